//! Token- and window-level confidence primitives.
//!
//! Token confidence is the negated mean log-probability of the top-k
//! candidates at one position, so higher means more confident. A position
//! with no distribution scores `+∞`. Every function here is pure.

use serde::{Deserialize, Serialize};

use crate::types::{TokenCandidate, Trace};

/// Confidence at one position from its top-`k` candidates (`k == 0` uses all).
pub fn token_confidence(top_k: &[TokenCandidate], k: usize) -> f64 {
    let take = if k == 0 { top_k.len() } else { k.min(top_k.len()) };
    if take == 0 {
        return f64::INFINITY;
    }
    let sum: f64 = top_k[..take].iter().map(|c| c.logprob).sum();
    -(sum / take as f64)
}

pub fn token_confidences(trace: &Trace, k: usize) -> Vec<f64> {
    trace
        .steps
        .iter()
        .map(|step| token_confidence(&step.top_k, k))
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean confidence over the `window` positions ending at `end_idx`.
///
/// `end_idx` is clamped to the last position and the window to the history
/// available before it. An empty sequence scores `0.0`.
pub fn group_confidence(conf: &[f64], end_idx: usize, window: usize) -> f64 {
    if conf.is_empty() {
        return 0.0;
    }
    let end = end_idx.min(conf.len() - 1);
    let start = (end + 1).saturating_sub(window.max(1));
    mean(&conf[start..=end])
}

/// Group confidence at every position of the sequence.
pub fn group_confidences(conf: &[f64], window: usize) -> Vec<f64> {
    (0..conf.len())
        .map(|idx| group_confidence(conf, idx, window))
        .collect()
}

/// The weakest local span of the trace.
pub fn lowest_group_confidence(conf: &[f64], window: usize) -> f64 {
    group_confidences(conf, window)
        .into_iter()
        .reduce(f64::min)
        .unwrap_or(0.0)
}

pub fn tail_confidence(conf: &[f64], tail_window: usize) -> f64 {
    match conf.len() {
        0 => 0.0,
        len => group_confidence(conf, len - 1, tail_window),
    }
}

/// Mean of the lowest `percent`% of group confidences (at least one value).
pub fn bottom_percent_group_confidence(conf: &[f64], window: usize, percent: u8) -> f64 {
    let mut groups = group_confidences(conf, window);
    if groups.is_empty() {
        return 0.0;
    }
    groups.sort_by(|a, b| a.total_cmp(b));
    let keep = (groups.len() * usize::from(percent.min(100)) / 100).max(1);
    mean(&groups[..keep])
}

/// Which summary reduces a trace's token confidences to one score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConfidenceMetric {
    Mean,
    LowestGroup { window: usize },
    Tail { window: usize },
    BottomPercent { window: usize, percent: u8 },
}

pub fn trace_confidence(conf: &[f64], metric: &ConfidenceMetric) -> f64 {
    match *metric {
        ConfidenceMetric::Mean => mean(conf),
        ConfidenceMetric::LowestGroup { window } => lowest_group_confidence(conf, window),
        ConfidenceMetric::Tail { window } => tail_confidence(conf, window),
        ConfidenceMetric::BottomPercent { window, percent } => {
            bottom_percent_group_confidence(conf, window, percent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Step;

    fn cand(logprob: f64) -> TokenCandidate {
        TokenCandidate {
            token: "t".into(),
            logprob,
        }
    }

    #[test]
    fn token_confidence_is_negated_mean_logprob() {
        let top = [cand(-1.0), cand(-3.0), cand(-100.0)];
        assert_eq!(token_confidence(&top, 2), 2.0);
        assert!((token_confidence(&top, 0) - 104.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_distribution_is_maximally_confident() {
        assert_eq!(token_confidence(&[], 5), f64::INFINITY);
        let trace = Trace::from_full_text("an answer");
        assert_eq!(token_confidences(&trace, 5), vec![f64::INFINITY]);
    }

    #[test]
    fn group_confidence_trailing_window() {
        assert_eq!(group_confidence(&[1.0, 2.0, 3.0, 4.0], 3, 2), 3.5);
    }

    #[test]
    fn group_confidence_clamps_to_history() {
        assert_eq!(group_confidence(&[1.0, 2.0, 3.0, 4.0], 1, 10), 1.5);
        assert_eq!(group_confidence(&[1.0, 2.0, 3.0, 4.0], 99, 2), 3.5);
        assert_eq!(group_confidence(&[], 0, 4), 0.0);
    }

    #[test]
    fn lowest_group_finds_weak_span() {
        let conf = [5.0, 5.0, 1.0, 1.0, 5.0, 5.0];
        assert_eq!(lowest_group_confidence(&conf, 2), 1.0);
        assert_eq!(lowest_group_confidence(&[], 2), 0.0);
    }

    #[test]
    fn tail_uses_final_window() {
        assert_eq!(tail_confidence(&[1.0, 2.0, 3.0, 4.0], 2), 3.5);
        assert_eq!(tail_confidence(&[], 2), 0.0);
    }

    #[test]
    fn bottom_percent_averages_worst_groups() {
        // Window 1: groups equal the values.
        let conf: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(bottom_percent_group_confidence(&conf, 1, 20), 1.5);
        // Always keeps at least one group.
        assert_eq!(bottom_percent_group_confidence(&conf, 1, 1), 1.0);
    }

    #[test]
    fn trace_confidence_dispatches_on_metric() {
        let trace = Trace::from_steps(vec![
            Step::new("a", vec![cand(-1.0)]),
            Step::new("b", vec![cand(-3.0)]),
        ]);
        let conf = token_confidences(&trace, 5);
        assert_eq!(trace_confidence(&conf, &ConfidenceMetric::Mean), 2.0);
        assert_eq!(
            trace_confidence(&conf, &ConfidenceMetric::LowestGroup { window: 1 }),
            1.0
        );
        assert_eq!(
            trace_confidence(&conf, &ConfidenceMetric::Tail { window: 1 }),
            3.0
        );
    }
}
