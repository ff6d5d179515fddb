//! Weighted answer voting and eta filtering.
//!
//! Answers cluster on exact string equality. When two answers tie on total
//! weight the one that was seen first wins; accumulation keeps answers in
//! first-insertion order and only a strictly heavier total replaces the
//! running winner.

use std::collections::HashMap;

use tracing::debug;

use crate::config::EtaPercent;

/// Result of one weighted vote.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    pub answer: String,
    /// Summed weight of the winning answer.
    pub weight: f64,
    pub total_weight: f64,
    /// `weight / total_weight`, or `0.0` when the total is not positive.
    pub consensus: f64,
}

/// NaN and negative weights count as nothing; an infinite weight counts as 1.
fn sanitize_weight(weight: f64) -> f64 {
    if weight.is_nan() || weight <= 0.0 {
        0.0
    } else if weight.is_infinite() {
        1.0
    } else {
        weight
    }
}

/// Sum weights per distinct answer and pick the heaviest.
///
/// Returns `None` for an empty ballot.
pub fn weighted_vote<'a, I>(ballots: I) -> Option<VoteOutcome>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut order: Vec<(&'a str, f64)> = Vec::new();
    let mut index: HashMap<&'a str, usize> = HashMap::new();

    for (answer, weight) in ballots {
        let weight = sanitize_weight(weight);
        match index.get(answer) {
            Some(&i) => order[i].1 += weight,
            None => {
                index.insert(answer, order.len());
                order.push((answer, weight));
            }
        }
    }

    let mut winner = *order.first()?;
    for &(answer, weight) in &order[1..] {
        if weight > winner.1 {
            winner = (answer, weight);
        }
    }

    let total_weight: f64 = order.iter().map(|(_, w)| w).sum();
    let consensus = if total_weight > 0.0 {
        (winner.1 / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    debug!(
        distinct = order.len(),
        winner_weight = winner.1,
        total_weight,
        consensus,
        "weighted vote"
    );

    Some(VoteOutcome {
        answer: winner.0.to_string(),
        weight: winner.1,
        total_weight,
        consensus,
    })
}

/// Keep the `eta`% highest-scoring items (at least one).
///
/// Ties keep their original relative order.
pub fn eta_filter<T, F>(items: &[T], eta: EtaPercent, score: F) -> Vec<&T>
where
    F: Fn(&T) -> f64,
{
    if items.is_empty() {
        return Vec::new();
    }
    let mut ranked: Vec<&T> = items.iter().collect();
    ranked.sort_by(|a, b| score(b).total_cmp(&score(a)));
    ranked.truncate(eta.keep_count(items.len()));
    ranked
}
