//! Logging setup and run progress reporting.
//!
//! Logs and progress go to stderr; stdout carries only the arbiter answer.

use std::io::Write;

use moe_coordination::{Draft, DraftStatus, ExpertDispatch, ModelRef, RunObserver};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins; default level is `info`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
}

/// One-line status text for a settled draft.
pub fn draft_line(draft: &Draft) -> String {
    let expert = &draft.expert;
    let mut line = format!(
        "[{}] {} ({}/{})",
        draft.status, expert.agent_id, expert.provider, expert.model
    );
    match draft.status {
        DraftStatus::Completed => {
            line.push_str(&format!(" {} chars", draft.content.chars().count()));
            if draft.is_partial {
                line.push_str(", partial");
            }
            if let Some(sampling) = &draft.sampling {
                line.push_str(&format!(
                    ", {}/{} traces kept, consensus {:.2}",
                    sampling.traces_kept, sampling.traces_generated, sampling.consensus
                ));
            }
        }
        DraftStatus::Failed => {
            if let Some(error) = &draft.error {
                line.push_str(&format!(": {error}"));
            }
        }
    }
    line
}

/// Prints run progress to a writer (stderr in the binary).
pub struct ProgressReporter<W: Write + Send> {
    out: W,
    show_drafts: bool,
}

impl<W: Write + Send> ProgressReporter<W> {
    pub fn new(out: W, show_drafts: bool) -> Self {
        Self { out, show_drafts }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RunObserver for ProgressReporter<W> {
    fn on_initial_agents(&mut self, experts: &[ExpertDispatch]) {
        let names: Vec<&str> = experts.iter().map(|e| e.agent_id.as_str()).collect();
        let _ = writeln!(self.out, "dispatching {} agents: {}", experts.len(), names.join(", "));
    }

    fn on_draft_complete(&mut self, draft: &Draft) {
        let _ = writeln!(self.out, "{}", draft_line(draft));
        if self.show_drafts && draft.is_completed() {
            let _ = writeln!(self.out, "{}\n", draft.content.trim());
        }
    }

    fn on_arbiter_switched(&mut self, from: &ModelRef, to: &ModelRef) {
        let _ = writeln!(
            self.out,
            "drafts are too large for {from}; arbitrating with {to} instead"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moe_coordination::{Provider, SamplingSummary};

    fn expert() -> ExpertDispatch {
        ExpertDispatch {
            agent_id: "physicist".into(),
            persona: String::new(),
            provider: Provider::Gemini,
            model: "gemini-2.5-pro".into(),
        }
    }

    #[test]
    fn completed_line_reports_sampling() {
        let draft = Draft::completed(expert(), "abc").with_sampling(SamplingSummary {
            consensus: 0.75,
            traces_generated: 4,
            traces_kept: 3,
            early_stopped: 0,
        });
        let line = draft_line(&draft);
        assert!(line.contains("physicist (gemini/gemini-2.5-pro) 3 chars"));
        assert!(line.contains("3/4 traces kept, consensus 0.75"));
    }

    #[test]
    fn reporter_writes_switch_notice() {
        let mut reporter = ProgressReporter::new(Vec::new(), false);
        reporter.on_arbiter_switched(
            &ModelRef::new(Provider::Groq, "small"),
            &ModelRef::new(Provider::Groq, "large"),
        );
        let text = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(text.contains("groq/small"));
        assert!(text.contains("groq/large"));
    }
}
