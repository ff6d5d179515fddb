//! Token-footprint estimation for synthesis prompts.
//!
//! An exact tokenizer is used when one is available for the running
//! platform; otherwise the estimate falls back to `ceil(chars / 4)`, which
//! over-counts for typical English prose and so errs toward switching to a
//! larger-context arbiter.

/// Exact token counter. Returns `None` when the tokenizer cannot run here.
#[cfg_attr(test, mockall::automock)]
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub tokens: usize,
    /// `true` when produced by an exact tokenizer.
    pub exact: bool,
}

/// Characters per token assumed by the heuristic.
const CHARS_PER_TOKEN: usize = 4;

pub fn heuristic_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_tokens(counter: Option<&dyn TokenCounter>, text: &str) -> TokenEstimate {
    if let Some(tokens) = counter.and_then(|c| c.count(text)) {
        return TokenEstimate {
            tokens,
            exact: true,
        };
    }
    TokenEstimate {
        tokens: heuristic_tokens(text),
        exact: false,
    }
}
