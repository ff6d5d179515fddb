//! Confidence engine
//!
//! DeepConf-style sampling: spend several generation attempts ("traces") on
//! one agent, score each by how confident it looked, discard the weakest and
//! take a weighted vote over what remains.
//!
//! # Architecture
//!
//! ```text
//!            ┌────────────────────────────┐
//!            │  run_offline / run_online  │   sampler.rs
//!            └─────────────┬──────────────┘
//!                          │ generate() / score()
//!                          ▼
//!            ┌────────────────────────────┐
//!            │   dyn TraceProvider        │   trace_provider.rs
//!            └──────┬──────────────┬──────┘
//!                   │              │
//!     ┌─────────────▼───┐    ┌─────▼───────────────┐
//!     │ LogprobTrace-   │    │ JudgeTraceProvider  │
//!     │ Provider        │    │ full text + Judge   │   judge.rs
//!     │ token metrics   │    └─────────────────────┘
//!     └─────────────────┘
//!            metrics.rs          voting.rs
//! ```
//!
//! # Components
//!
//! - **metrics**: pure per-token and per-window confidence functions
//! - **voting**: weighted vote with first-insertion tie-break, eta filter
//! - **trace_provider**: the two concrete ways of producing a scored trace
//! - **judge**: reflexive `{score, reasons}` judgment of a candidate answer
//! - **sampler**: the offline and online algorithms

pub mod judge;
pub mod metrics;
pub mod sampler;
pub mod trace_provider;
pub mod voting;

pub use judge::{parse_judge_response, Judge};
pub use metrics::{
    bottom_percent_group_confidence, group_confidence, group_confidences,
    lowest_group_confidence, tail_confidence, token_confidence, token_confidences,
    trace_confidence, ConfidenceMetric,
};
pub use sampler::{
    run_offline, run_online, stop_threshold, ConfidenceOutcome, ConfidenceParams, ScoredTrace,
};
pub use trace_provider::{EarlyStop, JudgeTraceProvider, LogprobTraceProvider, TraceProvider};
pub use voting::{eta_filter, weighted_vote, VoteOutcome};
