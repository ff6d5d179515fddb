//! Provider clients, panel configuration and CLI plumbing for running a
//! mixture-of-experts panel through [`moe_coordination::Orchestrator`].

pub mod config;
pub mod images;
pub mod providers;
pub mod telemetry;

pub use config::{build_registry, Overrides, PanelFile, ProviderEnv};
pub use telemetry::{init_logging, ProgressReporter};
