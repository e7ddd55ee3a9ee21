// THEORY:
// This file is the main entry point for the `dashcam_privacy` library crate.
// It defines the public API consumed by the daemon binary and by developer tools
// such as `grid_preview`.
//
// The primary goal is to export `PrivacyPipeline` and its configuration as the
// high-level interface of the engine, alongside the two boundaries a deployment has to
// fill in: the `engine` (model runtime) and the `store` (durable work queue). The
// `core_modules` stay public so tools can reuse the geometry, packing and redaction
// steps on their own.

pub mod config;
pub mod core_modules;
pub mod engine;
pub mod logging;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod store;

pub use config::PipelineConfig;
pub use pipeline::{CycleReport, PrivacyPipeline};
