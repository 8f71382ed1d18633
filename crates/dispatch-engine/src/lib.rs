//! Admission control, originate pipeline, IVR session handling, campaign
//! sweeping, and orphan reconciliation for outbound IVR dialing, built on
//! top of `apicall-switch-core`'s management-channel client.

pub mod api;
pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod error;
pub mod event_handler;
pub mod ivr;
pub mod models;
pub mod originator;
pub mod pool;
pub mod reaper;
pub mod smartcid;
pub mod sweeper;
pub mod tracker;

pub use config::ApicallConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
