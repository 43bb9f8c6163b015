//! Certificate lifecycle engine: tracks X.509 material in a directory,
//! issues and renews certificates, and pushes renewed material to wherever
//! it is deployed.

pub mod activity;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod files;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod vault;
pub mod watcher;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
