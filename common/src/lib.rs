//! Shared data model for certkeeper.
//!
//! The engine, the CLI and any outer adapter (HTTP, UI) speak in terms of the
//! types defined here. [`views`] are the shapes the engine hands out,
//! [`params`] are the shapes callers hand in.

pub mod fingerprint;
pub mod params;
pub mod views;

pub use fingerprint::{Fingerprint, normalize_fingerprint};
