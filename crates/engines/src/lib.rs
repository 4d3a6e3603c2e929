//! Generation engines for Valet.
//!
//! Two implementations of `valet_core::GenerationEngine`:
//! - [`LocalEngine`] (feature `local`, on by default): on-device GGUF
//!   inference via Candle, with per-session warmed contexts.
//! - [`HeavyEngine`]: a remote OpenAI-compatible streaming backend.
//!
//! The dispatcher only sees trait objects; which engine answers is
//! decided by tier and configuration.

pub mod heavy;
#[cfg(feature = "local")]
pub mod local;

pub use heavy::HeavyEngine;
#[cfg(feature = "local")]
pub use local::{LocalEngine, known_presets};
