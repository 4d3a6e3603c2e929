//! Request routing for Valet.
//!
//! [`TierDispatcher`] is the core pipeline: classify the prompt, try
//! the device stage, map the class to a tier, merge parameters, pick an
//! engine, and relay the resulting event stream with single-retry
//! fallback. [`HealthSnapshot`] is the never-failing aggregated health
//! view it exposes.

mod dispatcher;
mod health;

pub use dispatcher::TierDispatcher;
pub use health::{HealthSnapshot, RoutingSummary, SessionStats};
