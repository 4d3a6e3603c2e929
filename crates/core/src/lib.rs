//! Core domain types and traits for the Valet request-routing runtime.
//!
//! Everything that crosses a crate boundary lives here: session transcripts,
//! routing decisions, the `GenerationEngine` seam, streaming events, the
//! device-action seam, and the error taxonomy.

pub mod device;
pub mod engine;
pub mod error;
pub mod message;
pub mod route;

pub use device::{DeviceAction, DeviceActions, DeviceCommand};
pub use engine::{
    EngineHealth, EngineStatus, EventStream, GenerationEngine, GenerationEvent, GenerationParams,
};
pub use error::{DeviceError, EngineError, Error, Result, SessionError};
pub use message::{Message, Role, Session, SessionId};
pub use route::{RouteClass, RouteDecision, Tier};
