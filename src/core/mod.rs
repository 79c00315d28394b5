//! Core relay components
//!
//! This module contains the orchestration logic that connects a chat channel
//! to its model session.

mod pending;
mod registry;
mod relay;
mod signal;

pub use registry::RelayRegistry;
pub use relay::{Channel, DispatchOutcome, InboundMessage, RelayOrchestrator};
pub use signal::Signal;
