//! Client-side session management
//!
//! This module provides the pieces that drive one comparison session:
//! - `SessionController`: lifecycle state machine owning capture + transport
//! - `TranscriptAggregator`: per-provider final/non-final transcript state

mod aggregator;
mod controller;

pub use aggregator::{ProviderOutput, TranscriptAggregator};
pub use controller::{SessionController, SessionState, TransportConnector, WsConnector};
