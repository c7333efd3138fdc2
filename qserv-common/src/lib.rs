//! Types shared by the czar and worker halves of the dispatch/merge core.

pub mod config;
pub mod error;
pub mod fifo_gate;
pub mod ids;
pub mod logging;
pub mod message_store;
pub mod stats;
pub mod status;

pub use error::{DispatchError, Result};
