//! `PseudoFifo`: bounds concurrent in-flight data pulls to at most N, in
//! arrival order (spec.md section 4.2). Built on `qserv_common::fifo_gate`,
//! the same admission primitive the worker's `ChannelShared` transmit
//! serialization gate uses (spec.md section 4.6).

pub use qserv_common::fifo_gate::{FifoGate as PseudoFifo, FifoHandle};
