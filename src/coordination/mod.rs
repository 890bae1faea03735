//! Coordination layer
//!
//! - Per-instrument signal serialization with close holdoff
//! - Graceful shutdown sequencing

pub mod shutdown;
pub mod signal_gate;

pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownPhase, ShutdownSignal,
    ShutdownToken,
};
pub use signal_gate::{GateGuard, GateRejection, SignalGate};
