pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod services;
pub mod strategy;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal, SignalGate};
pub use error::{Result, TrailgateError};
pub use services::{Orchestrator, OrchestratorSettings, QuoteStream, QuoteStreams};
pub use strategy::{TriggerWatcher, WatcherRegistry};
pub use supervisor::{ConnectionGuard, CredentialRefresher, CredentialStore};
