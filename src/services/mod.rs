//! Execution services: tick distribution, submission reconciliation, close
//! cleanup and the orchestrator that ties them together.

pub mod close_cleanup;
pub mod orchestrator;
pub mod quote_stream;
pub mod reconciliation;

pub use close_cleanup::{CloseCleanup, CloseTimings, FlattenResult};
pub use orchestrator::{
    CloseOutcome, CloseReport, EntryOutcome, EntryPlacement, Orchestrator, OrchestratorSettings,
};
pub use quote_stream::{
    HubConnection, HubEvent, ListenerId, MarketHub, QuoteListener, QuoteStream, QuoteStreams,
};
pub use reconciliation::ReconciliationResolver;
