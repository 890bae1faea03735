//! Entry execution primitives.
//!
//! - `trigger_watcher`: per-entry state machine that arms the trailing stop
//! - `fill_poller`: throttled fill detection with rate-limit backoff
//! - `watcher_registry`: active watchers per instrument
//! - `flip`: reversal sizing

pub mod cancel;
pub mod fill_poller;
pub mod flip;
pub mod trigger_watcher;
pub mod watcher_registry;

pub use cancel::CancelToken;
pub use fill_poller::{FillPoller, PollOutcome};
pub use flip::{FlipPlan, FlipPolicy};
pub use trigger_watcher::{
    trail_price, TriggerWatcher, WatcherParams, WatcherPhase, WatcherReport, WatcherTimings,
};
pub use watcher_registry::{WatcherHandle, WatcherRegistry};
