pub mod contract;
pub mod instrument;
pub mod order;
pub mod session;
pub mod signal;

pub use contract::{continuous_root, map_continuous_to_active_quarter, ContractDirectory};
pub use instrument::*;
pub use order::*;
pub use session::TradingSession;
pub use signal::*;
