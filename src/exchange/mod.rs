mod traits;

#[cfg(test)]
pub use traits::MockBrokerClient;
pub use traits::{BrokerClient, ContractLookup};
