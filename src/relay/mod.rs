//! Relay pipeline: records, dispatch and the engine driving them

pub mod dispatcher;
pub mod engine;
pub mod record;
pub mod store;

pub use dispatcher::RelayDispatcher;
pub use engine::RelayEngine;
pub use record::{RelayHandle, RelayKind, RelayRequest, RelayState, TxRelayRecord};
pub use store::{RelayStats, RelayStore};
