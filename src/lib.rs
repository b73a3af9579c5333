pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod idempotency;
pub mod keys;
pub mod lock;
pub mod node;
pub mod queue;
pub mod store;
pub mod worker;

pub use coordinator::{Coordinator, RunningNode};
pub use error::{CoordError, StoreError};
