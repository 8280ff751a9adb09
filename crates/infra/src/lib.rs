//! Infrastructure layer: storage backends, listing and the outbox relay.
//!
//! - [`storage`]: the adjustment ledger, balance versions and the outbox,
//!   each with an in-memory and a Postgres backend
//! - [`query`]: filter language and cursor pagination shared by listings
//! - [`relay`]: background task draining the outbox into a publisher
//! - [`config`]: environment-driven settings

pub mod config;
pub mod query;
pub mod relay;
pub mod storage;

pub use config::{ConfigError, OutboxConfig, StoreConfig};
pub use relay::{OutboxRelay, RelayHandle, RelayReport};
pub use storage::{
    AdjustmentLedger, BalanceQuery, BalanceVersionStore, InMemoryStore, OutboxDispatcher,
    PostgresStore, ReferenceRegistry, StorageError, UnitOfWork,
};
