//! Persistence layer: one store per table family, the Postgres
//! LISTEN/NOTIFY bus, and schema bootstrap.
//!
//! Schema names are configurable, so statements interpolate the (validated)
//! schema identifier and bind everything else with `$n` placeholders.

pub mod bus;
pub mod checkpoints;
pub mod cron;
pub mod factory;
pub mod process_workers;
pub mod raw_events;
pub mod rpc_cache;
pub mod schema;
pub mod sync_workers;

pub use bus::{BusSubscription, NotificationBus};
pub use checkpoints::CheckpointStore;
pub use cron::CronStore;
pub use factory::FactoryChildStore;
pub use process_workers::ProcessWorkerStore;
pub use raw_events::RawEventStore;
pub use rpc_cache::RpcCacheStore;
pub use sync_workers::SyncWorkerStore;
