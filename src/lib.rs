pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fields;
pub mod filter;
pub mod protocol;
pub mod reconcile;
pub mod store;
pub mod warmup;

pub use client::PolicydClient;
pub use config::Config;
pub use error::{ApplyError, InsertError, StoreError, SyncError};
pub use fields::{FieldMask, MatchField};
pub use filter::{FilterOutcome, InsertFilter, QueueContext};
pub use protocol::{Identifier, Kind, PolicyRecord, ProtocolRevision, SuspendRecord};
pub use store::{MemoryStore, QueueStore};
pub use warmup::{WarmupIndex, WarmupPredicate};
