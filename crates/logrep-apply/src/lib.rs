#![warn(missing_docs)]

//! Subscriber side of logical replication: applies a publisher's change
//! stream to local tables, with initial table synchronization, spooling and
//! parallel apply of large in-progress transactions, and two-phase commit.

pub mod catalog;
pub mod config;
pub mod conflict;
pub mod env;
pub mod error;
pub mod flush;
pub mod launcher;
pub mod locator;
pub mod locks;
pub mod lsn;
pub mod origin;
pub mod proto;
pub mod queue;
pub mod relation;
pub mod skip;
pub mod slots;
pub mod spool;
pub mod storage;
pub mod types;
pub mod upstream;

mod apply;
mod dml;
mod leader;
mod parallel;
mod seqsync;
mod stream;
mod tablesync;

pub use catalog::{Catalog, CatalogSnapshot, MemoryCatalog};
pub use config::ApplyConfig;
pub use env::ApplyEnv;
pub use error::{ApplyError, ErrorKind, Result};
pub use launcher::{launch_leader, Launcher};
pub use lsn::Lsn;
pub use storage::{MemoryStorage, StorageEngine, StorageSnapshot};
pub use types::{RelState, Subscription};
pub use upstream::{ChannelPublisher, PublisherConnector};
