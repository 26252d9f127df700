//! # fleet-txn
//!
//! Conditional multi-document transactions over a shared document store.
//!
//! ## Design Principles
//!
//! - Writers never lock; every write carries asserts about the state it was
//!   computed from, and the store rejects the whole op list if any fail
//! - A rejected transaction is rebuilt from fresh reads, never resubmitted
//! - Referenced entities (model, machine, unit, subnet) are guarded with
//!   lifecycle asserts so nothing new attaches to a dead entity
//! - Every commit is broadcast, and change feeds are derived from that stream
//!
//! ## Stores
//!
//! - [`MemoryStore`]: in-process map, used by tests and single-node setups
//! - [`SqliteStore`]: WAL-mode SQLite file, one SQL transaction per apply

mod error;
mod life;
mod memory;
mod op;
mod runner;
mod sqlite;
mod store;
mod watch;

pub use error::{StoreError, TxnError};
pub use life::*;
pub use memory::MemoryStore;
pub use op::{Assert, DocChange, Mutation, Op, StoredDoc};
pub use runner::{Attempt, Committed, Plan, TransactionRunner, DEFAULT_MAX_ATTEMPTS};
pub use sqlite::SqliteStore;
pub use store::{load, Store, CHANGE_BUFFER};
pub use watch::{
    channel_feed, notify_channel, ChangeFeed, ChannelFeed, ChannelNotifyFeed, CollectionFeed,
    DocumentFeed, FeedError, LiveEntitiesFeed, NotifyFeed,
};
