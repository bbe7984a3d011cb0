//! The `persistence` module stores topic logs and subscription cursors.
//!
//! Topics are append-only `sled` trees keyed by sequence number, so a
//! restarted broker resumes with the same ids, the same retained history and
//! the same acknowledgement state for every durable subscription.

pub mod sled_store;

pub use sled_store::{Persistence, StoredCursor, StoredMessage};
