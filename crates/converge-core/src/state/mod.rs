// # State Store Implementations
//
// This module provides implementations of the StateStore trait for
// different persistence strategies, plus the advisory lock they share.

pub mod file;
pub mod lock;
pub mod memory;

pub use file::{FileStateStore, FileStateStoreFactory, STATE_SCHEMA};
pub use lock::{LockInfo, StateLock};
pub use memory::{MemoryStateStore, MemoryStateStoreFactory};
