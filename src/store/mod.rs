//! Storage seams for the shared call directory and per-user call logs.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{
    CallLogStore, CallPatch, CallStore, Result, StoreError, TrickledCandidate, WatchHandle,
};
