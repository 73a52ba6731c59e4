#![forbid(unsafe_code)]

//! In-process reference backends used by tests and the dev server.

mod log;
mod store;

pub use log::MemoryLog;
pub use store::MemoryStore;
