pub mod application;
pub mod cli;
pub mod domain;
pub mod io;
pub mod storage;
pub mod sync;

pub use domain::*;
pub use storage::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};
pub use sync::KeyLock;
