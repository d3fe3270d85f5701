pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod queue;
pub mod reconcile;
pub mod reply;
pub mod scheduler;
pub mod sync;
pub mod vault;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{Result, SyncError};
