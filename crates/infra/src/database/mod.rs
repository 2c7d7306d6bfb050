//! SQLite persistence for shared gateway state

pub mod manager;
pub mod state_store;

pub use manager::{DbManager, SqliteConnection, SqlitePool};
pub use state_store::SqliteStateStore;
