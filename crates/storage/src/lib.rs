/// Storage layer for the tabledger validator
///
/// Owns the single-writer SQLite database: the system schema (registry,
/// ACL, receipts, cursor, raw events), the block-scoped executor that
/// applies chain events under ACL, and the read-only gateway store.
pub mod events;
pub mod executor;
pub mod gateway;
pub mod hash;
pub mod receipts;
pub mod registry;
pub mod rows;
pub mod schema;
pub mod sqlite;

pub use executor::{BlockScope, Executor};
pub use gateway::GatewayStore;
pub use sqlite::{SqliteConfig, SqliteDb};
