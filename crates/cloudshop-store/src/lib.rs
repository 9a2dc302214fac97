//! CloudShop Store — SQLite-backed document collections plus the typed
//! repositories the orchestrator works against.

pub mod catalogue;
pub mod input;
pub mod ledger;
pub mod orders;
pub mod registry;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use catalogue::Catalogue;
pub use input::InputValue;
pub use ledger::JobLedger;
pub use orders::{OrderBook, OrderLock};
pub use registry::ResourceRegistry;
pub use sqlite::{DocumentStore, Record};
pub use types::*;
