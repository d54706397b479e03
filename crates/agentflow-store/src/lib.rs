mod catalog;
pub mod store;

pub use store::SqliteStore;
