pub mod account_balances;
pub mod arguments;
pub mod cache_store;
pub mod chain;
pub mod cutoff_cache;
pub mod database;
pub mod dust;
pub mod event_bus;
pub mod event_source;
pub mod fork;
pub mod notifier;
pub mod order_manager;
pub mod run;

pub use self::run::{run, start};
