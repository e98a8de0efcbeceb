pub mod accounting;
pub mod autoscan;
pub mod chain;
pub mod events;
pub mod manager;
pub mod metadata;
pub(crate) mod reconcile;
pub(crate) mod scheduler;
pub mod task;
pub mod transform;
pub(crate) mod triggers;
