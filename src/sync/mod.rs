//! Caches that sit between the command layer and the stores.

mod cache;
mod sessions;

pub use cache::SyncCache;
pub use sessions::SessionLog;
