//! Maintenance tools that run outside the sync loop

pub mod orphans;

pub use orphans::{find_orphans, move_orphans_to_inbox, OrphanFailure, OrphanReport};
