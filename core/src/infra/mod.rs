//! Infrastructure layer - external interfaces

pub mod daemon;
pub mod db;
pub mod queue;
pub mod store;
