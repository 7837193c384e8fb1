//! Operations over the store: parsing, the build pipeline and merge resolution

pub mod indexing;
pub mod merge;
pub mod parse;
