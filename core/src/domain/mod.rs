//! Domain models
//!
//! These are the types the pipeline passes around between discovery, the
//! worker pool, the writer and the merge resolver. Persistence lives in
//! `infra::db::entities`.

pub mod package;
pub mod source_file;
pub mod symbol;

pub use package::{Package, PackageId};
pub use source_file::{ContentHash, FileId, Fingerprint};
pub use symbol::{ExtractedReference, ExtractedSymbol, SymbolIdentity};
