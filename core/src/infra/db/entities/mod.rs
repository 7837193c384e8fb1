//! SeaORM entities for the index store

pub mod build_queue;
pub mod content_blob;
pub mod content_version;
pub mod package;
pub mod source_file;
pub mod symbol;
pub mod symbol_reference;

pub use build_queue::Entity as BuildQueueItem;
pub use content_blob::Entity as ContentBlob;
pub use content_version::Entity as ContentVersion;
pub use package::Entity as Package;
pub use source_file::Entity as SourceFile;
pub use symbol::Entity as Symbol;
pub use symbol_reference::Entity as SymbolReference;

pub use build_queue::{ActiveModel as BuildQueueActive, Model as BuildQueueModel};
pub use content_blob::{ActiveModel as ContentBlobActive, Model as ContentBlobModel};
pub use content_version::{ActiveModel as ContentVersionActive, Model as ContentVersionModel};
pub use package::{ActiveModel as PackageActive, Model as PackageModel};
pub use source_file::{ActiveModel as SourceFileActive, Model as SourceFileModel};
pub use symbol::{ActiveModel as SymbolActive, Model as SymbolModel};
pub use symbol_reference::{ActiveModel as SymbolReferenceActive, Model as SymbolReferenceModel};
