//! cairn-store: namespaced content-addressable storage on the local
//! filesystem.

pub mod path;
pub mod store;

pub use path::{cas_path_transform, default_path_transform, PathKey, PathTransform};
pub use store::{StagedFile, Store, StoreError, StoreOpts, DEFAULT_ROOT};
