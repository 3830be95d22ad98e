//! Key → path mapping.
//!
//! The CAS transform hashes the *key* (not the content) with SHA-1 and cuts
//! the hex digest into 5-character directory segments:
//!
//!   someGoodPicture → 6f96b/0131b/a7047/77da4/41184/6af2c/c0e8e/fddd7/<digest>
//!
//! Repeated stores of one key land on one file. Identical content under two
//! keys lands on two files.

use sha1::{Digest, Sha1};

/// Characters per directory segment.
pub const SEGMENT_LEN: usize = 5;

/// Where a key lives, relative to its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory part, segments joined by `/`.
    pub pathname: String,
    /// File name inside `pathname`.
    pub filename: String,
}

impl PathKey {
    /// First directory segment. Deletion removes this whole subtree.
    pub fn first_path_name(&self) -> &str {
        self.pathname.split('/').next().unwrap_or(&self.pathname)
    }

    /// `pathname/filename`.
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.pathname, self.filename)
    }
}

/// A pure key → PathKey function, chosen at store construction.
pub type PathTransform = fn(&str) -> PathKey;

/// SHA-1 content-addressed layout. The default.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = digest
        .as_bytes()
        .chunks(SEGMENT_LEN)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();

    PathKey {
        pathname: segments.join("/"),
        filename: digest,
    }
}

/// Flat layout: the key is both directory and file name. Only useful for
/// keys that are already safe path components.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        pathname: key.to_string(),
        filename: key.to_string(),
    }
}
