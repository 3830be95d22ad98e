//! cairn-core: shared wire format, stream cipher, and configuration.
//! All other cairn crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use crypto::EncryptionKey;
pub use wire::{Frame, Message};
