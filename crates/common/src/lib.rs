//! Common types for the batch media enhancement workspace

mod error;
mod media;
mod secret;

pub use error::{Error, Result};
pub use media::{MediaInfo, MediaKind};
pub use secret::Secret;
