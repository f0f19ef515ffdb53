//! Common types shared by the sign-in workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
