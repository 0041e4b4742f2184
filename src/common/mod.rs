mod config;
mod error;
mod types;

pub use config::*;
pub use error::{KeystoneError, Result};
pub use types::*;
