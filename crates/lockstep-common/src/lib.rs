pub mod error;
pub mod types;

pub use error::{Error, LockError, Result};
pub use types::ServiceId;
