//! Common utilities and types shared across vipcare components.

pub mod error;
pub mod logging;
pub mod retry;

pub use error::{Error, Result};
pub use retry::{RetryPolicy, retry};
