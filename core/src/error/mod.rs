#[allow(clippy::module_inception)]
pub mod error;
pub mod executor;
pub mod taxonomy;

pub use error::CliError;
pub use executor::ExecutorError;
pub use taxonomy::{
    classify, classify_status, is_no_retry, is_session_expired_message, ClassifiedError,
    ErrorKind, HttpClass, NoRetry,
};
