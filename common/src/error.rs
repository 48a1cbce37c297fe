use std::fmt::Debug;

use tracing::{error, warn};

pub trait LogErrorExt<T> {
    /// Logs the error, if any, and hands back the success value
    fn log_error(self, message: &str) -> Option<T>;

    /// Same as `log_error` for failures that are expected to happen now and then
    fn log_warn(self, message: &str) -> Option<T>;
}

impl<T, E: Debug> LogErrorExt<T> for Result<T, E> {
    fn log_error(self, message: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                error!("{message}: {err:?}");
                None
            }
        }
    }

    fn log_warn(self, message: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("{message}: {err:?}");
                None
            }
        }
    }
}
