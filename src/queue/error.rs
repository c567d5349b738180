//! Error type for queue setup failures.
//!
//! The steady-state protocol (`add_file`, `flush`) has no recoverable error
//! path by design (spec §7): a broken pipe to the supervisor means this
//! process's view of outstanding work can no longer be trusted, so those
//! calls abort the process rather than return a `Result` a caller could
//! paper over. This type only covers the one place a caller can sensibly
//! recover: failing to start the supervisor in the first place.

use std::fmt;

/// Failure to bring up a supervisor process.
#[derive(Debug)]
pub struct QueueStartError(pub(crate) std::io::Error);

impl fmt::Display for QueueStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to start job queue supervisor: {}", self.0)
    }
}

impl std::error::Error for QueueStartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<std::io::Error> for QueueStartError {
    fn from(err: std::io::Error) -> Self {
        Self(err)
    }
}
