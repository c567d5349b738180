//! Configuration copied into the supervisor at spawn time.

/// Settings for a [`super::handle::JobQueueHandle`].
///
/// `cmd_template` is a shell fragment containing zero or more occurrences of
/// the literal token `{}`; at dispatch time every occurrence is replaced with
/// the shell-quoted absolute path of the file being processed and the result
/// is run as `/bin/sh -c <expanded>`.
#[derive(Debug, Clone)]
pub struct JobQueueSettings {
    pub cmd_template: String,
    pub max_workers: usize,
    pub retry_wait_ms: u64,
}

impl JobQueueSettings {
    pub fn new(cmd_template: String, max_workers: usize, retry_wait_ms: u64) -> Self {
        Self {
            cmd_template,
            max_workers,
            retry_wait_ms,
        }
    }
}
