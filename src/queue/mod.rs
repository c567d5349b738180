//! The asynchronous job queue: a supervisor process that runs a shell
//! command for every file handed to it, with bounded concurrency and
//! automatic retry (spec §4).
//!
//! [`JobQueueHandle`] is the public surface used by the FUSE layer and the
//! CLI; everything else here is internal plumbing shared between the client
//! side ([`handle`]) and the supervisor side ([`supervisor`]).

mod error;
mod handle;
mod protocol;
mod settings;
mod supervisor;
mod template;
mod work_unit;

pub use error::QueueStartError;
pub use handle::JobQueueHandle;
pub use settings::JobQueueSettings;
