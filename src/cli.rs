//! Command-line surface (spec §6).
//!
//! `queuefs [options] <src-dir> <mount-point> <command...>` — every argument
//! after `mount-point` is the command template, joined with a single space
//! into one `cmd_template` string (§C.1).

use std::path::PathBuf;

use clap::Parser;

/// A passthrough FUSE filesystem that queues a shell command for every file
/// closed through the mount.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory to mirror.
    pub src_dir: PathBuf,

    /// Where to mount the passthrough filesystem.
    pub mount_point: PathBuf,

    /// Shell command template, run once per released writable file. Every
    /// `{}` in the joined template is replaced with the shell-quoted
    /// absolute path of that file; a template with no `{}` runs unchanged.
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,

    /// Maximum number of job processes running at once.
    #[arg(long, default_value_t = 4, value_name = "N")]
    pub max_workers: usize,

    /// Delay before retrying a job that exited non-zero.
    #[arg(long, default_value_t = 1000, value_name = "MS")]
    pub retry_wait_ms: u64,

    /// Don't pass `-oallow_other` to FUSE (only this user will be able to
    /// access the mount).
    #[arg(long)]
    pub no_allow_other: bool,
}

impl Cli {
    /// The single `cmd_template` string passed to the job queue (§C.1:
    /// trailing arguments are joined with a single space, following the
    /// original CLI's `OPTKEY_NONOPTION` handling).
    pub fn cmd_template(&self) -> String {
        self.command.join(" ")
    }
}
