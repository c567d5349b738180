use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGUSR1, SIGUSR2};
use signal_hook::iterator::exfiltrator::WithOrigin;
use signal_hook::iterator::SignalsInfo;
use tracing::{debug, info, warn};

mod cli;
mod fs;
mod logging;
mod queue;

use cli::Cli;
use fs::PassthroughFs;
use queue::{JobQueueHandle, JobQueueSettings};

fn main() -> Result<()> {
    logging::init();

    let cli = Cli::try_parse().unwrap_or_else(|e| {
        use clap::error::ErrorKind;
        // `--help`/`--version` aren't argument errors; let clap print and
        // exit with its own (0) code for those. Everything else (missing
        // arguments, bad syntax) is an argument error, which spec.md §6
        // maps to exit code 1 — not clap's default of 2
        // (`original_source/src/queuefs.c`'s `main()` returns 1 for both a
        // `fuse_opt_parse` failure and missing required arguments).
        if matches!(
            e.kind(),
            ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        ) {
            e.exit();
        }
        let _ = e.print();
        std::process::exit(1);
    });

    let src_dir = cli
        .src_dir
        .canonicalize()
        .with_context(|| format!("source directory {:?} is not accessible", cli.src_dir))?;

    if !src_dir.is_dir() {
        anyhow::bail!("{:?} is not a directory", src_dir);
    }

    let settings = JobQueueSettings::new(cli.cmd_template(), cli.max_workers, cli.retry_wait_ms);
    info!(
        cmd = %settings.cmd_template,
        max_workers = settings.max_workers,
        retry_wait_ms = settings.retry_wait_ms,
        "starting job queue"
    );

    let queue = Arc::new(JobQueueHandle::create(settings).context("failed to start job queue")?);

    // SIGUSR1/SIGUSR2 both force a synchronous flush; SIGUSR2 additionally
    // signals the sender back once the flush completes, so external tooling
    // can wait for "every file queued so far has been attempted" (§C.6).
    let flush_on_signal = {
        let queue = Arc::clone(&queue);
        let mut signals = SignalsInfo::<WithOrigin>::new([SIGUSR1, SIGUSR2])
            .context("failed to register SIGUSR1/SIGUSR2 handlers")?;
        std::thread::spawn(move || {
            for info in signals.forever() {
                debug!(signal = info.signal, "flushing job queue on signal");
                queue.flush();
                if info.signal == SIGUSR2 {
                    if let Some(origin) = info.process {
                        if unsafe { libc::kill(origin.pid, SIGUSR2) } != 0 {
                            warn!(pid = origin.pid, "failed to signal back after flush");
                        }
                    } else {
                        warn!("SIGUSR2 received without sender pid, cannot signal back");
                    }
                }
            }
        })
    };

    let fs = PassthroughFs::new(src_dir, Arc::clone(&queue));

    // Mirrors the original CLI's mount options exactly (§C.4): always
    // `default_permissions` and `nonempty`, plus `allow_other` unless
    // suppressed.
    let mut options = vec![
        fuser::MountOption::FSName("queuefs".to_string()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::CUSTOM("nonempty".to_string()),
    ];
    if !cli.no_allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!(mount_point = ?cli.mount_point, "mounting");
    let mount_result = fuser::mount2(fs, &cli.mount_point, &options);

    // Dropping `flush_on_signal`'s JoinHandle without joining is fine: it is
    // a daemon thread for the lifetime of the process and carries no
    // Drop-sensitive state of its own.
    drop(flush_on_signal);

    mount_result.context("FUSE mount failed")?;

    // Reaching here means the kernel unmounted us; `Filesystem::destroy` has
    // already flushed the queue. Tear the supervisor down for a clean exit
    // status.
    if let Ok(queue) = Arc::try_unwrap(queue) {
        let code = queue.destroy();
        if code != 0 {
            warn!(code, "job queue supervisor exited non-zero");
        }
    }

    Ok(())
}
