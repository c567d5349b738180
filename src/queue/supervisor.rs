//! The supervisor process (spec §4.2-§4.5).
//!
//! Runs as a separate process forked from [`super::handle::JobQueueHandle::create`].
//! Owns the pending queue, the active-worker table, and the counters used by
//! the flush protocol, and is solely responsible for mutating them — see the
//! module-level note below on why that makes the "signal-safe critical
//! section" discipline spec.md describes unnecessary in this implementation.
//!
//! ## Redesign: self-pipe instead of a SIGCHLD handler
//!
//! The original implementation is single-threaded but still needs a real
//! asynchronous SIGCHLD handler, because its main loop spends most of its
//! time in a blocking `read()` on the command pipe; every read of the
//! scheduler state is therefore wrapped in `sigprocmask` to keep the handler
//! from mutating it concurrently.
//!
//! This implementation instead registers the self-pipe pattern
//! (`signal_hook::low_level::pipe::register`) and folds the SIGCHLD
//! notification into the same `poll(2)` loop that waits on the command
//! pipe. The process is still single-threaded and still does nothing but
//! react to one of two file descriptors becoming readable, so there is only
//! ever one logical thread of control touching the pending queue, the
//! active table, or the counters — the signal-masking dance described in
//! spec.md §4.2 has no work left to do and is omitted. The scheduling
//! decisions themselves (one dispatch per processed command, a single
//! retry-slot refill per observed SIGCHLD wakeup, the timed wait inside
//! flush) are preserved exactly.

use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::protocol::{self, Command};
use super::settings::JobQueueSettings;
use super::template;
use super::work_unit::WorkUnit;

/// Capacity of the fixed read buffer used for draining the command pipe.
/// Mirrors the original `readbuf_capacity` of 4096 bytes (spec §4.2).
const READ_CHUNK: usize = 4096;

pub(crate) struct Supervisor {
    settings: JobQueueSettings,
    input_fd: RawFd,
    output_fd: RawFd,
    sigchld_read: UnixStream,

    /// Bytes read from `input_fd` that do not yet form a complete
    /// `\0`-terminated command.
    readbuf: Vec<u8>,

    pending: BTreeMap<(Instant, u64), WorkUnit>,
    active: HashMap<libc::pid_t, WorkUnit>,
    workers_started_ever: u64,
    workers_waited_ever: u64,
    next_seq: u64,
}

impl Supervisor {
    fn new(settings: JobQueueSettings, input_fd: RawFd, output_fd: RawFd) -> io::Result<Self> {
        let (sigchld_read, sigchld_write) = UnixStream::pair()?;
        sigchld_read.set_nonblocking(true)?;
        signal_hook::low_level::pipe::register(libc::SIGCHLD, sigchld_write)?;

        Ok(Self {
            settings,
            input_fd,
            output_fd,
            sigchld_read,
            readbuf: Vec::with_capacity(READ_CHUNK),
            pending: BTreeMap::new(),
            active: HashMap::new(),
            workers_started_ever: 0,
            workers_waited_ever: 0,
            next_seq: 0,
        })
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// The supervisor's main loop (spec §4.2): read commands until the input
    /// pipe is closed, reacting to worker exits as they happen. Returns once
    /// the pipe reaches EOF or errors; the caller is responsible for exiting
    /// the process (see [`super::handle::JobQueueHandle::create`]).
    fn main_loop(&mut self) {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.input_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.sigchld_read.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll() failed in supervisor main loop: {err}");
                break;
            }

            if fds[1].revents & libc::POLLIN != 0 {
                self.drain_sigchld_pipe();
                self.drain_finished_workers();
                if !self.pending.is_empty() && self.active.len() < self.settings.max_workers {
                    let _ = self.start_queued_work(true);
                }
            }

            if fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                match self.read_input_chunk() {
                    Ok(0) => {
                        debug!("input pipe closed, supervisor shutting down");
                        break;
                    }
                    Ok(_) => {
                        if self.handle_buffered_commands().is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("read from command pipe failed: {e}");
                        break;
                    }
                }
            }
        }

        // Live children are left to be reparented to init (spec §8 S6, §9):
        // this process makes no attempt to kill or wait for them.
        debug!(
            active = self.active.len(),
            "supervisor exiting, leaving active workers to be reparented"
        );
    }

    fn read_input_chunk(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = unsafe {
            libc::read(
                self.input_fd,
                chunk.as_mut_ptr() as *mut libc::c_void,
                chunk.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.readbuf.extend_from_slice(&chunk[..n as usize]);
        Ok(n as usize)
    }

    /// Extract and dispatch every complete `\0`-terminated command currently
    /// buffered, leaving any trailing partial command for the next read
    /// (spec §4.3).
    fn handle_buffered_commands(&mut self) -> io::Result<()> {
        while let Some(pos) = self.readbuf.iter().position(|&b| b == 0) {
            let body: Vec<u8> = self.readbuf.drain(..=pos).collect();
            let body = &body[..body.len() - 1]; // drop the trailing NUL
            self.dispatch_command(body)?;

            // Mirrors the original main loop: after every processed command,
            // try to fill one worker slot if there is queued work and room
            // (spec §4.2).
            if !self.pending.is_empty() && self.active.len() < self.settings.max_workers {
                self.start_queued_work(true)?;
            }
        }
        Ok(())
    }

    fn dispatch_command(&mut self, body: &[u8]) -> io::Result<()> {
        match protocol::parse(body) {
            Command::Exec(path) => {
                trace!(?path, "EXEC received");
                let seq = self.next_seq();
                let unit = WorkUnit::new(path, seq, Instant::now());
                self.pending.insert(unit.sort_key(), unit);
            }
            Command::Flush => {
                debug!("FLUSH received");
                self.handle_flush()?;
            }
            Command::Unknown => {
                warn!("ignoring unrecognized command on queue pipe");
            }
        }
        Ok(())
    }

    /// Flush protocol (spec §4.4): block until every unit that was pending
    /// before this command was processed has been attempted at least once,
    /// then acknowledge.
    fn handle_flush(&mut self) -> io::Result<()> {
        let target = self.workers_started_ever + self.pending.len() as u64;

        while self.workers_waited_ever < target {
            if self.active.is_empty() {
                self.start_queued_work(false)?;
            } else {
                self.wait_for_sigchld(None)?;
            }
        }

        self.write_ack()
    }

    fn write_ack(&mut self) -> io::Result<()> {
        loop {
            let n = unsafe {
                libc::write(
                    self.output_fd,
                    [protocol::ACK_BYTE].as_ptr() as *const libc::c_void,
                    1,
                )
            };
            if n == 1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // The source retries unboundedly here too (spec §9, Open
            // Questions); a write failure on this pipe almost certainly
            // means the client is gone, in which case there is nothing
            // better to do than keep trying until the process is killed.
            warn!("failed to write FLUSH ack: {err}");
        }
    }

    /// Dispatch the earliest pending unit, if any.
    ///
    /// When `nodelay` is `false` and that unit's `next_execution_time` is in
    /// the future, blocks until either that time arrives or a SIGCHLD
    /// notification does, whichever comes first (spec §4.5). If the
    /// notification arrives first the dispatch is aborted for this call; the
    /// caller (the flush loop) will reassess and try again.
    fn start_queued_work(&mut self, nodelay: bool) -> io::Result<()> {
        let Some((&key, _)) = self.pending.iter().next() else {
            return Ok(());
        };

        if !nodelay {
            let now = Instant::now();
            if key.0 > now {
                let woken_by_sigchld = self.wait_for_sigchld(Some(key.0 - now))?;
                if woken_by_sigchld {
                    return Ok(());
                }
            }
        }

        let unit = match self.pending.remove(&key) {
            Some(unit) => unit,
            None => return Ok(()), // raced with a concurrent removal; nothing to do
        };
        self.start_worker(unit)
    }

    /// Poll the SIGCHLD self-pipe for up to `timeout` (or indefinitely if
    /// `None`). If it becomes readable, drains it, reaps finished workers,
    /// and — mirroring `handle_sigchld`'s unconditional `drain_finished_workers()`
    /// then `start_queued_work(nodelay=true)` (spec §4.2) — tops up the active
    /// table from `pending` if there is room, returning `true`. Returns
    /// `false` on timeout. Without this, a flush's wait loop (§4.4) only ever
    /// refills a worker slot when `active` drops to zero, degenerating a
    /// multi-worker flush into one job at a time.
    fn wait_for_sigchld(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.sigchld_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms: i32 = match timeout {
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };

        let ret = unsafe { libc::poll(&mut pfd as *mut _, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(false);
        }

        self.drain_sigchld_pipe();
        self.drain_finished_workers();
        if !self.pending.is_empty() && self.active.len() < self.settings.max_workers {
            self.start_queued_work(true)?;
        }
        Ok(true)
    }

    fn drain_sigchld_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.sigchld_read.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Reap every currently waitable child (spec §4.5 `drain_finished_workers`).
    fn drain_finished_workers(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }

            let Some(mut unit) = self.active.remove(&pid) else {
                // Not one of ours (shouldn't happen; workers are our only
                // children), but don't let it wedge the reap loop.
                continue;
            };
            self.workers_waited_ever += 1;

            let code = wait_status_to_code(status);
            if code == 0 {
                debug!(path = ?unit.path, "job succeeded");
            } else {
                debug!(path = ?unit.path, code, "job failed, scheduling retry");
                unit.attempts += 1;
                unit.last_exit_code = Some(code);
                unit.next_execution_time =
                    Instant::now() + Duration::from_millis(self.settings.retry_wait_ms);
                let seq = self.next_seq();
                unit.seq = seq;
                self.pending.insert(unit.sort_key(), unit);
            }
        }
    }

    /// Fork a worker process to run the expanded command for `unit`
    /// (spec §4.5, §4.6). On fork failure the unit is put back in the
    /// pending queue to retry after `retry_wait_ms`, the same as any other
    /// failed attempt.
    fn start_worker(&mut self, mut unit: WorkUnit) -> io::Result<()> {
        let cmd_bytes = template::expand(&self.settings.cmd_template, path_bytes(&unit.path));
        let shell = CString::new("/bin/sh").expect("no interior NUL");
        let dash_c = CString::new("-c").expect("no interior NUL");
        let cmd = match CString::new(cmd_bytes) {
            Ok(cmd) => cmd,
            Err(_) => {
                warn!(path = ?unit.path, "expanded command contains a NUL byte, cannot exec; retrying later");
                unit.next_execution_time =
                    Instant::now() + Duration::from_millis(self.settings.retry_wait_ms);
                let seq = self.next_seq();
                unit.seq = seq;
                self.pending.insert(unit.sort_key(), unit);
                return Ok(());
            }
        };

        let argv: [*const libc::c_char; 4] =
            [shell.as_ptr(), dash_c.as_ptr(), cmd.as_ptr(), std::ptr::null()];

        debug!(path = ?unit.path, "starting worker");

        // Safety: between fork() and execv()/_exit() the child touches no
        // Rust heap state — everything it needs (`shell`, `argv`) was built
        // in the parent before the call.
        let pid = unsafe { libc::fork() };
        match pid {
            0 => unsafe {
                libc::execv(shell.as_ptr(), argv.as_ptr());
                libc::_exit(1);
            },
            -1 => {
                let err = io::Error::last_os_error();
                warn!("fork() failed starting worker: {err}; retrying later");
                unit.next_execution_time =
                    Instant::now() + Duration::from_millis(self.settings.retry_wait_ms);
                let seq = self.next_seq();
                unit.seq = seq;
                self.pending.insert(unit.sort_key(), unit);
            }
            pid => {
                self.active.insert(pid, unit);
                self.workers_started_ever += 1;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn path_bytes(path: &std::path::Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes()
}

#[cfg(not(unix))]
fn path_bytes(path: &std::path::Path) -> &[u8] {
    // queuefs only ever runs on unix (it mounts a FUSE filesystem); this
    // fallback exists only so the module type-checks on other targets.
    path.to_str().map(str::as_bytes).unwrap_or(&[])
}

fn wait_status_to_code(status: libc::c_int) -> i32 {
    unsafe {
        if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            -libc::WTERMSIG(status)
        } else {
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    /// A `Supervisor` wired to a real pipe pair so commands can be pushed
    /// through `dispatch_command`/`handle_buffered_commands` exactly the way
    /// the main loop would, without forking a second process or mounting
    /// anything.
    struct Harness {
        supervisor: Supervisor,
        ack_rx: std::os::unix::net::UnixStream,
    }

    fn harness(max_workers: usize, retry_wait_ms: u64) -> Harness {
        let settings = JobQueueSettings::new("true".to_string(), max_workers, retry_wait_ms);
        let mut input_fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(input_fds.as_mut_ptr()) }, 0);
        let (ack_tx, ack_rx) = std::os::unix::net::UnixStream::pair().unwrap();

        let supervisor =
            Supervisor::new(settings, input_fds[0], ack_tx.as_raw_fd()).expect("supervisor setup");
        std::mem::forget(ack_tx); // leak: Supervisor holds the raw fd, not an owned UnixStream

        Harness { supervisor, ack_rx }
    }

    #[test]
    fn exec_command_enqueues_a_pending_unit() {
        let mut h = harness(1, 10);
        h.supervisor
            .dispatch_command(b"EXEC /tmp/a")
            .expect("dispatch");
        assert_eq!(h.supervisor.pending.len(), 1);
        assert!(h.supervisor.active.is_empty());
    }

    #[test]
    fn unknown_command_does_not_touch_the_queue() {
        let mut h = harness(1, 10);
        h.supervisor.dispatch_command(b"PING").expect("dispatch");
        assert!(h.supervisor.pending.is_empty());
        assert!(h.supervisor.active.is_empty());
    }

    #[test]
    fn flush_with_nothing_pending_acks_immediately() {
        let mut h = harness(1, 10);
        h.supervisor.handle_flush().expect("flush");

        let mut byte = [0u8; 1];
        use std::io::Read;
        h.ack_rx
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        h.ack_rx.read_exact(&mut byte).expect("ack byte");
        assert_eq!(byte[0], protocol::ACK_BYTE);
    }

    #[test]
    fn flush_waits_for_a_dispatched_job_to_finish() {
        let mut h = harness(1, 10);
        h.supervisor
            .dispatch_command(b"EXEC /tmp/does-not-matter")
            .expect("dispatch");
        assert_eq!(h.supervisor.pending.len(), 1);

        h.supervisor.handle_flush().expect("flush");

        // The job (`true`, always succeeds) must have been started and
        // reaped exactly once, and nothing left pending for retry.
        assert_eq!(h.supervisor.workers_started_ever, 1);
        assert_eq!(h.supervisor.workers_waited_ever, 1);
        assert!(h.supervisor.pending.is_empty());
        assert!(h.supervisor.active.is_empty());
    }

    #[test]
    fn a_failing_job_is_rescheduled_for_retry() {
        let settings = JobQueueSettings::new("false".to_string(), 1, 5);
        let mut input_fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(input_fds.as_mut_ptr()) }, 0);
        let (ack_tx, _ack_rx) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut supervisor =
            Supervisor::new(settings, input_fds[0], ack_tx.as_raw_fd()).expect("supervisor setup");
        std::mem::forget(ack_tx);

        supervisor
            .dispatch_command(b"EXEC /tmp/always-fails")
            .expect("dispatch");
        supervisor.start_queued_work(true).expect("start");

        // Wait for the child to exit and be reaped.
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.active.len() == 1 && Instant::now() < deadline {
            supervisor.wait_for_sigchld(Some(Duration::from_millis(100))).ok();
        }

        assert!(supervisor.active.is_empty());
        assert_eq!(supervisor.pending.len(), 1);
        let unit = supervisor.pending.values().next().unwrap();
        assert_eq!(unit.attempts, 1);
        assert_eq!(unit.last_exit_code, Some(1));
    }

    #[test]
    fn never_exceeds_max_workers_concurrently() {
        // S5 (spec §8): six slow jobs, max_workers=2 — at no instant should
        // more than two be active at once.
        let mut h = harness(2, 5);
        for i in 0..6 {
            h.supervisor
                .dispatch_command(format!("EXEC /tmp/job-{i}").as_bytes())
                .expect("dispatch");
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while (!h.supervisor.pending.is_empty() || !h.supervisor.active.is_empty())
            && Instant::now() < deadline
        {
            while !h.supervisor.pending.is_empty()
                && h.supervisor.active.len() < h.supervisor.settings.max_workers
            {
                h.supervisor.start_queued_work(true).expect("start");
            }
            assert!(h.supervisor.active.len() <= h.supervisor.settings.max_workers);
            h.supervisor
                .wait_for_sigchld(Some(Duration::from_millis(50)))
                .ok();
        }

        assert!(h.supervisor.pending.is_empty());
        assert!(h.supervisor.active.is_empty());
    }

    #[test]
    fn wait_for_sigchld_refills_a_slot_after_reaping() {
        // Regression test: wait_for_sigchld used to only drain/reap, leaving
        // it to the caller to re-dispatch. handle_flush's wait branch never
        // did that, so a flush with capacity for several concurrent workers
        // degenerated to running one job at a time.
        let settings = JobQueueSettings::new("sleep 0.3".to_string(), 2, 5);
        let mut input_fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(input_fds.as_mut_ptr()) }, 0);
        let (ack_tx, _ack_rx) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut supervisor =
            Supervisor::new(settings, input_fds[0], ack_tx.as_raw_fd()).expect("supervisor setup");
        std::mem::forget(ack_tx);

        for i in 0..3 {
            supervisor
                .dispatch_command(format!("EXEC /tmp/wait-refill-{i}").as_bytes())
                .expect("dispatch");
        }

        supervisor.start_queued_work(true).expect("start first");
        supervisor.start_queued_work(true).expect("start second");
        assert_eq!(supervisor.active.len(), 2);
        assert_eq!(supervisor.pending.len(), 1);

        // Block for the first reap; the still-pending third unit must be
        // dispatched immediately, bringing `active` straight back to 2
        // instead of sitting at 1 until the caller notices.
        supervisor
            .wait_for_sigchld(Some(Duration::from_secs(5)))
            .expect("wait for a reap");

        assert_eq!(supervisor.active.len(), 2);
        assert!(supervisor.pending.is_empty());
    }

    #[test]
    fn flush_runs_jobs_concurrently_up_to_max_workers() {
        // Four jobs that each take ~0.2s with max_workers=2: a correct flush
        // runs two at a time (~0.4s total), not one at a time (~0.8s+).
        let settings = JobQueueSettings::new("sleep 0.2".to_string(), 2, 5);
        let mut input_fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(input_fds.as_mut_ptr()) }, 0);
        let (ack_tx, mut ack_rx) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut supervisor =
            Supervisor::new(settings, input_fds[0], ack_tx.as_raw_fd()).expect("supervisor setup");
        std::mem::forget(ack_tx);

        for i in 0..4 {
            supervisor
                .dispatch_command(format!("EXEC /tmp/flush-concurrency-{i}").as_bytes())
                .expect("dispatch");
        }

        let started = Instant::now();
        supervisor.handle_flush().expect("flush");
        let elapsed = started.elapsed();

        let mut byte = [0u8; 1];
        ack_rx
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        ack_rx.read_exact(&mut byte).expect("ack byte");

        assert_eq!(supervisor.workers_started_ever, 4);
        assert_eq!(supervisor.workers_waited_ever, 4);
        assert!(supervisor.pending.is_empty());
        assert!(supervisor.active.is_empty());
        assert!(
            elapsed < Duration::from_millis(700),
            "flush took {elapsed:?}, expected concurrent dispatch to finish well under serial time"
        );
    }
}

/// Entry point run by the forked supervisor process
/// ([`super::handle::JobQueueHandle::create`]). Consumes the two pipe ends it
/// owns and returns once the command pipe is closed; the caller exits the
/// process.
pub(crate) fn run(settings: JobQueueSettings, input_fd: RawFd, output_fd: RawFd) -> io::Result<()> {
    let mut supervisor = Supervisor::new(settings, input_fd, output_fd)?;
    supervisor.main_loop();
    Ok(())
}
