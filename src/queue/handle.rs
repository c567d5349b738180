//! Client side of the queue: [`JobQueueHandle`] (spec §4.1, §4.3, §4.4).
//!
//! `create` forks a child process that runs the [`super::supervisor`] loop
//! and returns a handle connected to it by a pair of pipes. Every other
//! method here sends one command and, for `flush`, waits for its ack.

use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use super::error::QueueStartError;
use super::protocol;
use super::settings::JobQueueSettings;
use super::supervisor;

/// A handle to a running supervisor process.
///
/// Sending commands (`add_file`, `flush`) takes a mutex for the duration of
/// the write, mirroring the original's `pthread_mutex_t` guarding
/// `send_command` — concurrent callers (e.g. multiple FUSE request threads
/// calling `release` at once) must not interleave partial writes on the pipe.
pub struct JobQueueHandle {
    input_fd: RawFd,
    output_fd: RawFd,
    child_pid: libc::pid_t,
    write_lock: Mutex<()>,
    destroyed: bool,
}

// Safety: the raw fds are only ever touched under `write_lock` (for writes)
// or during `flush`/`destroy`, which take `&mut self` or consume `self`.
unsafe impl Send for JobQueueHandle {}
unsafe impl Sync for JobQueueHandle {}

impl JobQueueHandle {
    /// Fork the supervisor process and return a handle connected to it.
    pub fn create(settings: JobQueueSettings) -> Result<Self, QueueStartError> {
        let (client_to_super_r, client_to_super_w) = pipe_cloexec()?;
        let (super_to_client_r, super_to_client_w) = pipe_cloexec()?;

        match unsafe { libc::fork() } {
            -1 => {
                let err = io::Error::last_os_error();
                close_fd(client_to_super_r);
                close_fd(client_to_super_w);
                close_fd(super_to_client_r);
                close_fd(super_to_client_w);
                Err(err.into())
            }
            0 => {
                // Supervisor process.
                close_fd(client_to_super_w);
                close_fd(super_to_client_r);
                if let Err(e) = supervisor::run(settings, client_to_super_r, super_to_client_w) {
                    warn!("supervisor exited with error: {e}");
                }
                close_fd(client_to_super_r);
                close_fd(super_to_client_w);
                unsafe { libc::_exit(0) };
            }
            child_pid => {
                // Parent (client) process.
                close_fd(client_to_super_r);
                close_fd(super_to_client_w);
                Ok(Self {
                    input_fd: client_to_super_w,
                    output_fd: super_to_client_r,
                    child_pid,
                    write_lock: Mutex::new(()),
                    destroyed: false,
                })
            }
        }
    }

    /// Enqueue `path` for execution (spec §4.3 `EXEC`). Aborts the process
    /// on an unrecoverable write failure, matching the original's contract
    /// that a broken queue pipe is a fatal condition rather than one this
    /// layer can meaningfully recover from.
    pub fn add_file(&self, path: &Path) {
        let command = protocol::encode_exec(path);
        self.send_command(&command);
    }

    /// Block until every file enqueued before this call has been attempted
    /// at least once (spec §4.4).
    pub fn flush(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let command = protocol::encode_flush();
        write_all_or_abort(self.input_fd, &command);

        let mut ack = [0u8; 1];
        loop {
            let n = unsafe {
                libc::read(self.output_fd, ack.as_mut_ptr() as *mut c_void, 1)
            };
            if n == 1 {
                return;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
            }
            // EOF (supervisor gone) or any other error: the original aborts
            // here since a flush that cannot be acknowledged leaves the
            // caller unable to know whether its files were processed.
            std::process::abort();
        }
    }

    fn send_command(&self, command: &[u8]) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        write_all_or_abort(self.input_fd, command);
    }

    /// Close both pipes and reap the supervisor process, returning its exit
    /// status translated the way the original does: the process's own exit
    /// code, or the negated signal number if it died from a signal.
    pub fn destroy(mut self) -> i32 {
        self.destroyed = true;
        close_fd(self.input_fd);
        close_fd(self.output_fd);

        let mut status: libc::c_int = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.child_pid, &mut status, 0) };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("waitpid on supervisor failed: {err}");
                return -1;
            }
        }

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
}

impl Drop for JobQueueHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            // Best-effort cleanup if the caller dropped the handle without
            // calling `destroy`: close our ends so the supervisor sees EOF
            // and exits on its own; we do not wait for it.
            close_fd(self.input_fd);
            close_fd(self.output_fd);
        }
    }
}

fn write_all_or_abort(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // A write failure on the command pipe means the supervisor is
            // gone; the original treats this as unrecoverable and aborts
            // rather than silently dropping the command.
            std::process::abort();
        }
        buf = &buf[n as usize..];
    }
}

fn pipe_cloexec() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for &fd in &fds {
        set_cloexec(fd)?;
    }
    Ok((fds[0], fds[1]))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
