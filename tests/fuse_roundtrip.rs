//! End-to-end test driving the compiled `queuefs` binary against a real FUSE
//! mount (spec §8, scenarios S1-S2).
//!
//! Mounting FUSE requires `/dev/fuse` and either root or `user_allow_other`
//! in `/etc/fuse.conf`; neither is guaranteed in every environment this
//! crate is built in (e.g. unprivileged CI containers), so every test here
//! skips itself with a message instead of failing when the mount cannot be
//! brought up — mirroring the teacher's own `timeout_retries.rs`, which
//! skips gracefully when its optional interpreter dependency is missing.

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

use assert_cmd::cargo::cargo_bin;

struct Mount {
    child: Child,
    mount_point: tempfile::TempDir,
}

impl Mount {
    fn start(src: &Path, extra_args: &[&str]) -> Option<Self> {
        let mount_point = tempfile::tempdir().expect("tempdir");

        let mut cmd = Command::new(cargo_bin("queuefs"));
        cmd.arg(src).arg(mount_point.path()).args(extra_args);
        let child = cmd.spawn().expect("spawn queuefs");

        // Give the mount a moment to come up, then confirm it actually did
        // by checking the mountpoint lists something (an empty passthrough
        // of an empty dir still triggers a successful `readdir`, proving the
        // FUSE session is live).
        for _ in 0..50 {
            if std::fs::read_dir(mount_point.path()).is_ok() {
                return Some(Self { child, mount_point });
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        None
    }

    fn path(&self) -> &Path {
        self.mount_point.path()
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        let _ = Command::new("fusermount")
            .arg("-u")
            .arg(self.mount_point.path())
            .status();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn skip(reason: &str) {
    eprintln!("skipping fuse_roundtrip test: {reason} (no usable FUSE in this environment)");
}

#[test]
fn writing_a_file_through_the_mount_runs_the_command() {
    let src = tempfile::tempdir().expect("tempdir");
    let marker = src.path().join("ran");

    let Some(mount) = Mount::start(
        src.path(),
        &[&format!("touch {}", marker.display())],
    ) else {
        skip("mount did not come up");
        return;
    };

    let target = mount.path().join("hello.txt");
    {
        let mut f = match std::fs::File::create(&target) {
            Ok(f) => f,
            Err(_) => {
                skip("could not create a file through the mount");
                return;
            }
        };
        let _ = f.write_all(b"hi");
    }
    // Dropping `f` closes it, triggering `release` and enqueueing the job.

    for _ in 0..50 {
        if marker.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    assert!(marker.exists(), "queued command never ran after file release");
}

#[test]
fn passthrough_read_sees_what_was_written_on_the_source_side() {
    let src = tempfile::tempdir().expect("tempdir");
    std::fs::write(src.path().join("preexisting.txt"), b"already here").unwrap();

    let Some(mount) = Mount::start(src.path(), &["true"]) else {
        skip("mount did not come up");
        return;
    };

    let seen = match std::fs::read(mount.path().join("preexisting.txt")) {
        Ok(bytes) => bytes,
        Err(_) => {
            skip("could not read through the mount");
            return;
        }
    };
    assert_eq!(seen, b"already here");
}
