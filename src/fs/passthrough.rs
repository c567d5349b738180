//! The passthrough `fuser::Filesystem` implementation (spec §4.7, §6).
//!
//! Every operation resolves the kernel's inode number to a path under
//! `source_root` via [`InodeTable`] and forwards to the real filesystem.
//! `release`, on files that were opened writable, is the one place this
//! filesystem does anything beyond passthrough: it hands the file's absolute
//! path to the job queue (spec §4.7).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use tracing::{debug, trace, warn};

use crate::queue::JobQueueHandle;

use super::inode::{InodeTable, ROOT_INO};

/// Attribute cache TTL handed back to the kernel with every reply. The
/// source directory is assumed to change only through this mount or through
/// jobs it spawns, so a short TTL is enough to avoid redundant `stat`s
/// without risking long-lived staleness.
const TTL: Duration = Duration::from_secs(1);

struct OpenFile {
    file: File,
    /// Opened with a mode that permits writing; set on `release` as the
    /// trigger for enqueueing a job (spec §4.7: "any file closed after being
    /// opened for writing").
    writable: bool,
}

/// `queuefs`'s FUSE frontend: a transparent mirror of `source_root` that
/// enqueues a job for every file released after a writable open.
pub struct PassthroughFs {
    source_root: PathBuf,
    queue: Arc<JobQueueHandle>,
    inodes: InodeTable,
    open_files: HashMap<u64, OpenFile>,
    open_dirs: HashMap<u64, PathBuf>,
    next_fh: u64,
}

impl PassthroughFs {
    pub fn new(source_root: PathBuf, queue: Arc<JobQueueHandle>) -> Self {
        Self {
            source_root,
            queue,
            inodes: InodeTable::new(),
            open_files: HashMap::new(),
            open_dirs: HashMap::new(),
            next_fh: 1,
        }
    }

    fn real_path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.path(ino).map(|rel| self.source_root.join(rel))
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn attr_for(&self, ino: u64, meta: &fs::Metadata) -> FileAttr {
        FileAttr {
            ino,
            size: meta.size(),
            blocks: meta.blocks(),
            atime: to_system_time(meta.atime(), meta.atime_nsec()),
            mtime: to_system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: to_system_time(meta.ctime(), meta.ctime_nsec()),
            crtime: SystemTime::UNIX_EPOCH,
            kind: file_type_of(meta.file_type()),
            perm: (meta.permissions().mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        }
    }
}

impl Filesystem for PassthroughFs {
    fn destroy(&mut self) {
        debug!("unmounting, flushing and tearing down job queue");
        self.queue.flush();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path(parent).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };
        let rel = parent_path.join(name);
        let abs = self.source_root.join(&rel);

        match fs::symlink_metadata(&abs) {
            Ok(meta) => {
                let ino = self.inodes.lookup(&rel);
                reply.entry(&TTL, &self.attr_for(ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.real_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match fs::symlink_metadata(&path) {
            Ok(meta) => reply.attr(&TTL, &self.attr_for(ino, &meta)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.real_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if atime.is_some() || mtime.is_some() {
            let c_path = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
                Ok(c) => c,
                Err(_) => {
                    reply.error(libc::EINVAL);
                    return;
                }
            };
            let specs = [timespec_of(atime), timespec_of(mtime)];
            let ret = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), specs.as_ptr(), 0) };
            if ret != 0 {
                reply.error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        }

        if let Some(mode) = mode {
            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = OpenOptions::new().write(true).open(&path).and_then(|f| f.set_len(size)) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            let c_path = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
                Ok(c) => c,
                Err(_) => {
                    reply.error(libc::EINVAL);
                    return;
                }
            };
            // libc::uid_t::MAX / gid_t::MAX tell chown(2) to leave that field
            // unchanged, matching `setattr`'s "only the fields that are
            // `Some` should change" contract.
            let raw_uid = uid.unwrap_or(libc::uid_t::MAX as u32) as libc::uid_t;
            let raw_gid = gid.unwrap_or(libc::gid_t::MAX as u32) as libc::gid_t;
            let ret = unsafe { libc::chown(c_path.as_ptr(), raw_uid, raw_gid) };
            if ret != 0 {
                reply.error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        }

        match fs::symlink_metadata(&path) {
            Ok(meta) => reply.attr(&TTL, &self.attr_for(ino, &meta)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.real_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match fs::read_link(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path(parent).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };
        let rel = parent_path.join(name);
        let abs = self.source_root.join(&rel);

        if let Err(e) = fs::create_dir(&abs) {
            reply.error(errno_of(&e));
            return;
        }
        let _ = fs::set_permissions(&abs, fs::Permissions::from_mode(mode));

        match fs::symlink_metadata(&abs) {
            Ok(meta) => {
                let ino = self.inodes.lookup(&rel);
                reply.entry(&TTL, &self.attr_for(ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path(parent).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.source_root.join(parent_path.join(name));
        match fs::remove_file(&abs) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path(parent).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.source_root.join(parent_path.join(name));
        match fs::remove_dir(&abs) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path(parent).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };
        let rel = parent_path.join(link_name);
        let abs = self.source_root.join(&rel);

        if let Err(e) = std::os::unix::fs::symlink(target, &abs) {
            reply.error(errno_of(&e));
            return;
        }
        match fs::symlink_metadata(&abs) {
            Ok(meta) => {
                let ino = self.inodes.lookup(&rel);
                reply.entry(&TTL, &self.attr_for(ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(newparent_path)) = (
            self.inodes.path(parent).map(Path::to_path_buf),
            self.inodes.path(newparent).map(Path::to_path_buf),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        let old_rel = parent_path.join(name);
        let new_rel = newparent_path.join(newname);

        match fs::rename(self.source_root.join(&old_rel), self.source_root.join(&new_rel)) {
            Ok(()) => {
                self.inodes.rename(&old_rel, &new_rel);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(path), Some(newparent_path)) = (
            self.real_path(ino),
            self.inodes.path(newparent).map(Path::to_path_buf),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        let new_rel = newparent_path.join(newname);
        let new_abs = self.source_root.join(&new_rel);

        if let Err(e) = fs::hard_link(&path, &new_abs) {
            reply.error(errno_of(&e));
            return;
        }
        match fs::symlink_metadata(&new_abs) {
            Ok(meta) => {
                let new_ino = self.inodes.lookup(&new_rel);
                reply.entry(&TTL, &self.attr_for(new_ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.real_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let writable = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;

        let opened = OpenOptions::new()
            .read(true)
            .write(writable)
            .custom_flags(flags & !(libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT))
            .open(&path);

        match opened {
            Ok(file) => {
                let fh = self.alloc_fh();
                self.open_files.insert(fh, OpenFile { file, writable });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(open) = self.open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match open.file.read_at(&mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(open) = self.open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match open.file.write_at(data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(open) = self.open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match open.file.sync_data() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(open) = self.open_files.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        if open.writable {
            if let Some(path) = self.real_path(ino) {
                trace!(?path, "enqueueing job for released writable file");
                self.queue.add_file(&path);
            } else {
                warn!(ino, "released file has no known path, dropping job");
            }
        }

        drop(open.file);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(open) = self.open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let result = if datasync { open.file.sync_data() } else { open.file.sync_all() };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.real_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fh = self.alloc_fh();
        self.open_dirs.insert(fh, path);
        reply.opened(fh, 0);
    }

    /// Lists directory entries without a per-entry `stat` (spec §C.7): the
    /// file type comes from the directory read itself, mirroring the
    /// original's use of `d_type` instead of an `lstat` per entry.
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir_path) = self.open_dirs.get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };
        let Some(rel) = self.inodes.path(ino).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mut entries = vec![(ino, FileType::Directory, ".".to_string())];
        if let Some(parent_rel) = rel.parent() {
            let parent_ino = self.inodes.lookup(parent_rel);
            entries.push((parent_ino, FileType::Directory, "..".to_string()));
        } else {
            entries.push((ROOT_INO, FileType::Directory, "..".to_string()));
        }

        let read_dir = match fs::read_dir(&dir_path) {
            Ok(rd) => rd,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };

        for entry in read_dir.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let name = entry.file_name();
            let entry_rel = rel.join(&name);
            let entry_ino = self.inodes.lookup(&entry_rel);
            entries.push((entry_ino, file_type_of(file_type), name.to_string_lossy().into_owned()));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.open_dirs.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let c_path = match std::ffi::CString::new(self.source_root.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let mut statvfs: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut statvfs) };
        if ret != 0 {
            reply.error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        reply.statfs(
            statvfs.f_blocks,
            statvfs.f_bfree,
            statvfs.f_bavail,
            statvfs.f_files,
            statvfs.f_ffree,
            statvfs.f_bsize as u32,
            statvfs.f_namemax as u32,
            statvfs.f_frsize as u32,
        );
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.real_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let c_path = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let ret = unsafe { libc::access(c_path.as_ptr(), mask) };
        if ret == 0 {
            reply.ok();
        } else {
            reply.error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EACCES));
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.inodes.path(parent).map(Path::to_path_buf) else {
            reply.error(libc::ENOENT);
            return;
        };
        let rel = parent_path.join(name);
        let abs = self.source_root.join(&rel);

        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .open(&abs);

        match opened {
            Ok(file) => {
                let meta = match file.metadata() {
                    Ok(meta) => meta,
                    Err(e) => {
                        reply.error(errno_of(&e));
                        return;
                    }
                };
                let ino = self.inodes.lookup(&rel);
                let fh = self.alloc_fh();
                self.open_files.insert(fh, OpenFile { file, writable: true });
                reply.created(&TTL, &self.attr_for(ino, &meta), 0, fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }
}

fn file_type_of(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn errno_of(err: &io::Error) -> libc::c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Translate a `setattr` time argument into a `utimensat(2)` timespec:
/// `UTIME_OMIT` when the kernel didn't ask to change this field,
/// `UTIME_NOW` for [`fuser::TimeOrNow::Now`], otherwise the given time.
fn timespec_of(t: Option<fuser::TimeOrNow>) -> libc::timespec {
    match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(fuser::TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(fuser::TimeOrNow::SpecificTime(time)) => {
            let dur = time
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: dur.subsec_nanos() as i64,
            }
        }
    }
}
