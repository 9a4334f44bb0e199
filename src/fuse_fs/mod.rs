use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error};

use crate::meta::types::{now_ns, Ctx, InodeAttr, SetAttr};
use crate::meta::MetaStore;
use crate::UdavError;

/// Advisory entry/attribute timeout handed to the kernel.
const TTL: Duration = Duration::from_secs(300);

/// Binds kernel upcalls to the store. Upcalls arrive on the bridge's
/// threads and block on the runtime for each database round trip.
pub struct UdavFs {
    store: MetaStore,
    rt: tokio::runtime::Handle,
}

impl UdavFs {
    pub fn new(store: MetaStore, rt: tokio::runtime::Handle) -> Self {
        Self { store, rt }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    /// errno for a failed operation; anything surfacing as EIO is an
    /// internal failure worth logging.
    fn fail(&self, op: &str, err: &UdavError) -> libc::c_int {
        let errno = err.errno();
        if errno == libc::EIO {
            error!("{op}: {err}");
        } else {
            debug!("{op}: {err}");
        }
        errno
    }

    fn attr(&self, attr: &InodeAttr) -> FileAttr {
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: system_time(attr.atime_ns),
            mtime: system_time(attr.mtime_ns),
            ctime: system_time(attr.ctime_ns),
            crtime: system_time(attr.ctime_ns),
            kind: file_type(attr.mode),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: self.store.blocksize() as u32,
            flags: 0,
        }
    }
}

fn ctx(req: &Request<'_>) -> Ctx {
    Ctx {
        uid: req.uid(),
        gid: req.gid(),
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

fn time_ns(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => now_ns(),
    }
}

impl Filesystem for UdavFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        debug!("FUSE init");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.block_on(self.store.lookup(parent, name)) {
            Ok(attr) => reply.entry(&TTL, &self.attr(&attr), 0),
            Err(e) => reply.error(self.fail("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.block_on(self.store.stat(ino)) {
            Ok(attr) => reply.attr(&TTL, &self.attr(&attr)),
            Err(e) => reply.error(self.fail("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime_ns: atime.map(time_ns),
            mtime_ns: mtime.map(time_ns),
            ctime_ns: ctime.map(|t| time_ns(TimeOrNow::SpecificTime(t))),
            rdev: None,
        };
        match self.block_on(self.store.set_attr(ino, changes)) {
            Ok(attr) => reply.attr(&TTL, &self.attr(&attr)),
            Err(e) => reply.error(self.fail("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.block_on(self.store.read_link(ino)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(self.fail("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.block_on(self.store.mknod(parent, name, mode, rdev, ctx(req))) {
            Ok(attr) => reply.entry(&TTL, &self.attr(&attr), 0),
            Err(e) => reply.error(self.fail("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let mode = mode | libc::S_IFDIR;
        match self.block_on(self.store.mkdir(parent, name, mode, ctx(req))) {
            Ok(attr) => reply.entry(&TTL, &self.attr(&attr), 0),
            Err(e) => reply.error(self.fail("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.block_on(self.store.unlink(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.fail("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.block_on(self.store.rmdir(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.fail("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(name) = link_name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        use std::os::unix::ffi::OsStrExt;
        let target = target.as_os_str().as_bytes();
        match self.block_on(self.store.symlink(parent, name, target, ctx(req))) {
            Ok(attr) => reply.entry(&TTL, &self.attr(&attr), 0),
            Err(e) => reply.error(self.fail("symlink", &e)),
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
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.block_on(self.store.rename(parent, name, newparent, newname)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.fail("rename", &e)),
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
        let Some(newname) = newname.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.block_on(self.store.link(ino, newparent, newname)) {
            Ok(attr) => reply.entry(&TTL, &self.attr(&attr), 0),
            Err(e) => reply.error(self.fail("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fh = self.store.open_handle(ino);
        reply.opened(fh, 0);
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
        let offset = offset.max(0) as u64;
        match self.block_on(self.store.read(fh, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(self.fail("read", &e)),
        }
    }

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
        let offset = offset.max(0) as u64;
        match self.block_on(self.store.write(fh, offset, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(self.fail("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock: u64, reply: ReplyEmpty) {
        // Every write already committed on its own.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.block_on(self.store.release(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.fail("release", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        // `.` and `..` occupy the reserved cursor offsets 1 and 2;
        // stored rows follow at their row id shifted by 2, keeping the
        // store's strictly-greater cursor protocol intact.
        if offset < 1 {
            if reply.add(ino, 1, FileType::Directory, ".") {
                reply.ok();
                return;
            }
        }
        if offset < 2 {
            let parent = self.block_on(self.store.parent_of(ino)).unwrap_or(ino);
            if reply.add(parent, 2, FileType::Directory, "..") {
                reply.ok();
                return;
            }
        }

        let cursor = (offset - 2).max(0);
        let entries = match self.block_on(self.store.read_dir(ino, cursor)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(self.fail("readdir", &e));
                return;
            }
        };
        for entry in entries {
            // The root stores its own `..` row; it was already emitted.
            if entry.name == ".." {
                continue;
            }
            if reply.add(entry.ino, entry.off + 2, file_type(entry.mode), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.block_on(self.store.statfs()) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, 255, st.frsize,
            ),
            Err(e) => reply.error(self.fail("statfs", &e)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.block_on(self.store.access(ino, mask as u32, ctx(req))) {
            Ok(true) => reply.ok(),
            Ok(false) => reply.error(libc::EACCES),
            Err(e) => reply.error(self.fail("access", &e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let mode = mode | libc::S_IFREG;
        match self.block_on(self.store.create(parent, name, mode, ctx(req))) {
            Ok((attr, fh)) => reply.created(&TTL, &self.attr(&attr), 0, fh, 0),
            Err(e) => reply.error(self.fail("create", &e)),
        }
    }
}
