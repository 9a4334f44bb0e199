use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Caller identity delivered with each upcall.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    pub uid: u32,
    pub gid: u32,
}

/// Full attribute record for one inode, as returned by lookup/getattr.
/// `nlink` and `blocks` are computed from the directory-entry and block
/// tables rather than stored.
#[derive(Debug, Clone)]
pub struct InodeAttr {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub target: Option<Vec<u8>>,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub nlink: u32,
    pub blocks: u64,
}

impl InodeAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// One streamed directory entry: the row id doubles as the cursor for
/// the next readdir call.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub off: i64,
    pub name: String,
    pub ino: u64,
    pub mode: u32,
}

/// Attribute changes requested by setattr. `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime_ns: Option<i64>,
    pub mtime_ns: Option<i64>,
    pub ctime_ns: Option<i64>,
    pub rdev: Option<u32>,
}

/// statfs snapshot, in blocksize units where applicable.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub frsize: u32,
}

/// Classic owner/group/other permission triage. `mask` is the R/W/X bit
/// set requested by access(2); F_OK (zero) is always granted because the
/// inode was already resolved.
pub fn permits(mode: u32, uid: u32, gid: u32, ctx: Ctx, mask: u32) -> bool {
    if mask == 0 {
        return true;
    }
    let shift = if ctx.uid == uid {
        6
    } else if ctx.gid == gid {
        3
    } else {
        0
    };
    let granted = (mode >> shift) & 0o7;
    granted & mask == mask
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: Ctx = Ctx { uid: 1000, gid: 100 };

    #[test]
    fn test_permits_owner_class() {
        // 0640: owner rw, group r, other nothing.
        assert!(permits(0o640, 1000, 100, CTX, 0o4));
        assert!(permits(0o640, 1000, 100, CTX, 0o6));
        assert!(!permits(0o640, 1000, 100, CTX, 0o1));
    }

    #[test]
    fn test_permits_group_class() {
        assert!(permits(0o640, 0, 100, CTX, 0o4));
        assert!(!permits(0o640, 0, 100, CTX, 0o2));
    }

    #[test]
    fn test_permits_other_class() {
        assert!(!permits(0o640, 0, 0, CTX, 0o4));
        assert!(permits(0o644, 0, 0, CTX, 0o4));
    }

    #[test]
    fn test_permits_owner_wins_over_group() {
        // Owner match uses the owner class even when it grants less.
        assert!(!permits(0o044, 1000, 100, CTX, 0o4));
    }

    #[test]
    fn test_permits_f_ok() {
        assert!(permits(0o000, 0, 0, CTX, 0));
    }

    #[test]
    fn test_kind_helpers() {
        let mut attr = InodeAttr {
            ino: 2,
            mode: libc::S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            target: None,
            atime_ns: 0,
            mtime_ns: 0,
            ctime_ns: 0,
            nlink: 1,
            blocks: 0,
        };
        assert!(attr.is_dir());
        attr.mode = libc::S_IFLNK | 0o777;
        assert!(attr.is_symlink());
        assert!(!attr.is_dir());
    }
}
