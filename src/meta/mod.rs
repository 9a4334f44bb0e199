pub mod body;
pub mod types;

use std::collections::HashMap;

use parking_lot::Mutex;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::db::{is_unique_violation, schema, Db};
use crate::{Result, UdavError};
use types::{now_ns, permits, Ctx, DirEntry, FsStats, InodeAttr, SetAttr};

/// Inode and directory store over the shared database. One instance per
/// mount; the open-count map is the only process-local state and is
/// rebuilt empty on every mount.
pub struct MetaStore {
    db: Db,
    fsid: String,
    blocksize: u64,
    capacity: u64,
    open_counts: Mutex<HashMap<u64, u64>>,
}

impl MetaStore {
    /// Open (or create) the filesystem identified by `fsid`. On first
    /// mount the tables are created and the header, root inode and the
    /// root's `..` entry inserted; afterwards the stored blocksize and
    /// capacity supersede whatever the command line said.
    pub async fn open(
        db: Db,
        fsid: String,
        blocksize: Option<u64>,
        capacity: Option<u64>,
    ) -> Result<Self> {
        let header = match schema::load_header(&db, &fsid).await? {
            Some(header) => header,
            None => {
                let bs = blocksize.ok_or_else(|| {
                    UdavError::Other("blocksize= is required on first mount".into())
                })?;
                let cap = capacity.ok_or_else(|| {
                    UdavError::Other("fssize= is required on first mount".into())
                })?;
                schema::create_tables(&db).await?;
                schema::create_filesystem(&db, &fsid, bs, cap).await?;
                schema::load_header(&db, &fsid).await?.ok_or_else(|| {
                    UdavError::Other("filesystem header missing after creation".into())
                })?
            }
        };
        let (capacity, blocksize) = header;

        Ok(Self {
            db,
            fsid,
            blocksize,
            capacity,
            open_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn blocksize(&self) -> u64 {
        self.blocksize
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn fsid(&self) -> &str {
        &self.fsid
    }

    // --- resolution -----------------------------------------------------

    /// Resolve a name within a parent directory. `.` is the parent
    /// itself; every other name (including the root's recorded `..`)
    /// goes through the unique (parent, name) entry.
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<InodeAttr> {
        if name == "." {
            return self.stat(parent).await;
        }
        let (ino, _mode) = self.resolve(parent, name).await?;
        self.stat(ino).await
    }

    /// Fetch the full attribute record. Link count and block count are
    /// computed from the directory-entry and block tables in the same
    /// statement.
    pub async fn stat(&self, ino: u64) -> Result<InodeAttr> {
        let row = self
            .db
            .one_row(
                sqlx::query(
                    "SELECT i.ino, i.mode, i.uid, i.gid, i.rdev, i.size, i.target,
                            i.atime_ns, i.mtime_ns, i.ctime_ns,
                            (SELECT COUNT(*) FROM contents c
                              WHERE c.fsid = i.fsid AND c.ino = i.ino) AS nlink,
                            (SELECT COUNT(*) FROM body b
                              WHERE b.fsid = i.fsid AND b.ino = i.ino) AS blocks
                     FROM inodes i WHERE i.fsid = $1 AND i.ino = $2",
                )
                .bind(&self.fsid)
                .bind(ino as i64),
            )
            .await?;
        row_to_attr(&row)
    }

    /// Stream directory entries with row id strictly greater than `off`,
    /// ascending. Offset zero precedes every row id, so the first call
    /// starts from the beginning; each entry carries its own id as the
    /// cursor for the next call.
    pub async fn read_dir(&self, ino: u64, off: i64) -> Result<Vec<DirEntry>> {
        let rows = self
            .db
            .all_rows(
                sqlx::query(
                    "SELECT c.id, c.name, c.ino, i.mode
                     FROM contents c
                     JOIN inodes i ON i.fsid = c.fsid AND i.ino = c.ino
                     WHERE c.fsid = $1 AND c.parent = $2 AND c.id > $3
                     ORDER BY c.id",
                )
                .bind(&self.fsid)
                .bind(ino as i64)
                .bind(off),
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(DirEntry {
                    off: row.try_get("id")?,
                    name: row.try_get("name")?,
                    ino: row.try_get::<i64, _>("ino")? as u64,
                    mode: row.try_get::<i64, _>("mode")? as u32,
                })
            })
            .collect()
    }

    /// Parent directory of an inode, resolved through its inbound
    /// directory entry. The root's `..` self-entry makes the root its
    /// own parent.
    pub async fn parent_of(&self, ino: u64) -> Result<u64> {
        let row = self
            .db
            .one_row(
                sqlx::query(
                    "SELECT parent FROM contents WHERE fsid = $1 AND ino = $2 ORDER BY id LIMIT 1",
                )
                .bind(&self.fsid)
                .bind(ino as i64),
            )
            .await?;
        Ok(row.try_get::<i64, _>("parent")? as u64)
    }

    /// Return the stored symlink target verbatim.
    pub async fn read_link(&self, ino: u64) -> Result<Vec<u8>> {
        let row = self
            .db
            .one_row(
                sqlx::query("SELECT target FROM inodes WHERE fsid = $1 AND ino = $2")
                    .bind(&self.fsid)
                    .bind(ino as i64),
            )
            .await?;
        let target: Option<Vec<u8>> = row.try_get("target")?;
        target.ok_or(UdavError::NotSymlink)
    }

    // --- creation -------------------------------------------------------

    pub async fn mknod(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        rdev: u32,
        ctx: Ctx,
    ) -> Result<InodeAttr> {
        self.create_node(parent, name, mode, ctx, rdev, None).await
    }

    pub async fn mkdir(&self, parent: u64, name: &str, mode: u32, ctx: Ctx) -> Result<InodeAttr> {
        self.create_node(parent, name, mode, ctx, 0, None).await
    }

    pub async fn symlink(
        &self,
        parent: u64,
        name: &str,
        target: &[u8],
        ctx: Ctx,
    ) -> Result<InodeAttr> {
        let mode = libc::S_IFLNK | 0o777;
        self.create_node(parent, name, mode, ctx, 0, Some(target))
            .await
    }

    /// Create a regular file and open it: returns the attributes and a
    /// file handle whose open count is already counted.
    pub async fn create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        ctx: Ctx,
    ) -> Result<(InodeAttr, u64)> {
        let attr = self.create_node(parent, name, mode, ctx, 0, None).await?;
        let fh = self.open_handle(attr.ino);
        Ok((attr, fh))
    }

    /// Add a directory entry for an existing inode under a new name.
    pub async fn link(&self, ino: u64, new_parent: u64, new_name: &str) -> Result<InodeAttr> {
        if self.nlink(new_parent).await? == 0 {
            return Err(UdavError::OrphanParent);
        }
        self.insert_entry(new_parent, new_name, ino).await?;
        self.stat(ino).await
    }

    /// Common creation path: the parent must still be linked somewhere,
    /// then the inode row and its directory entry are inserted.
    async fn create_node(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        ctx: Ctx,
        rdev: u32,
        target: Option<&[u8]>,
    ) -> Result<InodeAttr> {
        if self.nlink(parent).await? == 0 {
            return Err(UdavError::OrphanParent);
        }

        let now = now_ns();
        let row = self
            .db
            .one_row(
                sqlx::query(
                    "INSERT INTO inodes
                         (fsid, mode, uid, gid, rdev, target, atime_ns, mtime_ns, ctime_ns)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $7)
                     RETURNING ino",
                )
                .bind(&self.fsid)
                .bind(mode as i64)
                .bind(ctx.uid as i64)
                .bind(ctx.gid as i64)
                .bind(rdev as i64)
                .bind(target)
                .bind(now),
            )
            .await?;
        let ino = row.try_get::<i64, _>("ino")? as u64;

        if let Err(e) = self.insert_entry(parent, name, ino).await {
            // Without its entry the new inode is unreachable; drop it.
            let _ = self.delete_inode(ino).await;
            return Err(e);
        }

        self.stat(ino).await
    }

    async fn insert_entry(&self, parent: u64, name: &str, ino: u64) -> Result<()> {
        let res = self
            .db
            .execute(
                sqlx::query("INSERT INTO contents (fsid, parent, name, ino) VALUES ($1, $2, $3, $4)")
                    .bind(&self.fsid)
                    .bind(parent as i64)
                    .bind(name)
                    .bind(ino as i64),
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(UdavError::Exists),
            Err(e) => Err(e),
        }
    }

    // --- removal --------------------------------------------------------

    pub async fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        self.remove_entry(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        self.remove_entry(parent, name, true).await
    }

    async fn remove_entry(&self, parent: u64, name: &str, expect_dir: bool) -> Result<()> {
        let (ino, mode) = self.resolve(parent, name).await?;
        let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
        if expect_dir && !is_dir {
            return Err(UdavError::NotDirectory);
        }
        if !expect_dir && is_dir {
            return Err(UdavError::IsDirectory);
        }
        if is_dir && self.child_count(ino).await? > 0 {
            return Err(UdavError::NotEmpty);
        }

        let links = self.nlink(ino).await?;
        self.db
            .execute(
                sqlx::query("DELETE FROM contents WHERE fsid = $1 AND parent = $2 AND name = $3")
                    .bind(&self.fsid)
                    .bind(parent as i64)
                    .bind(name),
            )
            .await?;

        // The last link is gone; the inode survives only while some file
        // descriptor still references it.
        if links == 1 && !self.is_open(ino) {
            self.delete_inode(ino).await?;
        }
        Ok(())
    }

    /// Move a directory entry. A free destination is an in-place update;
    /// an existing one is displaced (only when childless), repointing its
    /// entry at the source inode and deleting the source entry.
    pub async fn rename(
        &self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<()> {
        if old_parent == new_parent && old_name == new_name {
            return Ok(());
        }
        let (old_ino, _) = self.resolve(old_parent, old_name).await?;

        match self.resolve(new_parent, new_name).await {
            Err(UdavError::NoSuchRow) => {
                self.db
                    .execute(
                        sqlx::query(
                            "UPDATE contents SET parent = $1, name = $2
                             WHERE fsid = $3 AND parent = $4 AND name = $5",
                        )
                        .bind(new_parent as i64)
                        .bind(new_name)
                        .bind(&self.fsid)
                        .bind(old_parent as i64)
                        .bind(old_name),
                    )
                    .await?;
                Ok(())
            }
            Ok((displaced, _)) => {
                if self.child_count(displaced).await? > 0 {
                    return Err(UdavError::NotEmpty);
                }
                let links = self.nlink(displaced).await?;
                self.db
                    .execute(
                        sqlx::query(
                            "UPDATE contents SET ino = $1
                             WHERE fsid = $2 AND parent = $3 AND name = $4",
                        )
                        .bind(old_ino as i64)
                        .bind(&self.fsid)
                        .bind(new_parent as i64)
                        .bind(new_name),
                    )
                    .await?;
                self.db
                    .execute(
                        sqlx::query(
                            "DELETE FROM contents WHERE fsid = $1 AND parent = $2 AND name = $3",
                        )
                        .bind(&self.fsid)
                        .bind(old_parent as i64)
                        .bind(old_name),
                    )
                    .await?;
                if links == 1 && !self.is_open(displaced) {
                    // Cascade drops the displaced inode's blocks.
                    self.delete_inode(displaced).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // --- attributes -----------------------------------------------------

    /// Apply the requested attribute changes. Size goes through the
    /// block engine; every other field is an independent update in its
    /// own commit.
    pub async fn set_attr(&self, ino: u64, changes: SetAttr) -> Result<InodeAttr> {
        if let Some(size) = changes.size {
            self.truncate(ino, size).await?;
        }
        if let Some(mode) = changes.mode {
            self.update_field("mode", mode as i64, ino).await?;
        }
        if let Some(uid) = changes.uid {
            self.update_field("uid", uid as i64, ino).await?;
        }
        if let Some(gid) = changes.gid {
            self.update_field("gid", gid as i64, ino).await?;
        }
        if let Some(atime) = changes.atime_ns {
            self.update_field("atime_ns", atime, ino).await?;
        }
        if let Some(mtime) = changes.mtime_ns {
            self.update_field("mtime_ns", mtime, ino).await?;
        }
        if let Some(ctime) = changes.ctime_ns {
            self.update_field("ctime_ns", ctime, ino).await?;
        }
        if let Some(rdev) = changes.rdev {
            self.update_field("rdev", rdev as i64, ino).await?;
        }
        self.stat(ino).await
    }

    async fn update_field(&self, column: &str, value: i64, ino: u64) -> Result<()> {
        // `column` comes from the fixed set above, never from the caller.
        let sql = format!("UPDATE inodes SET {column} = $1 WHERE fsid = $2 AND ino = $3");
        self.db
            .execute(
                sqlx::query(&sql)
                    .bind(value)
                    .bind(&self.fsid)
                    .bind(ino as i64),
            )
            .await?;
        Ok(())
    }

    pub async fn statfs(&self) -> Result<FsStats> {
        let row = self
            .db
            .one_row(
                sqlx::query(
                    "SELECT COALESCE(SUM(size), 0)::BIGINT AS used, COUNT(*) AS files
                     FROM inodes WHERE fsid = $1",
                )
                .bind(&self.fsid),
            )
            .await?;
        let used: i64 = row.try_get("used")?;
        let files: i64 = row.try_get("files")?;

        let total = self.capacity / self.blocksize;
        let free = total.saturating_sub(used as u64 / self.blocksize);
        Ok(FsStats {
            blocks: total,
            bfree: free,
            bavail: free,
            files: files as u64,
            ffree: (files as u64).max(100),
            bsize: self.blocksize as u32,
            frsize: self.blocksize as u32,
        })
    }

    /// Classic R/W/X check against the caller's identity. F_OK succeeds
    /// outright since the inode was already resolved.
    pub async fn access(&self, ino: u64, mask: u32, ctx: Ctx) -> Result<bool> {
        if mask == 0 {
            return Ok(true);
        }
        let row = self
            .db
            .one_row(
                sqlx::query("SELECT mode, uid, gid FROM inodes WHERE fsid = $1 AND ino = $2")
                    .bind(&self.fsid)
                    .bind(ino as i64),
            )
            .await?;
        let mode = row.try_get::<i64, _>("mode")? as u32;
        let uid = row.try_get::<i64, _>("uid")? as u32;
        let gid = row.try_get::<i64, _>("gid")? as u32;
        Ok(permits(mode, uid, gid, ctx, mask))
    }

    // --- open-count lifecycle -------------------------------------------

    /// Count a new file descriptor for the inode. The handle is the
    /// inode id itself.
    pub fn open_handle(&self, ino: u64) -> u64 {
        *self.open_counts.lock().entry(ino).or_insert(0) += 1;
        ino
    }

    pub(crate) fn is_open(&self, ino: u64) -> bool {
        self.open_counts.lock().contains_key(&ino)
    }

    /// Drop a file descriptor. When the last one goes and no directory
    /// entry points at the inode anymore, the inode row (and through the
    /// cascade, its blocks) is deleted.
    pub async fn release(&self, fh: u64) -> Result<()> {
        let closed = {
            let mut counts = self.open_counts.lock();
            match counts.get_mut(&fh) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&fh);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if closed && self.nlink(fh).await? == 0 {
            self.delete_inode(fh).await?;
        }
        Ok(())
    }

    // --- shared queries -------------------------------------------------

    async fn resolve(&self, parent: u64, name: &str) -> Result<(u64, u32)> {
        let row = self
            .db
            .one_row(
                sqlx::query(
                    "SELECT c.ino, i.mode
                     FROM contents c
                     JOIN inodes i ON i.fsid = c.fsid AND i.ino = c.ino
                     WHERE c.fsid = $1 AND c.parent = $2 AND c.name = $3",
                )
                .bind(&self.fsid)
                .bind(parent as i64)
                .bind(name),
            )
            .await?;
        Ok((
            row.try_get::<i64, _>("ino")? as u64,
            row.try_get::<i64, _>("mode")? as u32,
        ))
    }

    /// Number of directory entries pointing at the inode.
    async fn nlink(&self, ino: u64) -> Result<u64> {
        let row = self
            .db
            .one_row(
                sqlx::query("SELECT COUNT(*) AS n FROM contents WHERE fsid = $1 AND ino = $2")
                    .bind(&self.fsid)
                    .bind(ino as i64),
            )
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    /// Number of directory entries inside the inode (children).
    async fn child_count(&self, ino: u64) -> Result<u64> {
        let row = self
            .db
            .one_row(
                sqlx::query("SELECT COUNT(*) AS n FROM contents WHERE fsid = $1 AND parent = $2")
                    .bind(&self.fsid)
                    .bind(ino as i64),
            )
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn delete_inode(&self, ino: u64) -> Result<()> {
        self.db
            .execute(
                sqlx::query("DELETE FROM inodes WHERE fsid = $1 AND ino = $2")
                    .bind(&self.fsid)
                    .bind(ino as i64),
            )
            .await?;
        Ok(())
    }
}

fn row_to_attr(row: &PgRow) -> Result<InodeAttr> {
    Ok(InodeAttr {
        ino: row.try_get::<i64, _>("ino")? as u64,
        mode: row.try_get::<i64, _>("mode")? as u32,
        uid: row.try_get::<i64, _>("uid")? as u32,
        gid: row.try_get::<i64, _>("gid")? as u32,
        rdev: row.try_get::<i64, _>("rdev")? as u32,
        size: row.try_get::<i64, _>("size")? as u64,
        target: row.try_get("target")?,
        atime_ns: row.try_get("atime_ns")?,
        mtime_ns: row.try_get("mtime_ns")?,
        ctime_ns: row.try_get("ctime_ns")?,
        nlink: row.try_get::<i64, _>("nlink")? as u32,
        blocks: row.try_get::<i64, _>("blocks")? as u64,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::str::FromStr;

    use sqlx::postgres::PgConnectOptions;

    use super::MetaStore;
    use crate::db::{schema, Db};
    use crate::meta::types::Ctx;

    pub const BLOCKSIZE: u64 = 64;
    pub const CTX: Ctx = Ctx { uid: 1000, gid: 1000 };

    /// Connect to the server named by UDAVFS3_TEST_DB and open a fresh
    /// filesystem for the given tag, wiping whatever an earlier run
    /// left behind. Returns None (test skipped) when the variable is
    /// unset.
    pub async fn store(tag: &str) -> Option<MetaStore> {
        let url = std::env::var("UDAVFS3_TEST_DB").ok()?;
        let opts = PgConnectOptions::from_str(&url).expect("parse UDAVFS3_TEST_DB");
        let db = Db::with_options(opts).await.expect("connect test database");

        let fsid = crate::fsid(&format!("udavfs3-test-{tag}"));
        schema::create_tables(&db).await.expect("create tables");
        // Cascade from fsinfo removes inodes, entries and blocks.
        db.execute(sqlx::query("DELETE FROM fsinfo WHERE fsid = $1").bind(&fsid))
            .await
            .expect("wipe previous state");

        let store = MetaStore::open(db, fsid, Some(BLOCKSIZE), Some(4 * 1024 * 1024))
            .await
            .expect("open store");
        Some(store)
    }
}
