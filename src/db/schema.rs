use sqlx::Row;

use crate::db::{is_undefined_table, Db};
use crate::meta::types::now_ns;
use crate::{Result, UdavError};

/// Inode id reserved for every filesystem's root directory.
pub const ROOT_INO: i64 = 1;

/// Idempotent DDL for the four backing tables. The inode id sequence
/// starts at 2 because ino 1 is reserved for roots; `contents.id` is the
/// monotonic readdir cursor. `body` and `contents` cascade from `inodes`
/// so deleting an inode row drops its blocks and directory entries.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fsinfo (
    fsid      TEXT   PRIMARY KEY,
    capacity  BIGINT NOT NULL,
    blocksize BIGINT NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS inode_ids MINVALUE 2;

CREATE TABLE IF NOT EXISTS inodes (
    fsid     TEXT   NOT NULL REFERENCES fsinfo (fsid) ON DELETE CASCADE,
    ino      BIGINT NOT NULL DEFAULT nextval('inode_ids'),
    mode     BIGINT NOT NULL,
    uid      BIGINT NOT NULL,
    gid      BIGINT NOT NULL,
    rdev     BIGINT NOT NULL DEFAULT 0,
    size     BIGINT NOT NULL DEFAULT 0,
    target   BYTEA,
    atime_ns BIGINT NOT NULL,
    mtime_ns BIGINT NOT NULL,
    ctime_ns BIGINT NOT NULL,
    PRIMARY KEY (fsid, ino)
);

CREATE TABLE IF NOT EXISTS contents (
    id     BIGSERIAL,
    fsid   TEXT   NOT NULL,
    parent BIGINT NOT NULL,
    name   TEXT   NOT NULL,
    ino    BIGINT NOT NULL,
    PRIMARY KEY (fsid, parent, name),
    FOREIGN KEY (fsid, ino) REFERENCES inodes (fsid, ino) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS contents_ino_idx ON contents (fsid, ino);
CREATE INDEX IF NOT EXISTS contents_cursor_idx ON contents (fsid, parent, id);

CREATE TABLE IF NOT EXISTS body (
    fsid     TEXT   NOT NULL,
    ino      BIGINT NOT NULL,
    block_no BIGINT NOT NULL,
    data     BYTEA  NOT NULL,
    PRIMARY KEY (fsid, ino, block_no),
    FOREIGN KEY (fsid, ino) REFERENCES inodes (fsid, ino) ON DELETE CASCADE
);
";

/// Create the backing tables if they do not exist yet.
pub async fn create_tables(db: &Db) -> Result<()> {
    db.batch(SCHEMA).await
}

/// Probe for this filesystem's header row. A missing table counts as a
/// missing header (first mount against a fresh database).
pub async fn load_header(db: &Db, fsid: &str) -> Result<Option<(u64, u64)>> {
    let probe = db
        .one_row(sqlx::query("SELECT capacity, blocksize FROM fsinfo WHERE fsid = $1").bind(fsid))
        .await;
    match probe {
        Ok(row) => {
            let capacity: i64 = row.try_get("capacity")?;
            let blocksize: i64 = row.try_get("blocksize")?;
            Ok(Some((capacity as u64, blocksize as u64)))
        }
        Err(UdavError::NoSuchRow) => Ok(None),
        Err(e) if is_undefined_table(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// First-mount initialization: insert the header row, the root inode
/// (directory, 0755, owned by the current process) and the root's `..`
/// entry pointing at itself. Capacity is rounded up to a blocksize
/// multiple. All inserts tolerate a racing first mount.
pub async fn create_filesystem(db: &Db, fsid: &str, blocksize: u64, capacity: u64) -> Result<()> {
    let capacity = (capacity + blocksize - 1) / blocksize * blocksize;

    db.execute(
        sqlx::query(
            "INSERT INTO fsinfo (fsid, capacity, blocksize) VALUES ($1, $2, $3)
             ON CONFLICT (fsid) DO NOTHING",
        )
        .bind(fsid)
        .bind(capacity as i64)
        .bind(blocksize as i64),
    )
    .await?;

    let now = now_ns();
    let mode = (libc::S_IFDIR | 0o755) as i64;
    let uid = unsafe { libc::getuid() } as i64;
    let gid = unsafe { libc::getgid() } as i64;
    db.execute(
        sqlx::query(
            "INSERT INTO inodes (fsid, ino, mode, uid, gid, atime_ns, mtime_ns, ctime_ns)
             VALUES ($1, $2, $3, $4, $5, $6, $6, $6)
             ON CONFLICT (fsid, ino) DO NOTHING",
        )
        .bind(fsid)
        .bind(ROOT_INO)
        .bind(mode)
        .bind(uid)
        .bind(gid)
        .bind(now),
    )
    .await?;

    db.execute(
        sqlx::query(
            "INSERT INTO contents (fsid, parent, name, ino) VALUES ($1, $2, '..', $2)
             ON CONFLICT (fsid, parent, name) DO NOTHING",
        )
        .bind(fsid)
        .bind(ROOT_INO),
    )
    .await?;

    Ok(())
}
