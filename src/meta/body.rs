//! Block-aligned file bodies: translating arbitrary byte ranges into
//! fixed-size block reads, partial-block splices and tail trimming.
//! All block math is integer arithmetic.

use sqlx::Row;

use crate::meta::types::now_ns;
use crate::meta::MetaStore;
use crate::{Result, UdavError};

impl MetaStore {
    /// Read up to `len` bytes at `offset`. Reads past EOF return empty;
    /// reads straddling EOF are clamped. A stored block may be shorter
    /// than the block size (a fitting grow leaves the tail payload
    /// untouched), so blocks are laid onto a zeroed canvas.
    pub async fn read(&self, ino: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        let bs = self.blocksize();
        let size = self.inode_size(ino).await?;
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let len = (len as u64).min(size - offset);

        let first = offset / bs;
        let last = (offset + len - 1) / bs;
        let rows = self
            .db()
            .all_rows(
                sqlx::query(
                    "SELECT block_no, data FROM body
                     WHERE fsid = $1 AND ino = $2 AND block_no BETWEEN $3 AND $4
                     ORDER BY block_no",
                )
                .bind(self.fsid())
                .bind(ino as i64)
                .bind(first as i64)
                .bind(last as i64),
            )
            .await?;

        let mut canvas = vec![0u8; ((last - first + 1) * bs) as usize];
        for row in &rows {
            let block_no = row.try_get::<i64, _>("block_no")? as u64;
            let data: Vec<u8> = row.try_get("data")?;
            let at = ((block_no - first) * bs) as usize;
            let n = data.len().min(bs as usize);
            canvas[at..at + n].copy_from_slice(&data[..n]);
        }

        let head = (offset - first * bs) as usize;
        Ok(canvas[head..head + len as usize].to_vec())
    }

    /// Write `data` at `offset`, splicing each touched block over its old
    /// content (all zeros for blocks past the old end of file). Extends
    /// the recorded size when the write ends past it. Returns the number
    /// of bytes written.
    pub async fn write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<u32> {
        if data.is_empty() {
            return Ok(0);
        }
        let bs = self.blocksize();
        let size = self.inode_size(ino).await?;
        let old_blocks = (size + bs - 1) / bs;

        let end = offset + data.len() as u64;
        let first = offset / bs;
        let last = (end - 1) / bs;

        for block_no in first..=last {
            let block_start = block_no * bs;
            let seg_start = offset.max(block_start);
            let seg_end = end.min(block_start + bs);

            let (mut block, exists) = if block_no >= old_blocks {
                (vec![0u8; bs as usize], false)
            } else {
                self.fetch_block(ino, block_no).await?
            };
            block.resize(bs as usize, 0);

            block[(seg_start - block_start) as usize..(seg_end - block_start) as usize]
                .copy_from_slice(&data[(seg_start - offset) as usize..(seg_end - offset) as usize]);

            self.store_block(ino, block_no, &block, exists).await?;
        }

        let new_size = size.max(end);
        self.db()
            .execute(
                sqlx::query(
                    "UPDATE inodes SET size = $1, mtime_ns = $2, ctime_ns = $2
                     WHERE fsid = $3 AND ino = $4",
                )
                .bind(new_size as i64)
                .bind(now_ns())
                .bind(self.fsid())
                .bind(ino as i64),
            )
            .await?;

        Ok(data.len() as u32)
    }

    /// Change the file size. Growth that fits in the tail block's unused
    /// remainder touches no blocks; further growth allocates zero blocks
    /// through the write path so the stored block count never exceeds
    /// what the new size requires. Shrinking trims or deletes from the
    /// tail inward.
    pub(crate) async fn truncate(&self, ino: u64, new_size: u64) -> Result<()> {
        let bs = self.blocksize();
        let size = self.inode_size(ino).await?;

        if new_size > size {
            let blocks = (size + bs - 1) / bs;
            let end_len = size % bs;
            let fits_in_tail = end_len > 0 && new_size - size <= bs - end_len;
            if !fits_in_tail {
                // First boundary not yet backed by a block.
                let mut off = blocks * bs;
                while off < new_size {
                    let n = bs.min(new_size - off);
                    self.write(ino, off, &vec![0u8; n as usize]).await?;
                    off += n;
                }
            }
        } else if new_size < size {
            let mut d = size - new_size;
            let mut blocks = (size + bs - 1) / bs;
            let end_len = size % bs;

            if d < end_len {
                self.trim_block(ino, blocks - 1, (end_len - d) as usize).await?;
            } else if d == end_len && end_len > 0 {
                self.delete_blocks_from(ino, blocks - 1).await?;
            } else {
                if end_len > 0 {
                    self.delete_blocks_from(ino, blocks - 1).await?;
                    d -= end_len;
                    blocks -= 1;
                }
                let full = d / bs;
                let rem = d % bs;
                if full > 0 {
                    self.delete_blocks_from(ino, blocks - full).await?;
                    blocks -= full;
                }
                if rem > 0 {
                    self.trim_block(ino, blocks - 1, (bs - rem) as usize).await?;
                }
            }
        }

        self.db()
            .execute(
                sqlx::query("UPDATE inodes SET size = $1 WHERE fsid = $2 AND ino = $3")
                    .bind(new_size as i64)
                    .bind(self.fsid())
                    .bind(ino as i64),
            )
            .await?;
        Ok(())
    }

    async fn inode_size(&self, ino: u64) -> Result<u64> {
        let row = self
            .db()
            .one_row(
                sqlx::query("SELECT size FROM inodes WHERE fsid = $1 AND ino = $2")
                    .bind(self.fsid())
                    .bind(ino as i64),
            )
            .await?;
        Ok(row.try_get::<i64, _>("size")? as u64)
    }

    /// Fetch one block's stored payload. Returns the payload and whether
    /// the row exists; a missing row within the live range reads as
    /// zeros (and will be inserted, not updated, when persisted).
    async fn fetch_block(&self, ino: u64, block_no: u64) -> Result<(Vec<u8>, bool)> {
        let fetched = self
            .db()
            .one_row(
                sqlx::query("SELECT data FROM body WHERE fsid = $1 AND ino = $2 AND block_no = $3")
                    .bind(self.fsid())
                    .bind(ino as i64)
                    .bind(block_no as i64),
            )
            .await;
        match fetched {
            Ok(row) => Ok((row.try_get("data")?, true)),
            Err(UdavError::NoSuchRow) => Ok((vec![0u8; self.blocksize() as usize], false)),
            Err(e) => Err(e),
        }
    }

    /// Persist a block, keyed by (fsid, ino, block_no).
    async fn store_block(&self, ino: u64, block_no: u64, data: &[u8], exists: bool) -> Result<()> {
        let query = if exists {
            sqlx::query(
                "UPDATE body SET data = $4 WHERE fsid = $1 AND ino = $2 AND block_no = $3",
            )
        } else {
            sqlx::query("INSERT INTO body (fsid, ino, block_no, data) VALUES ($1, $2, $3, $4)")
        };
        self.db()
            .execute(
                query
                    .bind(self.fsid())
                    .bind(ino as i64)
                    .bind(block_no as i64)
                    .bind(data),
            )
            .await?;
        Ok(())
    }

    /// Rewrite a block keeping its first `keep` bytes and zeroing the
    /// rest of the block.
    async fn trim_block(&self, ino: u64, block_no: u64, keep: usize) -> Result<()> {
        let (mut block, exists) = self.fetch_block(ino, block_no).await?;
        block.resize(self.blocksize() as usize, 0);
        block[keep..].fill(0);
        self.store_block(ino, block_no, &block, exists).await
    }

    /// Delete every block with block_no >= `from`.
    async fn delete_blocks_from(&self, ino: u64, from: u64) -> Result<()> {
        self.db()
            .execute(
                sqlx::query("DELETE FROM body WHERE fsid = $1 AND ino = $2 AND block_no >= $3")
                    .bind(self.fsid())
                    .bind(ino as i64)
                    .bind(from as i64),
            )
            .await?;
        Ok(())
    }

    /// Number of stored blocks, for assertions about trimming.
    #[cfg(test)]
    pub(crate) async fn block_count(&self, ino: u64) -> Result<u64> {
        let row = self
            .db()
            .one_row(
                sqlx::query("SELECT COUNT(*) AS n FROM body WHERE fsid = $1 AND ino = $2")
                    .bind(self.fsid())
                    .bind(ino as i64),
            )
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::schema::ROOT_INO;
    use crate::meta::testutil::{store, BLOCKSIZE, CTX};
    use crate::meta::types::SetAttr;
    use crate::meta::MetaStore;
    use crate::UdavError;

    const ROOT: u64 = ROOT_INO as u64;
    const BS: u64 = BLOCKSIZE;

    async fn new_file(store: &MetaStore, name: &str) -> (u64, u64) {
        let (attr, fh) = store
            .create(ROOT, name, libc::S_IFREG | 0o644, CTX)
            .await
            .unwrap();
        (attr.ino, fh)
    }

    async fn truncate(store: &MetaStore, ino: u64, size: u64) {
        store
            .set_attr(ino, SetAttr { size: Some(size), ..Default::default() })
            .await
            .unwrap();
    }

    /// Distinct non-zero payload for boundary checks.
    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251 + 1) as u8).collect()
    }

    #[tokio::test]
    async fn test_write_read_within_one_block() {
        let Some(store) = store("body-one-block").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern(10);
        assert_eq!(store.write(ino, 3, &buf).await.unwrap(), 10);
        assert_eq!(store.read(ino, 3, 10).await.unwrap(), buf);
        // The preserved head reads as zeros.
        assert_eq!(store.read(ino, 0, 3).await.unwrap(), vec![0, 0, 0]);
        assert_eq!(store.stat(ino).await.unwrap().size, 13);
        assert_eq!(store.block_count(ino).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_crossing_one_boundary() {
        let Some(store) = store("body-boundary").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern(20);
        store.write(ino, BS - 10, &buf).await.unwrap();
        assert_eq!(store.read(ino, BS - 10, 20).await.unwrap(), buf);
        assert_eq!(store.stat(ino).await.unwrap().size, BS + 10);
        assert_eq!(store.block_count(ino).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_spanning_three_blocks() {
        let Some(store) = store("body-span").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern((2 * BS + 20) as usize);
        store.write(ino, 10, &buf).await.unwrap();
        assert_eq!(store.read(ino, 10, buf.len() as u32).await.unwrap(), buf);
        assert_eq!(store.stat(ino).await.unwrap().size, 2 * BS + 30);
        assert_eq!(store.block_count(ino).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_overwrite_preserves_neighbors() {
        let Some(store) = store("body-overwrite").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let base = vec![0xAAu8; (2 * BS) as usize];
        store.write(ino, 0, &base).await.unwrap();
        store.write(ino, BS - 2, &[1, 2, 3, 4]).await.unwrap();

        let all = store.read(ino, 0, (2 * BS) as u32).await.unwrap();
        assert_eq!(all[..(BS - 2) as usize], base[..(BS - 2) as usize]);
        assert_eq!(all[(BS - 2) as usize..(BS + 2) as usize], [1, 2, 3, 4]);
        assert_eq!(all[(BS + 2) as usize..], base[(BS + 2) as usize..]);
    }

    #[tokio::test]
    async fn test_read_past_eof_and_straddling() {
        let Some(store) = store("body-eof").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        store.write(ino, 0, &pattern(10)).await.unwrap();
        assert!(store.read(ino, 10, 5).await.unwrap().is_empty());
        assert!(store.read(ino, 100, 5).await.unwrap().is_empty());
        // Straddling EOF clamps to the 4 remaining bytes.
        assert_eq!(store.read(ino, 6, 100).await.unwrap(), pattern(10)[6..]);
    }

    #[tokio::test]
    async fn test_grow_within_tail_block() {
        let Some(store) = store("body-grow-tail").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        store.write(ino, 0, &pattern(10)).await.unwrap();
        truncate(&store, ino, BS).await;

        let attr = store.stat(ino).await.unwrap();
        assert_eq!(attr.size, BS);
        assert_eq!(store.block_count(ino).await.unwrap(), 1);

        let all = store.read(ino, 0, BS as u32).await.unwrap();
        assert_eq!(all[..10], pattern(10));
        assert!(all[10..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_grow_allocates_zero_blocks() {
        let Some(store) = store("body-grow-alloc").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        store.write(ino, 0, &pattern(10)).await.unwrap();
        truncate(&store, ino, 3 * BS + 7).await;

        let attr = store.stat(ino).await.unwrap();
        assert_eq!(attr.size, 3 * BS + 7);
        assert_eq!(store.block_count(ino).await.unwrap(), 4);

        let all = store.read(ino, 0, (3 * BS + 7) as u32).await.unwrap();
        assert_eq!(all.len() as u64, 3 * BS + 7);
        assert_eq!(all[..10], pattern(10));
        assert!(all[10..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_grow_across_block_boundary_via_write() {
        let Some(store) = store("body-sparse-write").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        // Write 10 bytes straddling the first block boundary of an empty
        // file: everything before them reads as zeros.
        let buf = pattern(10);
        store.write(ino, BS - 6, &buf).await.unwrap();

        let attr = store.stat(ino).await.unwrap();
        assert_eq!(attr.size, BS + 4);

        let all = store.read(ino, 0, (BS + 4) as u32).await.unwrap();
        assert!(all[..(BS - 6) as usize].iter().all(|&b| b == 0));
        assert_eq!(all[(BS - 6) as usize..], buf);
    }

    #[tokio::test]
    async fn test_shrink_within_tail() {
        let Some(store) = store("body-shrink-tail").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern((BS + 20) as usize);
        store.write(ino, 0, &buf).await.unwrap();
        truncate(&store, ino, BS + 5).await;

        assert_eq!(store.stat(ino).await.unwrap().size, BS + 5);
        assert_eq!(store.block_count(ino).await.unwrap(), 2);
        assert_eq!(
            store.read(ino, 0, (BS + 5) as u32).await.unwrap(),
            buf[..(BS + 5) as usize]
        );

        // Growing back exposes zeros, not the trimmed bytes.
        truncate(&store, ino, BS + 20).await;
        let regrown = store.read(ino, 0, (BS + 20) as u32).await.unwrap();
        assert!(regrown[(BS + 5) as usize..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_shrink_removes_exact_tail() {
        let Some(store) = store("body-shrink-exact").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern((BS + 20) as usize);
        store.write(ino, 0, &buf).await.unwrap();
        truncate(&store, ino, BS).await;

        assert_eq!(store.stat(ino).await.unwrap().size, BS);
        assert_eq!(store.block_count(ino).await.unwrap(), 1);
        assert_eq!(store.read(ino, 0, BS as u32).await.unwrap(), buf[..BS as usize]);
    }

    #[tokio::test]
    async fn test_shrink_tail_plus_full_blocks() {
        let Some(store) = store("body-shrink-full").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern((3 * BS + 20) as usize);
        store.write(ino, 0, &buf).await.unwrap();
        truncate(&store, ino, BS).await;

        assert_eq!(store.stat(ino).await.unwrap().size, BS);
        assert_eq!(store.block_count(ino).await.unwrap(), 1);
        assert_eq!(store.read(ino, 0, BS as u32).await.unwrap(), buf[..BS as usize]);
    }

    #[tokio::test]
    async fn test_shrink_to_partial_new_tail() {
        let Some(store) = store("body-shrink-partial").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        // Three full blocks down to one and a half.
        let buf = pattern((3 * BS) as usize);
        store.write(ino, 0, &buf).await.unwrap();
        truncate(&store, ino, BS + BS / 2).await;

        let attr = store.stat(ino).await.unwrap();
        assert_eq!(attr.size, BS + BS / 2);
        assert_eq!(store.block_count(ino).await.unwrap(), 2);

        assert_eq!(
            store.read(ino, 0, (BS + BS / 2) as u32).await.unwrap(),
            buf[..(BS + BS / 2) as usize]
        );
        // The trailing half of the surviving tail block is zeroed.
        truncate(&store, ino, 2 * BS).await;
        let tail = store.read(ino, BS + BS / 2, (BS / 2) as u32).await.unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_shrink_to_zero() {
        let Some(store) = store("body-shrink-zero").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        store.write(ino, 0, &pattern((2 * BS + 3) as usize)).await.unwrap();
        truncate(&store, ino, 0).await;

        assert_eq!(store.stat(ino).await.unwrap().size, 0);
        assert_eq!(store.block_count(ino).await.unwrap(), 0);
        assert!(store.read(ino, 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_then_read_returns_zeros() {
        let Some(store) = store("body-settruncate").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        truncate(&store, ino, 100).await;
        let all = store.read(ino, 0, 100).await.unwrap();
        assert_eq!(all.len(), 100);
        assert!(all.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_write_then_matching_truncate_is_identity() {
        let Some(store) = store("body-identity").await else { return };
        let (ino, _fh) = new_file(&store, "f").await;

        let buf = pattern((BS + 11) as usize);
        store.write(ino, 0, &buf).await.unwrap();
        truncate(&store, ino, BS + 11).await;

        assert_eq!(store.stat(ino).await.unwrap().size, BS + 11);
        assert_eq!(store.read(ino, 0, (BS + 11) as u32).await.unwrap(), buf);
    }

    #[tokio::test]
    async fn test_create_write_read_unlink() {
        let Some(store) = store("body-scenario-basic").await else { return };

        let d = store.mkdir(ROOT, "d", libc::S_IFDIR | 0o755, CTX).await.unwrap();
        let (f, fh) = store
            .create(d.ino, "f", libc::S_IFREG | 0o644, CTX)
            .await
            .unwrap();

        store.write(f.ino, 0, b"hello").await.unwrap();
        assert_eq!(store.read(f.ino, 0, 5).await.unwrap(), b"hello");
        assert_eq!(store.stat(f.ino).await.unwrap().size, 5);

        store.release(fh).await.unwrap();
        store.unlink(d.ino, "f").await.unwrap();
        assert!(matches!(
            store.lookup(d.ino, "f").await,
            Err(UdavError::NoSuchRow)
        ));
        assert!(matches!(store.stat(f.ino).await, Err(UdavError::NoSuchRow)));
    }

    #[tokio::test]
    async fn test_hard_link_shares_content() {
        let Some(store) = store("body-scenario-link").await else { return };

        let (a, fh) = store.create(ROOT, "a", libc::S_IFREG | 0o644, CTX).await.unwrap();
        store.write(a.ino, 0, b"abc").await.unwrap();
        store.release(fh).await.unwrap();

        let linked = store.link(a.ino, ROOT, "b").await.unwrap();
        assert_eq!(linked.nlink, 2);

        store.unlink(ROOT, "a").await.unwrap();
        assert_eq!(store.read(a.ino, 0, 3).await.unwrap(), b"abc");

        store.unlink(ROOT, "b").await.unwrap();
        assert!(matches!(store.stat(a.ino).await, Err(UdavError::NoSuchRow)));
    }

    #[tokio::test]
    async fn test_write_through_handle_after_unlink() {
        let Some(store) = store("body-scenario-orphan").await else { return };

        let (f, fh) = store.create(ROOT, "f", libc::S_IFREG | 0o644, CTX).await.unwrap();
        store.unlink(ROOT, "f").await.unwrap();

        // The handle keeps the orphan alive for IO.
        store.write(fh, 0, b"still here").await.unwrap();
        assert_eq!(store.read(fh, 0, 10).await.unwrap(), b"still here");
        assert_eq!(store.block_count(f.ino).await.unwrap(), 1);

        store.release(fh).await.unwrap();
        assert!(matches!(store.stat(f.ino).await, Err(UdavError::NoSuchRow)));
        assert_eq!(store.block_count(f.ino).await.unwrap(), 0);
    }
}
