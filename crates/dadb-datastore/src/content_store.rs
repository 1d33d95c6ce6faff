//! Content-addressed binary storage with block-level deduplication.
//!
//! A data object is split into fixed-size blocks; blocks are deduplicated
//! across the whole repository by `sha1`+`size`, and a whole data object is
//! deduplicated by `sha256` when it has already been fully stored.

use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;

use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

use crate::backend::Backend;
use crate::error::StoreError;

/// Target size of a single stored block. The last block of an object may be shorter.
pub const BLOCKSIZE: usize = 50 * 1024 * 1024;

/// Owns the three content tables (`{prefix}data`, `{prefix}block`, `{prefix}blockmap`).
pub struct ContentStore {
    backend: Rc<Backend>,
    prefix: String,
}

struct Hashes {
    md5: String,
    sha1: String,
    sha256: String,
    size: u64,
}

impl ContentStore {
    pub fn new(backend: Rc<Backend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    fn data_table(&self) -> String {
        format!("{}data", self.prefix)
    }
    fn block_table(&self) -> String {
        format!("{}block", self.prefix)
    }
    fn blockmap_table(&self) -> String {
        format!("{}blockmap", self.prefix)
    }

    /// Issues the DDL for the three content tables. Idempotent only in the
    /// sense that it is called once, at repository creation time.
    pub fn create_schema(&self) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE {data} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                md5 TEXT NOT NULL,
                sha1 TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                size INTEGER NOT NULL,
                stored INTEGER NOT NULL
            );
            CREATE INDEX {data}_sha256_idx ON {data} (sha256);
            CREATE TABLE {block} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sha1 TEXT NOT NULL,
                size INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            CREATE UNIQUE INDEX {block}_sha1_size_idx ON {block} (sha1, size);
            CREATE TABLE {blockmap} (
                dataid INTEGER NOT NULL,
                blkid INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                PRIMARY KEY (dataid, offset)
            );",
            data = self.data_table(),
            block = self.block_table(),
            blockmap = self.blockmap_table(),
        );
        self.backend.execute_batch(&sql)
    }

    /// Reads `reader` to completion, storing it as deduplicated blocks, and
    /// returns the id of the resulting (possibly pre-existing) `data` row.
    pub fn insert_data(&self, reader: &mut dyn Read) -> Result<i64, StoreError> {
        let conn = self.backend.conn();
        let data_table = self.data_table();
        let block_table = self.block_table();
        let blockmap_table = self.blockmap_table();

        conn.execute(
            &format!(
                "INSERT INTO {data_table} (md5, sha1, sha256, size, stored) VALUES ('', '', '', 0, 0)"
            ),
            [],
        )?;
        let dataid = conn.last_insert_rowid();

        let mut md5 = Md5::new();
        let mut sha1_whole = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut offset: u64 = 0;
        let mut buf = vec![0u8; BLOCKSIZE];

        loop {
            let n = read_full(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            md5.update(chunk);
            sha1_whole.update(chunk);
            sha256.update(chunk);

            let mut block_hasher = Sha1::new();
            block_hasher.update(chunk);
            let block_sha1 = hex::encode(block_hasher.finalize());

            let blkid: i64 = match conn.query_row(
                &format!("SELECT id FROM {block_table} WHERE sha1 = ?1 AND size = ?2"),
                rusqlite::params![block_sha1, n as i64],
                |row| row.get(0),
            ) {
                Ok(id) => id,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    conn.execute(
                        &format!("INSERT INTO {block_table} (sha1, size, data) VALUES (?1, ?2, ?3)"),
                        rusqlite::params![block_sha1, n as i64, chunk],
                    )?;
                    conn.last_insert_rowid()
                }
                Err(e) => return Err(e.into()),
            };

            conn.execute(
                &format!("INSERT INTO {blockmap_table} (dataid, blkid, offset) VALUES (?1, ?2, ?3)"),
                rusqlite::params![dataid, blkid, offset as i64],
            )?;

            offset += n as u64;
            if n < BLOCKSIZE {
                break;
            }
        }

        let hashes = Hashes {
            md5: hex::encode(md5.finalize()),
            sha1: hex::encode(sha1_whole.finalize()),
            sha256: hex::encode(sha256.finalize()),
            size: offset,
        };

        // whole-object dedup: if a *different* stored data row already has this sha256,
        // drop what we just wrote for `dataid` and hand back the existing id instead.
        let existing: Option<i64> = conn
            .query_row(
                &format!("SELECT id FROM {data_table} WHERE sha256 = ?1 AND stored = 1 AND id != ?2"),
                rusqlite::params![hashes.sha256, dataid],
                |row| row.get(0),
            )
            .ok();

        if let Some(existing_id) = existing {
            conn.execute(&format!("DELETE FROM {blockmap_table} WHERE dataid = ?1"), [dataid])?;
            conn.execute(&format!("DELETE FROM {data_table} WHERE id = ?1"), [dataid])?;
            log::debug!("insert_data: reusing existing data object {existing_id}");
            return Ok(existing_id);
        }

        conn.execute(
            &format!("UPDATE {data_table} SET md5=?1, sha1=?2, sha256=?3, size=?4, stored=1 WHERE id=?5"),
            rusqlite::params![hashes.md5, hashes.sha1, hashes.sha256, hashes.size as i64, dataid],
        )?;
        log::trace!("insert_data: stored new data object {dataid} ({} bytes)", hashes.size);
        Ok(dataid)
    }

    /// Registers a data object by its hash triple and size without storing any bytes.
    /// Reads against the returned id fail until a matching object is inserted via `insert_data`.
    pub fn insert_metadata_only(&self, md5: &str, sha1: &str, sha256: &str, size: u64) -> Result<i64, StoreError> {
        let conn = self.backend.conn();
        conn.execute(
            &format!(
                "INSERT INTO {} (md5, sha1, sha256, size, stored) VALUES (?1, ?2, ?3, ?4, 0)",
                self.data_table()
            ),
            rusqlite::params![md5, sha1, sha256, size as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetches metadata for `id` and returns a seek/read handle over its bytes.
    pub fn get_data(&self, id: i64) -> Result<DataHandle, StoreError> {
        let conn = self.backend.conn();
        let (md5, sha1, sha256, size, stored): (String, String, String, i64, i64) = conn
            .query_row(
                &format!("SELECT md5, sha1, sha256, size, stored FROM {} WHERE id = ?1", self.data_table()),
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NoSuchDataObject(id),
                other => other.into(),
            })?;

        Ok(DataHandle {
            backend: self.backend.clone(),
            block_table: self.block_table(),
            blockmap_table: self.blockmap_table(),
            id,
            md5,
            sha1,
            sha256,
            length: size as u64,
            stored: stored != 0,
            pos: 0,
        })
    }
}

/// Reads until `buf` is full or the reader is exhausted, returning the number of bytes read.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// A seek/read handle over a stored data object's bytes, fetching blocks lazily.
pub struct DataHandle {
    backend: Rc<Backend>,
    block_table: String,
    blockmap_table: String,
    id: i64,
    md5: String,
    sha1: String,
    sha256: String,
    length: u64,
    stored: bool,
    pos: u64,
}

impl DataHandle {
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn length(&self) -> u64 {
        self.length
    }
    pub fn md5(&self) -> &str {
        &self.md5
    }
    pub fn sha1(&self) -> &str {
        &self.sha1
    }
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
    pub fn stored(&self) -> bool {
        self.stored
    }
}

impl Read for DataHandle {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.pos >= self.length {
            return Ok(0);
        }
        if !self.stored {
            return Err(io::Error::new(io::ErrorKind::NotFound, StoreError::DataNotStored(self.id)));
        }

        let conn = self.backend.conn();
        let row: Option<(i64, i64, Vec<u8>)> = conn
            .query_row(
                &format!(
                    "SELECT {bm}.offset, {b}.size, {b}.data
                     FROM {bm} JOIN {b} ON {bm}.blkid = {b}.id
                     WHERE {bm}.dataid = ?1 AND {bm}.offset <= ?2
                     ORDER BY {bm}.offset DESC LIMIT 1",
                    bm = self.blockmap_table,
                    b = self.block_table,
                ),
                rusqlite::params![self.id, self.pos as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(to_io_error)?;

        let Some((block_offset, block_size, block_data)) = row else {
            return Ok(0);
        };
        let within = (self.pos - block_offset as u64) as usize;
        if within >= block_size as usize {
            return Ok(0);
        }
        let available = block_size as usize - within;
        let remaining_in_object = (self.length - self.pos) as usize;
        let n = out.len().min(available).min(remaining_in_object);
        out[..n].copy_from_slice(&block_data[within..within + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for DataHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.length as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of object"));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

fn to_io_error(e: rusqlite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store() -> (Rc<Backend>, ContentStore) {
        let backend = Rc::new(Backend::open_in_memory().unwrap());
        let cs = ContentStore::new(backend.clone(), "x");
        cs.create_schema().unwrap();
        (backend, cs)
    }

    #[test]
    fn round_trips_a_small_blob() {
        let (_backend, cs) = store();
        let bytes = [0u8, 1, 2, 3, 4, 5, 6];
        let id = cs.insert_data(&mut Cursor::new(bytes)).unwrap();
        let mut handle = cs.get_data(id).unwrap();
        assert_eq!(handle.length(), 7);
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, bytes);

        let expected_sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            hex::encode(hasher.finalize())
        };
        assert_eq!(handle.sha256(), expected_sha256);
    }

    #[test]
    fn splits_a_stream_larger_than_one_block() {
        let (backend, cs) = store();
        let bytes = vec![7u8; BLOCKSIZE + 1];
        let id = cs.insert_data(&mut Cursor::new(bytes.clone())).unwrap();

        let offsets: Vec<i64> = {
            let mut stmt = backend
                .conn()
                .prepare("SELECT offset FROM xblockmap WHERE dataid = ?1 ORDER BY offset")
                .unwrap();
            stmt.query_map([id], |r| r.get(0)).unwrap().map(|r| r.unwrap()).collect()
        };
        assert_eq!(offsets, vec![0, BLOCKSIZE as i64]);

        let mut handle = cs.get_data(id).unwrap();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn dedups_blocks_sharing_an_aligned_prefix() {
        let (backend, cs) = store();
        let shared_block = vec![9u8; BLOCKSIZE];
        let mut a = shared_block.clone();
        a.extend_from_slice(b"tail-a");
        let mut b = shared_block.clone();
        b.extend_from_slice(b"tail-b");

        cs.insert_data(&mut Cursor::new(a)).unwrap();
        cs.insert_data(&mut Cursor::new(b)).unwrap();

        let block_count: i64 = backend.conn().query_row("SELECT COUNT(*) FROM xblock", [], |r| r.get(0)).unwrap();
        assert_eq!(block_count, 3); // shared block + two distinct tails
    }

    #[test]
    fn dedups_identical_whole_objects() {
        let (backend, cs) = store();
        let bytes = b"same payload".to_vec();
        let id1 = cs.insert_data(&mut Cursor::new(bytes.clone())).unwrap();
        let id2 = cs.insert_data(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(id1, id2);

        let data_count: i64 = backend.conn().query_row("SELECT COUNT(*) FROM xdata", [], |r| r.get(0)).unwrap();
        assert_eq!(data_count, 1);
    }

    #[test]
    fn metadata_only_object_fails_to_read() {
        let (_backend, cs) = store();
        let id = cs.insert_metadata_only("d41d8cd98f00b204e9800998ecf8427e", "da39a3ee5e6b4b0d3255bfef95601890afd80709", "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855", 0).unwrap();
        let mut handle = cs.get_data(id).unwrap();
        assert!(!handle.stored());
        let mut buf = [0u8; 1];
        assert!(handle.read(&mut buf).is_err());
    }

    #[test]
    fn missing_data_object_is_reported() {
        let (_backend, cs) = store();
        let err = cs.get_data(42).unwrap_err();
        assert!(matches!(err, StoreError::NoSuchDataObject(42)));
    }
}
