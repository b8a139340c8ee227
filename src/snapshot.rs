//! Durable local snapshot of the key ring.
//!
//! The snapshot keeps the ring alive across process restarts so that cookies
//! minted before a restart keep verifying. Writes go to a temp file that is
//! atomically renamed into place; the on-disk state therefore always matches
//! some consistent in-memory ring. Load failures are never fatal — the ring
//! simply starts empty and generates fresh keys on demand.
//!
//! Layout (big-endian): `active: i32`, `next_rotation_at: i64`, then for each
//! slot a presence flag `i32` (0|1) followed, when present, by
//! `expires_at: i64`, the owner server id as a u16-length-prefixed UTF-8
//! string, `key_len: i32`, and the raw key bytes.

use crate::keys::{ExpiringSecretKey, HMAC_SHA256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound on stored field lengths; anything larger is a corrupt file.
const MAX_FIELD_LEN: usize = 4096;

/// In-memory image of a persisted ring.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub active: usize,
    pub next_rotation_at: u64,
    pub slots: Vec<Option<ExpiringSecretKey>>,
}

/// File-backed persistence for the key ring.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the ring to disk, creating parent directories as needed.
    pub fn save(&self, snapshot: &RingSnapshot) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!("saving key ring snapshot to {}", self.path.display());

        let mut out = File::create(&self.tmp_path)?;
        write_i32(&mut out, snapshot.active as i32)?;
        write_i64(&mut out, snapshot.next_rotation_at as i64)?;
        for slot in &snapshot.slots {
            match slot {
                None => write_i32(&mut out, 0)?,
                Some(key) => {
                    write_i32(&mut out, 1)?;
                    write_i64(&mut out, key.expires_at() as i64)?;
                    write_str(&mut out, key.server_id())?;
                    write_i32(&mut out, key.key().len() as i32)?;
                    out.write_all(key.key())?;
                }
            }
        }
        out.sync_all()?;
        drop(out);

        fs::rename(&self.tmp_path, &self.path)
    }

    /// Read a snapshot of `ring_size` slots back from disk.
    ///
    /// Returns `Ok(None)` when no snapshot file exists yet. Corrupt or
    /// truncated files produce an error; callers degrade to an empty ring.
    pub fn load(&self, ring_size: usize) -> io::Result<Option<RingSnapshot>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let active = read_i32(&mut file)? as usize;
        let next_rotation_at = read_i64(&mut file)? as u64;
        if active >= ring_size {
            return Err(corrupt(format!(
                "active slot {active} out of range for ring of {ring_size}"
            )));
        }

        let mut slots = Vec::with_capacity(ring_size);
        for i in 0..ring_size {
            let present = read_i32(&mut file)?;
            match present {
                0 => slots.push(None),
                1 => {
                    let expires_at = read_i64(&mut file)? as u64;
                    let server_id = read_str(&mut file)?;
                    let key_len = read_i32(&mut file)? as usize;
                    if key_len == 0 || key_len > MAX_FIELD_LEN {
                        return Err(corrupt(format!("slot {i} has key length {key_len}")));
                    }
                    let mut key = vec![0u8; key_len];
                    file.read_exact(&mut key)?;
                    slots.push(Some(ExpiringSecretKey::new(
                        key,
                        HMAC_SHA256,
                        expires_at,
                        &server_id,
                    )));
                }
                other => {
                    return Err(corrupt(format!("slot {i} has presence flag {other}")));
                }
            }
        }

        Ok(Some(RingSnapshot {
            active,
            next_rotation_at,
            slots,
        }))
    }

    /// `load` with failures downgraded to a logged warning.
    pub fn load_or_empty(&self, ring_size: usize) -> Option<RingSnapshot> {
        match self.load(ring_size) {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "failed to load key ring snapshot from {}: {e}; starting with an empty ring",
                    self.path.display()
                );
                None
            }
        }
    }
}

fn corrupt(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(corrupt(format!("server id of {} bytes", bytes.len())));
    }
    w.write_all(&(bytes.len() as u16).to_be_bytes())?;
    w.write_all(bytes)
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_FIELD_LEN {
        return Err(corrupt(format!("string field of {len} bytes")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| corrupt(format!("string field is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_snapshot() -> RingSnapshot {
        RingSnapshot {
            active: 2,
            next_rotation_at: 123_456,
            slots: vec![
                None,
                Some(ExpiringSecretKey::generate(10_000, "server-a")),
                Some(ExpiringSecretKey::generate(20_000, "server-b")),
                None,
                None,
            ],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("keys.bin"));
        let snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();

        let loaded = store.load(5).unwrap().unwrap();
        assert_eq!(loaded.active, 2);
        assert_eq!(loaded.next_rotation_at, 123_456);
        assert_eq!(loaded.slots, snapshot.slots);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nope.bin"));
        assert!(store.load(5).unwrap().is_none());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        let store = SnapshotStore::new(&path);
        store.save(&sample_snapshot()).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(store.load(5).is_err());
        assert!(store.load_or_empty(5).is_none());
    }

    #[test]
    fn out_of_range_active_slot_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("keys.bin"));
        let mut snapshot = sample_snapshot();
        snapshot.active = 4;
        store.save(&snapshot).unwrap();
        // reading back with a smaller ring makes the stored index invalid
        assert!(store.load(3).is_err());
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested/deeper/keys.bin"));
        store.save(&sample_snapshot()).unwrap();
        assert!(store.load(5).unwrap().is_some());
    }
}
