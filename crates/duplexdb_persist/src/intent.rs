//! Write-ahead intent record binding the general and system logs.
//!
//! The general log and the system log commit independently. Before either
//! commits, the engine records an intent naming the transaction and the
//! direction it is heading in; the record advances once the general log has
//! committed and is cleared after both logs succeed. Recovery reads it to
//! decide whether to redo the system-log half or undo the whole transaction.
//!
//! ## On-disk format
//!
//! ```text
//! | magic (4) | version (2) | length (4) | CBOR body (N) | crc32 (4) |
//! ```

use crate::error::{PersistError, PersistResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Magic bytes identifying an intent record.
pub const INTENT_MAGIC: [u8; 4] = *b"DXIR";

/// Current intent record format version.
pub const INTENT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// Which way the transaction was heading when the intent was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentDirection {
    /// Applying staged entries.
    Commit,
    /// Reverting staged entries.
    Rollback,
}

/// How far the two-log commit got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentPhase {
    /// Both logs hold staged work; neither has committed.
    Prepared,
    /// The general log committed; the system log has not.
    GeneralCommitted,
}

/// A write-ahead intent for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRecord {
    /// Raw transaction id.
    pub transaction_id: u64,
    /// Job the transaction belongs to.
    pub job_number: u64,
    /// Direction of the walk being persisted.
    pub direction: IntentDirection,
    /// Progress through the two logs.
    pub phase: IntentPhase,
}

impl IntentRecord {
    /// Creates a prepared intent.
    #[must_use]
    pub const fn prepared(transaction_id: u64, job_number: u64, direction: IntentDirection) -> Self {
        Self {
            transaction_id,
            job_number,
            direction,
            phase: IntentPhase::Prepared,
        }
    }

    /// Returns the same intent advanced to `phase`.
    #[must_use]
    pub const fn with_phase(mut self, phase: IntentPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn encode(&self) -> PersistResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body).map_err(|e| PersistError::Codec(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| PersistError::Codec("intent record too large".into()))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
        data.extend_from_slice(&INTENT_MAGIC);
        data.extend_from_slice(&INTENT_VERSION.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&body);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Decodes a record, validating magic, version, length and checksum.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Corrupted` on any envelope mismatch.
    pub fn decode(data: &[u8]) -> PersistResult<Self> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(PersistError::corrupted(format!(
                "intent record truncated: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != INTENT_MAGIC {
            return Err(PersistError::corrupted("bad intent magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != INTENT_VERSION {
            return Err(PersistError::corrupted(format!(
                "unsupported intent version {version}"
            )));
        }
        let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if data.len() != HEADER_SIZE + len + CRC_SIZE {
            return Err(PersistError::corrupted(format!(
                "intent length {len} does not match record size {}",
                data.len()
            )));
        }

        let crc_offset = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        let computed = compute_crc32(&data[..crc_offset]);
        if stored != computed {
            return Err(PersistError::corrupted(format!(
                "intent checksum mismatch: expected {stored:08x}, got {computed:08x}"
            )));
        }

        ciborium::from_reader(&data[HEADER_SIZE..crc_offset])
            .map_err(|e| PersistError::Codec(e.to_string()))
    }
}

/// Computes the CRC32 (IEEE) checksum of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Durable home of the single outstanding intent record.
pub trait IntentStore: Send + Sync {
    /// Durably records `intent`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be made durable.
    fn record(&self, intent: &IntentRecord) -> PersistResult<()>;

    /// Loads the outstanding intent, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored record cannot be read or is corrupted.
    fn load(&self) -> PersistResult<Option<IntentRecord>>;

    /// Removes the outstanding intent. Clearing an empty store succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    fn clear(&self) -> PersistResult<()>;
}

/// An intent store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryIntentStore {
    slot: Mutex<Option<IntentRecord>>,
}

impl InMemoryIntentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntentStore for InMemoryIntentStore {
    fn record(&self, intent: &IntentRecord) -> PersistResult<()> {
        *self.slot.lock() = Some(*intent);
        Ok(())
    }

    fn load(&self) -> PersistResult<Option<IntentRecord>> {
        Ok(*self.slot.lock())
    }

    fn clear(&self) -> PersistResult<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// An intent store backed by a single file.
///
/// Records are written to a sibling temporary file, synced, and renamed
/// over the target so a crash leaves either the old or the new record.
#[derive(Debug)]
pub struct FileIntentStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileIntentStore {
    /// Creates a store at `path`. The file is created on first record.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: &Path) -> PersistResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    /// Returns the path of the record file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl IntentStore for FileIntentStore {
    fn record(&self, intent: &IntentRecord) -> PersistResult<()> {
        let data = intent.encode()?;
        let _guard = self.lock.lock();

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> PersistResult<Option<IntentRecord>> {
        let _guard = self.lock.lock();
        match fs::read(&self.path) {
            Ok(data) => IntentRecord::decode(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> PersistResult<()> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn sample() -> IntentRecord {
        IntentRecord::prepared(7, 42, IntentDirection::Commit)
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn intent_encode_decode() {
        let record = sample().with_phase(IntentPhase::GeneralCommitted);
        let data = record.encode().unwrap();
        assert_eq!(&data[0..4], &INTENT_MAGIC);
        assert_eq!(IntentRecord::decode(&data).unwrap(), record);
    }

    #[test]
    fn intent_decode_detects_corruption() {
        let mut data = sample().encode().unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        assert!(matches!(
            IntentRecord::decode(&data),
            Err(PersistError::Corrupted(_))
        ));
    }

    #[test]
    fn intent_decode_rejects_truncation_and_magic() {
        let data = sample().encode().unwrap();
        assert!(IntentRecord::decode(&data[..data.len() - 1]).is_err());

        let mut bad = data.clone();
        bad[0] = b'X';
        assert!(IntentRecord::decode(&bad).is_err());
    }

    #[test]
    fn memory_store_record_load_clear() {
        let store = InMemoryIntentStore::new();
        assert!(store.load().unwrap().is_none());
        store.record(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intent").join("current.dxir");

        let store = FileIntentStore::open(&path).unwrap();
        store.record(&sample()).unwrap();
        drop(store);

        let reopened = FileIntentStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(sample()));
        assert!(!reopened.temp_path().exists());
    }

    #[test]
    fn file_store_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileIntentStore::open(&dir.path().join("intent.dxir")).unwrap();
        store.clear().unwrap();
        store.record(&sample()).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn file_store_reports_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intent.dxir");
        fs::write(&path, b"garbage").unwrap();
        let store = FileIntentStore::open(&path).unwrap();
        assert!(store.load().is_err());
    }

    proptest! {
        #[test]
        fn intent_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = IntentRecord::decode(&data);
        }
    }
}
