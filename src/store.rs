//! The non-volatile record store collaborator (§4.6, §6) and a small file-backed
//! implementation usable for local demonstration/testing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File/key identifiers for the two records this core persists.
pub const COUNTER_FILE_ID: u16 = 0xEF11;
pub const COUNTER_KEY: u16 = 0x7F11;
pub const WRAPPING_KEY_FILE_ID: u16 = 0xEF10;
pub const WRAPPING_KEY_KEY: u16 = 0x7F10;

/// Narrow interface onto the authenticator's persistent key/value records.
pub trait RecordStore {
    fn find(&self, file_id: u16, key: u16) -> Result<Option<Vec<u8>>>;
    fn write(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<()>;
    fn update(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<()>;
}

fn record_key(file_id: u16, key: u16) -> String {
    format!("{:04x}:{:04x}", file_id, key)
}

#[derive(Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(with = "hex_map")]
    records: HashMap<String, Vec<u8>>,
}

mod hex_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Vec<u8>>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let hexed: HashMap<&String, String> = map.iter().map(|(k, v)| (k, hex::encode(v))).collect();
        hexed.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<HashMap<String, Vec<u8>>, D::Error> {
        let hexed: HashMap<String, String> = HashMap::deserialize(d)?;
        hexed
            .into_iter()
            .map(|(k, v)| hex::decode(v).map(|b| (k, b)).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Persists records as a small serde-backed JSON file rather than raw flash pages.
pub struct FileRecordStore {
    path: PathBuf,
    records: HashMap<String, Vec<u8>>,
}

impl FileRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading record store {}", path.display()))?;
            let parsed: RecordFile = serde_json::from_str(&data)
                .with_context(|| format!("parsing record store {}", path.display()))?;
            parsed.records
        } else {
            HashMap::new()
        };
        Ok(Self { path, records })
    }

    fn persist(&self) -> Result<()> {
        let file = RecordFile { records: self.records.clone() };
        let data = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, data)
            .with_context(|| format!("writing record store {}", self.path.display()))?;
        log::debug!("persisted record store to {}", self.path.display());
        Ok(())
    }
}

impl RecordStore for FileRecordStore {
    fn find(&self, file_id: u16, key: u16) -> Result<Option<Vec<u8>>> {
        Ok(self.records.get(&record_key(file_id, key)).cloned())
    }

    fn write(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<()> {
        self.records.insert(record_key(file_id, key), data.to_vec());
        self.persist()
    }

    fn update(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<()> {
        self.write(file_id, key, data)
    }
}

/// In-memory record store used by tests; avoids touching the filesystem.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: HashMap<(u16, u16), Vec<u8>>,
}

impl RecordStore for MemoryRecordStore {
    fn find(&self, file_id: u16, key: u16) -> Result<Option<Vec<u8>>> {
        Ok(self.records.get(&(file_id, key)).cloned())
    }

    fn write(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<()> {
        self.records.insert((file_id, key), data.to_vec());
        Ok(())
    }

    fn update(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<()> {
        self.write(file_id, key, data)
    }
}

/// Loads the persisted signature counter, or initialises it to zero on first boot (§4.6).
pub fn load_or_init_counter(store: &mut dyn RecordStore) -> Result<u32> {
    match store.find(COUNTER_FILE_ID, COUNTER_KEY)? {
        Some(bytes) if bytes.len() == 4 => {
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        _ => {
            store.write(COUNTER_FILE_ID, COUNTER_KEY, &0u32.to_le_bytes())?;
            Ok(0)
        }
    }
}

/// Persists the signature counter synchronously (§4.6, §7: must happen before the response is sent).
pub fn persist_counter(store: &mut dyn RecordStore, value: u32) -> Result<()> {
    store.update(COUNTER_FILE_ID, COUNTER_KEY, &value.to_le_bytes())
}

/// Loads the persisted wrapping key, or generates and persists a fresh one on first boot (§4.6).
pub fn load_or_init_wrapping_key(store: &mut dyn RecordStore) -> Result<[u8; 16]> {
    match store.find(WRAPPING_KEY_FILE_ID, WRAPPING_KEY_KEY)? {
        Some(bytes) if bytes.len() == 16 => {
            let mut key = [0u8; 16];
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        _ => {
            let mut key = [0u8; 16];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
            store.write(WRAPPING_KEY_FILE_ID, WRAPPING_KEY_KEY, &key)?;
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_initialises_to_zero_on_first_boot() {
        let mut store = MemoryRecordStore::default();
        let counter = load_or_init_counter(&mut store).unwrap();
        assert_eq!(counter, 0);
        assert_eq!(store.find(COUNTER_FILE_ID, COUNTER_KEY).unwrap().unwrap(), 0u32.to_le_bytes());
    }

    #[test]
    fn counter_roundtrips_through_persist() {
        let mut store = MemoryRecordStore::default();
        load_or_init_counter(&mut store).unwrap();
        persist_counter(&mut store, 42).unwrap();
        let counter = load_or_init_counter(&mut store).unwrap();
        assert_eq!(counter, 42);
    }

    #[test]
    fn wrapping_key_generated_once_and_stable() {
        let mut store = MemoryRecordStore::default();
        let k1 = load_or_init_wrapping_key(&mut store).unwrap();
        let k2 = load_or_init_wrapping_key(&mut store).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = std::env::temp_dir().join(format!("ctap-store-test-{:?}", std::thread::current().id()));
        let _ = fs::remove_file(&dir);
        {
            let mut store = FileRecordStore::open(&dir).unwrap();
            load_or_init_counter(&mut store).unwrap();
            persist_counter(&mut store, 7).unwrap();
        }
        {
            let mut store = FileRecordStore::open(&dir).unwrap();
            assert_eq!(load_or_init_counter(&mut store).unwrap(), 7);
        }
        let _ = fs::remove_file(&dir);
    }
}
