use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::STORE_PREFIX;

/// Operator-entered fields, kept in the order they were asked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, keeping its original position if it is already present.
    pub fn insert(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(String, String); N]> for Attributes {
    fn from(pairs: [(String, String); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl FromIterator<(String, String)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut attributes = Self::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

impl std::ops::Index<&str> for Attributes {
    type Output = String;

    fn index(&self, key: &str) -> &String {
        match self.0.iter().find(|(k, _)| k == key) {
            Some((_, value)) => value,
            None => panic!("no attribute named {key}"),
        }
    }
}

// Serialized as a map so JSON listings read naturally; entry order is preserved.
impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AttributesVisitor;

        impl<'de> Visitor<'de> for AttributesVisitor {
            type Value = Attributes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of attribute names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Attributes, A::Error> {
                let mut attributes = Attributes::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    attributes.insert(key, value);
                }
                Ok(attributes)
            }
        }

        deserializer.deserialize_map(AttributesVisitor)
    }
}

/// An enrolled person: display attributes plus the merged registration template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub attributes: Attributes,
    #[serde(with = "serde_bytes")]
    pub template: Vec<u8>,
    pub enrolled_at: u64,
}

impl Identity {
    pub fn new(attributes: Attributes, template: Vec<u8>) -> Self {
        let enrolled_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attributes,
            template,
            enrolled_at,
        }
    }

    /// Short human label: the first non-empty attribute in entry order, else the id.
    pub fn label(&self) -> &str {
        self.attributes
            .values()
            .find(|v| !v.is_empty())
            .unwrap_or(&self.id)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("reading template store: {0}")]
    Read(String),
    #[error("writing template store: {0}")]
    Write(String),
    #[error("refusing to store an empty template")]
    EmptyTemplate,
}

/// Persistence for enrolled identities.
///
/// `save` must be atomic: either the whole identity is stored or nothing is.
pub trait TemplateStore: Send + Sync {
    /// Every enrolled identity, in enrollment order. An empty store is `Ok(vec![])`.
    fn list_all(&self) -> Result<Vec<Identity>, StoreError>;

    fn save(&self, attributes: Attributes, template: Vec<u8>) -> Result<Identity, StoreError>;

    /// Returns `false` if no identity had this id.
    fn remove(&self, id: &str) -> Result<bool, StoreError>;

    fn purge(&self) -> Result<(), StoreError>;
}

/// Identities kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<Identity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Identity>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl TemplateStore for MemoryStore {
    fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, attributes: Attributes, template: Vec<u8>) -> Result<Identity, StoreError> {
        if template.is_empty() {
            return Err(StoreError::EmptyTemplate);
        }
        let identity = Identity::new(attributes, template);
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identity.clone());
        Ok(identity)
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn purge(&self) -> Result<(), StoreError> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}

const STORE_FILE: &str = "identities.bin";
const LOCK_FILE: &str = ".identities.lock";

/// Identities stored as one postcard file under a directory.
///
/// Writers take an advisory `flock` on a lock file next to the store, so a
/// `remove` from one process cannot drop an identity another process is saving.
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store under the compiled-in prefix.
    pub fn open_default() -> Self {
        Self::open(STORE_PREFIX.to_path_buf())
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    fn load(&self) -> Result<Vec<Identity>, StoreError> {
        let file = self.path();
        if !file.exists() {
            return Ok(vec![]);
        }
        let data = std::fs::read(&file)
            .map_err(|e| StoreError::Read(format!("{}: {}", file.display(), e)))?;
        if data.is_empty() {
            return Ok(vec![]);
        }
        postcard::from_bytes(&data)
            .map_err(|e| StoreError::Read(format!("{}: {}", file.display(), e)))
    }

    /// Replace the store file in one rename so readers never see a partial write.
    fn commit(&self, records: &[Identity]) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(write_err)?;
        let data = postcard::to_allocvec(records).map_err(write_err)?;
        let tmp = self.dir.join(format!(".{}.tmp", STORE_FILE));
        write_synced(&tmp, &data).map_err(write_err)?;
        std::fs::rename(&tmp, self.path()).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            write_err(e)
        })
    }
}

/// Exclusive advisory lock over the store directory, released on drop.
struct StoreLock(std::fs::File);

impl StoreLock {
    fn acquire(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            loop {
                // SAFETY: the descriptor belongs to `file`, which is alive for the call.
                if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
        Ok(Self(file))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still owned by `self.0`.
            unsafe { libc::flock(self.0.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

fn write_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Write(e.to_string())
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

impl TemplateStore for FileStore {
    fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        self.load()
    }

    fn save(&self, attributes: Attributes, template: Vec<u8>) -> Result<Identity, StoreError> {
        if template.is_empty() {
            return Err(StoreError::EmptyTemplate);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = StoreLock::acquire(&self.dir).map_err(write_err)?;
        let mut records = self.load()?;
        let identity = Identity::new(attributes, template);
        records.push(identity.clone());
        self.commit(&records)?;
        Ok(identity)
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.path().exists() {
            return Ok(false);
        }
        let _lock = StoreLock::acquire(&self.dir).map_err(write_err)?;
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.commit(&records)?;
        Ok(true)
    }

    fn purge(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = self.path();
        if !file.exists() {
            return Ok(());
        }
        let _lock = StoreLock::acquire(&self.dir).map_err(write_err)?;
        if file.exists() {
            std::fs::remove_file(&file)
                .map_err(|e| StoreError::Write(format!("removing {}: {}", file.display(), e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(name: &str) -> Attributes {
        Attributes::from([("username".to_string(), name.to_string())])
    }

    #[test]
    fn test_missing_store_is_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("never-created"));
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_save_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let alice = FileStore::open(dir.path()).save(attrs("alice"), vec![1, 2, 3]).unwrap();
        let bob = FileStore::open(dir.path()).save(attrs("bob"), vec![4, 5, 6]).unwrap();

        let records = FileStore::open(dir.path()).list_all().unwrap();
        assert_eq!(records, vec![alice, bob]);
        assert_eq!(records[0].label(), "alice");
        assert!(!dir.path().join(".identities.bin.tmp").exists());
    }

    #[test]
    fn test_empty_template_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path());
        assert!(matches!(
            store.save(attrs("eve"), vec![]),
            Err(StoreError::EmptyTemplate)
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_store_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path());
        std::fs::write(store.path(), [0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert!(matches!(store.list_all(), Err(StoreError::Read(_))));
    }

    #[test]
    fn test_remove_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path());
        let alice = store.save(attrs("alice"), vec![1]).unwrap();
        store.save(attrs("bob"), vec![2]).unwrap();

        assert!(store.remove(&alice.id).unwrap());
        assert!(!store.remove(&alice.id).unwrap());
        assert_eq!(store.list_all().unwrap().len(), 1);

        store.purge().unwrap();
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let id = store.save(attrs("carol"), vec![9]).unwrap();
        assert_eq!(store.list_all().unwrap(), vec![id.clone()]);
        assert!(store.remove(&id.id).unwrap());
        assert!(store.list_all().unwrap().is_empty());
    }

    fn student(name: &str, age: &str) -> Attributes {
        Attributes::from([
            ("student_name".to_string(), name.to_string()),
            ("age".to_string(), age.to_string()),
        ])
    }

    #[test]
    fn test_attributes_keep_entry_order() {
        let dir = tempfile::tempdir().unwrap();
        let saved = FileStore::open(dir.path())
            .save(student("Ada Lovelace", "36"), vec![1])
            .unwrap();
        assert_eq!(saved.label(), "Ada Lovelace");

        let loaded = FileStore::open(dir.path()).list_all().unwrap().remove(0);
        let keys: Vec<&str> = loaded.attributes.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["student_name", "age"]);
        assert_eq!(loaded.label(), "Ada Lovelace");

        let json = serde_json::to_string(&loaded.attributes).unwrap();
        assert_eq!(json, r#"{"student_name":"Ada Lovelace","age":"36"}"#);
    }

    #[test]
    fn test_label_skips_empty_leading_field() {
        let identity = Identity::new(student("", "36"), vec![1]);
        assert_eq!(identity.label(), "36");
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut attributes = student("Ada", "36");
        attributes.insert("student_name".to_string(), "Ada Lovelace".to_string());
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes.values().collect::<Vec<_>>(), ["Ada Lovelace", "36"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_waits_for_lock_held_elsewhere() {
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let held = StoreLock::acquire(dir.path()).unwrap();

        let path = dir.path().to_path_buf();
        let (tx, rx) = mpsc::channel();
        let writer = std::thread::spawn(move || {
            let saved = FileStore::open(path).save(attrs("alice"), vec![1]);
            tx.send(()).unwrap();
            saved
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(FileStore::open(dir.path()).list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_from_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("never-created"));
        assert!(!store.remove("nobody").unwrap());
        store.purge().unwrap();
        assert!(!dir.path().join("never-created").exists());
    }

    #[test]
    fn test_label_falls_back_to_id() {
        let identity = Identity::new(Attributes::new(), vec![1]);
        assert_eq!(identity.label(), identity.id);
    }
}
