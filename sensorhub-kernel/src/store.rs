//! Registry persistence.
//!
//! The whole device collection lives in one JSON document. Every save writes a
//! complete snapshot to a temporary file next to the target, syncs it, then renames
//! it over the previous version, so a reader never observes a truncated file.

use crate::error::StoreError;
use crate::models::{Device, RegistryDocument};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Load/save pair over the persisted device collection.
///
/// `save` always receives the complete collection, never a delta.
pub trait RegistryStore: Send + Sync {
    fn load(&self) -> Result<Vec<Device>, StoreError>;
    fn save(&self, devices: &[Device]) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    devices: &'a [Device],
}

/// File-backed store using the `{"devices": [...]}` layout.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // An encoding failure is a write fault, not a corrupt file.
    fn encode<T: Serialize>(doc: &T) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        doc.serialize(&mut ser).map_err(io::Error::other)?;
        Ok(buf)
    }

    fn save_with<F>(&self, devices: &[Device], write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let bytes = Self::encode(&DocumentRef { devices })?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        // dropped (and removed) on any early return
        let mut tmp = NamedTempFile::new_in(dir)?;
        write(tmp.as_file_mut(), &bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Device>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no registry file yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: RegistryDocument = serde_json::from_str(&content)?;
        for clash in duplicate_keys(&doc.devices) {
            tracing::warn!(path = %self.path.display(), %clash, "registry file breaks name/topic uniqueness");
        }
        Ok(doc.devices)
    }

    fn save(&self, devices: &[Device]) -> Result<(), StoreError> {
        self.save_with(devices, |file, bytes| {
            file.write_all(bytes)?;
            file.flush()
        })
    }
}

/// Names or topics carried by more than one record, e.g. after a hand edit.
pub fn duplicate_keys(devices: &[Device]) -> Vec<String> {
    let mut names = HashSet::new();
    let mut topics = HashSet::new();
    let mut clashes = Vec::new();
    for d in devices {
        if !names.insert(d.name.as_str()) {
            clashes.push(format!("name '{}'", d.name));
        }
        if !topics.insert(d.topic.as_str()) {
            clashes.push(format!("topic '{}'", d.topic));
        }
    }
    clashes
}
