//! Attachment offloading
//!
//! Keeps any single broadcast payload under the host's cross-process transport
//! ceiling. When a message's serialized field map reaches the threshold, bulky
//! fields are written below `<attachments>/<message_key>/` and replaced with
//! `{"_file_ref": "<path>"}` markers. Listeners resolve markers through
//! [`AttachmentOffloader::load_attachment`].

use crate::config::OffloadConfig;
use crate::event::{AttachmentEntry, FieldMap, FieldValue};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("Attachment I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path is outside the attachments directory: {0}")]
    OutsideRoot(PathBuf),

    #[error("Field could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reference to one offloaded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// `<message_key>/<file name>`
    pub storage_key: String,
    pub path: PathBuf,
}

/// Field map after offloading plus the references that were created
#[derive(Debug, Clone)]
pub struct OffloadResult {
    pub fields: FieldMap,
    pub refs: Vec<AttachmentRef>,
}

pub struct AttachmentOffloader {
    root: PathBuf,
    threshold: usize,
    inline_limit: usize,
}

impl AttachmentOffloader {
    pub fn new(root: impl Into<PathBuf>, config: &OffloadConfig) -> Self {
        Self {
            root: root.into(),
            threshold: config.threshold_bytes,
            inline_limit: config.inline_field_limit_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Serialized JSON size of a field map
    pub fn serialized_size(fields: &FieldMap) -> usize {
        serde_json::to_vec(fields).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Offload bulky fields of one message
    ///
    /// Best effort per field: a field whose write fails stays inline.
    pub fn offload(&self, message_key: &str, mut fields: FieldMap) -> OffloadResult {
        let mut refs = Vec::new();
        let size = Self::serialized_size(&fields);
        if size < self.threshold {
            return OffloadResult { fields, refs };
        }

        let key = sanitize_key(message_key);
        debug!(
            "Offloading fields of {} ({} bytes >= {} threshold)",
            key, size, self.threshold
        );

        let ids: Vec<u8> = fields.keys().copied().collect();
        for id in &ids {
            if let Some(value) = fields.remove(id) {
                let value = self.offload_field(&key, *id, value, self.inline_limit, &mut refs);
                fields.insert(*id, value);
            }
        }

        // Many mid-sized fields can still add up; move the largest ones until
        // the map fits.
        while Self::serialized_size(&fields) >= self.threshold {
            let largest = fields
                .iter()
                .filter(|(_, v)| !v.is_file_ref())
                .map(|(id, v)| (*id, field_size(v)))
                .filter(|(_, s)| *s > 0)
                .max_by_key(|(_, s)| *s);
            let Some((id, _)) = largest else { break };
            let Some(value) = fields.remove(&id) else { break };
            let before = field_size(&value);
            let value = self.offload_field(&key, id, value, 0, &mut refs);
            let after = field_size(&value);
            fields.insert(id, value);
            if after >= before {
                warn!("Could not shrink field {} of {}; giving up", id, key);
                break;
            }
        }

        info!(
            "Offloaded {} payload(s) for {} ({} -> {} bytes)",
            refs.len(),
            key,
            size,
            Self::serialized_size(&fields)
        );
        OffloadResult { fields, refs }
    }

    fn offload_field(
        &self,
        key: &str,
        id: u8,
        value: FieldValue,
        limit: usize,
        refs: &mut Vec<AttachmentRef>,
    ) -> FieldValue {
        match value {
            FieldValue::Attachments(entries) => {
                let entries = entries
                    .into_iter()
                    .enumerate()
                    .map(|(idx, entry)| match entry {
                        AttachmentEntry::Inline { filename, data } if data.len() > limit => {
                            let name = format!("{}_{}", id, idx);
                            match self.write_payload(key, &name, &data) {
                                Ok(path) => {
                                    refs.push(AttachmentRef {
                                        storage_key: format!("{}/{}", key, name),
                                        path: path.clone(),
                                    });
                                    AttachmentEntry::Stored {
                                        filename,
                                        size: data.len(),
                                        path,
                                    }
                                }
                                Err(e) => {
                                    warn!("Keeping attachment {} of {} inline: {}", name, key, e);
                                    AttachmentEntry::Inline { filename, data }
                                }
                            }
                        }
                        other => other,
                    })
                    .collect();
                FieldValue::Attachments(entries)
            }
            FieldValue::Bytes { format, data } if field_size_bytes(&data) > limit => {
                let name = id.to_string();
                match self.write_payload(key, &name, &data) {
                    Ok(path) => {
                        refs.push(AttachmentRef {
                            storage_key: format!("{}/{}", key, name),
                            path: path.clone(),
                        });
                        FieldValue::FileRef(path)
                    }
                    Err(e) => {
                        warn!("Keeping field {} of {} inline: {}", id, key, e);
                        FieldValue::Bytes { format, data }
                    }
                }
            }
            FieldValue::Json(json) => {
                let encoded = match serde_json::to_vec(&json) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Field {} of {} is not serializable: {}", id, key, e);
                        return FieldValue::Json(json);
                    }
                };
                if encoded.len() <= limit.max(FILE_REF_OVERHEAD) {
                    return FieldValue::Json(json);
                }
                let name = id.to_string();
                match self.write_payload(key, &name, &encoded) {
                    Ok(path) => {
                        refs.push(AttachmentRef {
                            storage_key: format!("{}/{}", key, name),
                            path: path.clone(),
                        });
                        FieldValue::FileRef(path)
                    }
                    Err(e) => {
                        warn!("Keeping field {} of {} inline: {}", id, key, e);
                        FieldValue::Json(json)
                    }
                }
            }
            other => other,
        }
    }

    fn write_payload(&self, key: &str, name: &str, data: &[u8]) -> Result<PathBuf, OffloadError> {
        let dir = self.root.join(key);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        let tmp = dir.join(format!(".{}.tmp", name));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(std::fs::canonicalize(&path).unwrap_or(path))
    }

    /// Read back an offloaded payload
    pub fn load_attachment(&self, path: &Path) -> Result<Vec<u8>, OffloadError> {
        let resolved = std::fs::canonicalize(path)?;
        let root = std::fs::canonicalize(&self.root)?;
        if !resolved.starts_with(&root) {
            return Err(OffloadError::OutsideRoot(path.to_path_buf()));
        }
        Ok(std::fs::read(resolved)?)
    }

    /// Remove every offloaded payload of one message
    pub fn delete_attachments(&self, message_key: &str) -> Result<bool, OffloadError> {
        let dir = self.root.join(sanitize_key(message_key));
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        debug!("Deleted attachments at {}", dir.display());
        Ok(true)
    }

    /// Housekeeping: drop message directories not modified within `age`
    pub fn cleanup_older_than(&self, age: Duration) -> Result<usize, OffloadError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable attachment entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            let expired = match modified {
                Ok(modified) => now
                    .duration_since(modified)
                    .map(|elapsed| elapsed > age)
                    .unwrap_or(false),
                Err(e) => {
                    warn!("No mtime for {}: {}", path.display(), e);
                    false
                }
            };
            if expired {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            info!("Attachment cleanup removed {} message dir(s)", removed);
        }
        Ok(removed)
    }
}

/// A `_file_ref` marker is roughly this large; smaller values are never worth moving
const FILE_REF_OVERHEAD: usize = 64;

fn field_size(value: &FieldValue) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn field_size_bytes(data: &[u8]) -> usize {
    // base64 inflation
    data.len().div_ceil(3) * 4
}

fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
