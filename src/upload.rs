// Resumable upload engine. Small files go up in a single PUT, larger ones
// as a multipart upload whose progress is checkpointed on disk so an
// interrupted transfer picks up where it stopped. Every object-store
// request goes through the retry policy on its own, so one failing part
// never restarts the whole transfer.

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::oss::{Bucket, PartInfo};
use crate::retry::{with_retry, Paginator, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The object store refuses parts smaller than this (except the last one).
pub const MIN_PART_SIZE: u64 = 100 * 1024;
/// Upper bound on the number of parts of one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// Remote key for a freshly pushed file: `<userId>/push/<uuid><.ext>`.
pub fn remote_key(user_id: &str, path: &Path) -> String {
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}/push/{}{}", user_id, Uuid::new_v4(), extension)
}

/// Part size actually used for a file of `file_size` bytes.
pub fn effective_part_size(file_size: u64, requested: u64) -> u64 {
    let mut size = requested.max(MIN_PART_SIZE);
    if file_size.div_ceil(size) > MAX_PARTS {
        size = file_size.div_ceil(MAX_PARTS);
    }
    size
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
}

impl From<&UploadConfig> for UploadOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            multipart_threshold: config.multipart_threshold,
            part_size: config.part_size,
            checkpoint_dir: Some(config.checkpoint_dir.clone()),
        }
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// On-disk record of an unfinished multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Checkpoint {
    bucket: String,
    key: String,
    upload_id: String,
    file_size: u64,
    mtime: i64,
    part_size: u64,
    parts: Vec<PartInfo>,
}

/// Local file facts a checkpoint is validated against.
struct FileStat {
    size: u64,
    mtime: i64,
}

impl FileStat {
    fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            mtime,
        })
    }
}

pub struct Uploader<'a> {
    bucket: &'a Bucket,
    policy: &'a dyn RetryPolicy,
    options: UploadOptions,
}

impl<'a> Uploader<'a> {
    pub fn new(bucket: &'a Bucket, policy: &'a dyn RetryPolicy, options: UploadOptions) -> Self {
        Self {
            bucket,
            policy,
            options,
        }
    }

    /// Key of an unfinished upload of `path` into this bucket under
    /// `key_prefix`, if a still-valid checkpoint exists.
    pub fn pending_key(&self, path: &Path, key_prefix: &str) -> Option<String> {
        let stat = FileStat::of(path).ok()?;
        let part_size = effective_part_size(stat.size, self.options.part_size);
        self.load_checkpoint(path)
            .filter(|cp| self.checkpoint_matches(cp, &stat, part_size))
            .filter(|cp| cp.key.starts_with(key_prefix))
            .map(|cp| cp.key)
    }

    /// Upload `path` to `key`. `progress` receives (bytes done, total).
    pub fn upload(
        &self,
        path: &Path,
        key: &str,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<UploadedObject> {
        let stat = FileStat::of(path)?;
        if stat.size < self.options.multipart_threshold {
            return self.upload_single(path, key, stat.size, progress);
        }
        self.upload_multipart(path, key, &stat, progress)
    }

    fn upload_single(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<UploadedObject> {
        let data = std::fs::read(path)?;
        progress(0, size);
        let etag = with_retry(self.policy, "put_object", |_| {
            self.bucket.put_object(key, &data)
        })?;
        progress(size, size);
        info!(key, size, "object uploaded");
        Ok(UploadedObject {
            key: key.to_string(),
            size,
            etag,
        })
    }

    fn upload_multipart(
        &self,
        path: &Path,
        key: &str,
        stat: &FileStat,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<UploadedObject> {
        let part_size = effective_part_size(stat.size, self.options.part_size);
        let total_parts = stat.size.div_ceil(part_size) as u32;

        let resumed = match self.load_checkpoint(path) {
            Some(cp) if cp.key == key && self.checkpoint_matches(&cp, stat, part_size) => {
                self.reconcile(cp)?
            }
            Some(_) => {
                debug!(path = %path.display(), "discarding stale checkpoint");
                self.remove_checkpoint(path);
                None
            }
            None => None,
        };

        let mut checkpoint = match resumed {
            Some(cp) => {
                info!(key, upload_id = %cp.upload_id, parts = cp.parts.len(), "resuming upload");
                cp
            }
            None => {
                let upload_id = with_retry(self.policy, "init_multipart_upload", |_| {
                    self.bucket.init_multipart_upload(key)
                })?;
                let cp = Checkpoint {
                    bucket: self.bucket.name().to_string(),
                    key: key.to_string(),
                    upload_id,
                    file_size: stat.size,
                    mtime: stat.mtime,
                    part_size,
                    parts: Vec::new(),
                };
                self.save_checkpoint(path, &cp)?;
                cp
            }
        };

        let mut file = File::open(path)?;
        let mut done: u64 = checkpoint.parts.iter().map(|p| p.size).sum();
        progress(done, stat.size);

        for part_number in 1..=total_parts {
            if checkpoint.parts.iter().any(|p| p.part_number == part_number) {
                continue;
            }
            let offset = (part_number as u64 - 1) * part_size;
            let len = part_size.min(stat.size - offset);
            let mut buf = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;

            let etag = with_retry(self.policy, "upload_part", |_| {
                self.bucket
                    .upload_part(key, &checkpoint.upload_id, part_number, &buf)
            })?;
            checkpoint.parts.push(PartInfo {
                part_number,
                etag,
                size: len,
            });
            self.save_checkpoint(path, &checkpoint)?;

            done += len;
            progress(done, stat.size);
        }

        with_retry(self.policy, "complete_multipart_upload", |_| {
            self.bucket
                .complete_multipart_upload(key, &checkpoint.upload_id, &checkpoint.parts)
        })?;
        self.remove_checkpoint(path);
        info!(key, size = stat.size, parts = total_parts, "multipart upload complete");

        Ok(UploadedObject {
            key: key.to_string(),
            size: stat.size,
            etag: None,
        })
    }

    /// Replace the checkpoint's part list with what the server actually
    /// holds. `None` means the upload is gone and must start over.
    fn reconcile(&self, mut cp: Checkpoint) -> Result<Option<Checkpoint>> {
        let mut pager = Paginator::new(0);
        let listed = pager.collect_all(self.policy, |marker| {
            self.bucket.list_parts(&cp.key, &cp.upload_id, marker)
        });

        let server_parts = match listed {
            Ok(parts) => parts,
            Err(Error::Transfer(e)) if e.status == 404 => {
                warn!(upload_id = %cp.upload_id, "upload no longer exists on the server, restarting");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let expected_last = cp.file_size - (cp.file_size.div_ceil(cp.part_size) - 1) * cp.part_size;
        let total_parts = cp.file_size.div_ceil(cp.part_size) as u32;
        let mut by_number = BTreeMap::new();
        for part in server_parts {
            let expected = if part.part_number == total_parts {
                expected_last
            } else {
                cp.part_size
            };
            if part.part_number >= 1 && part.part_number <= total_parts && part.size == expected {
                by_number.insert(part.part_number, part);
            }
        }
        cp.parts = by_number.into_values().collect();
        Ok(Some(cp))
    }

    fn checkpoint_matches(&self, cp: &Checkpoint, stat: &FileStat, part_size: u64) -> bool {
        cp.bucket == self.bucket.name()
            && cp.file_size == stat.size
            && cp.mtime == stat.mtime
            && cp.part_size == part_size
    }

    fn checkpoint_path(&self, path: &Path) -> Option<PathBuf> {
        let dir = self.options.checkpoint_dir.as_ref()?;
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let digest = Sha1::digest(canonical.to_string_lossy().as_bytes());
        Some(dir.join(format!("{}.json", hex::encode(digest))))
    }

    fn load_checkpoint(&self, path: &Path) -> Option<Checkpoint> {
        let file = self.checkpoint_path(path)?;
        let contents = std::fs::read_to_string(file).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn save_checkpoint(&self, path: &Path, cp: &Checkpoint) -> Result<()> {
        let Some(file) = self.checkpoint_path(path) else {
            return Ok(());
        };
        if let Some(dir) = file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(file, serde_json::to_vec_pretty(cp)?)?;
        Ok(())
    }

    fn remove_checkpoint(&self, path: &Path) {
        if let Some(file) = self.checkpoint_path(path) {
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %file.display(), error = %e, "could not remove checkpoint");
                }
            }
        }
    }
}
