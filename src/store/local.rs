//! Directory-backed content store with leases and garbage collection.
//!
//! Layout under the root:
//! ```text
//! blobs/sha256/<hex>      content-addressed blobs
//! images/<name>.json      image records (name is URL-safe base64 encoded)
//! leases/<id>.json        lease records with the digests pinned to them
//! ingest/                 staging area; files are renamed into place when complete
//! ```
//!
//! Blobs and image records are staged in `ingest/` and atomically renamed, so concurrent
//! writers never observe partial files. [`LocalStore::gc`] deletes blobs that are neither
//! reachable from an image nor pinned by a live lease.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use oci_spec::image::{Descriptor, Digest, MediaType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

use super::{sha256_digest, ContentStore, Image, ImageStore};
use crate::lease::{Lease, LeaseContext, LeaseManager};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    #[serde(flatten)]
    lease: Lease,
    #[serde(default)]
    resources: Vec<String>,
}

pub struct LocalStore {
    root: PathBuf,
    // serializes lease record updates and gc sweeps within this process
    lease_lock: Mutex<()>,
}

impl LocalStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["blobs/sha256", "images", "leases", "ingest"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create store directory {}", path.display()))?;
        }
        log::debug!("opened local store at {}", root.display());
        Ok(Self {
            root,
            lease_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    fn image_path(&self, name: &str) -> PathBuf {
        self.root
            .join("images")
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(name)))
    }

    fn lease_path(&self, id: &str) -> PathBuf {
        self.root.join("leases").join(format!("{}.json", id))
    }

    /// Writes `data` to `dest` through a staged temp file and an atomic rename.
    fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(self.root.join("ingest"))
            .context("Failed to create staging file")?;
        tmp.write_all(data).context("Failed to write staging file")?;
        tmp.persist(dest)
            .map_err(|e| anyhow!("Failed to move staged file to {}: {}", dest.display(), e))?;
        Ok(())
    }

    fn read_lease(&self, id: &str) -> Result<LeaseRecord> {
        let path = self.lease_path(id);
        let content = fs::read_to_string(&path).with_context(|| format!("lease {} not found", id))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse lease {}", id))
    }

    fn pin_to_lease(&self, id: &str, digest: &Digest) -> Result<()> {
        let _guard = self
            .lease_lock
            .lock()
            .map_err(|_| anyhow!("lease lock poisoned"))?;
        let mut record = self.read_lease(id)?;
        let digest = digest.to_string();
        if !record.resources.contains(&digest) {
            record.resources.push(digest);
            let data = serde_json::to_vec_pretty(&record)?;
            self.write_atomic(&self.lease_path(id), &data)?;
        }
        Ok(())
    }

    pub fn list_images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(self.root.join("images"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read image record {}", path.display()))?;
            images.push(serde_json::from_str(&content).with_context(|| {
                format!("Failed to parse image record {}", path.display())
            })?);
        }
        Ok(images)
    }

    pub fn lease(&self, id: &str) -> Result<Option<(Lease, Vec<String>)>> {
        if !self.lease_path(id).exists() {
            return Ok(None);
        }
        let record = self.read_lease(id)?;
        Ok(Some((record.lease, record.resources)))
    }

    fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        let mut leases = Vec::new();
        for entry in fs::read_dir(self.root.join("leases"))? {
            let path = entry?.path();
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            match self.read_lease(&id) {
                Ok(record) => leases.push(record),
                // released while we were listing
                Err(_) if !path.exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(leases)
    }

    /// Marks `digest` and everything an index or manifest blob references.
    fn mark_reachable(&self, digest: &str, keep: &mut HashSet<String>) -> Result<()> {
        if !keep.insert(digest.to_string()) {
            return Ok(());
        }
        let digest: Digest = match digest.parse() {
            Ok(d) => d,
            Err(_) => return Ok(()),
        };
        if !self.contains(&digest) {
            return Ok(());
        }
        let data = self.read_blob(&digest)?;
        let value: serde_json::Value = match serde_json::from_slice(&data) {
            Ok(v) => v,
            // layer or other opaque content
            Err(_) => return Ok(()),
        };

        let mut children = Vec::new();
        if let Some(manifests) = value["manifests"].as_array() {
            children.extend(manifests.iter().filter_map(|m| m["digest"].as_str()));
        }
        if let Some(config) = value["config"]["digest"].as_str() {
            children.push(config);
        }
        if let Some(layers) = value["layers"].as_array() {
            children.extend(layers.iter().filter_map(|l| l["digest"].as_str()));
        }
        let children: Vec<String> = children.into_iter().map(String::from).collect();
        for child in children {
            self.mark_reachable(&child, keep)?;
        }
        Ok(())
    }

    /// Removes expired leases and every blob not reachable from an image or a live lease.
    /// Returns the digests of the removed blobs.
    pub fn gc(&self, now: DateTime<Utc>) -> Result<Vec<Digest>> {
        // Held until the sweep ends: writers pin under this lock before their blob
        // lands, so a pin either shows up in the snapshot or waits for the sweep.
        let _guard = self
            .lease_lock
            .lock()
            .map_err(|_| anyhow!("lease lock poisoned"))?;
        let mut keep = HashSet::new();

        for record in self.list_leases()? {
            if record.lease.is_expired(now) {
                log::debug!("gc: removing expired lease {}", record.lease.id);
                fs::remove_file(self.lease_path(&record.lease.id)).ok();
            } else {
                keep.extend(record.resources);
            }
        }

        let mut reachable = HashSet::new();
        for image in self.list_images()? {
            self.mark_reachable(&image.target.digest().to_string(), &mut reachable)?;
        }
        keep.extend(reachable);

        let mut removed = Vec::new();
        for entry in fs::read_dir(self.root.join("blobs").join("sha256"))? {
            let path = entry?.path();
            let hex = match path.file_name().and_then(|n| n.to_str()) {
                Some(hex) => hex.to_string(),
                None => continue,
            };
            let digest = format!("sha256:{}", hex);
            if keep.contains(&digest) {
                continue;
            }
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove blob {}", path.display()))?;
            log::debug!("gc: removed blob {}", digest);
            if let Ok(d) = digest.parse() {
                removed.push(d);
            }
        }

        log::info!("gc: removed {} unreferenced blobs", removed.len());
        Ok(removed)
    }
}

impl ContentStore for LocalStore {
    fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).with_context(|| format!("content {} not found", digest))
    }

    fn write_blob(
        &self,
        ctx: &LeaseContext,
        media_type: MediaType,
        data: &[u8],
    ) -> Result<Descriptor> {
        let digest = sha256_digest(data)?;
        let path = self.blob_path(&digest);

        // Pin before the blob becomes visible so a concurrent gc cannot collect it.
        if let Some(lease) = ctx.lease() {
            self.pin_to_lease(lease, &digest)?;
        }
        if !path.exists() {
            self.write_atomic(&path, data)
                .with_context(|| format!("Failed to write blob {}", digest))?;
        }

        Ok(Descriptor::new(media_type, data.len() as u64, digest))
    }
}

impl ImageStore for LocalStore {
    fn get_image(&self, name: &str) -> Result<Option<Image>> {
        let path = self.image_path(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse image record for {}", name))?,
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read image record for {}", name)),
        }
    }

    fn put_image(&self, mut image: Image) -> Result<Image> {
        if let Some(existing) = self.get_image(&image.name)? {
            image.created_at = existing.created_at;
            image.updated_at = Utc::now();
        }
        let data = serde_json::to_vec_pretty(&image)?;
        self.write_atomic(&self.image_path(&image.name), &data)
            .with_context(|| format!("Failed to write image record for {}", image.name))?;
        Ok(image)
    }
}

impl LeaseManager for LocalStore {
    fn create_lease(&self, id: &str, ttl: Duration) -> Result<Lease> {
        let lease = Lease::new(id, ttl);
        let record = LeaseRecord {
            lease: lease.clone(),
            resources: Vec::new(),
        };
        let mut tmp = NamedTempFile::new_in(self.root.join("ingest"))
            .context("Failed to create staging file")?;
        tmp.write_all(&serde_json::to_vec_pretty(&record)?)
            .with_context(|| format!("Failed to write lease {}", id))?;
        tmp.persist_noclobber(self.lease_path(id))
            .map_err(|e| match e.error.kind() {
                ErrorKind::AlreadyExists => anyhow!("lease {} already exists", id),
                _ => anyhow!("Failed to create lease {}: {}", id, e.error),
            })?;
        Ok(lease)
    }

    fn delete_lease(&self, id: &str) -> Result<()> {
        let _guard = self
            .lease_lock
            .lock()
            .map_err(|_| anyhow!("lease lock poisoned"))?;
        fs::remove_file(self.lease_path(id)).with_context(|| format!("lease {} not found", id))
    }
}
