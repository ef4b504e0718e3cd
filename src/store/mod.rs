//! Content and metadata store capabilities.
//!
//! The conversion reads and writes through three capabilities, bundled as [`Client`]:
//! - [`ContentStore`]: content-addressed blobs,
//! - [`ImageStore`]: named image records pointing at a target descriptor,
//! - [`crate::lease::LeaseManager`]: leases that pin objects against garbage collection.
//!
//! [`LocalStore`] is the directory-backed implementation used by the CLI.

pub mod local;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oci_spec::image::{Descriptor, Digest, MediaType};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fs;
use std::path::Path;

use crate::lease::{LeaseContext, LeaseManager};

pub use local::LocalStore;

pub trait ContentStore: Send + Sync {
    fn contains(&self, digest: &Digest) -> bool;

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Stores `data` and returns its descriptor. The blob is pinned to the context's lease.
    fn write_blob(&self, ctx: &LeaseContext, media_type: MediaType, data: &[u8])
        -> Result<Descriptor>;

    /// Stores the contents of a file; used for converted layers that may be large.
    fn write_blob_from_path(
        &self,
        ctx: &LeaseContext,
        media_type: MediaType,
        path: &Path,
    ) -> Result<Descriptor> {
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        self.write_blob(ctx, media_type, &data)
    }
}

/// A named reference to a root descriptor (manifest or index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn new(name: &str, target: Descriptor) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            target,
            created_at: now,
            updated_at: now,
        }
    }
}

pub trait ImageStore: Send + Sync {
    fn get_image(&self, name: &str) -> Result<Option<Image>>;

    /// Creates the record, or replaces the target of an existing one.
    fn put_image(&self, image: Image) -> Result<Image>;
}

/// Everything a conversion needs from the local store.
pub trait Client: ContentStore + ImageStore + LeaseManager {}

impl<T: ContentStore + ImageStore + LeaseManager> Client for T {}

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> Result<Digest> {
    let hex = format!("{:x}", Sha256::digest(data));
    format!("sha256:{}", hex)
        .parse()
        .context("Failed to build sha256 digest")
}

pub fn descriptor_for(media_type: MediaType, data: &[u8]) -> Result<Descriptor> {
    Ok(Descriptor::new(
        media_type,
        data.len() as u64,
        sha256_digest(data)?,
    ))
}
