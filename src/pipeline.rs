//! Generic image-conversion pipeline.
//!
//! [`convert_image`] resolves a local source image, hands its root descriptor to an
//! [`IndexConvertFunc`] and records the result under the destination name. The
//! destination record is only written after the function succeeded.
//!
//! [`LayerWalker`] is the index-conversion function used for overlaybd: it recurses
//! through indexes and manifests, converts every eligible layer with a
//! [`LayerConverter`], rewrites the config's `rootfs.diff_ids`, and writes new OCI
//! manifests (and indexes) under the caller's lease.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::lease::LeaseContext;
use crate::options::ConvertOptions;
use crate::overlaybd::{LayerConverter, LayerJob};
use crate::resolver::Resolver;
use crate::store::{sha256_digest, Client, Image};

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

pub const ANNOTATION_BLOB_DIGEST: &str = "containerd.io/snapshot/overlaybd/blob-digest";
pub const ANNOTATION_BLOB_SIZE: &str = "containerd.io/snapshot/overlaybd/blob-size";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Converts a root descriptor. `Ok(None)` means the content needed no change.
pub trait IndexConvertFunc {
    fn convert_index(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Option<Descriptor>>;
}

impl<F> IndexConvertFunc for F
where
    F: Fn(&LeaseContext, &Descriptor) -> Result<Option<Descriptor>>,
{
    fn convert_index(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Option<Descriptor>> {
        self(ctx, desc)
    }
}

/// Converts the local image `src` and stores the result as `dest`.
pub fn convert_image(
    client: &dyn Client,
    ctx: &LeaseContext,
    dest: &str,
    src: &str,
    index_fn: &dyn IndexConvertFunc,
) -> Result<Image> {
    let src_image = client
        .get_image(src)?
        .ok_or_else(|| anyhow!("image {:?}: not found", src))?;
    log::debug!("source {} -> {}", src, src_image.target.digest());

    let target = index_fn
        .convert_index(ctx, &src_image.target)?
        .unwrap_or_else(|| src_image.target.clone());

    client
        .put_image(Image::new(dest, target))
        .with_context(|| format!("Failed to store image {}", dest))
}

pub fn is_index(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        MediaType::Other(other) => other == DOCKER_MANIFEST_LIST,
        _ => false,
    }
}

pub fn is_manifest(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageManifest => true,
        MediaType::Other(other) => other == DOCKER_MANIFEST,
        _ => false,
    }
}

/// Layers carrying the overlaybd blob annotation are already converted.
pub fn is_overlaybd_layer(desc: &Descriptor) -> bool {
    desc.annotations()
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_BLOB_DIGEST))
}

fn chain_key(parent: &str, desc: &Descriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(b" ");
    hasher.update(desc.digest().to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
struct ConvertedLayer {
    desc: Descriptor,
    blob: PathBuf,
}

pub struct LayerWalker<L: LayerConverter> {
    options: ConvertOptions,
    client: Arc<dyn Client>,
    converter: L,
    work_dir: TempDir,
    // converted layers keyed by chain, shared by all manifests of one run
    converted: Mutex<HashMap<String, ConvertedLayer>>,
}

impl<L: LayerConverter> LayerWalker<L> {
    pub fn new(options: ConvertOptions, converter: L) -> Result<Self> {
        let client = options
            .client()
            .cloned()
            .ok_or_else(|| anyhow!("no client configured for conversion"))?;
        let work_dir = tempfile::Builder::new()
            .prefix("obdconv-")
            .tempdir()
            .context("Failed to create work directory")?;
        Ok(Self {
            options,
            client,
            converter,
            work_dir,
            converted: Mutex::new(HashMap::new()),
        })
    }

    fn resolver(&self) -> Option<&Arc<dyn Resolver>> {
        self.options.resolver()
    }

    /// Reads content from the local store, falling back to the resolver. Fetched content
    /// is verified and stored under the lease.
    fn fetch(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Vec<u8>> {
        if self.client.contains(desc.digest()) {
            return self.client.read_blob(desc.digest());
        }
        let resolver = self.resolver().ok_or_else(|| {
            anyhow!("content {} not found locally and no resolver configured", desc.digest())
        })?;
        log::debug!("fetching {} from {}", desc.digest(), self.options.image_ref());
        let data = resolver
            .fetch(desc)
            .with_context(|| format!("Failed to fetch {}", desc.digest()))?;
        let actual = sha256_digest(&data)?;
        if &actual != desc.digest() {
            bail!("digest mismatch: expected {}, got {}", desc.digest(), actual);
        }
        self.client
            .write_blob(ctx, desc.media_type().clone(), &data)?;
        Ok(data)
    }

    fn walk(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Option<Descriptor>> {
        if is_index(desc.media_type()) {
            self.convert_index_blob(ctx, desc)
        } else if is_manifest(desc.media_type()) {
            self.convert_manifest(ctx, desc)
        } else {
            bail!("unsupported media type {} for {}", desc.media_type(), desc.digest())
        }
    }

    fn convert_index_blob(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Option<Descriptor>> {
        let data = self.fetch(ctx, desc)?;
        let mut index = ImageIndex::from_reader(&data[..])
            .with_context(|| format!("Failed to parse index {}", desc.digest()))?;

        let mut changed = false;
        let mut manifests = Vec::with_capacity(index.manifests().len());
        for manifest in index.manifests() {
            let media_type = manifest.media_type();
            if !is_index(media_type) && !is_manifest(media_type) {
                // attestations, signatures and other artifacts stay as they are
                log::debug!("keeping {} entry {} unchanged", media_type, manifest.digest());
                manifests.push(manifest.clone());
                continue;
            }
            match self.walk(ctx, manifest)? {
                Some(new) => {
                    changed = true;
                    manifests.push(new);
                }
                None => manifests.push(manifest.clone()),
            }
        }
        if !changed {
            return Ok(None);
        }

        index.set_manifests(manifests);
        index.set_media_type(Some(MediaType::ImageIndex));
        let mut new = self
            .client
            .write_blob(ctx, MediaType::ImageIndex, &serde_json::to_vec(&index)?)?;
        new.set_platform(desc.platform().clone());
        log::info!("converted index {} -> {}", desc.digest(), new.digest());
        Ok(Some(new))
    }

    fn convert_manifest(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Option<Descriptor>> {
        let data = self.fetch(ctx, desc)?;
        let mut manifest = ImageManifest::from_reader(&data[..])
            .with_context(|| format!("Failed to parse manifest {}", desc.digest()))?;
        let config_data = self.fetch(ctx, manifest.config())?;
        let mut config: serde_json::Value = serde_json::from_slice(&config_data)
            .with_context(|| format!("Failed to parse config {}", manifest.config().digest()))?;

        let total = manifest.layers().len();
        let mut layers = Vec::with_capacity(total);
        let mut parents: Vec<PathBuf> = Vec::with_capacity(total);
        let mut chain = String::new();
        let mut changed = false;

        for (i, layer) in manifest.layers().iter().enumerate() {
            chain = chain_key(&chain, layer);
            let converted = if is_overlaybd_layer(layer) {
                log::debug!("layer {}/{} is already overlaybd", i + 1, total);
                self.keep_layer(ctx, &chain, layer)?
            } else {
                changed = true;
                self.convert_layer(ctx, &chain, i, layer, &parents)
                    .with_context(|| format!("failed to convert layer {}", layer.digest()))?
            };
            parents.push(converted.blob);
            layers.push(converted.desc);
        }

        if !changed {
            return Ok(None);
        }

        if !config.is_object() {
            bail!("config {} is not a JSON object", manifest.config().digest());
        }
        let diff_ids: Vec<String> = layers.iter().map(|l| l.digest().to_string()).collect();
        config["rootfs"] = serde_json::json!({ "type": "layers", "diff_ids": diff_ids });
        let config_desc =
            self.client
                .write_blob(ctx, MediaType::ImageConfig, &serde_json::to_vec(&config)?)?;

        manifest.set_media_type(Some(MediaType::ImageManifest));
        manifest.set_config(config_desc);
        manifest.set_layers(layers);
        let mut new = self
            .client
            .write_blob(ctx, MediaType::ImageManifest, &serde_json::to_vec(&manifest)?)?;
        new.set_platform(desc.platform().clone());
        log::info!("converted manifest {} -> {}", desc.digest(), new.digest());
        Ok(Some(new))
    }

    fn chain_dir(&self, chain: &str) -> Result<PathBuf> {
        let dir = self.work_dir.path().join(&chain[..16]);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    fn keep_layer(&self, ctx: &LeaseContext, chain: &str, layer: &Descriptor) -> Result<ConvertedLayer> {
        let blob = self.chain_dir(chain)?.join("overlaybd.commit");
        if !blob.exists() {
            fs::write(&blob, self.fetch(ctx, layer)?)?;
        }
        Ok(ConvertedLayer {
            desc: layer.clone(),
            blob,
        })
    }

    fn convert_layer(
        &self,
        ctx: &LeaseContext,
        chain: &str,
        index: usize,
        layer: &Descriptor,
        parents: &[PathBuf],
    ) -> Result<ConvertedLayer> {
        if let Some(done) = self.cached(chain)? {
            log::debug!("layer {} already converted in this run", layer.digest());
            return Ok(done);
        }

        let work_dir = self.chain_dir(chain)?;
        let tar_path = work_dir.join("layer.tar");
        write_layer_tar(&self.fetch(ctx, layer)?, &tar_path)?;

        let job = LayerJob {
            index,
            layer,
            tar_path: &tar_path,
            parents,
            work_dir: &work_dir,
            settings: self.options.settings(),
        };
        let output = self.converter.convert_layer(&job)?;
        fs::remove_file(&tar_path).ok();

        let mut desc = self
            .client
            .write_blob_from_path(ctx, MediaType::ImageLayer, &output)?;
        let mut annotations = HashMap::new();
        annotations.insert(ANNOTATION_BLOB_DIGEST.to_string(), desc.digest().to_string());
        annotations.insert(ANNOTATION_BLOB_SIZE.to_string(), desc.size().to_string());
        desc.set_annotations(Some(annotations));
        log::info!("converted layer {} -> {}", layer.digest(), desc.digest());

        let converted = ConvertedLayer { desc, blob: output };
        self.converted
            .lock()
            .map_err(|_| anyhow!("layer cache poisoned"))?
            .insert(chain.to_string(), converted.clone());
        Ok(converted)
    }

    fn cached(&self, chain: &str) -> Result<Option<ConvertedLayer>> {
        Ok(self
            .converted
            .lock()
            .map_err(|_| anyhow!("layer cache poisoned"))?
            .get(chain)
            .cloned())
    }
}

impl<L: LayerConverter> IndexConvertFunc for LayerWalker<L> {
    fn convert_index(&self, ctx: &LeaseContext, desc: &Descriptor) -> Result<Option<Descriptor>> {
        self.walk(ctx, desc)
    }
}

/// Writes a layer blob as a plain tar, decompressing gzip content.
fn write_layer_tar(blob: &[u8], dest: &Path) -> Result<()> {
    if blob.starts_with(&ZSTD_MAGIC) {
        bail!("zstd compressed layers are not supported");
    }
    let mut out = BufWriter::new(
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?,
    );
    if blob.starts_with(&GZIP_MAGIC) {
        io::copy(&mut GzDecoder::new(blob), &mut out).context("Failed to decompress layer")?;
    } else {
        io::copy(&mut &blob[..], &mut out).context("Failed to write layer")?;
    }
    Ok(())
}
