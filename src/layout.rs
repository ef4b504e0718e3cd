//! Import of OCI image layouts into the local store.
//!
//! Accepts an unpacked layout directory or a layout archive (plain tar or gzipped tar,
//! as written by `docker save`-style tools with `--format oci`). Every blob reachable
//! from `index.json` is checked against its descriptor before it is written.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar_rs as tar;
use tempfile::TempDir;

use crate::lease::LeaseContext;
use crate::pipeline::{is_index, is_manifest};
use crate::store::{sha256_digest, Client, Image};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciLayout {
    image_layout_version: String,
}

/// Imports the layout at `path` and records its root as image `name`.
///
/// A layout whose index lists a single manifest is stored with that manifest as target;
/// otherwise the index itself becomes the target.
pub fn import_layout(
    client: &dyn Client,
    ctx: &LeaseContext,
    path: &Path,
    name: &str,
) -> Result<Image> {
    if path.is_dir() {
        return import_dir(client, ctx, path, name);
    }

    let unpacked = TempDir::new().context("Failed to create temporary directory")?;
    unpack_archive(path, unpacked.path())?;
    import_dir(client, ctx, unpacked.path(), name)
}

/// Unpacks a plain or gzipped tar archive into `dest`.
fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(archive_path)
            .with_context(|| format!("Failed to open {}", archive_path.display()))?,
    );
    let mut magic = [0u8; 2];
    reader
        .read_exact(&mut magic)
        .with_context(|| format!("{} is too short to be an archive", archive_path.display()))?;

    // Reopen the file since we consumed the magic bytes
    let file = File::open(archive_path)?;
    let mut archive: tar::Archive<Box<dyn Read>> = if magic == [0x1f, 0x8b] {
        tar::Archive::new(Box::new(GzDecoder::new(file)))
    } else {
        tar::Archive::new(Box::new(file))
    };
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to unpack {}", archive_path.display()))
}

fn import_dir(client: &dyn Client, ctx: &LeaseContext, dir: &Path, name: &str) -> Result<Image> {
    let layout_path = dir.join(OCI_LAYOUT_FILE);
    let layout: OciLayout = serde_json::from_slice(
        &fs::read(&layout_path)
            .with_context(|| format!("{} is not an OCI image layout", dir.display()))?,
    )
    .with_context(|| format!("Failed to parse {}", layout_path.display()))?;
    log::debug!(
        "importing OCI layout {} (version {})",
        dir.display(),
        layout.image_layout_version
    );

    let index_data = fs::read(dir.join(INDEX_FILE))
        .with_context(|| format!("Failed to read {} in {}", INDEX_FILE, dir.display()))?;
    let index: ImageIndex =
        serde_json::from_slice(&index_data).context("Failed to parse layout index")?;
    if index.manifests().is_empty() {
        bail!("layout {} contains no images", dir.display());
    }

    let importer = Importer { client, ctx, dir };
    for desc in index.manifests() {
        importer.import(desc)?;
    }

    let target = match index.manifests().as_slice() {
        [single] => single.clone(),
        _ => client.write_blob(ctx, MediaType::ImageIndex, &index_data)?,
    };
    log::info!("imported {} as {} ({})", dir.display(), name, target.digest());
    client.put_image(Image::new(name, target))
}

struct Importer<'a> {
    client: &'a dyn Client,
    ctx: &'a LeaseContext,
    dir: &'a Path,
}

impl Importer<'_> {
    fn blob_path(&self, desc: &Descriptor) -> PathBuf {
        let digest = desc.digest();
        self.dir
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    /// Reads and verifies one blob, then copies it and its children into the store.
    fn import(&self, desc: &Descriptor) -> Result<()> {
        let data = if self.client.contains(desc.digest()) {
            self.client.read_blob(desc.digest())?
        } else {
            let path = self.blob_path(desc);
            let data = fs::read(&path)
                .with_context(|| format!("Missing blob {} in layout", desc.digest()))?;
            if data.len() as u64 != desc.size() {
                bail!(
                    "blob {}: size {} does not match descriptor size {}",
                    desc.digest(),
                    data.len(),
                    desc.size()
                );
            }
            let actual = sha256_digest(&data)?;
            if &actual != desc.digest() {
                bail!("blob {}: content digest is {}", desc.digest(), actual);
            }
            self.client
                .write_blob(self.ctx, desc.media_type().clone(), &data)?;
            data
        };

        if is_index(desc.media_type()) {
            let index: ImageIndex = serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse index {}", desc.digest()))?;
            for child in index.manifests() {
                self.import(child)?;
            }
        } else if is_manifest(desc.media_type()) {
            let manifest: ImageManifest = serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse manifest {}", desc.digest()))?;
            self.import(manifest.config())?;
            for layer in manifest.layers() {
                self.import(layer)?;
            }
        }
        Ok(())
    }
}
