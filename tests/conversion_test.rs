use anyhow::{anyhow, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use obdconv::lease::LeaseContext;
use obdconv::overlaybd::LayerJob;
use obdconv::pipeline::{IndexConvertFunc, LayerWalker, ANNOTATION_BLOB_DIGEST};
use obdconv::store::{descriptor_for, ContentStore, ImageStore};
use obdconv::{
    import_layout, ConversionRequest, ConvertOptions, ImageConverter, LayerConverter,
    LocalResolverProvider, LocalStore, Notifier, Stage,
};
use oci_spec::image::{Descriptor, ImageManifest, MediaType};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

/// Prefixes the uncompressed layer with `obd:` instead of running the overlaybd tools.
#[derive(Clone)]
struct PrefixConverter;

impl LayerConverter for PrefixConverter {
    fn convert_layer(&self, job: &LayerJob<'_>) -> Result<PathBuf> {
        let mut data = b"obd:".to_vec();
        data.extend(fs::read(job.tar_path)?);
        let out = job.work_dir.join("overlaybd.commit");
        fs::write(&out, data)?;
        Ok(out)
    }
}

#[derive(Clone)]
struct BrokenConverter;

impl LayerConverter for BrokenConverter {
    fn convert_layer(&self, _job: &LayerJob<'_>) -> Result<PathBuf> {
        Err(anyhow!("overlaybd-apply failed: bad tar header"))
    }
}

fn walker_factory<L: LayerConverter + Clone + 'static>(
    converter: L,
) -> impl Fn(ConvertOptions) -> Result<Box<dyn IndexConvertFunc>> {
    move |options: ConvertOptions| -> Result<Box<dyn IndexConvertFunc>> {
        Ok(Box::new(LayerWalker::new(options, converter.clone())?))
    }
}

fn blob(dir: &Path, media_type: MediaType, data: &[u8]) -> Descriptor {
    let desc = descriptor_for(media_type, data).unwrap();
    let blobs = dir.join("blobs/sha256");
    fs::create_dir_all(&blobs).unwrap();
    fs::write(blobs.join(desc.digest().digest()), data).unwrap();
    desc
}

/// Writes a one-layer OCI layout with a gzipped layer.
fn write_layout(dir: &Path) {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(b"layer-tar-bytes").unwrap();
    let layer = blob(dir, MediaType::ImageLayerGzip, &enc.finish().unwrap());
    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": ["sha256:00"] },
    });
    let config = blob(dir, MediaType::ImageConfig, &serde_json::to_vec(&config).unwrap());
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": config,
        "layers": [layer],
    });
    let manifest = blob(dir, MediaType::ImageManifest, &serde_json::to_vec(&manifest).unwrap());
    fs::write(
        dir.join("index.json"),
        serde_json::to_vec(&json!({ "schemaVersion": 2, "manifests": [manifest] })).unwrap(),
    )
    .unwrap();
    fs::write(dir.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
}

fn seeded_store() -> (TempDir, Arc<LocalStore>) {
    let root = tempdir().unwrap();
    let layout = tempdir().unwrap();
    write_layout(layout.path());
    let store = Arc::new(LocalStore::open(root.path()).unwrap());
    import_layout(store.as_ref(), &LeaseContext::unleased(), layout.path(), "app:v1").unwrap();
    (root, store)
}

fn lease_files(root: &Path) -> usize {
    fs::read_dir(root.join("leases")).unwrap().count()
}

#[test]
fn test_end_to_end_conversion() {
    let (root, store) = seeded_store();
    let converter = ImageConverter::new(
        store.clone(),
        walker_factory(PrefixConverter),
        Notifier::new(1),
    );
    let request =
        ConversionRequest::parse("app:v1", "app:obd", "ext4", "", "lz4", 4).unwrap();

    let result = converter
        .convert(&request, &LocalResolverProvider::new(store.clone()))
        .unwrap();

    let dest = store.get_image("app:obd").unwrap().unwrap();
    assert_eq!(result.digest(), dest.target.digest());
    assert_eq!(result.media_type(), &MediaType::ImageManifest);

    let manifest: ImageManifest =
        serde_json::from_slice(&store.read_blob(result.digest()).unwrap()).unwrap();
    let layer = &manifest.layers()[0];
    assert!(layer
        .annotations()
        .as_ref()
        .unwrap()
        .contains_key(ANNOTATION_BLOB_DIGEST));
    assert_eq!(store.read_blob(layer.digest()).unwrap(), b"obd:layer-tar-bytes");

    let config: serde_json::Value =
        serde_json::from_slice(&store.read_blob(manifest.config().digest()).unwrap()).unwrap();
    assert_eq!(config["rootfs"]["diff_ids"][0], layer.digest().to_string());

    assert_eq!(lease_files(root.path()), 0, "lease released");

    // source and destination are both reachable after the lease is gone
    store.gc(Utc::now()).unwrap();
    assert!(store.contains(layer.digest()));
    assert!(store.contains(manifest.config().digest()));
    assert!(store.contains(store.get_image("app:v1").unwrap().unwrap().target.digest()));
}

#[test]
fn test_failed_conversion_keeps_destination_absent() {
    let (root, store) = seeded_store();
    let converter = ImageConverter::new(
        store.clone(),
        walker_factory(BrokenConverter),
        Notifier::new(1),
    );

    let err = converter
        .convert(
            &ConversionRequest::new("app:v1", "app:obd"),
            &LocalResolverProvider::new(store.clone()),
        )
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Conversion);
    let message = err.to_string();
    assert!(message.contains("failed to convert layer"), "{}", message);
    assert!(message.contains("bad tar header"), "{}", message);
    assert!(store.get_image("app:obd").unwrap().is_none());
    assert_eq!(lease_files(root.path()), 0);
}

#[test]
fn test_reconversion_reuses_overlaybd_layers() {
    let (_root, store) = seeded_store();
    let provider = LocalResolverProvider::new(store.clone());
    let first = ImageConverter::new(
        store.clone(),
        walker_factory(PrefixConverter),
        Notifier::new(1),
    )
    .convert(&ConversionRequest::new("app:v1", "app:obd"), &provider)
    .unwrap();

    // every layer already carries the overlaybd annotation
    let second = ImageConverter::new(
        store.clone(),
        walker_factory(BrokenConverter),
        Notifier::new(1),
    )
    .convert(&ConversionRequest::new("app:obd", "app:obd2"), &provider)
    .unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_invalid_block_size_is_rejected_up_front() {
    let err = ConversionRequest::parse("app:v1", "app:obd", "ext4", "", "", 3).unwrap_err();
    assert_eq!(err.stage(), Stage::Input);
}
