use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use obdconv::lease::{self, DEFAULT_LEASE_TTL};
use obdconv::notifier::init_logging;
use obdconv::overlaybd::DEFAULT_BIN_DIR;
use obdconv::{
    import_layout, ConversionRequest, ConvertError, ImageConverter, LocalResolverProvider,
    LocalStore, Notifier, OverlaybdConverter, OverlaybdTool,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Convert a local container image into an overlaybd image",
    long_about = None
)]
struct Cli {
    #[arg(help = "Source image name (must exist in the local store)")]
    src_image: String,

    #[arg(help = "Destination image name")]
    dst_image: String,

    #[arg(
        long,
        default_value = "ext4",
        help = "Filesystem type of the converted image, with optional mount and mkfs options: <fs>[;mount,opts[;mkfs opts]]"
    )]
    fstype: String,

    #[arg(long, default_value = "", help = "Database config string for layer deduplication")]
    dbstr: String,

    #[arg(long, default_value = "", help = "Compression algorithm (lz4 or zstd)")]
    algorithm: String,

    #[arg(long, default_value_t = 0, help = "Compression block size in KB (4-64, power of two)")]
    bs: u32,

    #[arg(
        long,
        env = "OBDCONV_ROOT",
        default_value = "/var/lib/obdconv",
        help = "Root directory of the local content store"
    )]
    root: PathBuf,

    #[arg(
        long,
        env = "OVERLAYBD_BIN_DIR",
        default_value = DEFAULT_BIN_DIR,
        help = "Directory containing the overlaybd-create/apply/commit tools"
    )]
    overlaybd_bin: PathBuf,

    #[arg(
        long,
        help = "Import an OCI image layout (directory or tar archive) as the source image first"
    )]
    oci_layout: Option<PathBuf>,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

fn run(cli: Cli) -> Result<()> {
    init_logging(cli.verbose);

    let request = ConversionRequest::parse(
        &cli.src_image,
        &cli.dst_image,
        &cli.fstype,
        &cli.dbstr,
        &cli.algorithm,
        cli.bs,
    )?;
    info!("Starting obdconv: {} -> {}", cli.src_image, cli.dst_image);
    debug!("Store root: {}", cli.root.display());
    debug!("overlaybd tools: {}", cli.overlaybd_bin.display());

    let tool = OverlaybdTool::new(&cli.overlaybd_bin)?;
    let store = Arc::new(LocalStore::open(&cli.root)?);

    if let Some(layout) = &cli.oci_layout {
        let guard = lease::acquire(store.clone(), &lease::new_lease_name(), DEFAULT_LEASE_TTL)?;
        import_layout(store.as_ref(), guard.context(), layout, request.source_ref())
            .with_context(|| format!("Failed to import {}", layout.display()))?;
        guard.release()?;
    }

    let converter = ImageConverter::new(
        store.clone(),
        OverlaybdConverter::new(tool),
        Notifier::new(cli.verbose),
    );

    println!("filesystem type: {}", request.fs_type());
    if let Some(db_str) = request.db_str() {
        println!("database config string: {}", db_str);
    }

    let result = converter.convert(&request, &LocalResolverProvider::new(store))?;
    println!("new image digest: {}", result.digest());
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // ConvertError already renders its cause chain
            match e.downcast_ref::<ConvertError>() {
                Some(convert_error) => eprintln!("Error: {}", convert_error),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obdconv::store::{descriptor_for, ImageStore};
    use oci_spec::image::{Descriptor, MediaType};
    use std::ffi::OsStr;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn blob(dir: &Path, media_type: MediaType, data: &[u8]) -> Descriptor {
        let desc = descriptor_for(media_type, data).unwrap();
        let blobs = dir.join("blobs/sha256");
        fs::create_dir_all(&blobs).unwrap();
        fs::write(blobs.join(desc.digest().digest()), data).unwrap();
        desc
    }

    fn cli(root: &Path, bin: &Path, layout: &Path) -> Cli {
        Cli::parse_from([
            OsStr::new("obdconv"),
            OsStr::new("app:v1"),
            OsStr::new("app:obd"),
            OsStr::new("--root"),
            root.as_os_str(),
            OsStr::new("--overlaybd-bin"),
            bin.as_os_str(),
            OsStr::new("--oci-layout"),
            layout.as_os_str(),
        ])
    }

    #[test]
    fn test_missing_tools_leave_source_untouched() {
        let layout = tempdir().unwrap();
        let config = blob(layout.path(), MediaType::ImageConfig, b"{}");
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": config,
            "layers": [],
        });
        let manifest = blob(
            layout.path(),
            MediaType::ImageManifest,
            &serde_json::to_vec(&manifest).unwrap(),
        );
        let index = serde_json::json!({ "schemaVersion": 2, "manifests": [manifest] });
        fs::write(layout.path().join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        fs::write(layout.path().join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

        let root = tempdir().unwrap();
        let empty_bin = tempdir().unwrap();
        let err = run(cli(root.path(), empty_bin.path(), layout.path())).unwrap_err();
        assert!(err.to_string().contains("not found in"), "{:#}", err);

        let store = LocalStore::open(root.path()).unwrap();
        assert!(store.get_image("app:v1").unwrap().is_none());
    }
}
