//! Overlaybd layer conversion.
//!
//! The byte-level tar -> overlaybd transformation is done by the overlaybd tools
//! (`overlaybd-create`, `overlaybd-apply`, `overlaybd-commit`). [`OverlaybdTool`] drives
//! them as child processes for one layer at a time; [`OverlaybdConverter`] wires it into a
//! [`LayerWalker`] so it can be handed to the conversion pipeline.

use anyhow::{anyhow, bail, Context, Result};
use oci_spec::image::Descriptor;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::converter::IndexConverterFactory;
use crate::options::{ConvertOptions, LayerSettings};
use crate::pipeline::{IndexConvertFunc, LayerWalker};

pub const DEFAULT_BIN_DIR: &str = "/opt/overlaybd/bin";

const CREATE: &str = "overlaybd-create";
const APPLY: &str = "overlaybd-apply";
const COMMIT: &str = "overlaybd-commit";

/// Virtual size of the block device, in GB.
const DEFAULT_VSIZE_GB: u32 = 64;

/// One layer handed to a [`LayerConverter`].
pub struct LayerJob<'a> {
    /// Position of the layer in its manifest, base layer first.
    pub index: usize,
    pub layer: &'a Descriptor,
    /// The layer content as an uncompressed tar.
    pub tar_path: &'a Path,
    /// Converted blobs of the lower layers, base layer first.
    pub parents: &'a [PathBuf],
    /// Scratch directory owned by this layer; outputs go here.
    pub work_dir: &'a Path,
    pub settings: &'a LayerSettings,
}

/// Turns one tar layer into an overlaybd blob and returns the blob's path.
pub trait LayerConverter: Send + Sync {
    fn convert_layer(&self, job: &LayerJob<'_>) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct OverlaybdTool {
    bin_dir: PathBuf,
    vsize_gb: u32,
}

impl OverlaybdTool {
    pub fn new<P: AsRef<Path>>(bin_dir: P) -> Result<Self> {
        let bin_dir = bin_dir.as_ref().to_path_buf();
        for tool in [CREATE, APPLY, COMMIT] {
            if !bin_dir.join(tool).is_file() {
                bail!(
                    "{} not found in {}. Is overlaybd installed?",
                    tool,
                    bin_dir.display()
                );
            }
        }
        Ok(Self {
            bin_dir,
            vsize_gb: DEFAULT_VSIZE_GB,
        })
    }

    fn run_command(&self, tool: &str, args: &[String]) -> Result<()> {
        log::debug!("running {} {:?}", tool, args);
        let output = Command::new(self.bin_dir.join(tool))
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {}", tool))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} failed: {}", tool, error.trim()));
        }
        Ok(())
    }
}

struct Workspace {
    data: PathBuf,
    index: PathBuf,
    config: PathBuf,
    result: PathBuf,
    commit: PathBuf,
}

impl Workspace {
    fn new(dir: &Path) -> Self {
        Self {
            data: dir.join("writable_data"),
            index: dir.join("writable_index"),
            config: dir.join("config.json"),
            result: dir.join("result"),
            commit: dir.join("overlaybd.commit"),
        }
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

/// Arguments for `overlaybd-create`; the base layer also formats the device.
fn create_args(ws: &Workspace, job: &LayerJob<'_>, vsize_gb: u32) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        path_arg(&ws.data),
        path_arg(&ws.index),
        vsize_gb.to_string(),
    ];
    if job.parents.is_empty() {
        let fs_type = &job.settings.fs_type;
        args.push("--mkfs".to_string());
        args.push("--fstype".to_string());
        args.push(fs_type.name().to_string());
        if !fs_type.mkfs_options().is_empty() {
            args.push("--mkfs_options".to_string());
            args.push(fs_type.mkfs_options().join(" "));
        }
    }
    args
}

/// Config consumed by `overlaybd-apply`: lower layers plus the writable upper layer.
fn apply_config(ws: &Workspace, job: &LayerJob<'_>) -> serde_json::Value {
    let lowers: Vec<serde_json::Value> = job
        .parents
        .iter()
        .map(|p| serde_json::json!({ "file": path_arg(p) }))
        .collect();
    serde_json::json!({
        "lowers": lowers,
        "upper": { "index": path_arg(&ws.index), "data": path_arg(&ws.data) },
        "resultFile": path_arg(&ws.result),
    })
}

fn apply_args(ws: &Workspace, job: &LayerJob<'_>) -> Vec<String> {
    let fs_type = &job.settings.fs_type;
    let mut args = vec![
        path_arg(job.tar_path),
        path_arg(&ws.config),
        "--fstype".to_string(),
        fs_type.name().to_string(),
    ];
    if !fs_type.mount_options().is_empty() {
        args.push("--mount_options".to_string());
        args.push(fs_type.mount_options().join(","));
    }
    args
}

/// Arguments for `overlaybd-commit`, producing a compressed (zfile) blob.
fn commit_args(ws: &Workspace, settings: &LayerSettings) -> Vec<String> {
    let mut args = vec!["-z".to_string()];
    if let Some(algorithm) = settings.algorithm {
        args.push("--algorithm".to_string());
        args.push(algorithm.to_string());
    }
    if let Some(bs) = settings.block_size {
        args.push("--bs".to_string());
        args.push(bs.kb().to_string());
    }
    args.extend([path_arg(&ws.data), path_arg(&ws.index), path_arg(&ws.commit)]);
    args
}

impl LayerConverter for OverlaybdTool {
    fn convert_layer(&self, job: &LayerJob<'_>) -> Result<PathBuf> {
        if let Some(db) = &job.settings.db_str {
            log::debug!("layer deduplication database configured: {}", db);
        }
        let ws = Workspace::new(job.work_dir);

        self.run_command(CREATE, &create_args(&ws, job, self.vsize_gb))?;
        fs::write(&ws.config, serde_json::to_vec_pretty(&apply_config(&ws, job))?)
            .context("Failed to write overlaybd-apply config")?;
        self.run_command(APPLY, &apply_args(&ws, job))?;
        self.run_command(COMMIT, &commit_args(&ws, job.settings))?;

        fs::remove_file(&ws.data).ok();
        fs::remove_file(&ws.index).ok();
        Ok(ws.commit)
    }
}

/// Builds the overlaybd index-conversion function from assembled options.
pub struct OverlaybdConverter {
    tool: OverlaybdTool,
}

impl OverlaybdConverter {
    pub fn new(tool: OverlaybdTool) -> Self {
        Self { tool }
    }
}

impl IndexConverterFactory for OverlaybdConverter {
    fn index_convert_func(&self, options: ConvertOptions) -> Result<Box<dyn IndexConvertFunc>> {
        Ok(Box::new(LayerWalker::new(options, self.tool.clone())?))
    }
}
