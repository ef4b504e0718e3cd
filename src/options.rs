//! Conversion parameters.
//!
//! [`ConvertOptions`] is a frozen record of independent settings produced by
//! [`ConvertOptionsBuilder`]. Each setter writes its own field, so the order in which
//! options are supplied never changes the result.
//!
//! The typed values ([`FsType`], [`Algorithm`], [`BlockSize`]) validate on parse; the
//! builder itself never fails.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::resolver::Resolver;
use crate::store::Client;

pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Filesystem used when the converted block device is formatted and mounted.
///
/// Textual form: `<fs>[;<mount options>[;<mkfs options>]]` with mount options separated
/// by `,` and mkfs options separated by spaces, e.g. `ext4;rw,discard;-O ^has_journal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsType {
    name: String,
    mount_options: Vec<String>,
    mkfs_options: Vec<String>,
}

impl FsType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mount_options(&self) -> &[String] {
        &self.mount_options
    }

    pub fn mkfs_options(&self) -> &[String] {
        &self.mkfs_options
    }
}

impl Default for FsType {
    fn default() -> Self {
        Self {
            name: DEFAULT_FS_TYPE.to_string(),
            mount_options: Vec::new(),
            mkfs_options: Vec::new(),
        }
    }
}

impl FromStr for FsType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ';');
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            return Err(anyhow!("filesystem type must not be empty: {:?}", s));
        }
        let mount_options = parts
            .next()
            .map(|opts| {
                opts.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let mkfs_options = parts
            .next()
            .map(|opts| opts.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            mount_options,
            mkfs_options,
        })
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.mount_options.is_empty() || !self.mkfs_options.is_empty() {
            write!(f, ";{}", self.mount_options.join(","))?;
        }
        if !self.mkfs_options.is_empty() {
            write!(f, ";{}", self.mkfs_options.join(" "))?;
        }
        Ok(())
    }
}

/// Compression codec for converted block data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Lz4,
    Zstd,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Lz4 => "lz4",
            Algorithm::Zstd => "zstd",
        }
    }

    /// Parses a user value; empty means "converter default".
    pub fn parse_optional(s: &str) -> Result<Option<Self>> {
        match s.trim() {
            "" => Ok(None),
            other => other.parse().map(Some),
        }
    }
}

impl FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lz4" => Ok(Algorithm::Lz4),
            "zstd" => Ok(Algorithm::Zstd),
            _ => Err(anyhow!(
                "unsupported compression algorithm {:?}, expected lz4 or zstd",
                s
            )),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compressed block size in KB: a power of two between 4 and 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN_KB: u32 = 4;
    pub const MAX_KB: u32 = 64;

    pub fn new(kb: u32) -> Result<Self> {
        if (Self::MIN_KB..=Self::MAX_KB).contains(&kb) && kb.is_power_of_two() {
            Ok(Self(kb))
        } else {
            Err(anyhow!(
                "block size must be a power of two between {} and {} KB, got {}",
                Self::MIN_KB,
                Self::MAX_KB,
                kb
            ))
        }
    }

    /// Parses a user value; zero means "converter default".
    pub fn from_kb(kb: u32) -> Result<Option<Self>> {
        if kb == 0 {
            Ok(None)
        } else {
            Self::new(kb).map(Some)
        }
    }

    pub fn kb(self) -> u32 {
        self.0
    }
}

/// The per-layer settings the layer converter consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSettings {
    pub fs_type: FsType,
    /// Connection string of the layer deduplication database, when enabled.
    pub db_str: Option<String>,
    pub algorithm: Option<Algorithm>,
    pub block_size: Option<BlockSize>,
}

impl LayerSettings {
    pub fn dedup_enabled(&self) -> bool {
        self.db_str.is_some()
    }
}

/// Frozen bundle handed to the index-conversion function.
#[derive(Clone)]
pub struct ConvertOptions {
    settings: LayerSettings,
    image_ref: String,
    resolver: Option<Arc<dyn Resolver>>,
    client: Option<Arc<dyn Client>>,
}

impl ConvertOptions {
    pub fn builder() -> ConvertOptionsBuilder {
        ConvertOptionsBuilder::default()
    }

    pub fn settings(&self) -> &LayerSettings {
        &self.settings
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn resolver(&self) -> Option<&Arc<dyn Resolver>> {
        self.resolver.as_ref()
    }

    pub fn client(&self) -> Option<&Arc<dyn Client>> {
        self.client.as_ref()
    }
}

impl fmt::Debug for ConvertOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvertOptions")
            .field("settings", &self.settings)
            .field("image_ref", &self.image_ref)
            .field("resolver", &self.resolver.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct ConvertOptionsBuilder {
    settings: LayerSettings,
    image_ref: String,
    resolver: Option<Arc<dyn Resolver>>,
    client: Option<Arc<dyn Client>>,
}

impl ConvertOptionsBuilder {
    pub fn fs_type(mut self, fs_type: FsType) -> Self {
        self.settings.fs_type = fs_type;
        self
    }

    /// Empty strings leave deduplication disabled.
    pub fn db_str(mut self, db_str: &str) -> Self {
        self.settings.db_str = (!db_str.is_empty()).then(|| db_str.to_string());
        self
    }

    pub fn algorithm(mut self, algorithm: Option<Algorithm>) -> Self {
        self.settings.algorithm = algorithm;
        self
    }

    pub fn block_size(mut self, block_size: Option<BlockSize>) -> Self {
        self.settings.block_size = block_size;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn image_ref(mut self, image_ref: &str) -> Self {
        self.image_ref = image_ref.to_string();
        self
    }

    pub fn client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> ConvertOptions {
        ConvertOptions {
            settings: self.settings,
            image_ref: self.image_ref,
            resolver: self.resolver,
            client: self.client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_type_parsing() {
        let plain: FsType = "ext4".parse().unwrap();
        assert_eq!(plain, FsType::default());
        assert!(plain.mount_options().is_empty());

        let full: FsType = "xfs;rw,discard;-m crc=1 -f".parse().unwrap();
        assert_eq!(full.name(), "xfs");
        assert_eq!(full.mount_options(), ["rw", "discard"]);
        assert_eq!(full.mkfs_options(), ["-m", "crc=1", "-f"]);
        assert_eq!(full.to_string(), "xfs;rw,discard;-m crc=1 -f");

        let mkfs_only: FsType = "ext4;;-O ^has_journal".parse().unwrap();
        assert!(mkfs_only.mount_options().is_empty());
        assert_eq!(mkfs_only.to_string(), "ext4;;-O ^has_journal");

        assert!("".parse::<FsType>().is_err());
        assert!(";rw".parse::<FsType>().is_err());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(Algorithm::parse_optional("").unwrap(), None);
        assert_eq!(Algorithm::parse_optional("lz4").unwrap(), Some(Algorithm::Lz4));
        assert_eq!(Algorithm::parse_optional("ZSTD").unwrap(), Some(Algorithm::Zstd));
        assert!(Algorithm::parse_optional("gzip").is_err());
    }

    #[test]
    fn test_block_size_accepts_powers_of_two() {
        for kb in [4, 8, 16, 32, 64] {
            assert_eq!(BlockSize::new(kb).unwrap().kb(), kb);
        }
        assert_eq!(BlockSize::from_kb(0).unwrap(), None);
    }

    #[test]
    fn test_block_size_rejects_everything_else() {
        for kb in (1..=1024).filter(|kb| ![4, 8, 16, 32, 64].contains(kb)) {
            assert!(BlockSize::new(kb).is_err(), "{} KB should be rejected", kb);
        }
    }

    #[test]
    fn test_builder_order_independence() {
        let fs: FsType = "ext4;discard".parse().unwrap();
        let forward = ConvertOptions::builder()
            .fs_type(fs.clone())
            .db_str("user:pass@tcp(db:3306)/obd")
            .algorithm(Some(Algorithm::Zstd))
            .block_size(Some(BlockSize::new(16).unwrap()))
            .build();
        let backward = ConvertOptions::builder()
            .block_size(Some(BlockSize::new(16).unwrap()))
            .algorithm(Some(Algorithm::Zstd))
            .db_str("user:pass@tcp(db:3306)/obd")
            .fs_type(fs)
            .build();

        assert_eq!(forward.settings(), backward.settings());
        assert!(forward.settings().dedup_enabled());
    }

    #[test]
    fn test_empty_db_str_disables_dedup() {
        let opts = ConvertOptions::builder().db_str("").build();
        assert!(!opts.settings().dedup_enabled());
        assert_eq!(opts.settings().fs_type.name(), DEFAULT_FS_TYPE);
        assert!(opts.resolver().is_none());
    }
}
