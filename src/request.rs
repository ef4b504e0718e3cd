use crate::error::ConvertError;
use crate::options::{Algorithm, BlockSize, FsType};

/// What the caller asked for. Built once from user input and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    source_ref: String,
    dest_ref: String,
    fs_type: FsType,
    db_str: Option<String>,
    algorithm: Option<Algorithm>,
    block_size: Option<BlockSize>,
}

impl ConversionRequest {
    /// Request with converter defaults for every parameter.
    pub fn new(source_ref: &str, dest_ref: &str) -> Self {
        Self {
            source_ref: source_ref.to_string(),
            dest_ref: dest_ref.to_string(),
            fs_type: FsType::default(),
            db_str: None,
            algorithm: None,
            block_size: None,
        }
    }

    /// Parses raw command line values. `algorithm` may be empty and `block_size_kb` may be
    /// zero to keep the converter defaults.
    pub fn parse(
        source_ref: &str,
        dest_ref: &str,
        fs_type: &str,
        db_str: &str,
        algorithm: &str,
        block_size_kb: u32,
    ) -> Result<Self, ConvertError> {
        let request = Self {
            source_ref: source_ref.to_string(),
            dest_ref: dest_ref.to_string(),
            fs_type: fs_type
                .parse()
                .map_err(|e| ConvertError::input(format!("invalid --fstype: {:#}", e)))?,
            db_str: (!db_str.is_empty()).then(|| db_str.to_string()),
            algorithm: Algorithm::parse_optional(algorithm)
                .map_err(|e| ConvertError::input(format!("invalid --algorithm: {:#}", e)))?,
            block_size: BlockSize::from_kb(block_size_kb)
                .map_err(|e| ConvertError::input(format!("invalid --bs: {:#}", e)))?,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_fs_type(mut self, fs_type: FsType) -> Self {
        self.fs_type = fs_type;
        self
    }

    pub fn with_db_str(mut self, db_str: &str) -> Self {
        self.db_str = (!db_str.is_empty()).then(|| db_str.to_string());
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn with_block_size(mut self, block_size: BlockSize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Both image references must be present.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.source_ref.trim().is_empty() || self.dest_ref.trim().is_empty() {
            return Err(ConvertError::input(
                "please provide src image name(must in local) and dest image name",
            ));
        }
        Ok(())
    }

    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    pub fn dest_ref(&self) -> &str {
        &self.dest_ref
    }

    pub fn fs_type(&self) -> &FsType {
        &self.fs_type
    }

    pub fn db_str(&self) -> Option<&str> {
        self.db_str.as_deref()
    }

    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    pub fn block_size(&self) -> Option<BlockSize> {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;

    #[test]
    fn test_parse_defaults() {
        let request = ConversionRequest::parse("app:v1", "app:obd", "ext4", "", "", 0).unwrap();
        assert_eq!(request, ConversionRequest::new("app:v1", "app:obd"));
        assert_eq!(request.db_str(), None);
        assert_eq!(request.block_size(), None);
    }

    #[test]
    fn test_parse_full() {
        let request =
            ConversionRequest::parse("app:v1", "app:obd", "ext4;discard", "dsn", "lz4", 8).unwrap();
        assert_eq!(request.fs_type().mount_options(), ["discard"]);
        assert_eq!(request.db_str(), Some("dsn"));
        assert_eq!(request.algorithm(), Some(Algorithm::Lz4));
        assert_eq!(request.block_size().map(BlockSize::kb), Some(8));
    }

    #[test]
    fn test_invalid_values_are_input_errors() {
        for (fs, alg, bs) in [("", "", 0), ("ext4", "gzip", 0), ("ext4", "", 12), ("ext4", "", 128)] {
            let err = ConversionRequest::parse("a", "b", fs, "", alg, bs).unwrap_err();
            assert_eq!(err.stage(), Stage::Input, "{:?}", (fs, alg, bs));
        }
    }

    #[test]
    fn test_missing_references() {
        let err = ConversionRequest::parse("", "app:obd", "ext4", "", "", 0).unwrap_err();
        assert_eq!(err.stage(), Stage::Input);
        assert!(ConversionRequest::new("app:v1", " ").validate().is_err());
    }
}
