//! Error taxonomy of a single conversion run.
//!
//! Every failure surfaced by [`crate::converter::ImageConverter`] is a [`ConvertError`]
//! tagged with the [`Stage`] it happened in. The underlying cause (an `anyhow` chain from
//! the store, resolver or pipeline) is kept as the error source and rendered in full.

use std::fmt;
use thiserror::Error;

/// Where in the conversion a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Caller input was rejected before any resource was acquired.
    Input,
    /// The lease could not be created.
    Lease,
    /// The resolver could not be built inside the lease scope.
    Resolver,
    /// The conversion pipeline failed.
    Conversion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Lease => "lease",
            Stage::Resolver => "resolver",
            Stage::Conversion => "conversion",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0}")]
    Input(String),

    #[error("failed to create lease: {0:#}")]
    Lease(#[source] anyhow::Error),

    #[error("failed to get resolver: {0:#}")]
    Resolver(#[source] anyhow::Error),

    #[error("{0:#}")]
    Conversion(#[source] anyhow::Error),
}

impl ConvertError {
    pub fn input<S: Into<String>>(msg: S) -> Self {
        ConvertError::Input(msg.into())
    }

    pub fn stage(&self) -> Stage {
        match self {
            ConvertError::Input(_) => Stage::Input,
            ConvertError::Lease(_) => Stage::Lease,
            ConvertError::Resolver(_) => Stage::Resolver,
            ConvertError::Conversion(_) => Stage::Conversion,
        }
    }
}
