//! Conversion driver.
//!
//! [`ImageConverter::convert`] runs one conversion through the states
//! `Start → LeaseAcquired → OptionsAssembled → ConversionInFlight → Succeeded | Failed`:
//! it validates the request, takes a uniquely named lease, builds the resolver and the
//! options bundle, and runs the pipeline with the index-conversion function produced by
//! an [`IndexConverterFactory`]. The lease is released on every exit path; the
//! destination image is only written when the whole conversion succeeded.

use anyhow::Result;
use chrono::Duration;
use oci_spec::image::{Descriptor, Digest, MediaType};
use std::fmt;
use std::sync::Arc;

use crate::error::ConvertError;
use crate::lease::{self, LeaseManager, DEFAULT_LEASE_TTL};
use crate::notifier::Notifier;
use crate::options::ConvertOptions;
use crate::pipeline::{self, IndexConvertFunc};
use crate::request::ConversionRequest;
use crate::resolver::ResolverProvider;
use crate::store::Client;

/// Produces the index-conversion function for a frozen options bundle.
pub trait IndexConverterFactory {
    fn index_convert_func(&self, options: ConvertOptions) -> Result<Box<dyn IndexConvertFunc>>;
}

impl<F> IndexConverterFactory for F
where
    F: Fn(ConvertOptions) -> Result<Box<dyn IndexConvertFunc>>,
{
    fn index_convert_func(&self, options: ConvertOptions) -> Result<Box<dyn IndexConvertFunc>> {
        self(options)
    }
}

/// Root descriptor of a converted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultDescriptor {
    digest: Digest,
    media_type: MediaType,
    size: u64,
}

impl ResultDescriptor {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl From<&Descriptor> for ResultDescriptor {
    fn from(desc: &Descriptor) -> Self {
        Self {
            digest: desc.digest().clone(),
            media_type: desc.media_type().clone(),
            size: desc.size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConversionState {
    Start,
    LeaseAcquired,
    OptionsAssembled,
    ConversionInFlight,
    Succeeded,
    Failed,
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct ImageConverter<F: IndexConverterFactory> {
    client: Arc<dyn Client>,
    leases: Arc<dyn LeaseManager>,
    factory: F,
    notifier: Notifier,
    lease_ttl: Duration,
}

impl<F: IndexConverterFactory> ImageConverter<F> {
    pub fn new<C: Client + 'static>(client: Arc<C>, factory: F, notifier: Notifier) -> Self {
        Self {
            client: client.clone(),
            leases: client,
            factory,
            notifier,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    fn enter(&self, state: ConversionState) {
        self.notifier.debug(&format!("conversion state: {}", state));
    }

    pub fn convert(
        &self,
        request: &ConversionRequest,
        resolvers: &dyn ResolverProvider,
    ) -> Result<ResultDescriptor, ConvertError> {
        self.enter(ConversionState::Start);
        request.validate()?;
        let (src, dest) = (request.source_ref(), request.dest_ref());

        let lease_name = lease::new_lease_name();
        self.notifier.info(&format!("Creating lease {}...", lease_name));
        let lease = lease::acquire(self.leases.clone(), &lease_name, self.lease_ttl)?;
        self.enter(ConversionState::LeaseAcquired);

        let resolver = resolvers
            .resolver(lease.context())
            .map_err(ConvertError::Resolver)?;

        self.notifier
            .debug(&format!("filesystem type: {}", request.fs_type()));
        if let Some(db_str) = request.db_str() {
            self.notifier
                .debug(&format!("database config string: {}", db_str));
        }
        let options = ConvertOptions::builder()
            .fs_type(request.fs_type().clone())
            .db_str(request.db_str().unwrap_or_default())
            .algorithm(request.algorithm())
            .block_size(request.block_size())
            .resolver(resolver)
            .image_ref(src)
            .client(self.client.clone())
            .build();
        self.enter(ConversionState::OptionsAssembled);

        let index_fn = self
            .factory
            .index_convert_func(options)
            .map_err(ConvertError::Conversion)?;

        self.enter(ConversionState::ConversionInFlight);
        self.notifier
            .info(&format!("Converting {} to {}...", src, dest));
        let result =
            pipeline::convert_image(self.client.as_ref(), lease.context(), dest, src, index_fn.as_ref());
        drop(index_fn);

        match result {
            Ok(image) => {
                self.enter(ConversionState::Succeeded);
                if let Err(e) = lease.release() {
                    self.notifier
                        .warn(&format!("failed to release lease {}: {:#}", lease_name, e));
                }
                self.notifier.finish(&format!(
                    "Converted {} to {} ({})",
                    src,
                    dest,
                    image.target.digest()
                ));
                Ok(ResultDescriptor::from(&image.target))
            }
            Err(e) => {
                self.enter(ConversionState::Failed);
                self.notifier.finish(&format!("Conversion of {} failed", src));
                Err(ConvertError::Conversion(e))
            }
        }
    }
}
