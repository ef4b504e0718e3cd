use anyhow::{anyhow, Result};
use oci_spec::image::Descriptor;
use std::sync::Arc;

use crate::lease::LeaseContext;
use crate::store::Client;

/// Resolves image references and fetches their content.
pub trait Resolver: Send + Sync {
    /// Returns the root descriptor (manifest or index) a reference points at.
    fn resolve(&self, reference: &str) -> Result<Descriptor>;

    fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>>;
}

/// Builds the resolver for a conversion. Called inside the lease scope, may fail.
pub trait ResolverProvider {
    fn resolver(&self, ctx: &LeaseContext) -> Result<Arc<dyn Resolver>>;
}

impl<F> ResolverProvider for F
where
    F: Fn(&LeaseContext) -> Result<Arc<dyn Resolver>>,
{
    fn resolver(&self, ctx: &LeaseContext) -> Result<Arc<dyn Resolver>> {
        self(ctx)
    }
}

/// Resolver backed by the local store: names come from the image store, content from
/// the content store.
pub struct LocalResolver {
    client: Arc<dyn Client>,
}

impl LocalResolver {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }
}

impl Resolver for LocalResolver {
    fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.client
            .get_image(reference)?
            .map(|image| image.target)
            .ok_or_else(|| anyhow!("{}: not found", reference))
    }

    fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.client.read_blob(desc.digest())
    }
}

/// Provider handing out a [`LocalResolver`] over the given client.
pub struct LocalResolverProvider {
    client: Arc<dyn Client>,
}

impl LocalResolverProvider {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }
}

impl ResolverProvider for LocalResolverProvider {
    fn resolver(&self, _ctx: &LeaseContext) -> Result<Arc<dyn Resolver>> {
        Ok(Arc::new(LocalResolver::new(self.client.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContentStore, Image, ImageStore, LocalStore};
    use oci_spec::image::MediaType;
    use tempfile::tempdir;

    #[test]
    fn test_local_resolver() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let desc = store
            .write_blob(&LeaseContext::unleased(), MediaType::ImageManifest, b"{}")
            .unwrap();
        store.put_image(Image::new("busybox:latest", desc.clone())).unwrap();

        let resolver = LocalResolverProvider::new(store)
            .resolver(&LeaseContext::unleased())
            .unwrap();
        assert_eq!(resolver.resolve("busybox:latest").unwrap(), desc);
        assert_eq!(resolver.fetch(&desc).unwrap(), b"{}");

        let err = resolver.resolve("alpine:latest").unwrap_err();
        assert_eq!(err.to_string(), "alpine:latest: not found");
    }
}
