pub mod converter;
pub mod error;
pub mod layout;
pub mod lease;
pub mod notifier;
pub mod options;
pub mod overlaybd;
pub mod pipeline;
pub mod request;
pub mod resolver;
pub mod store;
pub mod unique;

// Re-exports for easy access
pub use converter::{ImageConverter, IndexConverterFactory, ResultDescriptor};
pub use error::{ConvertError, Stage};
pub use layout::import_layout;
pub use lease::{LeaseContext, LeaseGuard, LeaseManager};
pub use notifier::Notifier;
pub use options::{Algorithm, BlockSize, ConvertOptions, FsType};
pub use overlaybd::{LayerConverter, OverlaybdConverter, OverlaybdTool};
pub use request::ConversionRequest;
pub use resolver::{LocalResolverProvider, Resolver, ResolverProvider};
pub use store::{Client, LocalStore};
