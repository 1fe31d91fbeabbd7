pub mod client_ip;
pub mod error;
pub mod form;
pub mod pipeline;
pub mod rate_limit;
pub mod reputation;
pub mod resource_cache;
pub mod server;
pub mod settings;
pub mod smtp;
pub mod templates;
pub mod tenant_config;
pub mod watcher;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the async trait seams (providers, probes, sinks).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use error::ContactError;
pub use pipeline::AdmissionPipeline;
pub use settings::Settings;
pub use tenant_config::{ConfigCache, TenantConfig};
pub use templates::TemplateCache;
