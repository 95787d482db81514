use std::sync::Once;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::CacheConfig;
use crate::decode::ImageDecoder;
use crate::engine::cache::ResourceCache;

/// The image cache most hosts want.
pub type ImageCache = ResourceCache<ImageDecoder>;

static INIT_TRACING: Once = Once::new();

/// Install the fmt subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("image cache tracing initialized");
    });
}

/// Open an image cache over HTTP with a dedicated callback task.
pub fn open_image_cache(config: &CacheConfig) -> Result<ImageCache> {
    init_tracing();
    ResourceCache::open(config, ImageDecoder)
}
