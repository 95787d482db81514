// Network transports used on cache misses.

pub mod http_source;
pub mod traits;
