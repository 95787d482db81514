// Remote resource cache on top of a bounded-concurrency task scheduler.

pub mod api;
pub mod config;
pub mod decode;
pub mod detect;
pub mod engine;
pub mod error;
pub mod source;

pub use config::CacheConfig;
pub use engine::cache::{CancelHandle, ResourceCache};
pub use engine::scheduler::Scheduler;
pub use error::CacheError;
