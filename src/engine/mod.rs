// Engine — task scheduling, durable storage and the resource cache built on them.

pub mod cache;
pub mod dispatch;
pub mod key;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod task;
