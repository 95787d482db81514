// Payload format detection from leading magic bytes.

pub mod image;
