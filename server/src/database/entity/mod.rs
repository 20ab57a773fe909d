//! Database entities.

pub mod file;
pub mod storage_usage;
pub mod upload;
pub mod upload_chunk;
