//! Version 1 of the upload API.

pub mod upload;
