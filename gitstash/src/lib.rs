//! Shared types for the GitStash upload protocol.
//!
//! This crate contains everything the server and clients must agree on:
//! the request/response shapes of the versioned HTTP API, the custom
//! header names, and the digest helpers used to verify chunk integrity
//! on both ends of the wire.

pub mod api;
pub mod hash;
pub mod util;
