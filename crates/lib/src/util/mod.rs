//! Shared utilities.
//!
//! Content hashing used by fingerprints and cache entry verification.

pub mod hash;
