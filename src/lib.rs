//! A content-addressed, streaming model-delivery engine: decode GGUF- and
//! safetensors-style container headers, re-shard them into a uniform
//! content-addressed registry format, and fetch/verify/resume that
//! registry across a network.

pub mod config;
pub mod dtype;
pub mod download;
pub mod error;
pub mod format;
pub mod import;
pub mod manifest;
pub mod preflight;
pub mod serve;
pub mod store;
