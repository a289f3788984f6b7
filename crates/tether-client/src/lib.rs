//! Client runtime for tether.
//!
//! [`client::Client`] ties the instance arbiter to one backend port: outgoing
//! calls are classified and correlated, file reads are served by the
//! [`file_cache::FileCache`], and untagged backend envelopes are republished
//! as [`client::ClientUpdate`]s.

pub mod backend;
pub mod blob_store;
pub mod client;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod file_cache;

pub use backend::{BackendPort, MemoryBackend};
pub use blob_store::{BlobStore, ReadBatcher, SqliteBlobStore};
pub use client::{Client, ClientOptions, ClientUpdate};
pub use crate::config::ClientConfig;
pub use correlator::QueryCorrelator;
pub use envelope::{Envelope, ReadFileRequest, Request, UnsupportedMethod};
pub use error::ClientError;
pub use file_cache::{FileCache, FileCacheOptions, FileCacheStats, FileMetadata, FilePart, LiveProbe, LocalFile, ReadOrigin};
