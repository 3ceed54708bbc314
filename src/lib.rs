//! upstamp - resumable file uploads with content fingerprints and timestamp proofs
//!
//! Each selected file is fingerprinted, its fingerprint is submitted to
//! OpenTimestamps calendars, and the bytes are sent to a file server with a
//! resumable `PUT`/`PATCH` protocol under a bounded-concurrency FIFO scheduler.
//! Once a transfer completes the proof is attached next to the file.

pub mod cli;
pub mod config;
pub mod error;
pub mod format;
pub mod hasher;
pub mod progress;
pub mod proof;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod transfer;
pub mod transport;
pub mod types;
pub mod upload;
pub mod uploader;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
pub use uploader::Uploader;
