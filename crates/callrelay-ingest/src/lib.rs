//! Ingestion gateway for the callrelay engine
//!
//! Accepts call submissions from direct uploads, trunk-recorder style
//! uploads and watched directories, normalizes them into the canonical
//! call shape, authenticates the writer and hands the result to the
//! archive. Every accepted (non-duplicate) call is announced on the
//! gateway's event channel for live fan-out and downstream relay.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]

pub mod dirwatch;
pub mod gateway;
pub mod sources;

pub use gateway::{CallArrived, Gateway};
pub use sources::{SourcePayload, TrunkRecorderMeta, TrunkRecorderUpload};
