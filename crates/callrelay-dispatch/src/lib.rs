//! Live fan-out and downstream federation for the callrelay engine
//!
//! The hub streams arrival notices to connected listeners behind their
//! access grants, with a bounded drop-oldest queue per listener so one
//! stalled consumer never delays the rest. The relay manager forwards
//! complete calls to configured downstream peers, one worker per target,
//! with isolated retry and automatic disablement of persistently failing
//! targets. The controller wires both to the ingestion event stream and
//! owns startup, the maintenance loops and shutdown.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]

pub mod access;
pub mod controller;
pub mod error;
pub mod hub;
pub mod queue;
pub mod relay;

pub use controller::Controller;
pub use error::{DispatchError, Result};
pub use hub::{ClientHandle, Hub};
pub use relay::{HttpTransport, RelayManager, RelayTransport, TargetSnapshot};
