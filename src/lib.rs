//! Gavel: a deterministic grading engine for competitive-programming tasks.
//!
//! The crate is organised around an execution pipeline:
//! - [`store`] is the content-addressed artifact store every byte flows
//!   through,
//! - [`sandbox`] runs one untrusted command under resource limits,
//! - [`executor`] ties the two together into the service the dispatch layer
//!   calls, with admission control and a response cache,
//! - [`remote`] is the server/worker/client dispatch layer with streaming
//!   file transfer,
//! - [`events`] carries per-artifact progress to observers,
//! - [`ipc`] is a cross-process bounded queue for POD records.

pub mod config;
pub mod events;
pub mod executor;
pub mod ipc;
pub mod proto;
pub mod remote;
pub mod sandbox;
pub mod store;
