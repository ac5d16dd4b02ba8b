//! Distributed dispatch layer.
//!
//! Three roles share one wire protocol: the [`server`] is the rendezvous
//! matching requests to workers and relaying artifacts, a [`worker`] owns
//! a local executor and serves one request per registered connection, and
//! a [`client`] submits requests and receives its session's event stream.

pub mod client;
pub mod server;
pub mod wire;
pub mod worker;

pub use client::Client;
pub use server::DispatchServer;
pub use worker::WorkerOptions;
