//! Persistent SSH sessions for a lab target, exposed as MCP tools.
//!
//! This module is organized into the following submodules:
//!
//! - `transport`: Connection and channel traits the session layer is written against
//! - `client`: russh implementation of the transport traits
//! - `pool`: One shared connection per (user, host, port)
//! - `framer`: Sentinel framing of commands written to a shell
//! - `output`: Bounded line buffer of session output
//! - `session`: Persistent shell session driven by a worker task
//! - `registry`: Directory of live sessions with automatic reaping
//! - `exec`: One-shot commands over exec channels
//! - `lab`: Lab description and target credentials
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error type shared by every layer
//! - `types`: Serializable response types for MCP tools
//! - `tools`: MCP tool implementations

pub mod client;
pub(crate) mod config;
pub mod error;
pub(crate) mod exec;
pub(crate) mod framer;
pub mod lab;
pub(crate) mod output;
pub mod pool;
pub mod registry;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod tools;
pub mod transport;
pub mod types;

pub use tools::LabTools;
