//! The `nubo-device` library crate connects a device to its cloud platform
//! through an `MQTT` broker.
//!
//! Core functionalities of this crate include:
//!
//! - Routing every inbound message to the service listening on its channel,
//!   with `MQTT` wildcards allowed in the channel patterns
//! - Running all commands on a single background executor, one at a time and
//!   in arrival order
//! - Receiving files as a chain of binary packets, each one verified against
//!   the digest of the previous one
//! - Downloading files from `URL`s
//! - Keeping the list of stored files consistent with the file directory and
//!   publishing it to the platform
//! - Applying actuation requests and publishing actuator statuses
//!
//! The broker connection runs as a `tokio` task. Commands run on a
//! dedicated executor thread and every `URL` download on its own thread, so
//! that slow work never blocks the network.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Actuation requests and actuator statuses.
pub mod actuation;
/// The device connection and its builder.
pub mod connector;
/// Error management.
pub mod error;
/// A single-threaded executor of commands.
pub mod executor;
/// The file management service.
pub mod files;
/// Records of the stored files.
pub mod repository;
/// A router of inbound messages.
pub mod router;
/// Chunked file transfers.
pub mod transfer;
/// The transport of outbound messages.
pub mod transport;
/// Downloads of files identified by a `URL`.
pub mod url;

mod sweeper;
