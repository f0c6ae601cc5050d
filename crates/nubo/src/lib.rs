//! The communication interface between a `nubo` device and its cloud
//! platform.
//!
//! This crate provides APIs to:
//!
//! - Build the channels a device subscribes to and publishes on. Every
//!   channel is scoped by the device key, and inbound channels may contain
//!   `MQTT` wildcards.
//! - Decode raw inbound messages into typed commands. Decoders are tried in a
//!   fixed order and the first one that recognizes a message wins.
//! - Encode and decode the file management messages: upload and `URL`
//!   download commands, transfer statuses, packet requests and file lists.
//! - Validate the binary packets that carry file content, each one chained to
//!   the previous packet through a `SHA-256` digest.
//!
//! This crate can be compiled for both `std` and `no_std` environments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Actuation commands and actuator statuses.
pub mod actuator;
/// Device channels and wildcard matching.
pub mod channel;
/// File management commands, statuses and lists.
pub mod file;
/// Inbound messages and their decoders.
pub mod message;
/// Binary packets and content hashes.
pub mod packet;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
