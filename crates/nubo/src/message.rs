use alloc::string::String;
use alloc::vec::Vec;

use serde::de::DeserializeOwned;

use crate::actuator::{ActuationRequest, ActuatorCommand};
use crate::channel::{Channels, SEPARATOR};
use crate::file::{FileCommand, UrlCommand};

/// A raw message exchanged with the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The channel the message is published on.
    pub channel: String,
    /// The message payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a [`Message`].
    #[must_use]
    #[inline]
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Creates a [`Message`] with a `JSON` payload.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be serialized.
    pub fn json<T: serde::Serialize>(
        channel: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(channel, serde_json::to_vec(value)?))
    }
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A binary packet of a chunked transfer.
    Binary(Vec<u8>),
    /// A file management command.
    File(FileCommand),
    /// A `URL` download command.
    Url(UrlCommand),
    /// An actuation command.
    Actuation(ActuatorCommand),
}

/// Device capabilities a command may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Chunked file transfer and file management.
    FileManagement,
    /// File download from a `URL`.
    UrlDownload,
    /// Actuator control.
    Actuation,
}

/// A decode function tagged with the capability it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    /// The capability of the decoded commands.
    pub capability: Capability,
    /// Decodes a message, returning [`None`] when the message is not
    /// recognized.
    pub decode: fn(&Channels, &Message) -> Option<Command>,
}

/// All decoders, in the order they are tried.
pub const DECODERS: &[Decoder] = &[
    Decoder {
        capability: Capability::FileManagement,
        decode: decode_binary,
    },
    Decoder {
        capability: Capability::FileManagement,
        decode: decode_file_command,
    },
    Decoder {
        capability: Capability::UrlDownload,
        decode: decode_url_command,
    },
    Decoder {
        capability: Capability::Actuation,
        decode: decode_actuation,
    },
];

/// Decodes a message with the first decoder recognizing it.
#[must_use]
pub fn decode(channels: &Channels, message: &Message) -> Option<Command> {
    DECODERS
        .iter()
        .find_map(|decoder| (decoder.decode)(channels, message))
}

/// Decodes a message considering only the decoders of a capability.
#[must_use]
pub fn decode_for(
    capability: Capability,
    channels: &Channels,
    message: &Message,
) -> Option<Command> {
    DECODERS
        .iter()
        .filter(|decoder| decoder.capability == capability)
        .find_map(|decoder| (decoder.decode)(channels, message))
}

fn decode_json<T: DeserializeOwned>(message: &Message) -> Option<T> {
    match serde_json::from_slice(&message.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Unable to decode message on `{}`: {e}", message.channel);
            None
        }
    }
}

fn decode_binary(channels: &Channels, message: &Message) -> Option<Command> {
    (message.channel == channels.binary()).then(|| Command::Binary(message.payload.clone()))
}

fn decode_file_command(channels: &Channels, message: &Message) -> Option<Command> {
    if message.channel != channels.file_commands() {
        return None;
    }
    decode_json(message).map(Command::File)
}

fn decode_url_command(channels: &Channels, message: &Message) -> Option<Command> {
    if message.channel != channels.url_commands() {
        return None;
    }
    decode_json(message).map(Command::Url)
}

fn decode_actuation(channels: &Channels, message: &Message) -> Option<Command> {
    let reference = message
        .channel
        .strip_prefix(channels.actuation_prefix().as_str())?;

    if reference.is_empty() || reference.contains(SEPARATOR) {
        return None;
    }

    decode_json::<ActuationRequest>(message)
        .map(|request| Command::Actuation(ActuatorCommand::new(reference, request)))
}
