use std::io::Write;
use std::path::{Path, PathBuf};

use nubo::file::{FilePacketRequest, FileTransferError};
use nubo::packet::{BinaryPacket, FIRST_PACKET_PREVIOUS_HASH, Hash};

use sha2::{Digest, Sha256};

use tempfile::NamedTempFile;

use tracing::{debug, error, info, warn};

// Number of times an invalid packet is requested again before failing.
const MAX_PACKET_RETRIES: u32 = 3;

// Staging files are hidden, so they are never listed as stored files.
const STAGING_PREFIX: &str = ".nubo-";
const STAGING_SUFFIX: &str = ".part";

/// States of a [`ChunkedTransfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer started yet.
    Idle,
    /// Waiting for the packet with the given index.
    Requesting(u64),
    /// All packets received, checking the file digest.
    Verifying,
    /// The file has been stored.
    Ready,
    /// The transfer has failed.
    Failed(FileTransferError),
    /// The transfer has been aborted.
    Aborted,
}

impl TransferState {
    /// Checks whether the state is final.
    #[must_use]
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_) | Self::Aborted)
    }
}

/// Callbacks notified by a [`ChunkedTransfer`].
///
/// They run on the thread driving the transfer, so they must only do
/// minimal work and hand everything else over to other threads.
pub struct TransferCallbacks {
    on_packet_request: Box<dyn Fn(FilePacketRequest) + Send + Sync>,
    on_completed: Box<dyn Fn(PathBuf) + Send + Sync>,
    on_failed: Box<dyn Fn(FileTransferError) + Send + Sync>,
}

impl std::fmt::Debug for TransferCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCallbacks").finish_non_exhaustive()
    }
}

impl TransferCallbacks {
    /// Creates the [`TransferCallbacks`].
    ///
    /// - `on_packet_request` asks the platform for a packet
    /// - `on_completed` receives the path of the stored file
    /// - `on_failed` receives the failure reason
    #[must_use]
    pub fn new<R, C, F>(on_packet_request: R, on_completed: C, on_failed: F) -> Self
    where
        R: Fn(FilePacketRequest) + Send + Sync + 'static,
        C: Fn(PathBuf) + Send + Sync + 'static,
        F: Fn(FileTransferError) + Send + Sync + 'static,
    {
        Self {
            on_packet_request: Box::new(on_packet_request),
            on_completed: Box::new(on_completed),
            on_failed: Box::new(on_failed),
        }
    }
}

struct Job {
    name: String,
    size: u64,
    expected_hash: Hash,
    target: PathBuf,
    staging: NamedTempFile,
    hasher: Sha256,
    received: u64,
    previous_hash: Hash,
    retries: u32,
}

/// A file transfer split into sequentially requested packets.
///
/// Each packet carries the digest of the previous one, so packets are
/// accepted strictly in order. Invalid packets are requested again a few
/// times before the transfer fails.
///
/// The data is staged in a hidden file of the destination directory, which
/// is renamed to the file name only after the whole file digest has been
/// verified.
pub struct ChunkedTransfer {
    max_packet_size: u64,
    state: TransferState,
    job: Option<Job>,
    callbacks: Option<TransferCallbacks>,
}

impl std::fmt::Debug for ChunkedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTransfer")
            .field("max_packet_size", &self.max_packet_size)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ChunkedTransfer {
    /// Creates an idle [`ChunkedTransfer`] requesting packets of at most
    /// `max_packet_size` bytes.
    #[must_use]
    #[inline]
    pub const fn new(max_packet_size: u64) -> Self {
        Self {
            max_packet_size,
            state: TransferState::Idle,
            job: None,
            callbacks: None,
        }
    }

    /// Returns the current [`TransferState`].
    #[must_use]
    #[inline]
    pub const fn state(&self) -> TransferState {
        self.state
    }

    /// Starts downloading a file into a directory.
    ///
    /// The first packet is requested immediately. A transfer can only be
    /// started once, later calls are ignored.
    pub fn download(
        &mut self,
        name: &str,
        size: u64,
        hash: Hash,
        directory: &Path,
        callbacks: TransferCallbacks,
    ) {
        if self.state != TransferState::Idle {
            warn!("Transfer of `{name}` already started, ignoring the new request");
            return;
        }
        self.callbacks = Some(callbacks);

        if self.max_packet_size == 0 {
            error!("Transfer of `{name}` requested with a zero packet size");
            self.fail(FileTransferError::TransferProtocolDisabled);
            return;
        }

        let staging = match tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(directory)
        {
            Ok(staging) => staging,
            Err(e) => {
                error!("Impossible to stage `{name}` in `{}`: {e}", directory.display());
                self.fail(FileTransferError::FileSystemError);
                return;
            }
        };

        info!("Starting transfer of `{name}`, {size} bytes");
        self.job = Some(Job {
            name: name.into(),
            size,
            expected_hash: hash,
            target: directory.join(name),
            staging,
            hasher: Sha256::new(),
            received: 0,
            previous_hash: FIRST_PACKET_PREVIOUS_HASH,
            retries: 0,
        });

        if size == 0 {
            self.finish();
        } else {
            self.state = TransferState::Requesting(0);
            self.request_packet();
        }
    }

    /// Handles a binary packet received from the platform.
    ///
    /// Packets arriving when no packet is awaited are dropped.
    pub fn handle_data(&mut self, bytes: &[u8]) {
        let TransferState::Requesting(index) = self.state else {
            debug!("No packet awaited in state {:?}, dropping it", self.state);
            return;
        };
        let Some(job) = self.job.as_mut() else {
            return;
        };

        let expected_size = self.max_packet_size.min(job.size - job.received);
        let validation = match BinaryPacket::parse(bytes) {
            Err(e) => Err(e.to_string()),
            Ok(packet) if packet.previous_hash() != job.previous_hash => {
                Err("packet breaks the hash chain".into())
            }
            Ok(packet) if packet.data().len() as u64 != expected_size => Err(format!(
                "packet carries {} bytes instead of {expected_size}",
                packet.data().len()
            )),
            Ok(packet) => Ok(packet),
        };

        let packet = match validation {
            Ok(packet) => packet,
            Err(reason) => {
                job.retries += 1;
                warn!(
                    "Invalid packet {index} of `{}` ({reason}), attempt {}",
                    job.name, job.retries
                );
                if job.retries > MAX_PACKET_RETRIES {
                    error!("Packet {index} of `{}` requested too many times", job.name);
                    self.fail(FileTransferError::RetryCountExceeded);
                } else {
                    self.request_packet();
                }
                return;
            }
        };

        if let Err(e) = job.staging.write_all(packet.data()) {
            error!("Impossible to write packet {index} of `{}`: {e}", job.name);
            self.fail(FileTransferError::FileSystemError);
            return;
        }

        job.hasher.update(packet.data());
        job.received += packet.data().len() as u64;
        job.retries = 0;
        job.previous_hash.copy_from_slice(packet.hash());

        if job.received == job.size {
            self.finish();
        } else {
            self.state = TransferState::Requesting(index + 1);
            self.request_packet();
        }
    }

    /// Aborts the transfer, deleting the partially written data.
    ///
    /// Aborting a finished transfer has no effect.
    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            debug!("Transfer already finished in state {:?}", self.state);
            return;
        }

        if let Some(job) = self.job.take() {
            info!("Transfer of `{}` aborted", job.name);
        }
        self.state = TransferState::Aborted;
    }

    fn request_packet(&self) {
        let (TransferState::Requesting(index), Some(job), Some(callbacks)) =
            (self.state, &self.job, &self.callbacks)
        else {
            return;
        };

        let chunk_size = self.max_packet_size.min(job.size - job.received);
        debug!("Requesting packet {index} of `{}`, {chunk_size} bytes", job.name);
        (callbacks.on_packet_request)(FilePacketRequest::new(job.name.as_str(), index, chunk_size));
    }

    fn finish(&mut self) {
        self.state = TransferState::Verifying;
        let Some(job) = self.job.take() else {
            return;
        };

        let Job {
            name,
            expected_hash,
            target,
            mut staging,
            hasher,
            ..
        } = job;

        let digest: Hash = hasher.finalize().into();
        if digest != expected_hash {
            error!("Digest of `{name}` does not match the expected one");
            self.fail(FileTransferError::FileHashMismatch);
            return;
        }

        let stored = match staging.flush().and_then(|()| staging.as_file().sync_all()) {
            Ok(()) => staging.persist(&target).map(drop).map_err(|e| e.error),
            Err(e) => Err(e),
        };

        if let Err(e) = stored {
            error!("Impossible to store `{name}` in `{}`: {e}", target.display());
            self.fail(FileTransferError::FileSystemError);
            return;
        }

        let path = std::path::absolute(&target).unwrap_or(target);
        info!("Transfer of `{name}` completed in `{}`", path.display());
        self.state = TransferState::Ready;
        if let Some(callbacks) = &self.callbacks {
            (callbacks.on_completed)(path);
        }
    }

    fn fail(&mut self, error: FileTransferError) {
        // Dropping the job deletes the staged data.
        self.job = None;
        self.state = TransferState::Failed(error);
        if let Some(callbacks) = &self.callbacks {
            (callbacks.on_failed)(error);
        }
    }
}
