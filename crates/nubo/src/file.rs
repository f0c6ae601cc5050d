use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

/// Statuses of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileTransferStatus {
    /// The transfer is in progress.
    FileTransfer,
    /// The file is stored on the device and available.
    FileReady,
    /// The transfer has been aborted.
    Aborted,
    /// The transfer has failed. The failure reason is described by a
    /// [`FileTransferError`].
    Error,
}

impl core::fmt::Display for FileTransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::FileTransfer => "FILE_TRANSFER",
            Self::FileReady => "FILE_READY",
            Self::Aborted => "ABORTED",
            Self::Error => "ERROR",
        })
    }
}

/// All reasons that may cause a file transfer to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileTransferError {
    /// A generic error, usually caused by an invalid or incomplete request.
    UnspecifiedError,
    /// The requested transfer kind is disabled on the device.
    TransferProtocolDisabled,
    /// The content hash differs from the expected one.
    FileHashMismatch,
    /// The device filesystem failed to read, write or delete a file.
    FileSystemError,
    /// A packet has been requested too many times without receiving a
    /// valid one.
    RetryCountExceeded,
    /// The `URL` does not identify a downloadable file.
    MalformedUrl,
}

impl core::fmt::Display for FileTransferError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::UnspecifiedError => "UNSPECIFIED_ERROR",
            Self::TransferProtocolDisabled => "TRANSFER_PROTOCOL_DISABLED",
            Self::FileHashMismatch => "FILE_HASH_MISMATCH",
            Self::FileSystemError => "FILE_SYSTEM_ERROR",
            Self::RetryCountExceeded => "RETRY_COUNT_EXCEEDED",
            Self::MalformedUrl => "MALFORMED_URL",
        })
    }
}

/// A request to start a chunked file upload towards the device.
///
/// Missing fields are decoded as empty values, so that the device can answer
/// with an error status instead of discarding the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileUploadInitiate {
    /// File name.
    pub file_name: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Base64 encoding of the file `SHA-256` digest.
    pub file_hash: String,
}

impl FileUploadInitiate {
    /// Creates a [`FileUploadInitiate`].
    #[must_use]
    #[inline]
    pub fn new(file_name: impl Into<String>, file_size: u64, file_hash: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            file_hash: file_hash.into(),
        }
    }
}

/// A file name carried by abort and delete commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileName {
    /// File name.
    pub file_name: String,
}

impl FileName {
    /// Creates a [`FileName`].
    #[must_use]
    #[inline]
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

/// A file `URL` carried by the `URL` download commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileUrl {
    /// File `URL`.
    pub file_url: String,
}

impl FileUrl {
    /// Creates a [`FileUrl`].
    #[must_use]
    #[inline]
    pub fn new(file_url: impl Into<String>) -> Self {
        Self {
            file_url: file_url.into(),
        }
    }
}

/// File management commands sent by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileCommand {
    /// Starts a chunked upload.
    UploadInitiate(FileUploadInitiate),
    /// Aborts a chunked upload.
    UploadAbort(FileName),
    /// Deletes a stored file. An empty name only republishes the file list.
    FileDelete(FileName),
    /// Deletes all stored files.
    FilePurge,
    /// Confirms the reception of a file list.
    FileListConfirm,
}

/// `URL` download commands sent by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlCommand {
    /// Starts downloading a file from a `URL`.
    UrlDownload(FileUrl),
    /// Aborts the download of a file from a `URL`.
    UrlAbort(FileUrl),
}

/// The status of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadStatus {
    /// File name.
    pub file_name: String,
    /// Transfer status.
    pub status: FileTransferStatus,
    /// Failure reason, present only for the [`FileTransferStatus::Error`]
    /// status.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<FileTransferError>,
}

impl FileUploadStatus {
    /// Creates a [`FileUploadStatus`] for a non-failing status.
    #[must_use]
    #[inline]
    pub fn new(file_name: impl Into<String>, status: FileTransferStatus) -> Self {
        Self {
            file_name: file_name.into(),
            status,
            error: None,
        }
    }

    /// Creates a [`FileUploadStatus`] describing a failure.
    #[must_use]
    #[inline]
    pub fn error(file_name: impl Into<String>, error: FileTransferError) -> Self {
        Self {
            file_name: file_name.into(),
            status: FileTransferStatus::Error,
            error: Some(error),
        }
    }
}

/// The status of a `URL` download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUrlDownloadStatus {
    /// File `URL`.
    pub file_url: String,
    /// Transfer status.
    pub status: FileTransferStatus,
    /// Name of the stored file, present once the file is ready.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_name: Option<String>,
    /// Failure reason, present only for the [`FileTransferStatus::Error`]
    /// status.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<FileTransferError>,
}

impl FileUrlDownloadStatus {
    /// Creates a [`FileUrlDownloadStatus`] for a non-failing status.
    #[must_use]
    #[inline]
    pub fn new(file_url: impl Into<String>, status: FileTransferStatus) -> Self {
        Self {
            file_url: file_url.into(),
            status,
            file_name: None,
            error: None,
        }
    }

    /// Creates a [`FileUrlDownloadStatus`] for a file ready on the device.
    #[must_use]
    #[inline]
    pub fn ready(file_url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_url: file_url.into(),
            status: FileTransferStatus::FileReady,
            file_name: Some(file_name.into()),
            error: None,
        }
    }

    /// Creates a [`FileUrlDownloadStatus`] describing a failure.
    #[must_use]
    #[inline]
    pub fn error(file_url: impl Into<String>, error: FileTransferError) -> Self {
        Self {
            file_url: file_url.into(),
            status: FileTransferStatus::Error,
            file_name: None,
            error: Some(error),
        }
    }
}

/// A request for a single packet of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePacketRequest {
    /// File name.
    pub file_name: String,
    /// Zero-based index of the requested packet.
    pub chunk_index: u64,
    /// Number of file bytes the packet must carry.
    pub chunk_size: u64,
}

impl FilePacketRequest {
    /// Creates a [`FilePacketRequest`].
    #[must_use]
    #[inline]
    pub fn new(file_name: impl Into<String>, chunk_index: u64, chunk_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            chunk_index,
            chunk_size,
        }
    }
}

/// The list of files stored on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList(Vec<FileName>);

impl FileList {
    /// Creates a [`FileList`] from a sequence of file names.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(FileName::new).collect())
    }

    /// Returns an iterator over the file names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|name| name.file_name.as_str())
    }

    /// Returns the number of files.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the list is empty.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
