use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::HashMap;

use nubo::channel::Channels;
use nubo::file::{
    FileCommand, FileList, FilePacketRequest, FileTransferError, FileTransferStatus,
    FileUploadInitiate, FileUploadStatus, FileUrlDownloadStatus, UrlCommand,
};
use nubo::message::{Capability, Command, Message, decode_for};
use nubo::packet::{Hash, decode_hash, encode_hash};

use sha2::{Digest, Sha256};

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::repository::{FileInfo, FileRepository};
use crate::router::MessageListener;
use crate::sweeper::Sweeper;
use crate::transfer::{ChunkedTransfer, TransferCallbacks};
use crate::transport::Transport;
use crate::url::UrlFileDownloader;

/// Default maximum number of file bytes carried by a single packet.
pub const DEFAULT_MAX_PACKET_SIZE: u64 = 256 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Lock poisoned, recovering it");
            poisoned.into_inner()
        }
    }
}

// Checks whether a name denotes a plain, visible file of the file directory.
fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|file| file == name)
}

/// File management settings.
///
/// Chunked transfers are enabled with a [`DEFAULT_MAX_PACKET_SIZE`] packet
/// size, while `URL` downloads are disabled until a [`UrlFileDownloader`] is
/// provided.
#[derive(Clone)]
pub struct FileManagement {
    directory: PathBuf,
    max_packet_size: u64,
    downloader: Option<Arc<dyn UrlFileDownloader>>,
}

impl std::fmt::Debug for FileManagement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManagement")
            .field("directory", &self.directory)
            .field("max_packet_size", &self.max_packet_size)
            .field("url_download", &self.downloader.is_some())
            .finish()
    }
}

impl FileManagement {
    /// Creates the [`FileManagement`] settings for files stored in the
    /// given directory.
    #[must_use]
    #[inline]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            downloader: None,
        }
    }

    /// Sets the maximum number of file bytes carried by a single packet.
    ///
    /// A zero size disables chunked transfers.
    #[must_use]
    #[inline]
    pub fn max_packet_size(mut self, max_packet_size: u64) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Enables `URL` downloads through the given [`UrlFileDownloader`].
    #[must_use]
    #[inline]
    pub fn url_downloader(mut self, downloader: Arc<dyn UrlFileDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Returns the directory containing the stored files.
    #[must_use]
    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

struct TransferRecord {
    hash: String,
    engine: Arc<Mutex<ChunkedTransfer>>,
    completed: Arc<AtomicBool>,
}

impl TransferRecord {
    fn is_live(&self) -> bool {
        !self.completed.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Transfers {
    records: HashMap<String, TransferRecord>,
    current: Option<String>,
}

impl Transfers {
    // Records flagged as completed are treated as absent.
    fn live(&self, name: &str) -> Option<&TransferRecord> {
        self.records.get(name).filter(|record| record.is_live())
    }

    fn sweep(&mut self) {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live());
        if before != self.records.len() {
            debug!("Swept {} finished transfers", before - self.records.len());
        }

        if self
            .current
            .as_ref()
            .is_some_and(|name| !self.records.contains_key(name))
        {
            self.current = None;
        }
    }
}

// Outcome of registering a new transfer.
enum Registration {
    Started(Arc<Mutex<ChunkedTransfer>>, Arc<AtomicBool>),
    InProgress,
    Conflict,
}

/// The file management service of a device.
///
/// It handles chunked uploads, `URL` downloads and the deletion of the
/// stored files, keeping the file repository consistent with the file
/// directory. Every handler runs on the [`CommandExecutor`] worker.
///
/// Several transfers may be in progress at the same time, but binary
/// packets are always routed to the most recently started one.
pub struct FileManager {
    channels: Channels,
    directory: PathBuf,
    max_packet_size: u64,
    downloader: Option<Arc<dyn UrlFileDownloader>>,
    executor: CommandExecutor,
    transport: Arc<dyn Transport>,
    repository: Arc<dyn FileRepository>,
    transfers: Arc<Mutex<Transfers>>,
    sweeper: Sweeper,
    this: Weak<Self>,
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("device_key", &self.channels.device_key())
            .field("directory", &self.directory)
            .field("max_packet_size", &self.max_packet_size)
            .finish_non_exhaustive()
    }
}

impl MessageListener for FileManager {
    fn message_received(&self, message: Message) {
        let command = decode_for(Capability::FileManagement, &self.channels, &message)
            .or_else(|| decode_for(Capability::UrlDownload, &self.channels, &message));

        match command {
            Some(Command::Binary(data)) => self.handle_binary_chunk(&data),
            Some(Command::File(command)) => match command {
                FileCommand::UploadInitiate(initiate) => self.handle_upload_initiate(&initiate),
                FileCommand::UploadAbort(name) => self.handle_upload_abort(&name.file_name),
                FileCommand::FileDelete(name) => self.handle_file_delete(&name.file_name),
                FileCommand::FilePurge => self.handle_purge(),
                FileCommand::FileListConfirm => self.handle_file_list_confirm(),
            },
            Some(Command::Url(command)) => match command {
                UrlCommand::UrlDownload(url) => self.handle_url_download(&url.file_url),
                UrlCommand::UrlAbort(url) => self.handle_url_abort(&url.file_url),
            },
            Some(Command::Actuation(_)) | None => {
                warn!("Unable to handle the message on `{}`", message.channel);
            }
        }
    }
}

impl FileManager {
    /// Creates a [`FileManager`] and starts its sweeper.
    ///
    /// The file directory is created when missing.
    ///
    /// # Errors
    ///
    /// Fails when the file directory cannot be created or the sweeper
    /// thread cannot be spawned.
    pub fn new(
        channels: Channels,
        settings: FileManagement,
        executor: CommandExecutor,
        transport: Arc<dyn Transport>,
        repository: Arc<dyn FileRepository>,
    ) -> Result<Arc<Self>> {
        let FileManagement {
            directory,
            max_packet_size,
            downloader,
        } = settings;

        std::fs::create_dir_all(&directory)?;
        let directory = std::path::absolute(&directory)?;

        let transfers = Arc::new(Mutex::new(Transfers::default()));
        let sweeper = Sweeper::spawn(Arc::clone(&transfers), Transfers::sweep)?;

        Ok(Arc::new_cyclic(|this| Self {
            channels,
            directory,
            max_packet_size,
            downloader,
            executor,
            transport,
            repository,
            transfers,
            sweeper,
            this: Weak::clone(this),
        }))
    }

    /// Returns the channel patterns the service listens to.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.file_management_inbound()
    }

    /// Returns the directory containing the stored files.
    #[must_use]
    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Handles an upload initiate request.
    ///
    /// Already stored files are reported as ready when their digest matches,
    /// otherwise a new chunked transfer is started.
    pub fn handle_upload_initiate(&self, initiate: &FileUploadInitiate) {
        let FileUploadInitiate {
            file_name: name,
            file_size: size,
            file_hash: hash,
        } = initiate;

        if self.max_packet_size == 0 {
            warn!("Chunked transfers are disabled, `{name}` refused");
            self.publish_status(FileUploadStatus::error(
                name.as_str(),
                FileTransferError::TransferProtocolDisabled,
            ));
            return;
        }

        if !is_valid_file_name(name) || *size == 0 || hash.is_empty() {
            warn!("Invalid upload initiate for `{name}`, size {size}, hash `{hash}`");
            self.publish_status(FileUploadStatus::error(
                name.as_str(),
                FileTransferError::UnspecifiedError,
            ));
            return;
        }

        let Some(raw_hash) = decode_hash(hash) else {
            warn!("Upload initiate for `{name}` carries an invalid hash `{hash}`");
            self.publish_status(FileUploadStatus::error(
                name.as_str(),
                FileTransferError::UnspecifiedError,
            ));
            return;
        };

        match self.repository.file_info(name) {
            Ok(None) => self.start_transfer(name, *size, hash, raw_hash),
            Ok(Some(info)) if info.hash == *hash => {
                info!("File `{name}` already stored");
                self.publish_status(FileUploadStatus::new(
                    name.as_str(),
                    FileTransferStatus::FileReady,
                ));
            }
            Ok(Some(_)) => {
                warn!("File `{name}` already stored with another hash");
                self.publish_status(FileUploadStatus::error(
                    name.as_str(),
                    FileTransferError::FileHashMismatch,
                ));
            }
            Err(e) => {
                error!("Impossible to look `{name}` up: {e}");
                self.publish_status(FileUploadStatus::error(
                    name.as_str(),
                    FileTransferError::UnspecifiedError,
                ));
            }
        }
    }

    fn start_transfer(&self, name: &str, size: u64, hash: &str, raw_hash: Hash) {
        let registration = {
            let mut transfers = lock(&self.transfers);
            match transfers.live(name) {
                Some(record) if record.hash == hash => Registration::InProgress,
                Some(_) => Registration::Conflict,
                None => {
                    let record = TransferRecord {
                        hash: hash.into(),
                        engine: Arc::new(Mutex::new(ChunkedTransfer::new(self.max_packet_size))),
                        completed: Arc::new(AtomicBool::new(false)),
                    };
                    let engine = Arc::clone(&record.engine);
                    let completed = Arc::clone(&record.completed);

                    let _ = transfers.records.insert(name.into(), record);
                    transfers.current = Some(name.into());
                    Registration::Started(engine, completed)
                }
            }
        };

        let (engine, completed) = match registration {
            Registration::Started(engine, completed) => (engine, completed),
            Registration::InProgress => {
                info!("Transfer of `{name}` already in progress");
                self.publish_status(FileUploadStatus::new(name, FileTransferStatus::FileTransfer));
                return;
            }
            Registration::Conflict => {
                warn!("Transfer of `{name}` already in progress with another hash");
                self.publish_status(FileUploadStatus::error(
                    name,
                    FileTransferError::UnspecifiedError,
                ));
                return;
            }
        };

        info!("Starting transfer of `{name}`");
        self.publish_status(FileUploadStatus::new(name, FileTransferStatus::FileTransfer));

        let callbacks = self.transfer_callbacks(name, raw_hash, &completed);
        lock(&engine).download(name, size, raw_hash, &self.directory, callbacks);
    }

    fn transfer_callbacks(
        &self,
        name: &str,
        raw_hash: Hash,
        completed: &Arc<AtomicBool>,
    ) -> TransferCallbacks {
        let on_packet_request = {
            let this = Weak::clone(&self.this);
            move |request: FilePacketRequest| {
                if let Some(manager) = this.upgrade() {
                    let _ = manager.submit(move |manager| manager.publish_packet_request(&request));
                }
            }
        };

        let on_completed = {
            let this = Weak::clone(&self.this);
            let completed = Arc::clone(completed);
            let name = name.to_string();
            move |path: PathBuf| {
                let Some(manager) = this.upgrade() else {
                    return;
                };
                if !manager.claim_completion(&name, &completed) {
                    return;
                }
                let name = name.clone();
                let _ =
                    manager.submit(move |manager| manager.transfer_completed(&name, &raw_hash, path));
            }
        };

        let on_failed = {
            let this = Weak::clone(&self.this);
            let completed = Arc::clone(completed);
            let name = name.to_string();
            move |error: FileTransferError| {
                let Some(manager) = this.upgrade() else {
                    return;
                };
                if !manager.claim_completion(&name, &completed) {
                    return;
                }
                let name = name.clone();
                let _ = manager.submit(move |manager| manager.transfer_failed(&name, error));
            }
        };

        TransferCallbacks::new(on_packet_request, on_completed, on_failed)
    }

    // Flags a transfer as finished, returning `false` when another outcome
    // has already been claimed.
    fn claim_completion(&self, name: &str, completed: &AtomicBool) -> bool {
        if completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Transfer of `{name}` already finished, outcome ignored");
            return false;
        }
        self.sweeper.wake();
        true
    }

    fn transfer_completed(&self, name: &str, raw_hash: &Hash, path: PathBuf) {
        let info = FileInfo::new(name, encode_hash(raw_hash), path);

        match self.repository.store(info) {
            Ok(()) => {
                self.publish_status(FileUploadStatus::new(name, FileTransferStatus::FileReady));
            }
            Err(e) => {
                error!("Impossible to store the record of `{name}`: {e}");
                self.publish_status(FileUploadStatus::error(
                    name,
                    FileTransferError::FileSystemError,
                ));
            }
        }

        self.send_file_list();
    }

    fn transfer_failed(&self, name: &str, error: FileTransferError) {
        warn!("Transfer of `{name}` failed: {error}");
        self.publish_status(FileUploadStatus::error(name, error));
        self.send_file_list();
    }

    /// Routes a binary packet to the current transfer.
    ///
    /// Packets arriving without a transfer in progress are dropped.
    pub fn handle_binary_chunk(&self, data: &[u8]) {
        let engine = {
            let transfers = lock(&self.transfers);
            transfers
                .current
                .as_deref()
                .and_then(|name| transfers.live(name))
                .map(|record| Arc::clone(&record.engine))
        };

        match engine {
            Some(engine) => lock(&engine).handle_data(data),
            None => warn!("No transfer in progress, binary packet dropped"),
        }
    }

    /// Aborts the chunked transfer of a file.
    ///
    /// Aborting a file without a transfer in progress has no effect.
    pub fn handle_upload_abort(&self, name: &str) {
        if name.is_empty() {
            warn!("Upload abort without a file name");
            self.publish_status(FileUploadStatus::error(
                name,
                FileTransferError::UnspecifiedError,
            ));
            return;
        }

        let record = {
            let mut transfers = lock(&self.transfers);
            let record = transfers
                .live(name)
                .map(|record| (Arc::clone(&record.engine), Arc::clone(&record.completed)));
            if record.is_some() && transfers.current.as_deref() == Some(name) {
                transfers.current = None;
            }
            record
        };

        let Some((engine, completed)) = record else {
            debug!("No transfer of `{name}` to abort");
            return;
        };

        if !self.claim_completion(name, &completed) {
            return;
        }

        lock(&engine).abort();
        info!("Transfer of `{name}` aborted");
        self.publish_status(FileUploadStatus::new(name, FileTransferStatus::Aborted));
    }

    /// Deletes a stored file.
    ///
    /// The file list is published in any case, an empty name only publishes
    /// it.
    pub fn handle_file_delete(&self, name: &str) {
        if name.is_empty() {
            debug!("File delete without a file name, publishing the file list");
            self.send_file_list();
            return;
        }

        match self.repository.file_info(name) {
            Ok(Some(info)) => self.delete_file(&info),
            Ok(None) => warn!("No record of `{name}`, nothing to delete"),
            Err(e) => error!("Impossible to look `{name}` up: {e}"),
        }

        self.send_file_list();
    }

    /// Deletes all stored files.
    ///
    /// Files that cannot be deleted are kept and the others are deleted
    /// anyway.
    pub fn handle_purge(&self) {
        match self.repository.file_names() {
            Ok(names) => {
                for name in names {
                    match self.repository.file_info(&name) {
                        Ok(Some(info)) => self.delete_file(&info),
                        Ok(None) => warn!("Record of `{name}` disappeared"),
                        Err(e) => error!("Impossible to look `{name}` up: {e}"),
                    }
                }
            }
            Err(e) => error!("Impossible to list the stored files: {e}"),
        }

        self.send_file_list();
    }

    fn delete_file(&self, info: &FileInfo) {
        if let Err(e) = std::fs::remove_file(&info.path) {
            error!("Impossible to delete `{}`: {e}", info.path.display());
            return;
        }

        info!("Deleted `{}`", info.path.display());
        if let Err(e) = self.repository.remove(&info.name) {
            error!("Impossible to remove the record of `{}`: {e}", info.name);
        }
    }

    /// Logs the platform confirmation of a file list.
    pub fn handle_file_list_confirm(&self) {
        debug!("File list confirmed by the platform");
    }

    /// Starts downloading a file from a `URL`.
    pub fn handle_url_download(&self, url: &str) {
        let Some(downloader) = &self.downloader else {
            warn!("URL downloads are disabled, `{url}` refused");
            self.publish_url_status(FileUrlDownloadStatus::error(
                url,
                FileTransferError::TransferProtocolDisabled,
            ));
            return;
        };

        if url.is_empty() {
            warn!("URL download without a URL");
            self.publish_url_status(FileUrlDownloadStatus::error(
                url,
                FileTransferError::UnspecifiedError,
            ));
            return;
        }

        info!("Downloading `{url}`");
        self.publish_url_status(FileUrlDownloadStatus::new(
            url,
            FileTransferStatus::FileTransfer,
        ));

        let on_completed = {
            let this = Weak::clone(&self.this);
            move |url: String, name: String, path: PathBuf| {
                if let Some(manager) = this.upgrade() {
                    let _ = manager
                        .submit(move |manager| manager.url_download_completed(&url, &name, &path));
                }
            }
        };

        let on_failed = {
            let this = Weak::clone(&self.this);
            move |url: String, error: FileTransferError| {
                if let Some(manager) = this.upgrade() {
                    let _ = manager.submit(move |manager| manager.url_download_failed(&url, error));
                }
            }
        };

        downloader.download(
            url,
            &self.directory,
            Box::new(on_completed),
            Box::new(on_failed),
        );
    }

    /// Aborts the download of a `URL`.
    pub fn handle_url_abort(&self, url: &str) {
        let Some(downloader) = &self.downloader else {
            warn!("URL downloads are disabled, abort of `{url}` refused");
            self.publish_url_status(FileUrlDownloadStatus::error(
                url,
                FileTransferError::TransferProtocolDisabled,
            ));
            return;
        };

        if url.is_empty() {
            warn!("URL abort without a URL");
            self.publish_url_status(FileUrlDownloadStatus::error(
                url,
                FileTransferError::UnspecifiedError,
            ));
            return;
        }

        info!("Aborting the download of `{url}`");
        downloader.abort(url);
        self.publish_url_status(FileUrlDownloadStatus::new(url, FileTransferStatus::Aborted));
    }

    fn url_download_completed(&self, url: &str, name: &str, path: &Path) {
        let hash = match file_hash(path) {
            Ok(hash) => hash,
            Err(e) => {
                error!("Impossible to read the download `{}`: {e}", path.display());
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Impossible to delete `{}`: {e}", path.display());
                }
                self.publish_url_status(FileUrlDownloadStatus::error(
                    url,
                    FileTransferError::FileSystemError,
                ));
                self.send_file_list();
                return;
            }
        };

        let info = FileInfo::new(name, hash, path);
        match self.repository.store(info) {
            Ok(()) => self.publish_url_status(FileUrlDownloadStatus::ready(url, name)),
            Err(e) => {
                error!("Impossible to store the record of `{name}`: {e}");
                self.publish_url_status(FileUrlDownloadStatus::error(
                    url,
                    FileTransferError::FileSystemError,
                ));
            }
        }

        self.send_file_list();
    }

    fn url_download_failed(&self, url: &str, error: FileTransferError) {
        warn!("Download of `{url}` failed: {error}");
        self.publish_url_status(FileUrlDownloadStatus::error(url, error));
        self.send_file_list();
    }

    /// Reconciles the file repository with the file directory, returning the
    /// sorted names of all stored files.
    ///
    /// Records of files missing from the directory are removed, while
    /// untracked files found in the directory are hashed and recorded.
    /// Hidden files are ignored. When the repository cannot be listed, the
    /// files in the directory are returned as they are.
    pub fn reconcile_file_list(&self) -> Vec<String> {
        let on_disk = self.files_on_disk();

        let stored = match self.repository.file_names() {
            Ok(stored) => stored,
            Err(e) => {
                error!("Impossible to list the stored files: {e}");
                return sorted(on_disk.into_iter().map(|(name, _)| name).collect());
            }
        };

        let mut valid = Vec::with_capacity(on_disk.len());

        for name in stored.iter().filter(|name| !on_disk.contains_key(*name)) {
            warn!("File `{name}` missing from the file directory");
            if let Err(e) = self.repository.remove(name) {
                error!("Impossible to remove the record of `{name}`: {e}");
            }
        }

        for (name, path) in on_disk {
            if stored.contains(&name) {
                valid.push(name);
                continue;
            }

            let hash = match file_hash(&path) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Found `{name}` but unable to read it: {e}");
                    continue;
                }
            };

            info!("Found untracked file `{name}`");
            let info = FileInfo::new(name.as_str(), hash, path);
            match self.repository.store(info) {
                Ok(()) => valid.push(name),
                Err(e) => error!("Impossible to record `{name}`: {e}"),
            }
        }

        sorted(valid)
    }

    /// Publishes the list of stored files.
    ///
    /// The list is reconciled and published by a task of the executor.
    pub fn publish_file_list(&self) {
        let _ = self.submit(|manager| manager.send_file_list());
    }

    fn files_on_disk(&self) -> HashMap<String, PathBuf> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Impossible to list `{}`: {e}", self.directory.display());
                return HashMap::new();
            }
        };

        entries
            .filter_map(|entry| {
                let entry = entry
                    .map_err(|e| warn!("Unreadable directory entry: {e}"))
                    .ok()?;
                let name = entry.file_name().into_string().ok()?;
                let is_file = entry.file_type().is_ok_and(|kind| kind.is_file());
                (is_file && !name.starts_with('.')).then(|| (name, entry.path()))
            })
            .collect()
    }

    fn send_file_list(&self) {
        let names = self.reconcile_file_list();
        debug!("Publishing a list of {} files", names.len());
        self.publish(Message::json(
            self.channels.file_list_update(),
            &FileList::new(names),
        ));
    }

    fn publish_status(&self, status: FileUploadStatus) {
        self.publish(Message::json(self.channels.file_status(), &status));
    }

    fn publish_url_status(&self, status: FileUrlDownloadStatus) {
        self.publish(Message::json(self.channels.url_status(), &status));
    }

    fn publish_packet_request(&self, request: &FilePacketRequest) {
        self.publish(Message::json(self.channels.packet_request(), request));
    }

    fn publish(&self, message: std::result::Result<Message, serde_json::Error>) {
        match message {
            Ok(message) => {
                let channel = message.channel.clone();
                if !self.transport.publish(message) {
                    warn!("Message on `{channel}` not published");
                }
            }
            Err(e) => error!("Impossible to encode a message: {e}"),
        }
    }

    // Runs a follow-up on the executor, keeping the service alive meanwhile.
    fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let Some(manager) = self.this.upgrade() else {
            return false;
        };
        self.executor.submit(move || task(&manager))
    }
}

// Streams a file into its `SHA-256` digest, returning the digest text form.
fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let _ = std::io::copy(&mut file, &mut hasher)?;
    Ok(encode_hash(&hasher.finalize()))
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use nubo::channel::Channels;
    use nubo::message::Message;
    use nubo::packet::{BinaryPacket, FIRST_PACKET_PREVIOUS_HASH, Hash, content_hash, encode_hash};

    use serde_json::{Value, json};

    use tempfile::TempDir;

    use crate::executor::CommandExecutor;
    use crate::executor::tests::flush;
    use crate::repository::{FileInfo, FileRepository, InMemoryFileRepository};
    use crate::router::MessageListener;
    use crate::transport::Transport;
    use crate::transport::tests::RecordingTransport;
    use crate::url::tests::FakeDownloader;

    use super::{FileManagement, FileManager};

    const CONTENT: &[u8] = b"The quick brown fox jumps over the lazy dog";

    struct Fixture {
        dir: TempDir,
        channels: Channels,
        executor: CommandExecutor,
        transport: Arc<RecordingTransport>,
        repository: Arc<InMemoryFileRepository>,
        manager: Arc<FileManager>,
    }

    impl Fixture {
        fn new(configure: impl FnOnce(FileManagement) -> FileManagement) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let channels = Channels::new("KEY");
            let executor = CommandExecutor::new().unwrap();
            let transport = Arc::new(RecordingTransport::default());
            let repository = Arc::new(InMemoryFileRepository::new());

            let manager = FileManager::new(
                channels.clone(),
                configure(FileManagement::new(dir.path()).max_packet_size(16)),
                executor.clone(),
                Arc::clone(&transport) as Arc<dyn Transport>,
                Arc::clone(&repository) as Arc<dyn FileRepository>,
            )
            .unwrap();

            Self {
                dir,
                channels,
                executor,
                transport,
                repository,
                manager,
            }
        }

        // Delivers a message as the router does and waits for all the
        // follow-up tasks.
        fn deliver(&self, channel: String, payload: Vec<u8>) {
            let manager = Arc::clone(&self.manager);
            assert!(
                self.executor
                    .submit(move || manager.message_received(Message::new(channel, payload)))
            );
            self.settle();
        }

        fn command(&self, command: Value) {
            self.deliver(
                self.channels.file_commands(),
                serde_json::to_vec(&command).unwrap(),
            );
        }

        fn url_command(&self, command: Value) {
            self.deliver(
                self.channels.url_commands(),
                serde_json::to_vec(&command).unwrap(),
            );
        }

        fn binary(&self, packet: Vec<u8>) {
            self.deliver(self.channels.binary(), packet);
        }

        fn settle(&self) {
            for _ in 0..3 {
                flush(&self.executor);
            }
        }

        fn statuses(&self) -> Vec<Value> {
            self.transport.published_on(&self.channels.file_status())
        }

        fn url_statuses(&self) -> Vec<Value> {
            self.transport.published_on(&self.channels.url_status())
        }

        fn packet_requests(&self) -> Vec<Value> {
            self.transport
                .published_on(&self.channels.packet_request())
        }

        fn file_lists(&self) -> Vec<Value> {
            self.transport
                .published_on(&self.channels.file_list_update())
        }

        fn path(&self, name: &str) -> std::path::PathBuf {
            self.dir.path().join(name)
        }

        fn wait_for_sweep(&self) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.manager.transfers.lock().unwrap().records.is_empty() {
                assert!(Instant::now() < deadline, "Transfers never swept");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn initiate(name: &str, content: &[u8]) -> Value {
        json!({
            "command": "UPLOAD_INITIATE",
            "fileName": name,
            "fileSize": content.len(),
            "fileHash": encode_hash(&content_hash(content)),
        })
    }

    fn packets(content: &[u8], packet_size: usize) -> Vec<Vec<u8>> {
        let mut previous: Hash = FIRST_PACKET_PREVIOUS_HASH;
        content
            .chunks(packet_size)
            .map(|chunk| {
                let packet = BinaryPacket::encode(&previous, chunk);
                previous = content_hash(chunk);
                packet
            })
            .collect()
    }

    fn status(name: &str, status: &str) -> Value {
        json!({ "fileName": name, "status": status })
    }

    fn error(name: &str, error: &str) -> Value {
        json!({ "fileName": name, "status": "ERROR", "error": error })
    }

    fn file_list(names: &[&str]) -> Value {
        Value::Array(
            names
                .iter()
                .map(|name| json!({ "fileName": name }))
                .collect(),
        )
    }

    #[test]
    fn upload_success() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(initiate("fox.txt", CONTENT));
        for packet in packets(CONTENT, 16) {
            fixture.binary(packet);
        }

        assert_eq!(
            fixture.statuses(),
            [
                status("fox.txt", "FILE_TRANSFER"),
                status("fox.txt", "FILE_READY")
            ]
        );
        assert_eq!(
            fixture.packet_requests(),
            [
                json!({ "fileName": "fox.txt", "chunkIndex": 0, "chunkSize": 16 }),
                json!({ "fileName": "fox.txt", "chunkIndex": 1, "chunkSize": 16 }),
                json!({ "fileName": "fox.txt", "chunkIndex": 2, "chunkSize": 11 }),
            ]
        );
        assert_eq!(fixture.file_lists(), [file_list(&["fox.txt"])]);

        assert_eq!(std::fs::read(fixture.path("fox.txt")).unwrap(), CONTENT);
        let info = fixture.repository.file_info("fox.txt").unwrap().unwrap();
        assert_eq!(info.hash, encode_hash(&content_hash(CONTENT)));
        assert!(info.path.is_absolute());

        fixture.wait_for_sweep();
        assert!(fixture.manager.transfers.lock().unwrap().current.is_none());

        // The same upload again is already satisfied.
        fixture.transport.clear();
        fixture.command(initiate("fox.txt", CONTENT));
        assert_eq!(fixture.statuses(), [status("fox.txt", "FILE_READY")]);
        assert!(fixture.packet_requests().is_empty());
    }

    #[test]
    fn hash_mismatch_with_stored_file() {
        let fixture = Fixture::new(|settings| settings);
        fixture
            .repository
            .store(FileInfo::new(
                "fox.txt",
                encode_hash(&content_hash(b"old content")),
                fixture.path("fox.txt"),
            ))
            .unwrap();

        fixture.command(initiate("fox.txt", CONTENT));

        assert_eq!(
            fixture.statuses(),
            [error("fox.txt", "FILE_HASH_MISMATCH")]
        );
        assert!(fixture.packet_requests().is_empty());
    }

    #[test]
    fn invalid_upload_initiates() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(initiate("", CONTENT));
        fixture.command(initiate("empty.txt", b""));
        fixture.command(initiate("../escape.txt", CONTENT));
        fixture.command(json!({
            "command": "UPLOAD_INITIATE",
            "fileName": "fox.txt",
            "fileSize": 10,
            "fileHash": "not base64!",
        }));

        assert_eq!(
            fixture.statuses(),
            [
                error("", "UNSPECIFIED_ERROR"),
                error("empty.txt", "UNSPECIFIED_ERROR"),
                error("../escape.txt", "UNSPECIFIED_ERROR"),
                error("fox.txt", "UNSPECIFIED_ERROR"),
            ]
        );
        assert!(fixture.packet_requests().is_empty());
    }

    #[test]
    fn disabled_chunked_transfer() {
        let fixture = Fixture::new(|settings| settings.max_packet_size(0));

        fixture.command(initiate("fox.txt", CONTENT));

        assert_eq!(
            fixture.statuses(),
            [error("fox.txt", "TRANSFER_PROTOCOL_DISABLED")]
        );
    }

    #[test]
    fn concurrent_initiates_of_the_same_file() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(initiate("fox.txt", CONTENT));
        fixture.command(initiate("fox.txt", CONTENT));
        fixture.command(initiate("fox.txt", b"another content"));

        assert_eq!(
            fixture.statuses(),
            [
                status("fox.txt", "FILE_TRANSFER"),
                status("fox.txt", "FILE_TRANSFER"),
                error("fox.txt", "UNSPECIFIED_ERROR"),
            ]
        );
        // A single transfer requests packets.
        assert_eq!(fixture.packet_requests().len(), 1);
        assert_eq!(fixture.manager.transfers.lock().unwrap().records.len(), 1);
    }

    #[test]
    fn abort_drops_stray_packets() {
        let fixture = Fixture::new(|settings| settings);
        let packets = packets(CONTENT, 16);

        fixture.command(initiate("fox.txt", CONTENT));
        fixture.binary(packets[0].clone());
        fixture.command(json!({ "command": "UPLOAD_ABORT", "fileName": "fox.txt" }));
        fixture.binary(packets[1].clone());
        fixture.binary(packets[2].clone());
        // Aborting again has no effect.
        fixture.command(json!({ "command": "UPLOAD_ABORT", "fileName": "fox.txt" }));

        assert_eq!(
            fixture.statuses(),
            [
                status("fox.txt", "FILE_TRANSFER"),
                status("fox.txt", "ABORTED")
            ]
        );
        assert_eq!(fixture.packet_requests().len(), 2);
        assert_eq!(std::fs::read_dir(fixture.dir.path()).unwrap().count(), 0);
        assert!(fixture.repository.file_names().unwrap().is_empty());

        fixture.wait_for_sweep();

        // The file can be uploaded again.
        fixture.command(initiate("fox.txt", CONTENT));
        assert_eq!(fixture.statuses().len(), 3);
    }

    #[test]
    fn abort_without_name() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(json!({ "command": "UPLOAD_ABORT" }));
        fixture.command(json!({ "command": "UPLOAD_ABORT", "fileName": "unknown.txt" }));

        assert_eq!(fixture.statuses(), [error("", "UNSPECIFIED_ERROR")]);
    }

    #[test]
    fn corrupted_upload_fails() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(initiate("fox.txt", CONTENT));
        for _ in 0..4 {
            fixture.binary(b"definitely not a packet".to_vec());
        }

        assert_eq!(
            fixture.statuses(),
            [
                status("fox.txt", "FILE_TRANSFER"),
                error("fox.txt", "RETRY_COUNT_EXCEEDED")
            ]
        );
        assert_eq!(fixture.file_lists(), [file_list(&[])]);
        fixture.wait_for_sweep();
    }

    #[test]
    fn delete_files() {
        let fixture = Fixture::new(|settings| settings);
        std::fs::write(fixture.path("a.txt"), b"a").unwrap();
        std::fs::write(fixture.path("b.txt"), b"b").unwrap();

        // An empty name only publishes the list, discovering both files.
        fixture.command(json!({ "command": "FILE_DELETE", "fileName": "" }));
        assert_eq!(fixture.file_lists(), [file_list(&["a.txt", "b.txt"])]);

        fixture.transport.clear();
        fixture.command(json!({ "command": "FILE_DELETE", "fileName": "a.txt" }));
        fixture.command(json!({ "command": "FILE_DELETE", "fileName": "missing.txt" }));

        assert_eq!(
            fixture.file_lists(),
            [file_list(&["b.txt"]), file_list(&["b.txt"])]
        );
        assert!(!fixture.path("a.txt").exists());
        assert_eq!(fixture.repository.file_names().unwrap(), ["b.txt"]);
        assert!(fixture.statuses().is_empty());
    }

    #[test]
    fn purge_files() {
        let fixture = Fixture::new(|settings| settings);
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(fixture.path(name), name).unwrap();
        }
        assert_eq!(fixture.manager.reconcile_file_list().len(), 3);

        fixture.command(json!({ "command": "FILE_PURGE" }));

        assert_eq!(fixture.file_lists(), [file_list(&[])]);
        assert!(fixture.repository.file_names().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(fixture.dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn abort_after_completion_is_ignored() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(initiate("fox.txt", CONTENT));
        for packet in packets(CONTENT, 16) {
            fixture.binary(packet);
        }
        fixture.command(json!({ "command": "UPLOAD_ABORT", "fileName": "fox.txt" }));

        assert_eq!(
            fixture.statuses(),
            [
                status("fox.txt", "FILE_TRANSFER"),
                status("fox.txt", "FILE_READY")
            ]
        );
        assert_eq!(std::fs::read(fixture.path("fox.txt")).unwrap(), CONTENT);
        assert_eq!(fixture.repository.file_names().unwrap(), ["fox.txt"]);
    }

    #[test]
    fn completion_after_abort_is_ignored() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(initiate("fox.txt", CONTENT));
        fixture.command(json!({ "command": "UPLOAD_ABORT", "fileName": "fox.txt" }));
        for packet in packets(CONTENT, 16) {
            fixture.binary(packet);
        }

        assert_eq!(
            fixture.statuses(),
            [
                status("fox.txt", "FILE_TRANSFER"),
                status("fox.txt", "ABORTED")
            ]
        );
        assert_eq!(fixture.packet_requests().len(), 1);
        assert!(!fixture.path("fox.txt").exists());
        assert!(fixture.repository.file_names().unwrap().is_empty());
    }

    // Records a file whose path cannot be removed as a regular file.
    fn undeletable_file(fixture: &Fixture, name: &str) {
        std::fs::write(fixture.path(name), name).unwrap();
        let locked = fixture.path(".locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("inner"), b"x").unwrap();
        fixture
            .repository
            .store(FileInfo::new(name, "aGFzaA==", locked))
            .unwrap();
    }

    #[test]
    fn failed_delete_keeps_the_record() {
        let fixture = Fixture::new(|settings| settings);
        undeletable_file(&fixture, "a.txt");

        fixture.command(json!({ "command": "FILE_DELETE", "fileName": "a.txt" }));

        assert_eq!(fixture.file_lists(), [file_list(&["a.txt"])]);
        assert_eq!(
            fixture.repository.file_info("a.txt").unwrap(),
            Some(FileInfo::new("a.txt", "aGFzaA==", fixture.path(".locked")))
        );
        assert!(fixture.path(".locked").is_dir());
    }

    #[test]
    fn purge_skips_failed_deletions() {
        let fixture = Fixture::new(|settings| settings);
        undeletable_file(&fixture, "a.txt");
        for name in ["b.txt", "c.txt"] {
            std::fs::write(fixture.path(name), name).unwrap();
        }
        assert_eq!(
            fixture.manager.reconcile_file_list(),
            ["a.txt", "b.txt", "c.txt"]
        );

        fixture.command(json!({ "command": "FILE_PURGE" }));

        assert_eq!(fixture.file_lists(), [file_list(&["a.txt"])]);
        assert_eq!(fixture.repository.file_names().unwrap(), ["a.txt"]);
        assert!(!fixture.path("b.txt").exists());
        assert!(!fixture.path("c.txt").exists());
    }

    #[test]
    fn reconciliation() {
        let fixture = Fixture::new(|settings| settings);
        std::fs::write(fixture.path("untracked.txt"), CONTENT).unwrap();
        std::fs::write(fixture.path(".staging"), b"partial").unwrap();
        std::fs::create_dir(fixture.path("nested")).unwrap();
        fixture
            .repository
            .store(FileInfo::new("gone.txt", "aGFzaA==", fixture.path("gone.txt")))
            .unwrap();

        assert_eq!(fixture.manager.reconcile_file_list(), ["untracked.txt"]);

        let info = fixture
            .repository
            .file_info("untracked.txt")
            .unwrap()
            .unwrap();
        assert_eq!(info.hash, encode_hash(&content_hash(CONTENT)));
        assert!(Path::new(&info.path).is_absolute());
        assert_eq!(fixture.repository.file_info("gone.txt").unwrap(), None);

        // A second pass changes nothing.
        assert_eq!(fixture.manager.reconcile_file_list(), ["untracked.txt"]);
        assert_eq!(fixture.repository.file_names().unwrap(), ["untracked.txt"]);
    }

    #[test]
    fn file_list_confirm_and_publish() {
        let fixture = Fixture::new(|settings| settings);

        fixture.command(json!({ "command": "FILE_LIST_CONFIRM" }));
        assert!(fixture.transport.published.lock().unwrap().is_empty());

        fixture.manager.publish_file_list();
        fixture.settle();
        assert_eq!(fixture.file_lists(), [file_list(&[])]);
    }

    #[test]
    fn url_download() {
        let downloader = Arc::new(FakeDownloader::default());
        *downloader.content.lock().unwrap() = Some(CONTENT.to_vec());

        let fixture = Fixture::new({
            let downloader = Arc::clone(&downloader);
            move |settings| settings.url_downloader(downloader)
        });

        fixture.url_command(json!({
            "command": "URL_DOWNLOAD",
            "fileUrl": "http://host/files/fox.txt",
        }));

        assert_eq!(
            fixture.url_statuses(),
            [
                json!({ "fileUrl": "http://host/files/fox.txt", "status": "FILE_TRANSFER" }),
                json!({
                    "fileUrl": "http://host/files/fox.txt",
                    "status": "FILE_READY",
                    "fileName": "fox.txt",
                }),
            ]
        );
        assert_eq!(fixture.file_lists(), [file_list(&["fox.txt"])]);
        assert_eq!(
            fixture.repository.file_info("fox.txt").unwrap().unwrap().hash,
            encode_hash(&content_hash(CONTENT))
        );

        fixture.transport.clear();
        fixture.url_command(json!({ "command": "URL_ABORT", "fileUrl": "http://host/a.bin" }));
        fixture.url_command(json!({ "command": "URL_DOWNLOAD", "fileUrl": "http://host/" }));
        fixture.url_command(json!({ "command": "URL_DOWNLOAD", "fileUrl": "" }));

        assert_eq!(*downloader.aborted.lock().unwrap(), ["http://host/a.bin"]);
        assert_eq!(
            fixture.url_statuses(),
            [
                json!({ "fileUrl": "http://host/a.bin", "status": "ABORTED" }),
                json!({ "fileUrl": "http://host/", "status": "FILE_TRANSFER" }),
                json!({ "fileUrl": "http://host/", "status": "ERROR", "error": "MALFORMED_URL" }),
                json!({ "fileUrl": "", "status": "ERROR", "error": "UNSPECIFIED_ERROR" }),
            ]
        );
    }

    #[test]
    fn unreadable_url_download() {
        // The downloader reports a file it never wrote.
        let downloader = Arc::new(FakeDownloader::default());
        let fixture = Fixture::new(move |settings| settings.url_downloader(downloader));

        fixture.url_command(json!({
            "command": "URL_DOWNLOAD",
            "fileUrl": "http://host/ghost.bin",
        }));

        assert_eq!(
            fixture.url_statuses()[1],
            json!({
                "fileUrl": "http://host/ghost.bin",
                "status": "ERROR",
                "error": "FILE_SYSTEM_ERROR",
            })
        );
        assert!(fixture.repository.file_names().unwrap().is_empty());
    }

    #[test]
    fn disabled_url_download() {
        let fixture = Fixture::new(|settings| settings);

        fixture.url_command(json!({ "command": "URL_DOWNLOAD", "fileUrl": "http://host/a.bin" }));
        fixture.url_command(json!({ "command": "URL_ABORT", "fileUrl": "http://host/a.bin" }));

        let disabled = json!({
            "fileUrl": "http://host/a.bin",
            "status": "ERROR",
            "error": "TRANSFER_PROTOCOL_DISABLED",
        });
        assert_eq!(fixture.url_statuses(), [disabled.clone(), disabled]);
    }
}
