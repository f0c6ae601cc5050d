use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;

use nubo::file::FileTransferError;

use reqwest::Url;
use reqwest::blocking::Client;

use tempfile::NamedTempFile;

use tracing::{debug, error, info, warn};

// Timeout for establishing a connection with the remote host.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Size of the buffer used to copy the response body.
const BUFFER_SIZE: usize = 8 * 1024;

/// Notified when a file has been downloaded, with the `URL`, the file name and
/// the path of the stored file.
pub type UrlCompletedCallback = Box<dyn Fn(String, String, PathBuf) + Send + Sync>;

/// Notified when a download fails, with the `URL` and the failure reason.
pub type UrlFailedCallback = Box<dyn Fn(String, FileTransferError) + Send + Sync>;

/// A downloader of files identified by a `URL`.
///
/// Downloads run in the background and their outcome is reported through
/// the callbacks. An aborted download reports nothing.
pub trait UrlFileDownloader: Send + Sync {
    /// Starts downloading a file into a directory.
    fn download(
        &self,
        url: &str,
        directory: &Path,
        on_completed: UrlCompletedCallback,
        on_failed: UrlFailedCallback,
    );

    /// Aborts the download of a `URL`. Unknown `URL`s are ignored.
    fn abort(&self, url: &str);
}

/// Extracts the name of the file a `URL` points to.
///
/// The name is the last non-empty path segment. Names of hidden files and
/// relative path components are refused.
#[must_use]
pub fn file_name_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let name = url.path_segments()?.next_back()?;

    if name.is_empty() || name.starts_with('.') {
        return None;
    }

    Some(name.to_string())
}

enum DownloadError {
    Aborted,
    Request(reqwest::Error),
    Io(std::io::Error),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e)
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A [`UrlFileDownloader`] over `HTTP`.
///
/// Each download runs on its own thread with a blocking client.
#[derive(Debug, Default)]
pub struct HttpFileDownloader {
    timeout: Option<Duration>,
    downloads: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl HttpFileDownloader {
    /// Creates a [`HttpFileDownloader`] without a global download timeout.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a timeout for each whole download.
    #[must_use]
    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn register(&self, url: &str) -> Option<Arc<AtomicBool>> {
        let mut downloads = match self.downloads.lock() {
            Ok(downloads) => downloads,
            Err(poisoned) => poisoned.into_inner(),
        };

        if downloads.contains_key(url) {
            return None;
        }

        let aborted = Arc::new(AtomicBool::new(false));
        let _ = downloads.insert(url.to_string(), Arc::clone(&aborted));
        Some(aborted)
    }
}

fn unregister(downloads: &Mutex<HashMap<String, Arc<AtomicBool>>>, url: &str) {
    let mut downloads = match downloads.lock() {
        Ok(downloads) => downloads,
        Err(poisoned) => poisoned.into_inner(),
    };
    let _ = downloads.remove(url);
}

fn fetch(
    url: &str,
    timeout: Option<Duration>,
    target: &Path,
    aborted: &AtomicBool,
) -> Result<PathBuf, DownloadError> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder.build()?;

    let mut response = client.get(url).send()?.error_for_status()?;

    let directory = target.parent().unwrap_or_else(|| Path::new("."));
    let mut staging = tempfile::Builder::new()
        .prefix(".nubo-")
        .suffix(".download")
        .tempfile_in(directory)?;

    let mut buffer = vec![0; BUFFER_SIZE];
    loop {
        if aborted.load(Ordering::Acquire) {
            return Err(DownloadError::Aborted);
        }

        let read = response.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        staging.write_all(&buffer[..read])?;
    }

    persist(staging, target)?;
    Ok(std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf()))
}

fn persist(mut staging: NamedTempFile, target: &Path) -> std::io::Result<()> {
    staging.flush()?;
    staging.as_file().sync_all()?;
    let _ = staging.persist(target).map_err(|e| e.error)?;
    Ok(())
}

impl UrlFileDownloader for HttpFileDownloader {
    fn download(
        &self,
        url: &str,
        directory: &Path,
        on_completed: UrlCompletedCallback,
        on_failed: UrlFailedCallback,
    ) {
        let Some(name) = file_name_from_url(url) else {
            warn!("No file name in `{url}`");
            on_failed(url.to_string(), FileTransferError::MalformedUrl);
            return;
        };

        let Some(aborted) = self.register(url) else {
            info!("Download of `{url}` already in progress");
            return;
        };

        let url = url.to_string();
        let target = directory.join(&name);
        let timeout = self.timeout;
        let downloads = Arc::clone(&self.downloads);

        let spawned = thread::Builder::new().name("nubo-download".into()).spawn({
            let url = url.clone();
            move || {
                info!("Downloading `{url}` into `{}`", target.display());
                let result = fetch(&url, timeout, &target, &aborted);
                unregister(&downloads, &url);

                match result {
                    Ok(path) => {
                        info!("Download of `{url}` completed");
                        on_completed(url, name, path);
                    }
                    Err(DownloadError::Aborted) => debug!("Download of `{url}` aborted"),
                    Err(DownloadError::Request(e)) => {
                        error!("Download of `{url}` failed: {e}");
                        on_failed(url, FileTransferError::UnspecifiedError);
                    }
                    Err(DownloadError::Io(e)) => {
                        error!("Impossible to store the download of `{url}`: {e}");
                        on_failed(url, FileTransferError::FileSystemError);
                    }
                }
            }
        });

        if let Err(e) = spawned {
            error!("Impossible to start the download of `{url}`: {e}");
            unregister(&self.downloads, &url);
        }
    }

    fn abort(&self, url: &str) {
        let downloads = match self.downloads.lock() {
            Ok(downloads) => downloads,
            Err(poisoned) => poisoned.into_inner(),
        };

        match downloads.get(url) {
            Some(aborted) => aborted.store(true, Ordering::Release),
            None => debug!("No download in progress for `{url}`"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use nubo::file::FileTransferError;

    use crate::executor::tests::WAIT;

    use super::{
        HttpFileDownloader, UrlCompletedCallback, UrlFailedCallback, UrlFileDownloader,
        file_name_from_url,
    };

    // Serves a single `HTTP` response with the given body and returns the
    // server address.
    fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let _ = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }

            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(body).unwrap();
        });

        format!("http://{address}")
    }

    // A downloader completing downloads instantly with files written by the
    // test itself.
    #[derive(Default)]
    pub(crate) struct FakeDownloader {
        pub(crate) aborted: Mutex<Vec<String>>,
        pub(crate) content: Mutex<Option<Vec<u8>>>,
    }

    impl UrlFileDownloader for FakeDownloader {
        fn download(
            &self,
            url: &str,
            directory: &Path,
            on_completed: UrlCompletedCallback,
            on_failed: UrlFailedCallback,
        ) {
            let Some(name) = file_name_from_url(url) else {
                on_failed(url.into(), FileTransferError::MalformedUrl);
                return;
            };

            let path = directory.join(&name);
            if let Some(content) = self.content.lock().unwrap().as_ref() {
                std::fs::write(&path, content).unwrap();
            }
            on_completed(url.into(), name, path);
        }

        fn abort(&self, url: &str) {
            self.aborted.lock().unwrap().push(url.into());
        }
    }

    fn callbacks() -> (
        UrlCompletedCallback,
        UrlFailedCallback,
        flume::Receiver<Result<(String, PathBuf), FileTransferError>>,
    ) {
        let (sender, receiver) = flume::unbounded();
        let failed = sender.clone();
        (
            Box::new(move |_url, name, path| {
                let _ = sender.send(Ok((name, path)));
            }),
            Box::new(move |_url, error| {
                let _ = failed.send(Err(error));
            }),
            receiver,
        )
    }

    #[test]
    fn file_names() {
        assert_eq!(
            file_name_from_url("http://host/files/image.bin"),
            Some("image.bin".into())
        );
        assert_eq!(
            file_name_from_url("https://host/a.bin?version=2"),
            Some("a.bin".into())
        );
        assert_eq!(file_name_from_url("http://host/"), None);
        assert_eq!(file_name_from_url("http://host/dir/"), None);
        assert_eq!(file_name_from_url("http://host/.hidden"), None);
        assert_eq!(file_name_from_url("not a url"), None);
    }

    #[test]
    fn http_download() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/files/data.bin", serve_once("200 OK", b"remote content"));

        let (on_completed, on_failed, outcome) = callbacks();
        HttpFileDownloader::new().download(&url, dir.path(), on_completed, on_failed);

        let (name, path) = outcome.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(name, "data.bin");
        assert!(path.is_absolute());
        assert_eq!(std::fs::read(path).unwrap(), b"remote content");

        // No staging file is left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn http_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/missing.bin", serve_once("404 Not Found", b""));

        let (on_completed, on_failed, outcome) = callbacks();
        HttpFileDownloader::new().download(&url, dir.path(), on_completed, on_failed);

        assert_eq!(
            outcome.recv_timeout(WAIT).unwrap(),
            Err(FileTransferError::UnspecifiedError)
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn malformed_url() {
        let dir = tempfile::tempdir().unwrap();

        let (on_completed, on_failed, outcome) = callbacks();
        let downloader = HttpFileDownloader::new();
        downloader.download("http://host/", dir.path(), on_completed, on_failed);

        assert_eq!(
            outcome.recv_timeout(WAIT).unwrap(),
            Err(FileTransferError::MalformedUrl)
        );

        // Aborting an unknown download is harmless.
        downloader.abort("http://host/");
    }
}
