//! Executes a single book download.
//!
//! The fetcher walks the descriptor's candidate URLs in order, streams the
//! first successful response into a temp file, validates it against the
//! expected size, then publishes it into the ingest directory through an
//! intermediate rename. Cancellation is observed at every chunk boundary and
//! once more right before the final rename.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header;
use thiserror::Error;
use tokio::fs;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::models::{BookInfo, parse_size, sanitize_filename};
use crate::config::Config;

/// Minimum acceptable ratio of downloaded bytes to the expected size.
const MIN_DOWNLOAD_SIZE_RATIO: f64 = 0.9;
/// Extension for files still being transferred.
const TEMP_DOWNLOAD_EXT: &str = "crdownload";
/// Progress callbacks fire at most this often.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome classification for a failed download.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("truncated download from {url}: got {downloaded} of {expected} bytes")]
    Truncated {
        url: String,
        downloaded: u64,
        expected: u64,
    },

    #[error("{url} served an HTML page instead of book content")]
    HtmlContent { url: String },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("all {tried} download sources failed, last error: {last}")]
    Exhausted { tried: usize, last: String },
}

impl FetchError {
    /// Fatal errors abort the whole request; everything else advances to the
    /// next candidate URL.
    fn is_fatal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Io { .. })
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl Fetcher {
    pub fn new(config: Arc<Config>) -> Self {
        // No request timeout: large books may take arbitrarily long, and
        // per-item cancellation is the control lever.
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Tries each candidate URL in order until one yields a complete file,
    /// then publishes it. Returns the final path inside the ingest directory.
    pub async fn download_book<F>(
        &self,
        book: &BookInfo,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<PathBuf, FetchError>
    where
        F: Fn(f64),
    {
        let urls = self.candidate_urls(book);
        if urls.is_empty() {
            return Err(FetchError::Exhausted {
                tried: 0,
                last: "no download sources supplied".to_string(),
            });
        }

        let filename = self.build_filename(book);
        let temp_path = self
            .config
            .tmp_dir
            .join(format!("{filename}.{TEMP_DOWNLOAD_EXT}"));
        let declared_size = book.size.as_deref().map(parse_size).unwrap_or(0);

        let tried = urls.len();
        let mut last_error: Option<FetchError> = None;

        for url in urls {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            tracing::info!("downloading {} from {}", book.id, url);
            match self
                .download_url(&url, &temp_path, declared_size, cancel, &progress)
                .await
            {
                Ok(()) => {
                    self.run_custom_script(&temp_path).await;
                    return self.publish(&temp_path, &book.id, &filename, cancel).await;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!("download of {} from {} failed: {}", book.id, url, err);
                    last_error = Some(err);
                }
            }
        }

        Err(FetchError::Exhausted {
            tried,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Candidate URLs in attempt order. A donator key prepends the partner
    /// fast-download endpoint ahead of the descriptor's own sources.
    fn candidate_urls(&self, book: &BookInfo) -> Vec<String> {
        let mut urls = Vec::with_capacity(book.download_urls.len() + 1);
        if let Some(key) = self
            .config
            .aa_donator_key
            .as_deref()
            .filter(|key| !key.is_empty())
        {
            urls.push(format!(
                "{}/dyn/api/fast_download.json?md5={}&key={}",
                self.config.aa_base_url, book.id, key
            ));
        }
        urls.extend(book.download_urls.iter().cloned());
        urls
    }

    /// Derives the final filename: the sanitized title when configured (and
    /// usable), else the id; the descriptor's format, else `epub`.
    fn build_filename(&self, book: &BookInfo) -> String {
        let mut stem = if self.config.use_book_title {
            sanitize_filename(&book.title)
        } else {
            sanitize_filename(&book.id)
        };
        if stem.is_empty() {
            stem = sanitize_filename(&book.id);
        }
        let extension = book
            .format
            .as_deref()
            .filter(|format| !format.is_empty())
            .unwrap_or("epub");
        format!("{stem}.{extension}")
    }

    /// One streaming attempt against a single URL, writing into `temp_path`.
    async fn download_url<F>(
        &self,
        url: &str,
        temp_path: &Path,
        declared_size: u64,
        cancel: &CancellationToken,
        progress: &F,
    ) -> Result<(), FetchError>
    where
        F: Fn(f64),
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Caller-declared size wins; fall back to the wire's content length.
        // Neither known means the truncation check is skipped.
        let expected = if declared_size > 0 {
            declared_size
        } else {
            response.content_length().unwrap_or(0)
        };

        let mut file = File::create(temp_path)
            .await
            .map_err(|e| FetchError::io(temp_path, e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report: Option<Instant> = None;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                tracing::info!("download from {} cancelled after {} bytes", url, downloaded);
                drop(file);
                let _ = fs::remove_file(temp_path).await;
                return Err(FetchError::Cancelled);
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    drop(file);
                    let _ = fs::remove_file(temp_path).await;
                    return Err(FetchError::Transport {
                        url: url.to_string(),
                        source,
                    });
                }
            };

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = fs::remove_file(temp_path).await;
                return Err(FetchError::io(temp_path, e));
            }
            downloaded += chunk.len() as u64;

            if expected > 0
                && last_report.map_or(true, |at| at.elapsed() >= PROGRESS_INTERVAL)
            {
                progress(downloaded as f64 * 100.0 / expected as f64);
                last_report = Some(Instant::now());
            }
        }

        file.flush().await.map_err(|e| FetchError::io(temp_path, e))?;
        file.shutdown()
            .await
            .map_err(|e| FetchError::io(temp_path, e))?;
        drop(file);

        if expected > 0 && (downloaded as f64) < expected as f64 * MIN_DOWNLOAD_SIZE_RATIO {
            let _ = fs::remove_file(temp_path).await;
            // An undersized text/html body is a login wall or block page,
            // not a partial book.
            if content_type.starts_with("text/html") {
                return Err(FetchError::HtmlContent {
                    url: url.to_string(),
                });
            }
            return Err(FetchError::Truncated {
                url: url.to_string(),
                downloaded,
                expected,
            });
        }

        if expected > 0 {
            progress(downloaded as f64 * 100.0 / expected as f64);
        }
        tracing::debug!("fetched {} bytes from {}", downloaded, url);
        Ok(())
    }

    /// Runs the configured post-download hook against the temp file. A
    /// failing hook is logged and never fails the download.
    async fn run_custom_script(&self, temp_path: &Path) {
        let Some(script) = &self.config.custom_script else {
            return;
        };
        tracing::info!("running custom script {}", script.display());
        match tokio::process::Command::new(script)
            .arg(temp_path)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::error!("custom script exited with {}", status),
            Err(e) => tracing::error!("custom script failed to start: {}", e),
        }
    }

    /// Moves a finished temp file into the ingest directory through the
    /// intermediate `<id>.crdownload` name, with one last cancellation check
    /// before the final rename.
    async fn publish(
        &self,
        temp_path: &Path,
        book_id: &str,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let intermediate = self.config.ingest_dir.join(format!(
            "{}.{TEMP_DOWNLOAD_EXT}",
            sanitize_filename(book_id)
        ));
        rename_or_copy(temp_path, &intermediate)
            .await
            .map_err(|e| FetchError::io(&intermediate, e))?;

        if cancel.is_cancelled() {
            let _ = fs::remove_file(&intermediate).await;
            return Err(FetchError::Cancelled);
        }

        let final_path = self.config.ingest_dir.join(filename);
        // Two titles can sanitize to the same filename; never overwrite a
        // book that already landed.
        if self.config.use_book_title
            && fs::try_exists(&final_path).await.unwrap_or(false)
        {
            let _ = fs::remove_file(&intermediate).await;
            return Err(FetchError::io(
                &final_path,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "destination filename already taken",
                ),
            ));
        }

        rename_or_copy(&intermediate, &final_path)
            .await
            .map_err(|e| FetchError::io(&final_path, e))?;
        tracing::info!("book {} published to {}", book_id, final_path.display());
        Ok(final_path)
    }
}

/// Renames, falling back to copy-and-delete for cross-filesystem moves.
async fn rename_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await?;
            Ok(())
        }
    }
}
