//! Config module for libram
//!
//! Everything is driven by environment variables (with `.env` support from
//! the binary), matching how the service is deployed next to the library
//! manager it feeds.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Config {
    #[clap(env = "LIBRAM_HOST", default_value = "0.0.0.0:8084")]
    pub host: String,

    /// Number of concurrent download workers
    #[clap(env = "MAX_CONCURRENT_DOWNLOADS", default_value_t = 3)]
    pub max_concurrent_downloads: usize,

    /// Seconds a terminal record is retained before the sweeper evicts it
    #[clap(env = "STATUS_TIMEOUT", default_value_t = 3600)]
    pub status_timeout: u64,

    /// Seconds an idle worker sleeps between queue polls
    #[clap(env = "MAIN_LOOP_SLEEP_TIME", default_value_t = 5)]
    pub main_loop_sleep_time: u64,

    /// Staging directory for in-flight transfers
    #[clap(env = "TMP_DIR", default_value = "/tmp/libram")]
    pub tmp_dir: PathBuf,

    /// Final landing area watched by the library manager
    #[clap(env = "INGEST_DIR", default_value = "/library/ingest")]
    pub ingest_dir: PathBuf,

    /// Name finished files after the book title instead of the id
    #[clap(long, env = "USE_BOOK_TITLE", default_value = "false")]
    pub use_book_title: bool,

    /// Formats advertised to clients; the pipeline itself accepts any
    #[clap(
        env = "SUPPORTED_FORMATS",
        value_delimiter = ',',
        default_value = "epub,mobi,azw3,fb2,djvu,cbz,cbr"
    )]
    pub supported_formats: Vec<String>,

    /// Optional post-download hook, invoked with the temp file path
    #[clap(long, env = "CUSTOM_SCRIPT")]
    pub custom_script: Option<PathBuf>,

    /// Retry budget for metadata page fetches (kept for compatibility with
    /// upstream deployments; the pipeline itself retries per candidate URL)
    #[clap(env = "MAX_RETRY", default_value_t = 3)]
    pub max_retry: u32,

    /// Base backoff in seconds for metadata page fetches (see `max_retry`)
    #[clap(env = "DEFAULT_SLEEP", default_value_t = 5)]
    pub default_sleep: u64,

    /// Base URL for the partner fast-download endpoint
    #[clap(env = "AA_BASE_URL", default_value = "https://annas-archive.org")]
    pub aa_base_url: String,

    /// Subscription key; when set, a fast-download URL is tried first
    #[clap(long, env = "AA_DONATOR_KEY")]
    pub aa_donator_key: Option<String>,

    /// Calibre-Web database to authenticate against; unset disables auth
    #[clap(long, env = "CWA_DB_PATH")]
    pub cwa_db_path: Option<PathBuf>,
}

impl Config {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout)
    }
}

pub fn config() -> Config {
    Config::parse()
}
