//! Default configuration values

/// Maximum number of download attempts per source
pub const MAX_DOWNLOAD_RETRIES: u32 = 3;

/// Base delay for download backoff (in milliseconds)
pub const DOWNLOAD_BACKOFF_MS: u64 = 1000;

/// Upper bound for the download backoff delay (in milliseconds)
pub const MAX_DOWNLOAD_BACKOFF_MS: u64 = 30_000;

/// Default number of formulas installed concurrently
pub const DEFAULT_WORKERS: usize = 2;

/// `PATH` entries appended after dependency `bin` directories
pub const BASE_PATH: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Library directories searched after every dependency
pub const SYSTEM_LIB_PATHS: &[&str] = &["/usr/lib"];

/// `SOURCE_DATE_EPOCH` for reproducible timestamps (1980-01-01, the ZIP epoch)
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Directory of kegs under the install root
pub const CELLAR_DIR: &str = "Cellar";

/// Directory of `opt/<name>` links under the install root
pub const OPT_DIR: &str = "opt";

/// Receipt written into every keg
pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";
