//! Debug file log: timestamped lines appended to `swap.log` when enabled.
//!
//! Every line is also mirrored to `tracing` at debug level so that the same
//! trail is visible with `RUST_LOG=debug` even when the file is off.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

const SEPARATOR: &str =
    "================================================================================";

/// Cheap to clone; clones share the same file lock.
#[derive(Clone, Debug)]
pub struct DebugLog {
    path: PathBuf,
    enabled: bool,
    write_lock: Arc<Mutex<()>>,
}

impl DebugLog {
    pub fn new<P: AsRef<Path>>(path: P, enabled: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            enabled,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Logger that never touches the filesystem.
    pub fn disabled() -> Self {
        Self::new("swap.log", false)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fire-and-forget: write failures are reported through tracing only.
    ///
    /// The append is a synchronous write on the calling thread, async
    /// workers included. It only happens in debug mode, one short line at a
    /// time.
    pub fn log<S: AsRef<str>>(&self, message: S) {
        let message = message.as_ref();
        debug!(target: "swap_log", "{}", message);
        if !self.enabled {
            return;
        }

        let line = format!("[{}] {}\n", chrono::Utc::now().to_rfc3339(), message);
        // Held across open+write so lines from concurrent tasks stay whole.
        let _guard = self.write_lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to append to debug log");
        }
    }

    /// Visual break between runs.
    pub fn log_end(&self) {
        if !self.enabled {
            return;
        }
        for _ in 0..3 {
            self.log(SEPARATOR);
            self.log("\n");
        }
    }
}
