//! Minidump discovery and lifecycle
//!
//! The native crash facility writes dumps to one of two layouts:
//!
//! - **crashpad**: finished dumps are moved into `completed/` (`reports/` on
//!   Windows, plus `pending/` on macOS); a `metadata` database file sits in
//!   the crash directory.
//! - **breakpad**: dumps sit directly in the crash directory, each wrapped in
//!   a multipart upload body, next to `*.txt` metadata files.
//!
//! A path returned by [`MinidumpLoader::discover`] is claimed until it is
//! released with [`MinidumpLoader::mark_delivered`] or
//! [`MinidumpLoader::delete`]; overlapping discovery passes skip it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use crashrelay_core::config::{CrashLayout, MinidumpConfig};
use crashrelay_core::domain::Attachment;
use tracing::{debug, info, warn};

use crate::parser::{self, ParsedMinidump};
use crate::MinidumpError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_SETTLE_WAIT: Duration = Duration::from_secs(5);

const MULTIPART_BINARY_MARKER: &[u8] = b"Content-Type: application/octet-stream";
const MULTIPART_BOUNDARY: &[u8] = b"----------------------------";

/// Loader tuning
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub crashes_dir: PathBuf,
    pub layout: CrashLayout,
    /// Dumps last modified before `now - max_age` are deleted unseen
    pub max_age: Duration,
    /// A dump must be unmodified for this long before it is read
    pub settle: Duration,
    pub retry_delay: Duration,
    pub max_settle_wait: Duration,
}

impl From<&MinidumpConfig> for LoaderOptions {
    fn from(config: &MinidumpConfig) -> Self {
        Self {
            crashes_dir: config.crashes_dir.clone(),
            layout: config.layout,
            max_age: DAY * config.max_age_days,
            settle: Duration::from_millis(config.settle_ms),
            retry_delay: RETRY_DELAY,
            max_settle_wait: MAX_SETTLE_WAIT,
        }
    }
}

/// A dump file on disk, claimed by the loader
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrashDump {
    path: PathBuf,
    layout: CrashLayout,
    modified: SystemTime,
}

impl CrashDump {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the crash facility last wrote the dump, as seen at discovery
    pub fn modified_date(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }

    /// File name used for the attachment
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "minidump.dmp".to_string())
    }

    /// Reads the dump bytes, unwrapping breakpad multipart bodies
    pub async fn load(&self) -> Result<Vec<u8>, MinidumpError> {
        let file = tokio::fs::read(&self.path).await?;
        Ok(match self.layout {
            CrashLayout::Breakpad => minidump_from_multipart(&file).to_vec(),
            CrashLayout::Crashpad => file,
        })
    }
}

/// A dump that has settled and passed validation
#[derive(Debug, Clone)]
pub struct LoadedDump {
    pub dump: CrashDump,
    pub parsed: ParsedMinidump,
    pub data: Vec<u8>,
}

impl LoadedDump {
    /// Converts the dump into a minidump attachment
    pub fn to_attachment(&self) -> Attachment {
        Attachment::minidump(self.dump.filename(), self.data.clone())
    }
}

/// Discovers dump files and tracks which ones are in flight
pub struct MinidumpLoader {
    options: LoaderOptions,
    known: Mutex<HashSet<PathBuf>>,
}

impl MinidumpLoader {
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Returns dumps that are not yet claimed, claiming them.
    ///
    /// Dumps older than the maximum age are deleted and never returned.
    pub async fn discover(&self) -> Vec<CrashDump> {
        self.remove_orphaned_metadata().await;

        let mut found = Vec::new();
        for path in self.candidate_paths().await {
            if !self.claim(&path) {
                continue;
            }

            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat minidump");
                    self.release(&path);
                    continue;
                }
            };

            if is_older_than(modified, self.options.max_age) {
                info!(path = %path.display(), "Deleting minidump older than maximum age");
                remove_file(&path).await;
                self.release(&path);
                continue;
            }

            debug!(path = %path.display(), "Found minidump");
            found.push(CrashDump {
                path,
                layout: self.options.layout,
                modified,
            });
        }
        found
    }

    /// Waits for the dump to stop changing, then reads and validates it.
    ///
    /// The dump stays claimed whatever the outcome; the caller decides
    /// whether to deliver or delete it.
    pub async fn load(&self, dump: &CrashDump) -> Result<LoadedDump, MinidumpError> {
        let max_retries = (self.options.max_settle_wait.as_millis()
            / self.options.retry_delay.as_millis().max(1)) as u32;

        let mut retries = 0;
        loop {
            let modified = tokio::fs::metadata(&dump.path).await?.modified()?;
            if is_older_than(modified, self.options.settle) {
                break;
            }
            if retries >= max_retries {
                warn!(path = %dump.path.display(), "Timed out waiting for minidump to stop being modified");
                return Err(MinidumpError::StillWriting(dump.path.clone()));
            }
            debug!(
                path = %dump.path.display(),
                "Minidump modified in the last {:?}, waiting", self.options.settle
            );
            retries += 1;
            tokio::time::sleep(self.options.retry_delay).await;
        }

        let data = dump.load().await?;
        let parsed = parser::parse(&data)?;
        Ok(LoadedDump {
            dump: dump.clone(),
            parsed,
            data,
        })
    }

    /// Releases a dump after successful delivery and unlinks it
    pub async fn mark_delivered(&self, dump: &CrashDump) {
        debug!(path = %dump.path.display(), "Minidump delivered");
        remove_file(&dump.path).await;
        self.release(&dump.path);
    }

    /// Releases a dump without delivering it and unlinks it
    pub async fn delete(&self, dump: &CrashDump) {
        debug!(path = %dump.path.display(), "Minidump discarded");
        remove_file(&dump.path).await;
        self.release(&dump.path);
    }

    /// Removes crash-facility metadata files that are not dumps.
    ///
    /// Returns how many were removed.
    pub async fn remove_orphaned_metadata(&self) -> usize {
        let dir = &self.options.crashes_dir;
        match self.options.layout {
            CrashLayout::Crashpad => {
                let metadata = dir.join("metadata");
                match tokio::fs::remove_file(&metadata).await {
                    Ok(()) => {
                        debug!(path = %metadata.display(), "Deleted crashpad metadata file");
                        1
                    }
                    Err(_) => 0,
                }
            }
            CrashLayout::Breakpad => {
                let mut removed = 0;
                for path in list_dir(dir).await {
                    let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                    let Some(name) = name else { continue };
                    if name.ends_with(".txt") && !name.ends_with("log.txt") {
                        remove_file(&path).await;
                        removed += 1;
                    }
                }
                removed
            }
        }
    }

    /// Number of currently claimed paths
    pub fn in_flight(&self) -> usize {
        self.known().len()
    }

    async fn candidate_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for dir in self.dump_dirs() {
            paths.extend(
                list_dir(&dir)
                    .await
                    .into_iter()
                    .filter(|p| p.extension().is_some_and(|e| e == "dmp")),
            );
        }
        paths.sort();
        paths
    }

    fn dump_dirs(&self) -> Vec<PathBuf> {
        let dir = &self.options.crashes_dir;
        match self.options.layout {
            CrashLayout::Breakpad => vec![dir.clone()],
            CrashLayout::Crashpad => {
                let sub = if cfg!(windows) { "reports" } else { "completed" };
                let mut dirs = vec![dir.join(sub)];
                if cfg!(target_os = "macos") {
                    dirs.push(dir.join("pending"));
                }
                dirs
            }
        }
    }

    fn known(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, path: &Path) -> bool {
        self.known().insert(path.to_path_buf())
    }

    fn release(&self, path: &Path) {
        self.known().remove(path);
    }
}

fn is_older_than(time: SystemTime, age: Duration) -> bool {
    SystemTime::now()
        .duration_since(time)
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false)
}

async fn list_dir(dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return paths;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            paths.push(entry.path());
        }
    }
    paths
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not delete file");
        }
    }
}

/// Cuts the dump out of a breakpad multipart upload body.
///
/// The dump starts at the first `MDMP` after the last binary part header and
/// ends at the last boundary. Returns the input unchanged if either is missing.
pub fn minidump_from_multipart(file: &[u8]) -> &[u8] {
    let Some(binary_start) = rfind(file, MULTIPART_BINARY_MARKER) else {
        return file;
    };
    let Some(dump_start) = find(&file[binary_start..], parser::SIGNATURE).map(|i| i + binary_start)
    else {
        return file;
    };
    match rfind(file, MULTIPART_BOUNDARY) {
        Some(dump_end) if dump_end > dump_start => &file[dump_start..dump_end],
        _ => file,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
