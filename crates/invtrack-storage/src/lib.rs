//! Tabular store adapter contract plus in-memory and file-backed sheets.
//!
//! Rows and columns are 1-based, matching the remote spreadsheet API the
//! feeds were written against. Blank cells read back as empty strings.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "invtrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("row index {0} is out of range (rows are 1-based)")]
    InvalidRow(usize),
    #[error("column index {0} is out of range (columns are 1-based)")]
    InvalidColumn(usize),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sheet file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("timed out after {waited:?} waiting for upsert lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

/// What `write_header_row` did to row 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOutcome {
    Unchanged,
    /// Sheet was empty; header became row 1.
    Initialized,
    /// Row 1 was an older header for the same schema and was replaced.
    Migrated,
    /// Row 1 held data; header was inserted above it.
    Inserted,
}

/// Exclusive right to run one read-modify-write against a sheet.
///
/// Dropping the lease releases it.
pub struct UpsertLease {
    guard: Option<Box<dyn Any + Send>>,
}

impl UpsertLease {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            guard: Some(Box::new(guard)),
        }
    }

    /// Lease for stores with no native locking. Callers must guarantee that
    /// no two upserts run against the same sheet at once.
    pub fn unguarded() -> Self {
        Self { guard: None }
    }

    pub fn is_exclusive(&self) -> bool {
        self.guard.is_some()
    }
}

impl fmt::Debug for UpsertLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsertLease")
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Every row's value in `column`, in row order.
    async fn column_values(&self, column: usize) -> Result<Vec<String>, StoreError>;

    /// Cells of `row`; trailing blanks may be omitted. Missing rows are empty.
    async fn row_values(&self, row: usize) -> Result<Vec<String>, StoreError>;

    /// Full-row overwrite.
    async fn write_row(&self, row: usize, values: &[String]) -> Result<(), StoreError>;

    /// Appends after the last populated row and returns the new row index.
    async fn append_row(&self, values: &[String]) -> Result<usize, StoreError>;

    async fn write_header_row(&self, values: &[String]) -> Result<HeaderOutcome, StoreError>;

    async fn lock_for_upsert(&self) -> Result<UpsertLease, StoreError> {
        Ok(UpsertLease::unguarded())
    }
}

/// Content fingerprint of a row, insensitive to trailing blank cells.
pub fn row_fingerprint(cells: &[String]) -> String {
    let populated = cells
        .iter()
        .rposition(|c| !c.is_empty())
        .map_or(0, |i| i + 1);
    let mut hasher = Sha256::new();
    for cell in &cells[..populated] {
        hasher.update(cell.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(hasher.finalize())
}

fn trim_trailing_blanks(mut cells: Vec<String>) -> Vec<String> {
    while cells.last().is_some_and(|c| c.is_empty()) {
        cells.pop();
    }
    cells
}

fn is_blank_row(cells: &[String]) -> bool {
    cells.iter().all(|c| c.is_empty())
}

// Shared grid semantics for the in-process sheet implementations.
fn grid_column(rows: &[Vec<String>], column: usize) -> Result<Vec<String>, StoreError> {
    if column == 0 {
        return Err(StoreError::InvalidColumn(column));
    }
    Ok(rows
        .iter()
        .map(|r| r.get(column - 1).cloned().unwrap_or_default())
        .collect())
}

fn grid_row(rows: &[Vec<String>], row: usize) -> Result<Vec<String>, StoreError> {
    if row == 0 {
        return Err(StoreError::InvalidRow(row));
    }
    Ok(rows
        .get(row - 1)
        .cloned()
        .map(trim_trailing_blanks)
        .unwrap_or_default())
}

fn grid_write(rows: &mut Vec<Vec<String>>, row: usize, values: &[String]) -> Result<(), StoreError> {
    if row == 0 {
        return Err(StoreError::InvalidRow(row));
    }
    if rows.len() < row {
        rows.resize_with(row, Vec::new);
    }
    rows[row - 1] = values.to_vec();
    Ok(())
}

fn grid_append(rows: &mut Vec<Vec<String>>, values: &[String]) -> usize {
    let populated = rows
        .iter()
        .rposition(|r| !is_blank_row(r))
        .map_or(0, |i| i + 1);
    rows.truncate(populated);
    rows.push(values.to_vec());
    rows.len()
}

fn grid_header(rows: &mut Vec<Vec<String>>, header: &[String]) -> HeaderOutcome {
    let Some(first) = rows.first_mut() else {
        rows.push(header.to_vec());
        return HeaderOutcome::Initialized;
    };
    if is_blank_row(first) {
        *first = header.to_vec();
        return HeaderOutcome::Initialized;
    }
    let current = trim_trailing_blanks(first.clone());
    if current.as_slice() == trim_trailing_blanks(header.to_vec()).as_slice() {
        return HeaderOutcome::Unchanged;
    }
    if first.first() == header.first() {
        *first = header.to_vec();
        return HeaderOutcome::Migrated;
    }
    rows.insert(0, header.to_vec());
    HeaderOutcome::Inserted
}

/// Process-local sheet; upserts are serialized by an async gate.
#[derive(Debug, Default)]
pub struct MemorySheet {
    rows: Mutex<Vec<Vec<String>>>,
    upsert_gate: Arc<Mutex<()>>,
    offline: AtomicBool,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<I, R, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(Into::into).collect())
            .collect();
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    /// Raw grid contents, untrimmed.
    pub async fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().await.clone()
    }

    /// Simulates the backing service going away; every call then fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory sheet is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TabularStore for MemorySheet {
    async fn column_values(&self, column: usize) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        grid_column(&self.rows.lock().await, column)
    }

    async fn row_values(&self, row: usize) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        grid_row(&self.rows.lock().await, row)
    }

    async fn write_row(&self, row: usize, values: &[String]) -> Result<(), StoreError> {
        self.check_online()?;
        grid_write(&mut *self.rows.lock().await, row, values)
    }

    async fn append_row(&self, values: &[String]) -> Result<usize, StoreError> {
        self.check_online()?;
        Ok(grid_append(&mut *self.rows.lock().await, values))
    }

    async fn write_header_row(&self, values: &[String]) -> Result<HeaderOutcome, StoreError> {
        self.check_online()?;
        Ok(grid_header(&mut *self.rows.lock().await, values))
    }

    async fn lock_for_upsert(&self) -> Result<UpsertLease, StoreError> {
        self.check_online()?;
        let guard = self.upsert_gate.clone().lock_owned().await;
        Ok(UpsertLease::new(guard))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub timeout: Duration,
    /// A lock file older than this is assumed abandoned by a crashed run.
    pub stale_after: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Exclusive lock file, removed when dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub async fn acquire(path: impl Into<PathBuf>, policy: LockPolicy) -> Result<Self, StoreError> {
        let path = path.into();
        let started = tokio::time::Instant::now();
        let mut attempt = 0usize;

        loop {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let owner = format!("pid={} lease={}\n", std::process::id(), Uuid::new_v4());
                    file.write_all(owner.as_bytes())
                        .await
                        .map_err(|e| StoreError::io(format!("writing lock file {}", path.display()), e))?;
                    debug!(path = %path.display(), attempt, "acquired upsert lock");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(owner) = stale_lock_owner(&path, policy.stale_after).await {
                        if reclaim_stale_lock(&path, &owner).await {
                            continue;
                        }
                    }
                    let waited = started.elapsed();
                    if waited >= policy.timeout {
                        return Err(StoreError::LockTimeout { path, waited });
                    }
                    let delay = policy
                        .backoff
                        .delay_for_attempt(attempt)
                        .min(policy.timeout - waited);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(StoreError::io(
                        format!("creating lock file {}", path.display()),
                        err,
                    ))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "could not release upsert lock");
            }
        }
    }
}

/// Contents of the lock file at `path` if it is older than `stale_after`.
async fn stale_lock_owner(path: &Path, stale_after: Duration) -> Option<Vec<u8>> {
    let meta = fs::metadata(path).await.ok()?;
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())?;
    if age < stale_after {
        return None;
    }
    fs::read(path).await.ok()
}

/// Moves the stale lock aside and deletes it only if it still holds the
/// owner line seen when it was judged stale. A lock created in between by
/// another process is put back.
async fn reclaim_stale_lock(path: &Path, observed_owner: &[u8]) -> bool {
    let mut aside_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    aside_name.push(format!(".{}.stale", Uuid::new_v4()));
    let aside = path.with_file_name(aside_name);

    match fs::rename(path, &aside).await {
        Ok(()) => {}
        // another process reclaimed it first
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return false,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not move stale upsert lock aside");
            return false;
        }
    }

    let moved = fs::read(&aside).await.ok();
    let reclaimed = moved.as_deref() == Some(observed_owner);
    if reclaimed {
        warn!(path = %path.display(), "reclaimed stale upsert lock");
    } else if let Err(err) = fs::hard_link(&aside, path).await {
        warn!(path = %path.display(), error = %err, "could not restore a live upsert lock");
    }
    if let Err(err) = fs::remove_file(&aside).await {
        warn!(path = %aside.display(), error = %err, "could not remove displaced lock file");
    }
    reclaimed
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SheetFile {
    rows: Vec<Vec<String>>,
}

/// Sheet persisted as a JSON document; every mutation is an atomic
/// temp-file rename, and upserts serialize across processes via a lock file.
#[derive(Debug, Clone)]
pub struct FileSheet {
    path: PathBuf,
    lock_policy: LockPolicy,
}

impl FileSheet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    async fn load(&self) -> Result<Vec<Vec<String>>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let file: SheetFile =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: self.path.clone(),
                        source,
                    })?;
                Ok(file.rows)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StoreError::io(format!("reading {}", self.path.display()), err)),
        }
    }

    async fn save(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(format!("creating sheet directory {}", parent.display()), e))?;

        let bytes = serde_json::to_vec_pretty(&SheetFile { rows }).map_err(|source| {
            StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomically(parent, &self.path, &bytes).await
    }
}

/// Writes `bytes` to a temp file beside `target` and renames it into place.
/// The temp file never outlives a failed attempt.
async fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(format!("opening temp sheet file {}", temp_path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing temp sheet file {}", temp_path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(format!("flushing temp sheet file {}", temp_path.display()), e))?;
        drop(file);

        fs::rename(&temp_path, target).await.map_err(|e| {
            StoreError::io(
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    target.display()
                ),
                e,
            )
        })
    }
    .await;

    if result.is_err() {
        match fs::remove_file(&temp_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %temp_path.display(), error = %err, "could not remove temp sheet file")
            }
        }
    }
    result
}

#[async_trait]
impl TabularStore for FileSheet {
    async fn column_values(&self, column: usize) -> Result<Vec<String>, StoreError> {
        grid_column(&self.load().await?, column)
    }

    async fn row_values(&self, row: usize) -> Result<Vec<String>, StoreError> {
        grid_row(&self.load().await?, row)
    }

    async fn write_row(&self, row: usize, values: &[String]) -> Result<(), StoreError> {
        let mut rows = self.load().await?;
        grid_write(&mut rows, row, values)?;
        self.save(rows).await
    }

    async fn append_row(&self, values: &[String]) -> Result<usize, StoreError> {
        let mut rows = self.load().await?;
        let index = grid_append(&mut rows, values);
        self.save(rows).await?;
        Ok(index)
    }

    async fn write_header_row(&self, values: &[String]) -> Result<HeaderOutcome, StoreError> {
        let mut rows = self.load().await?;
        let outcome = grid_header(&mut rows, values);
        if outcome != HeaderOutcome::Unchanged {
            self.save(rows).await?;
        }
        Ok(outcome)
    }

    async fn lock_for_upsert(&self) -> Result<UpsertLease, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(format!("creating sheet directory {}", parent.display()), e))?;
        }
        let lock = LockFile::acquire(self.lock_path(), self.lock_policy).await?;
        Ok(UpsertLease::new(lock))
    }
}
