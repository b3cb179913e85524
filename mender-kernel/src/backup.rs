/**
 * SOURCE TREE & BACKUPS - Worker sources, pre-fix copies and restore
 *
 * ROLE:
 * - Maps an app name reported by a worker to its source file
 *   (`<app>` itself, else `<app>.<ext>` for each configured extension).
 * - Takes byte-exact backups before a fix is applied. Backup names:
 *     worker-A.py.bkp                        first backup
 *     worker-A_20240101_120000.py.bkp        when the first name is taken
 *     worker-A_20240101_120000_1.py.bkp      same second, again taken
 *   Backup files are opened create-new, so an existing backup is never
 *   overwritten even if two writers race for a name.
 * - Restores the newest backup of an app on request. This is the manual
 *   rollback path; remediation itself never rolls back.
 */

use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

pub const BACKUP_SUFFIX: &str = ".bkp";

/// Counter attempts after the timestamped name is taken.
const MAX_COLLISIONS: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("invalid app name {0:?}")]
    InvalidName(String),
    #[error("no source file for app {0}")]
    SourceNotFound(String),
    #[error("no backup found for app {0}")]
    NoBackup(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no free backup name for {0}")]
    Exhausted(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io { path: path.to_path_buf(), source }
}

/// A backup file found in the source directory.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub file_name: String,
    /// File name the backup restores to.
    pub original: String,
    pub size: u64,
    /// RFC 3339 modification time.
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Restored {
    pub original: PathBuf,
    pub backup: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceTree {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl SourceTree {
    pub fn new<P: Into<PathBuf>>(dir: P, extensions: Vec<String>) -> Self {
        Self { dir: dir.into(), extensions }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names an app may be stored under, most specific first.
    fn candidate_names(&self, app: &str) -> Result<Vec<String>, BackupError> {
        let mut components = Path::new(app).components();
        let single_normal = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
        if app.trim().is_empty() || !single_normal || app.contains(['/', '\\', '\0']) {
            return Err(BackupError::InvalidName(app.to_string()));
        }
        let mut names = vec![app.to_string()];
        names.extend(self.extensions.iter().map(|ext| format!("{app}.{}", ext.trim_start_matches('.'))));
        Ok(names)
    }

    /// Source file of `app`, which must exist.
    pub async fn resolve(&self, app: &str) -> Result<PathBuf, BackupError> {
        for name in self.candidate_names(app)? {
            let path = self.dir.join(&name);
            if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                return Ok(path);
            }
        }
        Err(BackupError::SourceNotFound(app.to_string()))
    }

    /// Copies `original` to a fresh backup name and returns the backup path.
    pub async fn create_backup(&self, original: &Path) -> Result<PathBuf, BackupError> {
        let file_name = original
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackupError::InvalidName(original.display().to_string()))?;
        let parent = original.parent().unwrap_or(&self.dir);
        let mut src = File::open(original).await.map_err(io_err(original))?;

        for candidate in backup_names(file_name, OffsetDateTime::now_utc()) {
            let path = parent.join(&candidate);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut dst) => {
                    tokio::io::copy(&mut src, &mut dst).await.map_err(io_err(&path))?;
                    dst.flush().await.map_err(io_err(&path))?;
                    dst.sync_all().await.map_err(io_err(&path))?;
                    info!(original = %original.display(), backup = %path.display(), "backup created");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_err(&path)(e)),
            }
        }
        Err(BackupError::Exhausted(original.to_path_buf()))
    }

    /// Every `*.bkp` file of the directory, by file name.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        let mut backups = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err(&self.dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else { continue };
            let Some(original) = original_name_of(&file_name) else { continue };
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| OffsetDateTime::from(t).format(&time::format_description::well_known::Rfc3339).ok());
            backups.push(BackupInfo { file_name, original, size: meta.len(), modified });
        }

        backups.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(backups)
    }

    /// Copies the newest backup of `app` back over its source file.
    pub async fn restore_latest(&self, app: &str) -> Result<Restored, BackupError> {
        let names = self.candidate_names(app)?;
        let mut newest: Option<(std::time::SystemTime, PathBuf, String)> = None;

        for backup in self.list_backups().await? {
            if !names.contains(&backup.original) {
                continue;
            }
            let path = self.dir.join(&backup.file_name);
            let modified = fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map_err(io_err(&path))?;
            let newer = newest
                .as_ref()
                .map_or(true, |(t, p, _)| (modified, &path) > (*t, p));
            if newer {
                newest = Some((modified, path, backup.original));
            }
        }

        let (_, backup, original_name) = newest.ok_or_else(|| BackupError::NoBackup(app.to_string()))?;
        let original = self.dir.join(original_name);
        fs::copy(&backup, &original).await.map_err(io_err(&original))?;
        info!(backup = %backup.display(), original = %original.display(), "backup restored");
        Ok(Restored { original, backup })
    }
}

/// Backup names to try for `file_name`, in order.
pub fn backup_names(file_name: &str, at: OffsetDateTime) -> impl Iterator<Item = String> {
    let stamp = at
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (file_name.to_string(), String::new()),
    };

    let first = format!("{file_name}{BACKUP_SUFFIX}");
    let stamped = format!("{stem}_{stamp}{ext}{BACKUP_SUFFIX}");
    let counted = (1..=MAX_COLLISIONS).map(move |n| format!("{stem}_{stamp}_{n}{ext}{BACKUP_SUFFIX}"));
    [first, stamped].into_iter().chain(counted)
}

/// Byte offset where a trailing `_YYYYmmdd_HHMMSS` starts, if any.
fn stamp_start(stem: &str) -> Option<usize> {
    let cut = stem.len().checked_sub(16)?;
    let tail = &stem.as_bytes()[cut..];
    let shape = tail[0] == b'_'
        && tail[9] == b'_'
        && tail[1..9].iter().all(u8::is_ascii_digit)
        && tail[10..].iter().all(u8::is_ascii_digit);
    (shape && cut > 0).then_some(cut)
}

fn strip_stamp(stem: &str) -> Option<&str> {
    if let Some(cut) = stamp_start(stem) {
        return stem.get(..cut);
    }
    let (head, counter) = stem.rsplit_once('_')?;
    if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stamp_start(head).and_then(|cut| head.get(..cut))
}

/// File name a backup restores to, or `None` if `backup` is not a backup name.
pub fn original_name_of(backup: &str) -> Option<String> {
    let rest = backup.strip_suffix(BACKUP_SUFFIX)?;
    if rest.is_empty() {
        return None;
    }
    let (stem, ext) = match rest.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (rest, None),
    };
    let base = strip_stamp(stem).unwrap_or(stem);
    Some(match ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    })
}
