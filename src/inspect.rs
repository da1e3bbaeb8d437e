//! Read-only report on a cache directory.
//!
//! Used by `chancache inspect` to check what a stopped (or running)
//! chancacher has left on disk without taking ownership of it.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chancache_codec::Decoder;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ChanCacherError, ChanCacherResult};
use crate::store::{cache_paths, list_quarantined, DirLock, QUARANTINE_DIR, READER_FILE, WRITER_FILE};

/// State of a cache directory.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub dir: PathBuf,
    /// A live chancacher owns the directory.
    pub locked: bool,
    pub files: Vec<CacheFileReport>,
    pub quarantined: Vec<QuarantinedFile>,
}

/// One of the two cache files.
#[derive(Debug, Clone, Serialize)]
pub struct CacheFileReport {
    pub name: String,
    pub bytes: u64,
    /// Records decoded before the end of file or the first error.
    pub records: u64,
    /// Why decoding stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A file moved aside after failing validation.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedFile {
    pub name: String,
    pub bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl CacheReport {
    /// Total bytes in the two cache files.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }

    /// Total decodable records in the two cache files.
    pub fn total_records(&self) -> u64 {
        self.files.iter().map(|f| f.records).sum()
    }

    pub fn is_healthy(&self) -> bool {
        self.files.iter().all(|f| f.error.is_none())
    }
}

/// Inspect `dir`, decoding each cache file as `T`.
pub fn inspect<T: DeserializeOwned>(dir: &Path) -> ChanCacherResult<CacheReport> {
    let meta = fs::metadata(dir).map_err(|e| ChanCacherError::io(dir, e))?;
    if !meta.is_dir() {
        return Err(ChanCacherError::InvalidCachePath(dir.to_path_buf()));
    }

    let locked = DirLock::is_held(dir).map_err(|e| ChanCacherError::io(dir, e))?;

    let mut files = Vec::with_capacity(2);
    for path in cache_paths(dir) {
        if path.exists() {
            files.push(inspect_file::<T>(&path)?);
        }
    }

    let qdir = dir.join(QUARANTINE_DIR);
    let mut quarantined = Vec::new();
    if qdir.is_dir() {
        for name in [READER_FILE, WRITER_FILE] {
            let paths = list_quarantined(&qdir, name).map_err(|e| ChanCacherError::io(&qdir, e))?;
            for path in paths {
                quarantined.push(quarantined_file(&path)?);
            }
        }
    }

    Ok(CacheReport {
        dir: dir.to_path_buf(),
        locked,
        files,
        quarantined,
    })
}

fn inspect_file<T: DeserializeOwned>(path: &Path) -> ChanCacherResult<CacheFileReport> {
    let file = File::open(path).map_err(|e| ChanCacherError::io(path, e))?;
    let bytes = file.metadata().map_err(|e| ChanCacherError::io(path, e))?.len();

    let mut dec = Decoder::new(file);
    let mut records = 0;
    let error = loop {
        match dec.decode::<T>() {
            Ok(Some(_)) => records += 1,
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };

    Ok(CacheFileReport {
        name: file_name(path),
        bytes,
        records,
        error,
    })
}

fn quarantined_file(path: &Path) -> ChanCacherResult<QuarantinedFile> {
    let meta = fs::metadata(path).map_err(|e| ChanCacherError::io(path, e))?;
    Ok(QuarantinedFile {
        name: file_name(path),
        bytes: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache: {}", self.dir.display())?;
        writeln!(f, "  Locked: {}", if self.locked { "yes" } else { "no" })?;
        for file in &self.files {
            write!(f, "  {}: {} bytes, {} records", file.name, file.bytes, file.records)?;
            if let Some(err) = &file.error {
                write!(f, " (unreadable after record {}: {})", file.records, err)?;
            }
            writeln!(f)?;
        }
        if self.quarantined.is_empty() {
            writeln!(f, "  Quarantined: none")?;
        } else {
            writeln!(f, "  Quarantined:")?;
            for q in &self.quarantined {
                let when = q
                    .modified
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                    .unwrap_or_else(|| "-".to_string());
                writeln!(f, "    {} ({} bytes, {})", q.name, q.bytes, when)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilePair;
    use chancache_codec::Encoder;
    use tempfile::TempDir;

    #[test]
    fn test_inspect_empty_dir() {
        let temp = TempDir::new().unwrap();
        let report = inspect::<u32>(temp.path()).unwrap();

        assert!(!report.locked);
        assert!(report.files.is_empty());
        assert!(report.quarantined.is_empty());
        assert!(report.is_healthy());
    }

    #[test]
    fn test_inspect_counts_records() {
        let temp = TempDir::new().unwrap();
        let mut enc = Encoder::new(File::create(temp.path().join(READER_FILE)).unwrap());
        for v in 0..5u32 {
            enc.encode(&v).unwrap();
        }
        drop(enc);
        fs::write(temp.path().join(WRITER_FILE), b"").unwrap();

        let report = inspect::<u32>(temp.path()).unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.total_records(), 5);
        assert!(report.total_bytes() > 0);
        assert!(report.is_healthy());
    }

    #[test]
    fn test_inspect_reports_corruption_and_quarantine() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(WRITER_FILE), b"notvalid").unwrap();
        {
            // the corrupt writer is shuffled into the reader slot and
            // quarantined from there
            let _pair = FilePair::open::<u32>(temp.path()).unwrap();
        }
        fs::write(temp.path().join(WRITER_FILE), b"still not valid at all").unwrap();

        let report = inspect::<u32>(temp.path()).unwrap();
        assert!(!report.is_healthy());
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.quarantined[0].name, "cache_a.1");
        assert!(report.quarantined[0].modified.is_some());

        let text = report.to_string();
        assert!(text.contains("cache_a.1"));
        assert!(text.contains("unreadable"));
    }

    #[test]
    fn test_inspect_sees_live_lock() {
        let temp = TempDir::new().unwrap();
        let _pair = FilePair::open::<u32>(temp.path()).unwrap();

        let report = inspect::<u32>(temp.path()).unwrap();
        assert!(report.locked);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["locked"], true);
    }

    #[test]
    fn test_inspect_rejects_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file");
        fs::write(&path, b"").unwrap();
        assert!(matches!(
            inspect::<u32>(&path),
            Err(ChanCacherError::InvalidCachePath(_))
        ));
    }
}
