//! Cache directory ownership and the on-disk file pair.
//!
//! A cache directory holds:
//! - `cache_a`, `cache_b`: the two halves of the double buffer
//! - `lock`: advisory lock held by the owning chancacher
//! - `quarantine/`: cache files that failed validation, created on demand
//! - `merge*`: transient files from startup recovery
//!
//! ## Opening
//!
//! [`FilePair::open`] takes the directory lock, cleans up after interrupted
//! merges, shuffles or merges leftover data into the reader slot, then opens
//! both files and decodes each end to end. A file that cannot be opened for
//! lack of permission, or that does not decode, is quarantined and replaced
//! with an empty one.

mod lock;
mod quarantine;
mod recovery;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chancache_codec::{CountingFile, Decoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{ChanCacherError, ChanCacherResult};

pub use lock::{DirLock, LockError, LockResult};
pub use quarantine::{list_quarantined, next_quarantine_name, quarantine_cache};
pub use recovery::{merge, recover_pair, remove_detritus, Recovery};

/// Permissions on cache directories
pub const CACHE_DIR_PERM: u32 = 0o750;

/// Permissions on cache files
pub const CACHE_FILE_PERM: u32 = 0o640;

/// File drained first after startup
pub const READER_FILE: &str = "cache_a";

/// File receiving spilled values after startup
pub const WRITER_FILE: &str = "cache_b";

/// Subdirectory for unreadable cache files
pub const QUARANTINE_DIR: &str = "quarantine";

/// Name prefix of temporary merge files
pub const MERGE_PREFIX: &str = "merge";

/// The two cache files of a directory, opened, validated and locked.
#[derive(Debug)]
pub struct FilePair {
    /// Positioned at the start, ready to drain.
    pub reader: CountingFile,
    /// Positioned at the end, ready to append.
    pub writer: CountingFile,
    /// Held until the owning chancacher tears down.
    pub lock: DirLock,
    pub recovery: Recovery,
}

impl FilePair {
    /// Take ownership of `dir` and open its cache files.
    ///
    /// `T` is the value type stored in the files; a file holding anything
    /// else fails validation and is quarantined.
    pub fn open<T>(dir: &Path) -> ChanCacherResult<Self>
    where
        T: Serialize + DeserializeOwned,
    {
        check_cache_dir(dir)?;
        create_dir(dir).map_err(|e| ChanCacherError::io(dir, e))?;

        let lock = DirLock::try_acquire(dir)?;

        remove_detritus(dir)?;

        let reader_path = dir.join(READER_FILE);
        let writer_path = dir.join(WRITER_FILE);
        let recovery = recover_pair::<T>(&reader_path, &writer_path)?;

        let reader = open_cache::<T>(&reader_path)?;
        let writer = open_cache::<T>(&writer_path)?;

        let reader = CountingFile::new(reader).map_err(|e| ChanCacherError::io(&reader_path, e))?;
        let mut writer =
            CountingFile::new(writer).map_err(|e| ChanCacherError::io(&writer_path, e))?;
        writer
            .seek(SeekFrom::End(0))
            .map_err(|e| ChanCacherError::io(&writer_path, e))?;

        debug!(
            dir = %dir.display(),
            reader_bytes = reader.count(),
            writer_bytes = writer.count(),
            ?recovery,
            "opened cache files"
        );

        Ok(Self {
            reader,
            writer,
            lock,
            recovery,
        })
    }
}

/// Fail if `dir` exists but is not a directory.
pub fn check_cache_dir(dir: &Path) -> ChanCacherResult<()> {
    match fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => Err(ChanCacherError::InvalidCachePath(dir.to_path_buf())),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChanCacherError::io(dir, e)),
    }
}

/// Create `dir` and its parents with [`CACHE_DIR_PERM`].
pub fn create_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(CACHE_DIR_PERM);
    }
    builder.create(dir)
}

/// Open or create a cache file read-write with [`CACHE_FILE_PERM`].
pub fn open_cache_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(CACHE_FILE_PERM);
    }
    options.open(path)
}

/// Open a cache file and prove it decodes, quarantining it if not.
///
/// The returned file is positioned at its start.
pub fn open_cache<T>(path: &Path) -> ChanCacherResult<File>
where
    T: DeserializeOwned,
{
    let mut file = match open_cache_file(path) {
        Ok(file) => file,
        Err(e) => {
            error!(cache = %path.display(), error = %e, "failed to open cache file");
            if e.kind() == io::ErrorKind::PermissionDenied {
                return quarantine_cache(path);
            }
            return Err(ChanCacherError::io(path, e));
        }
    };

    match validate::<T>(&mut file) {
        Ok(records) => {
            debug!(cache = %path.display(), records, "validated cache file");
            Ok(file)
        }
        Err(e) => {
            drop(file);
            error!(cache = %path.display(), error = %e, "cannot parse cache file");
            quarantine_cache(path)
        }
    }
}

fn validate<T: DeserializeOwned>(file: &mut File) -> Result<u64, chancache_codec::CodecError> {
    let records = Decoder::new(&mut *file).validate::<T>()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(records)
}

/// Paths of the two cache files under `dir`, reader slot first.
pub fn cache_paths(dir: &Path) -> [PathBuf; 2] {
    [dir.join(READER_FILE), dir.join(WRITER_FILE)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chancache_codec::Encoder;
    use tempfile::TempDir;

    fn write_values(path: &Path, values: &[u32]) {
        let mut enc = Encoder::new(File::create(path).unwrap());
        for v in values {
            enc.encode(v).unwrap();
        }
    }

    #[test]
    fn test_open_creates_layout() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("cache");

        let pair = FilePair::open::<u32>(&dir).unwrap();

        assert!(dir.join(READER_FILE).exists());
        assert!(dir.join(WRITER_FILE).exists());
        assert!(dir.join(DirLock::LOCK_FILENAME).exists());
        assert!(!dir.join(QUARANTINE_DIR).exists());
        assert_eq!(pair.reader.count(), 0);
        assert_eq!(pair.writer.count(), 0);
        assert_eq!(pair.recovery, Recovery::Untouched);
    }

    #[test]
    #[cfg(unix)]
    fn test_open_applies_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cache");
        let _pair = FilePair::open::<u32>(&dir).unwrap();

        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(dir.join(READER_FILE)).unwrap().permissions().mode() & 0o777;
        // umask may strip bits but never adds them
        assert_eq!(dir_mode & !CACHE_DIR_PERM, 0);
        assert_eq!(file_mode & !CACHE_FILE_PERM, 0);
    }

    #[test]
    fn test_open_rejects_file_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("not_a_dir");
        fs::write(&path, b"x").unwrap();

        let err = FilePair::open::<u32>(&path).unwrap_err();
        assert!(matches!(err, ChanCacherError::InvalidCachePath(_)));
    }

    #[test]
    fn test_open_twice_fails_on_lock() {
        let temp = TempDir::new().unwrap();
        let _first = FilePair::open::<u32>(temp.path()).unwrap();

        let err = FilePair::open::<u32>(temp.path()).unwrap_err();
        assert!(matches!(err, ChanCacherError::Lock(LockError::Held(_))));
    }

    #[test]
    fn test_open_quarantines_corrupt_reader() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(READER_FILE), b"notvalid").unwrap();

        let pair = FilePair::open::<u32>(temp.path()).unwrap();

        assert_eq!(pair.reader.count(), 0);
        let moved = temp.path().join(QUARANTINE_DIR).join("cache_a.1");
        assert_eq!(fs::read(moved).unwrap(), b"notvalid");
    }

    #[test]
    fn test_open_quarantines_wrong_value_type() {
        let temp = TempDir::new().unwrap();
        let mut enc = Encoder::new(File::create(temp.path().join(READER_FILE)).unwrap());
        enc.encode("a string, not a number").unwrap();
        drop(enc);

        let pair = FilePair::open::<u32>(temp.path()).unwrap();
        assert_eq!(pair.reader.count(), 0);
        assert!(temp.path().join(QUARANTINE_DIR).join("cache_a.1").exists());
    }

    #[test]
    fn test_open_positions_writer_at_end() {
        let temp = TempDir::new().unwrap();
        // A corrupt reader stops the merge, leaving data in the writer.
        fs::write(temp.path().join(READER_FILE), b"notvalid").unwrap();
        write_values(&temp.path().join(WRITER_FILE), &[1, 2, 3]);

        let mut pair = FilePair::open::<u32>(temp.path()).unwrap();
        assert_eq!(pair.recovery, Recovery::MergeAbandoned);
        let len = pair.writer.len().unwrap();
        assert!(len > 0);
        assert_eq!(pair.writer.count(), len);
        assert_eq!(pair.writer.stream_position().unwrap(), len);
    }

    #[test]
    fn test_open_merges_populated_pair() {
        let temp = TempDir::new().unwrap();
        write_values(&temp.path().join(READER_FILE), &[1, 2]);
        write_values(&temp.path().join(WRITER_FILE), &[3]);

        let pair = FilePair::open::<u32>(temp.path()).unwrap();
        assert_eq!(pair.recovery, Recovery::Merged { records: 3 });
        assert!(pair.reader.count() > 0);
        assert_eq!(pair.writer.count(), 0);

        let mut dec = Decoder::new(pair.reader);
        assert_eq!(dec.validate::<u32>().unwrap(), 3);
    }

    #[test]
    #[cfg(unix)]
    fn test_open_quarantines_unreadable_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let reader = temp.path().join(READER_FILE);
        fs::write(&reader, b"").unwrap();
        fs::set_permissions(&reader, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&reader).is_ok() {
            // running with CAP_DAC_OVERRIDE, permissions are not enforced
            return;
        }

        let _pair = FilePair::open::<u32>(temp.path()).unwrap();
        assert!(temp.path().join(QUARANTINE_DIR).join("cache_a.1").exists());
        assert!(File::open(&reader).is_ok());
    }
}
