//! Startup recovery for the cache file pair.
//!
//! A clean shutdown leaves at most one of the two files with data in it.
//! A crash can leave both populated, or leave a half-written merge file
//! behind. Before the pair is opened:
//! 1. leftover `merge*` files are deleted
//! 2. a lone populated writer file is renamed into the reader slot
//! 3. two populated files are merged, reader contents first, into the
//!    reader slot

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use chancache_codec::{CodecError, CodecResult, Decoder, Encoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CACHE_FILE_PERM, MERGE_PREFIX};
use crate::error::{ChanCacherError, ChanCacherResult};

/// What recovery did to the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Neither file held data, or only the reader did.
    Untouched,
    /// The writer held all the data and was renamed into the reader slot.
    Shuffled,
    /// Both held data and were merged into the reader slot.
    Merged { records: u64 },
    /// Both held data but merging failed; both were left in place.
    MergeAbandoned,
}

/// Delete `merge*` files left in `dir` by a merge that never finished.
pub fn remove_detritus(dir: &Path) -> ChanCacherResult<usize> {
    let mut removed = 0;
    let entries = fs::read_dir(dir).map_err(|e| ChanCacherError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ChanCacherError::io(dir, e))?;
        if !entry.file_name().to_string_lossy().starts_with(MERGE_PREFIX) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(file = %path.display(), "removed leftover merge file");
                removed += 1;
            }
            Err(e) => warn!(file = %path.display(), error = %e, "failed to remove leftover merge file"),
        }
    }
    Ok(removed)
}

/// Shuffle or merge the pair so that at most the reader holds data.
pub fn recover_pair<T>(reader_path: &Path, writer_path: &Path) -> ChanCacherResult<Recovery>
where
    T: Serialize + DeserializeOwned,
{
    let size_r = file_size(reader_path);
    let size_w = file_size(writer_path);

    if size_w == 0 {
        return Ok(Recovery::Untouched);
    }

    if size_r == 0 {
        fs::rename(writer_path, reader_path).map_err(|e| ChanCacherError::io(writer_path, e))?;
        info!(from = %writer_path.display(), to = %reader_path.display(), "moved cached data into reader slot");
        return Ok(Recovery::Shuffled);
    }

    match merge::<T>(reader_path, writer_path) {
        Ok(records) => {
            info!(cache = %reader_path.display(), records, "merged cache files");
            Ok(Recovery::Merged { records })
        }
        Err(e) => {
            // Both files stay as they are; validation decides what survives
            // and the writer drains after the reader.
            warn!(
                a = %reader_path.display(),
                b = %writer_path.display(),
                error = %e,
                "failed to merge cache files, leaving both in place"
            );
            Ok(Recovery::MergeAbandoned)
        }
    }
}

/// Merge the records of `a` then `b` into `a`, and delete `b`.
///
/// The merged stream is built in a `merge*` temp file and renamed over `a`,
/// so a crash at any point leaves either the original pair or the merged
/// file in place.
pub fn merge<T>(a: &Path, b: &Path) -> CodecResult<u64>
where
    T: Serialize + DeserializeOwned,
{
    let dir = a.parent().unwrap_or_else(|| Path::new("."));
    let mut builder = tempfile::Builder::new();
    builder.prefix(MERGE_PREFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(CACHE_FILE_PERM));
    }
    let mut temp = builder.tempfile_in(dir)?;

    let mut records = 0;
    {
        let mut enc = Encoder::new(BufWriter::new(temp.as_file_mut()));
        for path in [a, b] {
            let mut dec = Decoder::new(fs::File::open(path)?);
            while let Some(value) = dec.decode::<T>()? {
                enc.encode(&value)?;
                records += 1;
            }
        }
        enc.flush()?;
    }
    temp.as_file().sync_all()?;

    temp.persist(a).map_err(|e| CodecError::Io(e.error))?;
    if let Err(e) = fs::remove_file(b) {
        // `a` already has everything; a surviving `b` replays on next start.
        warn!(cache = %b.display(), error = %e, "failed to remove merged cache file");
    }
    Ok(records)
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_values(path: &Path, values: &[u32]) {
        let mut enc = Encoder::new(fs::File::create(path).unwrap());
        for v in values {
            enc.encode(v).unwrap();
        }
    }

    fn read_values(path: &Path) -> Vec<u32> {
        let mut dec = Decoder::new(fs::File::open(path).unwrap());
        let mut out = Vec::new();
        while let Some(v) = dec.decode::<u32>().unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn test_detritus_removed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("merge12345"), b"junk").unwrap();
        fs::write(dir.path().join("mergeXYZ"), b"").unwrap();
        fs::write(dir.path().join("cache_a"), b"").unwrap();

        assert_eq!(remove_detritus(dir.path()).unwrap(), 2);
        assert!(!dir.path().join("merge12345").exists());
        assert!(dir.path().join("cache_a").exists());
    }

    #[test]
    fn test_empty_pair_untouched() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("cache_a");
        let b = dir.path().join("cache_b");

        assert_eq!(recover_pair::<u32>(&a, &b).unwrap(), Recovery::Untouched);
    }

    #[test]
    fn test_lone_writer_shuffled_into_reader() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("cache_a");
        let b = dir.path().join("cache_b");
        write_values(&b, &[1, 2, 3]);

        assert_eq!(recover_pair::<u32>(&a, &b).unwrap(), Recovery::Shuffled);
        assert_eq!(read_values(&a), vec![1, 2, 3]);
        assert!(!b.exists());
    }

    #[test]
    fn test_both_populated_merged_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("cache_a");
        let b = dir.path().join("cache_b");
        write_values(&a, &[1, 2]);
        write_values(&b, &[3, 4, 5]);

        assert_eq!(
            recover_pair::<u32>(&a, &b).unwrap(),
            Recovery::Merged { records: 5 }
        );
        assert_eq!(read_values(&a), vec![1, 2, 3, 4, 5]);
        assert!(!b.exists());
        assert_eq!(remove_detritus(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_half_abandons_merge() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("cache_a");
        let b = dir.path().join("cache_b");
        write_values(&a, &[1, 2]);
        fs::write(&b, b"notvalid").unwrap();

        assert_eq!(
            recover_pair::<u32>(&a, &b).unwrap(),
            Recovery::MergeAbandoned
        );
        assert_eq!(read_values(&a), vec![1, 2]);
        assert_eq!(fs::read(&b).unwrap(), b"notvalid");
        assert_eq!(remove_detritus(dir.path()).unwrap(), 0);
    }
}
