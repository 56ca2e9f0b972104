// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Total-size quota enforcement over the recording root.
//!
//! Runs after every finalization: oldest segments (by last write time) are
//! deleted, together with their sidecars and index rows, until the total size
//! of `*.opus` files fits the budget. The currently open segment is never
//! evicted, so a single recording larger than the quota survives.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tsrec_index::RecordingIndex;

use crate::segment::{self, AUDIO_EXT};

struct Candidate {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Deletes oldest recordings until the total is at or under `limit_bytes`.
///
/// `current_file_id` protects the open segment from eviction.
pub fn enforce(
    root: &Path,
    limit_bytes: u64,
    index: &RecordingIndex,
    bot_id: i64,
    current_file_id: Option<&str>,
) {
    let mut candidates = Vec::new();
    collect_audio_files(root, &mut candidates);

    let mut total: u64 = candidates.iter().map(|c| c.size).sum();
    if total <= limit_bytes {
        return;
    }

    candidates.sort_by_key(|c| c.modified);

    for candidate in candidates {
        if total <= limit_bytes {
            break;
        }
        let file_id = segment::file_id_for(root, &candidate.path);
        if file_id.as_deref() == current_file_id && current_file_id.is_some() {
            continue;
        }

        tracing::info!(
            path = %candidate.path.display(),
            size = candidate.size,
            "quota eviction: deleting oldest recording"
        );
        segment::remove_segment_files(root, &candidate.path);
        if let Some(file_id) = file_id {
            if let Err(e) = index.remove_row(bot_id, &file_id) {
                tracing::warn!(file_id, "quota eviction: failed to drop index row: {e}");
            }
        }
        total -= candidate.size;
    }
}

fn collect_audio_files(dir: &Path, out: &mut Vec<Candidate>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            collect_audio_files(&path, out);
        } else if path.extension().is_some_and(|e| e == AUDIO_EXT) {
            if let Ok(meta) = entry.metadata() {
                out.push(Candidate {
                    path,
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    fn write_sized(path: &Path, size: usize, age_secs: u64) {
        std::fs::write(path, vec![0u8; size]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        let file = std::fs::File::options().append(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_evicts_oldest_until_under_limit() {
        let root = tempfile::tempdir().unwrap();
        let index = RecordingIndex::open_in_memory().unwrap();
        let day = root.path().join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();

        const MB: usize = 1024 * 1024;
        write_sized(&day.join("08-00-00__08-10-00.opus"), 4 * MB, 300);
        write_sized(&day.join("09-00-00__09-10-00.opus"), 3 * MB, 200);
        write_sized(&day.join("10-00-00__10-10-00.opus"), 5 * MB, 100);

        enforce(root.path(), 7 * MB as u64, &index, 1, None);

        assert!(!day.join("08-00-00__08-10-00.opus").exists());
        assert!(!day.join("09-00-00__09-10-00.opus").exists());
        assert!(day.join("10-00-00__10-10-00.opus").exists());
    }

    #[test]
    fn test_open_segment_is_never_evicted() {
        let root = tempfile::tempdir().unwrap();
        let index = RecordingIndex::open_in_memory().unwrap();
        let day = root.path().join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();

        write_sized(&day.join("08-00-00__open.opus"), 4096, 300);
        write_sized(&day.join("09-00-00__09-10-00.opus"), 4096, 100);

        enforce(root.path(), 4096, &index, 1, Some("2026-03-01/08-00-00__open.opus"));

        assert!(day.join("08-00-00__open.opus").exists());
        assert!(!day.join("09-00-00__09-10-00.opus").exists());
    }

    #[test]
    fn test_no_eviction_when_under_limit() {
        let root = tempfile::tempdir().unwrap();
        let index = RecordingIndex::open_in_memory().unwrap();
        write_sized(&root.path().join("a.opus"), 100, 10);
        enforce(root.path(), 1000, &index, 1, None);
        assert!(root.path().join("a.opus").exists());
    }
}
