// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Segment naming and on-disk layout.
//!
//! Segments live in one folder per UTC day:
//!
//! ```text
//! <root>/2026-03-01/10-00-00__open.opus        while recording
//! <root>/2026-03-01/10-00-00__10-30-00.opus    finalized
//! <root>/2026-03-01/10-00-00__10-30-00__<uid>.wfm
//! ```
//!
//! Collisions on either form append `_1`, `_2`, … before the extension; the
//! suffix survives finalization.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use tsrec_core::{RecError, Result};

pub const OPEN_MARKER: &str = "open";
pub const AUDIO_EXT: &str = "opus";
pub const WAVEFORM_EXT: &str = "wfm";

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H-%M-%S";

pub fn format_day(t: DateTime<Utc>) -> String {
    t.format(DAY_FORMAT).to_string()
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Splits `10-00-00__open_3.opus` into (`10-00-00`, `_3`).
///
/// Returns `None` when the name is not an open-segment name.
pub fn split_open_name(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_suffix(&format!(".{AUDIO_EXT}"))?;
    let (start, marker) = stem.split_once("__")?;
    let suffix = marker.strip_prefix(OPEN_MARKER)?;
    if !suffix.is_empty() && !suffix.starts_with('_') {
        return None;
    }
    Some((start, suffix))
}

/// Maps an open-segment name to its finalized name for a given end time,
/// preserving any collision suffix:
/// `10-00-00__open_1.opus` + 10:30:00 → `10-00-00__10-30-00_1.opus`.
pub fn finalized_name(open_name: &str, end: DateTime<Utc>) -> Option<String> {
    let (start, suffix) = split_open_name(open_name)?;
    Some(format!("{start}__{}{suffix}.{AUDIO_EXT}", format_time(end)))
}

/// Parses the start instant from `<day-dir>/<HH-MM-SS>__….opus`.
pub fn start_from_path(path: &Path) -> Option<DateTime<Utc>> {
    let file_name = path.file_name()?.to_str()?;
    let time_part = file_name.split("__").next()?;
    let day_part = path.parent()?.file_name()?.to_str()?;

    let date = NaiveDate::parse_from_str(day_part, DAY_FORMAT).ok()?;
    let time = NaiveTime::parse_from_str(time_part, TIME_FORMAT).ok()?;
    Utc.from_utc_datetime(&date.and_time(time)).into()
}

/// Slash-normalized path of `path` relative to `root`, the segment's stable
/// identifier.
pub fn file_id_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

/// Picks a non-existing file name in `dir`, starting from `base.ext` and
/// appending `_1`, `_2`, … until free.
///
/// # Errors
///
/// Returns [`RecError::Runtime`] after an unreasonable number of collisions.
pub fn allocate_name(dir: &Path, base: &str, ext: &str) -> Result<(PathBuf, String)> {
    for n in 0..1000u32 {
        let name =
            if n == 0 { format!("{base}.{ext}") } else { format!("{base}_{n}.{ext}") };
        let path = dir.join(&name);
        if !path.exists() {
            return Ok((path, name));
        }
    }
    Err(RecError::Runtime(format!("no free name for {base} in {}", dir.display())))
}

/// Removes a segment's audio file, its waveform sidecars, and any parent
/// directories left empty, without climbing above `root`.
pub fn remove_segment_files(root: &Path, audio_path: &Path) {
    if let Err(e) = std::fs::remove_file(audio_path) {
        tracing::debug!(path = %audio_path.display(), "failed to remove audio file: {e}");
    }
    remove_sidecars(audio_path);

    let mut dir = audio_path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(d).is_err() {
            break; // not empty (or gone already)
        }
        dir = d.parent();
    }
}

/// Removes every `.wfm` sidecar belonging to `audio_path`.
pub fn remove_sidecars(audio_path: &Path) {
    for sidecar in sidecar_paths(audio_path) {
        if let Err(e) = std::fs::remove_file(&sidecar) {
            tracing::debug!(path = %sidecar.display(), "failed to remove sidecar: {e}");
        }
    }
}

/// All existing `.wfm` sidecars whose name derives from `audio_path`'s base.
pub fn sidecar_paths(audio_path: &Path) -> Vec<PathBuf> {
    let Some(dir) = audio_path.parent() else { return Vec::new() };
    let Some(base) = audio_path.file_stem().and_then(|s| s.to_str()) else {
        return Vec::new();
    };
    let prefix = format!("{base}__");

    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut sidecars: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|e| e == WAVEFORM_EXT)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    sidecars.sort();
    sidecars
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_name_round_trip() {
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap();
        assert_eq!(
            finalized_name("10-00-00__open.opus", end).unwrap(),
            "10-00-00__10-30-00.opus"
        );
        assert_eq!(
            finalized_name("10-00-00__open_2.opus", end).unwrap(),
            "10-00-00__10-30-00_2.opus"
        );
        assert!(finalized_name("10-00-00__10-20-00.opus", end).is_none());
        assert!(finalized_name("10-00-00__opener.opus", end).is_none());
    }

    #[test]
    fn test_start_from_path() {
        let path = Path::new("/data/rec/2026-03-01/10-00-00__open.opus");
        let start = start_from_path(path).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());

        assert!(start_from_path(Path::new("/data/rec/notaday/10-00-00__open.opus")).is_none());
    }

    #[test]
    fn test_file_id_is_slash_normalized() {
        let root = Path::new("/data/rec");
        let path = Path::new("/data/rec/2026-03-01/10-00-00__open.opus");
        assert_eq!(
            file_id_for(root, path).unwrap(),
            "2026-03-01/10-00-00__open.opus"
        );
        assert!(file_id_for(Path::new("/elsewhere"), path).is_none());
    }

    #[test]
    fn test_allocate_name_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (first, name1) = allocate_name(dir.path(), "10-00-00__open", AUDIO_EXT).unwrap();
        std::fs::write(&first, b"x").unwrap();
        assert_eq!(name1, "10-00-00__open.opus");

        let (_, name2) = allocate_name(dir.path(), "10-00-00__open", AUDIO_EXT).unwrap();
        assert_eq!(name2, "10-00-00__open_1.opus");
    }

    #[test]
    fn test_remove_segment_files_prunes_empty_day_dir() {
        let root = tempfile::tempdir().unwrap();
        let day = root.path().join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        let audio = day.join("10-00-00__10-01-00.opus");
        std::fs::write(&audio, b"a").unwrap();
        std::fs::write(day.join("10-00-00__10-01-00__mixed.wfm"), b"w").unwrap();
        std::fs::write(day.join("10-00-00__10-01-00__u1.wfm"), b"w").unwrap();
        // A different segment's sidecar must survive.
        std::fs::write(day.join("11-00-00__11-01-00__mixed.wfm"), b"w").unwrap();

        remove_segment_files(root.path(), &audio);
        assert!(!audio.exists());
        assert!(day.join("11-00-00__11-01-00__mixed.wfm").exists());
        assert!(day.exists(), "day dir still has files");

        std::fs::remove_file(day.join("11-00-00__11-01-00__mixed.wfm")).unwrap();
        let audio2 = day.join("12-00-00__12-01-00.opus");
        std::fs::write(&audio2, b"a").unwrap();
        remove_segment_files(root.path(), &audio2);
        assert!(!day.exists(), "empty day dir is pruned");
        assert!(root.path().exists(), "root itself is never removed");
    }
}
