// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Startup recovery of orphaned open segments.
//!
//! A crash leaves `*__open.opus` files behind. Before any new segment starts,
//! the recording root is scanned and each orphan is pushed through the normal
//! finalize pipeline: the duration comes from the granule position of the
//! file's last Ogg page, the start from the index row or the file name, and
//! the sidecars are renamed and header-patched along with the audio.
//!
//! An orphan that cannot be recovered is left in place for manual inspection;
//! recovery never fails startup.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use tsrec_audio::ogg;
use tsrec_audio::waveform::{self, TSWF_HEADER_SIZE, WAVEFORM_SAMPLE_RATE};
use tsrec_core::types::{Participant, RecordingInfo, WaveformInfo};
use tsrec_core::{RecError, Result};
use tsrec_index::RecordingIndex;

use crate::quota;
use crate::segment::{self, AUDIO_EXT};

/// Window scanned at the end of an orphan for its last Ogg page header.
const TAIL_SCAN_BYTES: u64 = 8 * 1024;

/// Settings the recovery pass shares with the recorder.
pub struct RecoveryOptions {
    pub bot_id: i64,
    pub min_duration: Duration,
    /// When set, quota eviction runs once after all orphans are handled.
    pub max_total_size: Option<u64>,
}

/// Finalizes every orphaned open segment under `root`. Returns how many were
/// recovered (renamed and indexed; discarded ones do not count).
pub fn recover_orphans(root: &Path, index: &RecordingIndex, options: &RecoveryOptions) -> usize {
    let mut orphans = Vec::new();
    collect_orphans(root, &mut orphans);
    if !orphans.is_empty() {
        tracing::info!(count = orphans.len(), "recovering orphaned open segments");
    }

    let mut recovered = 0;
    for path in orphans {
        match recover_one(root, index, options, &path) {
            Ok(true) => recovered += 1,
            Ok(false) => {},
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "orphan recovery failed, leaving file in place: {e}"
                );
            },
        }
    }

    // The inverse orphan: rows still flagged open whose file is gone.
    match index.open_rows(options.bot_id) {
        Ok(rows) => {
            for row in rows {
                if !root.join(&row.file_id).exists() {
                    tracing::warn!(file_id = %row.file_id, "dropping open row without a file");
                    if let Err(e) = index.remove_row(options.bot_id, &row.file_id) {
                        tracing::warn!(file_id = %row.file_id, "failed to drop row: {e}");
                    }
                }
            }
        },
        Err(e) => tracing::warn!("cannot list open rows: {e}"),
    }

    if let Some(limit) = options.max_total_size {
        quota::enforce(root, limit, index, options.bot_id, None);
    }
    recovered
}

fn collect_orphans(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            collect_orphans(&path, out);
        } else if path.extension().is_some_and(|e| e == AUDIO_EXT)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(segment::split_open_name)
                .is_some()
        {
            out.push(path);
        }
    }
}

/// Runs one orphan through the finalize pipeline with reason "crash
/// recovery". `Ok(false)` means the file was discarded as too short.
fn recover_one(
    root: &Path,
    index: &RecordingIndex,
    options: &RecoveryOptions,
    path: &Path,
) -> Result<bool> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RecError::Runtime("orphan has no file name".to_string()))?
        .to_string();
    let file_id = segment::file_id_for(root, path)
        .ok_or_else(|| RecError::Runtime("orphan path outside root".to_string()))?;

    let granule = read_tail_granule(path)?.unwrap_or(0);
    let duration = Duration::from_millis(granule * 1000 / 48_000);

    let row = index.get(options.bot_id, &file_id)?;
    let start = row
        .as_ref()
        .map(|r| r.start)
        .or_else(|| segment::start_from_path(path))
        .unwrap_or_else(|| fallback_start(path, duration));
    let end = start + chrono::Duration::from_std(duration).unwrap_or_default();

    if duration < options.min_duration {
        tracing::info!(
            path = %path.display(),
            ?duration,
            "crash recovery: recording discarded (too short)"
        );
        segment::remove_segment_files(root, path);
        index.remove_row(options.bot_id, &file_id)?;
        return Ok(false);
    }

    let final_name = segment::finalized_name(&file_name, end)
        .ok_or_else(|| RecError::Runtime(format!("{file_name} has no open marker")))?;
    let final_stem = final_name.trim_end_matches(&format!(".{AUDIO_EXT}")).to_string();
    let dir = path
        .parent()
        .ok_or_else(|| RecError::Runtime("orphan has no parent directory".to_string()))?;
    let (final_path, final_name) = segment::allocate_name(dir, &final_stem, AUDIO_EXT)?;
    std::fs::rename(path, &final_path)?;

    let final_base = final_name.trim_end_matches(&format!(".{AUDIO_EXT}"));
    let open_base = file_name.trim_end_matches(&format!(".{AUDIO_EXT}"));
    let waveforms = recover_sidecars(root, path, open_base, final_base);

    let participants: Vec<Participant> =
        row.as_ref().map(|r| r.participants.clone()).unwrap_or_default();
    let info = RecordingInfo {
        id: RecordingInfo::id_from_file_id(
            &segment::file_id_for(root, &final_path).unwrap_or_else(|| file_id.clone()),
        ),
        bot_id: options.bot_id,
        file_id: segment::file_id_for(root, &final_path).unwrap_or_else(|| file_id.clone()),
        file_name: final_name,
        start,
        end: Some(end.max(start)),
        size_bytes: std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0),
        duration_ms: Some(duration.as_millis() as u64),
        is_open: false,
        participants,
        waveforms,
        created: row.as_ref().map_or(start, |r| r.created),
        updated: Utc::now(),
    };
    index.finalize_row(&file_id, &info)?;
    tracing::info!(
        file_id = %info.file_id,
        duration_ms = info.duration_ms,
        "crash recovery: segment finalized"
    );
    Ok(true)
}

/// Reads the last granule position out of the final few KiB of the file.
fn read_tail_granule(path: &Path) -> Result<Option<u64>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_SCAN_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::with_capacity(usize::try_from(len - start).unwrap_or(0));
    file.read_to_end(&mut tail)?;
    Ok(ogg::last_granule(&tail))
}

/// Renames an orphan's sidecars to the finalized base and patches their
/// headers with the sample count implied by the file size.
fn recover_sidecars(
    root: &Path,
    audio_path: &Path,
    open_base: &str,
    final_base: &str,
) -> Vec<WaveformInfo> {
    let mut infos = Vec::new();
    for sidecar in segment::sidecar_paths(audio_path) {
        let Some(name) = sidecar.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(escaped_uid) = name
            .strip_prefix(&format!("{open_base}__"))
            .and_then(|rest| rest.strip_suffix(".wfm"))
        else {
            continue;
        };
        let uid = waveform::unescape_uid(escaped_uid);
        let final_name = waveform::track_file_name(final_base, &uid);
        let final_path = sidecar.with_file_name(&final_name);

        let recovered = patch_sidecar_header(&sidecar)
            .and_then(|samples| {
                std::fs::rename(&sidecar, &final_path)?;
                Ok(samples)
            });
        match recovered {
            Ok((samples, max_sample)) => {
                infos.push(WaveformInfo {
                    uid: uid.clone(),
                    name: uid,
                    sample_rate: WAVEFORM_SAMPLE_RATE,
                    samples,
                    max_sample,
                    size_bytes: std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0),
                    file_id: segment::file_id_for(root, &final_path)
                        .unwrap_or_else(|| final_name.clone()),
                });
            },
            Err(e) => {
                tracing::warn!(path = %sidecar.display(), "sidecar recovery failed: {e}");
            },
        }
    }
    infos.sort_by(|a, b| a.uid.cmp(&b.uid));
    infos
}

/// Rewrites the TSWF sample count from the file length. Returns the count and
/// the maximum sample.
fn patch_sidecar_header(path: &Path) -> Result<(u32, u8)> {
    let data = std::fs::read(path)?;
    if data.len() < TSWF_HEADER_SIZE as usize || &data[..4] != waveform::TSWF_MAGIC {
        return Err(RecError::Runtime("not a TSWF file".to_string()));
    }
    let samples = u32::try_from(data.len() - TSWF_HEADER_SIZE as usize)
        .map_err(|_| RecError::Runtime("sidecar too large".to_string()))?;
    let max_sample = data[TSWF_HEADER_SIZE as usize..].iter().copied().max().unwrap_or(0);

    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(12))?;
    std::io::Write::write_all(&mut file, &samples.to_le_bytes())?;
    Ok((samples, max_sample))
}

/// Last resort when neither the index nor the file name carries the start:
/// derive it from the file's mtime minus the recovered duration.
fn fallback_start(path: &Path, duration: Duration) -> DateTime<Utc> {
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(0));
    let end = Utc.timestamp_opt(mtime, 0).single().unwrap_or_default();
    end - chrono::Duration::from_std(duration).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::io::Write;
    use tsrec_audio::ogg::OggMuxer;

    /// Writes an orphan whose last page carries the given granule.
    fn write_orphan(day_dir: &Path, name: &str, packets: usize) -> PathBuf {
        let path = day_dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut mux = OggMuxer::with_serial(file, 2, 42).unwrap();
        // config 19, code 0 => 960 samples (20 ms) per packet
        for _ in 0..packets {
            mux.write_packet(&[19 << 3, 0xAA, 0xBB]).unwrap();
        }
        mux.flush().unwrap();
        path
    }

    fn write_orphan_sidecar(day_dir: &Path, base: &str, uid: &str, samples: &[u8]) {
        let path = day_dir.join(waveform::track_file_name(base, uid));
        let mut file = std::fs::File::create(path).unwrap();
        let mut header = [0u8; 16];
        header[..4].copy_from_slice(waveform::TSWF_MAGIC);
        header[4] = 1;
        header[8..12].copy_from_slice(&WAVEFORM_SAMPLE_RATE.to_le_bytes());
        file.write_all(&header).unwrap();
        file.write_all(samples).unwrap();
    }

    #[test]
    fn test_orphan_recovered_with_granule_duration() {
        let root = tempfile::tempdir().unwrap();
        let day = root.path().join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();

        // 2000 packets x 960 samples = 1_920_000 samples = 40 s.
        write_orphan(&day, "10-00-00__open.opus", 2000);
        write_orphan_sidecar(&day, "10-00-00__open", "mixed", &[1, 2, 3]);

        let index = RecordingIndex::open_in_memory().unwrap();
        let options = RecoveryOptions {
            bot_id: 1,
            min_duration: Duration::from_secs(1),
            max_total_size: None,
        };
        assert_eq!(recover_orphans(root.path(), &index, &options), 1);

        let final_path = day.join("10-00-00__10-00-40.opus");
        assert!(final_path.exists(), "renamed to start + 40 s");
        assert!(!day.join("10-00-00__open.opus").exists());

        let row = index.get(1, "2026-03-01/10-00-00__10-00-40.opus").unwrap().unwrap();
        assert!(!row.is_open);
        assert_eq!(row.duration_ms, Some(40_000));
        assert_eq!(row.end.unwrap() - row.start, chrono::Duration::seconds(40));

        // Sidecar renamed and header patched.
        let sidecar = day.join("10-00-00__10-00-40__mixed.wfm");
        let data = std::fs::read(&sidecar).unwrap();
        assert_eq!(u32::from_le_bytes(data[12..16].try_into().unwrap()), 3);
        assert_eq!(row.waveforms.len(), 1);
        assert_eq!(row.waveforms[0].samples, 3);
        assert_eq!(row.waveforms[0].max_sample, 3);
    }

    #[test]
    fn test_too_short_orphan_is_discarded() {
        let root = tempfile::tempdir().unwrap();
        let day = root.path().join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        write_orphan(&day, "11-00-00__open.opus", 10); // 0.2 s

        let index = RecordingIndex::open_in_memory().unwrap();
        let options = RecoveryOptions {
            bot_id: 1,
            min_duration: Duration::from_secs(1),
            max_total_size: None,
        };
        assert_eq!(recover_orphans(root.path(), &index, &options), 0);
        assert!(!day.exists(), "discarded orphan and empty day dir removed");
    }

    #[test]
    fn test_open_row_without_file_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        let index = RecordingIndex::open_in_memory().unwrap();
        let start = chrono::Utc::now();
        index
            .insert(&RecordingInfo {
                id: "2026-03-01/08-00-00__open.opus".to_string(),
                bot_id: 1,
                file_id: "2026-03-01/08-00-00__open.opus".to_string(),
                file_name: "08-00-00__open.opus".to_string(),
                start,
                end: None,
                size_bytes: 0,
                duration_ms: None,
                is_open: true,
                participants: vec![],
                waveforms: vec![],
                created: start,
                updated: start,
            })
            .unwrap();

        let options = RecoveryOptions {
            bot_id: 1,
            min_duration: Duration::from_secs(1),
            max_total_size: None,
        };
        recover_orphans(root.path(), &index, &options);
        assert!(index.get(1, "2026-03-01/08-00-00__open.opus").unwrap().is_none());
    }

    #[test]
    fn test_finalized_files_are_untouched() {
        let root = tempfile::tempdir().unwrap();
        let day = root.path().join("2026-03-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("09-00-00__09-30-00.opus"), b"done").unwrap();

        let index = RecordingIndex::open_in_memory().unwrap();
        let options = RecoveryOptions {
            bot_id: 1,
            min_duration: Duration::from_secs(1),
            max_total_size: None,
        };
        assert_eq!(recover_orphans(root.path(), &index, &options), 0);
        assert!(day.join("09-00-00__09-30-00.opus").exists());
    }
}
