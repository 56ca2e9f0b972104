// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TSWF loudness sidecar writer.
//!
//! One `.wfm` file per tracked participant plus the reserved `mixed` track.
//! Layout:
//!
//! ```text
//! 0..4   magic "TSWF"
//! 4      version (1)
//! 5      flags (0)
//! 6..8   reserved
//! 8..12  sample rate, u32 LE (50)
//! 12..16 sample count, u32 LE (patched on finalize)
//! 16..   one u8 amplitude sample per mix tick
//! ```
//!
//! All tracks of a segment carry the same number of samples: tracks created
//! mid-segment are prepended with zeros, and every tick writes one byte to
//! every known track.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tsrec_core::types::{Participant, WaveformInfo, MIXED_TRACK_UID};
use tsrec_core::Result;

pub const TSWF_MAGIC: &[u8; 4] = b"TSWF";
pub const TSWF_VERSION: u8 = 1;
pub const TSWF_HEADER_SIZE: u64 = 16;

/// Samples per second; one per 20 ms mix tick.
pub const WAVEFORM_SAMPLE_RATE: u32 = 50;

/// Percent-encodes a uid so it is safe inside a file name on any filesystem.
pub fn escape_uid(uid: &str) -> String {
    urlencoding::encode(uid).into_owned()
}

/// Inverse of [`escape_uid`], used when recovering orphaned sidecars.
pub fn unescape_uid(escaped: &str) -> String {
    urlencoding::decode(escaped).map_or_else(|_| escaped.to_string(), |s| s.into_owned())
}

/// Sidecar file name for a segment base name (no extension) and a uid.
pub fn track_file_name(segment_base: &str, uid: &str) -> String {
    format!("{segment_base}__{}.wfm", escape_uid(uid))
}

struct WaveformTrack {
    name: String,
    writer: BufWriter<File>,
    path: PathBuf,
    max_sample: u8,
}

impl WaveformTrack {
    fn create(path: PathBuf, name: String, prepad_samples: u32) -> Result<Self> {
        let file = OpenOptions::new().create(true).truncate(true).write(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; TSWF_HEADER_SIZE as usize];
        header[..4].copy_from_slice(TSWF_MAGIC);
        header[4] = TSWF_VERSION;
        // flags and reserved stay zero
        header[8..12].copy_from_slice(&WAVEFORM_SAMPLE_RATE.to_le_bytes());
        // sample count patched on finalize
        writer.write_all(&header)?;

        // Align a late-created track with the rest of the segment.
        let zeros = [0u8; 256];
        let mut remaining = prepad_samples as usize;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            writer.write_all(&zeros[..n])?;
            remaining -= n;
        }

        Ok(Self { name, writer, path, max_sample: 0 })
    }

    fn push(&mut self, sample: u8) -> Result<()> {
        self.writer.write_all(&[sample])?;
        self.max_sample = self.max_sample.max(sample);
        Ok(())
    }
}

/// The waveform sidecar set of one segment.
pub struct WaveformSet {
    dir: PathBuf,
    segment_base: String,
    tracks: HashMap<String, WaveformTrack>,
    samples: u32,
}

impl WaveformSet {
    /// Creates the set with the reserved `mixed` track already open.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from creating the mixed sidecar.
    pub fn create(dir: &Path, segment_base: &str) -> Result<Self> {
        let mut set = Self {
            dir: dir.to_path_buf(),
            segment_base: segment_base.to_string(),
            tracks: HashMap::new(),
            samples: 0,
        };
        set.ensure_track(MIXED_TRACK_UID, MIXED_TRACK_UID)?;
        Ok(set)
    }

    fn ensure_track(&mut self, uid: &str, name: &str) -> Result<()> {
        if self.tracks.contains_key(uid) {
            return Ok(());
        }
        let path = self.dir.join(track_file_name(&self.segment_base, uid));
        tracing::debug!(uid, path = %path.display(), "creating waveform track");
        let track = WaveformTrack::create(path, name.to_string(), self.samples)?;
        self.tracks.insert(uid.to_string(), track);
        Ok(())
    }

    /// Appends one tick: each listed sender gets its level, every other known
    /// track (including senders silent this tick) gets 0, and the mixed track
    /// gets `mixed`.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; the tick logs and continues.
    pub fn append_tick(&mut self, senders: &[(Participant, u8)], mixed: u8) -> Result<()> {
        for (participant, _) in senders {
            self.ensure_track(&participant.uid, &participant.name)?;
        }

        for (uid, track) in &mut self.tracks {
            let sample = if uid == MIXED_TRACK_UID {
                mixed
            } else {
                senders
                    .iter()
                    .find(|(p, _)| p.uid == *uid)
                    .map_or(0, |(_, level)| *level)
            };
            track.push(sample)?;
        }
        self.samples += 1;
        Ok(())
    }

    /// Flushes buffered bytes of every track to disk.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sidecar files.
    pub fn flush(&mut self) -> Result<()> {
        for track in self.tracks.values_mut() {
            track.writer.flush()?;
        }
        Ok(())
    }

    /// Ticks recorded so far (identical across all tracks).
    pub const fn sample_count(&self) -> u32 {
        self.samples
    }

    pub fn track_uids(&self) -> impl Iterator<Item = &String> {
        self.tracks.keys()
    }

    /// Patches every header with the true sample count, renames the sidecars
    /// to the finalized base name and returns their metadata.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; callers log and keep the audio file regardless.
    pub fn finalize(mut self, final_base: &str) -> Result<Vec<WaveformInfo>> {
        let mut infos = Vec::with_capacity(self.tracks.len());
        let samples = self.samples;

        for (uid, mut track) in self.tracks.drain() {
            track.writer.flush()?;
            let file = track.writer.get_mut();
            file.seek(SeekFrom::Start(12))?;
            file.write_all(&samples.to_le_bytes())?;
            file.flush()?;

            let final_name = track_file_name(final_base, &uid);
            let final_path = track.path.with_file_name(&final_name);
            std::fs::rename(&track.path, &final_path)?;

            let size_bytes = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
            infos.push(WaveformInfo {
                uid,
                name: track.name,
                sample_rate: WAVEFORM_SAMPLE_RATE,
                samples,
                max_sample: track.max_sample,
                size_bytes,
                file_id: final_name,
            });
        }

        infos.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(infos)
    }

    /// Removes all sidecar files without finalizing, for discarded segments.
    pub fn discard(mut self) {
        for (_, track) in self.tracks.drain() {
            drop(track.writer);
            if let Err(e) = std::fs::remove_file(&track.path) {
                tracing::debug!(path = %track.path.display(), "failed to remove sidecar: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn participant(uid: &str, name: &str) -> Participant {
        Participant { uid: uid.to_string(), name: name.to_string() }
    }

    fn read_header(path: &Path) -> (u32, u32, Vec<u8>) {
        let data = std::fs::read(path).unwrap();
        assert_eq!(&data[..4], TSWF_MAGIC);
        assert_eq!(data[4], TSWF_VERSION);
        let rate = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(data[12..16].try_into().unwrap());
        (rate, count, data[16..].to_vec())
    }

    #[test]
    fn test_tracks_share_sample_count_with_zero_prepad() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = WaveformSet::create(dir.path(), "10-00-00__open").unwrap();

        let alice = participant("uid-a", "Alice");
        let bob = participant("uid+b", "Bob");

        // Alice alone for 3 ticks, then Bob joins.
        for _ in 0..3 {
            set.append_tick(&[(alice.clone(), 10)], 10).unwrap();
        }
        set.append_tick(&[(alice.clone(), 20), (bob.clone(), 30)], 36).unwrap();
        // A tick with no senders still writes a byte everywhere.
        set.append_tick(&[], 0).unwrap();
        assert_eq!(set.sample_count(), 5);

        let infos = set.finalize("10-00-00__10-00-01").unwrap();
        assert_eq!(infos.len(), 3);
        for info in &infos {
            assert_eq!(info.samples, 5);
            assert_eq!(info.sample_rate, WAVEFORM_SAMPLE_RATE);
        }

        let bob_path = dir.path().join(track_file_name("10-00-00__10-00-01", "uid+b"));
        let (rate, count, samples) = read_header(&bob_path);
        assert_eq!(rate, 50);
        assert_eq!(count, 5);
        assert_eq!(samples, vec![0, 0, 0, 30, 0]);
    }

    #[test]
    fn test_uid_escaping_round_trip() {
        assert_eq!(escape_uid("a/b=c"), "a%2Fb%3Dc");
        assert_eq!(unescape_uid("a%2Fb%3Dc"), "a/b=c");
        let name = track_file_name("12-00-00__open", "x/y");
        assert_eq!(name, "12-00-00__open__x%2Fy.wfm");
    }

    #[test]
    fn test_mixed_track_always_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = WaveformSet::create(dir.path(), "09-00-00__open").unwrap();
        set.append_tick(&[], 0).unwrap();
        set.flush().unwrap();

        let mixed_path = dir.path().join(track_file_name("09-00-00__open", MIXED_TRACK_UID));
        assert!(mixed_path.exists());
        let uids: Vec<_> = set.track_uids().cloned().collect();
        assert_eq!(uids, vec![MIXED_TRACK_UID.to_string()]);
    }

    #[test]
    fn test_discard_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = WaveformSet::create(dir.path(), "09-00-00__open").unwrap();
        set.append_tick(&[(participant("u", "U"), 5)], 5).unwrap();
        set.discard();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
