// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Recording data model.
//!
//! This module defines the rows and API objects shared between the engine,
//! the index and the HTTP surface:
//! - [`RecordingInfo`]: one segment (open or finalized) with its metadata
//! - [`Participant`]: a client that contributed audio to a segment
//! - [`WaveformInfo`]: metadata for one loudness sidecar track
//! - [`RecordingStatus`]: the engine's externally visible state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved waveform uid for the mixed (all senders summed) track.
pub const MIXED_TRACK_UID: &str = "mixed";

/// A client that contributed audio to a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub uid: String,
    pub name: String,
}

/// Metadata for one loudness sidecar track of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformInfo {
    pub uid: String,
    pub name: String,
    /// Samples per second; one sample per mix tick (50 Hz at a 20 ms tick).
    pub sample_rate: u32,
    pub samples: u32,
    pub max_sample: u8,
    pub size_bytes: u64,
    /// Slash-normalized path of the sidecar relative to the recording root.
    pub file_id: String,
}

/// One recording segment, open or finalized.
///
/// Invariants:
/// - `file_id` is unique per bot
/// - while `is_open`, `end` is `None` and `duration_ms` may be a live estimate
/// - after finalization `end >= start` and `duration_ms` is the muxer's value
/// - `size_bytes` never decreases while the segment is open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingInfo {
    /// Stable identifier derived from the relative path.
    pub id: String,
    pub bot_id: i64,
    /// Slash-normalized path relative to the recording root.
    pub file_id: String,
    pub file_name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub duration_ms: Option<u64>,
    pub is_open: bool,
    pub participants: Vec<Participant>,
    pub waveforms: Vec<WaveformInfo>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl RecordingInfo {
    /// The id under which a segment is addressed over HTTP is its file id.
    pub fn id_from_file_id(file_id: &str) -> String {
        file_id.to_string()
    }
}

/// Externally visible recorder state, returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub enabled: bool,
    pub active: bool,
    /// The currently open segment, if any.
    pub current: Option<RecordingInfo>,
}
