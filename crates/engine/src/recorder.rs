// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The recording manager.
//!
//! Owns the control state machine, the per-sender jitter buffers and the
//! currently open segment behind a single recording mutex. A dedicated timer
//! task drives the 20 ms mix tick; voice-client callbacks arrive through
//! [`ChannelEvents`]; the HTTP layer reads through the accessor methods.
//!
//! Locking discipline: heavy I/O (renames, quota scans, header rescans) never
//! happens while the recording mutex is held. Rotation and stop prepare
//! outside the lock, swap inside, and finalize outside again. The index has
//! its own lock and is only called with the recording mutex released.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use tsrec_audio::mix::{self, MixAccumulator, FRAME_BYTES, FRAME_SAMPLES, MIX_TICK};
use tsrec_audio::ogg::OggMuxer;
use tsrec_audio::opus::OpusEncoder;
use tsrec_audio::pcm::PcmBuffer;
use tsrec_audio::waveform::{self, WaveformSet};
use tsrec_core::types::{Participant, RecordingInfo, RecordingStatus, WaveformInfo};
use tsrec_core::units::truncate_to_second;
use tsrec_core::{RecError, Result};
use tsrec_index::{DeleteOutcome, ListFilter, RecordingIndex};

use crate::quota;
use crate::segment::{self, AUDIO_EXT, OPEN_MARKER};
use crate::source::{ChannelEventBus, ChannelEvents, ChannelSource, ClientId, Subscription};

/// Senders with no PCM for this long are dropped from the mix.
const SENDER_STALE_AFTER: Duration = Duration::from_secs(30);

/// Segments are rotated once they have been open this long.
const SEGMENT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Cadence for muxer/waveform flushes and index row refreshes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum spacing between tick-driven aloneness checks.
const ALONE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Static configuration of one bot's recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub bot_id: i64,
    /// Recording root; segments live in per-day folders below it.
    pub root: PathBuf,
    /// Initial value of the enabled gate.
    pub enabled: bool,
    pub bitrate_kbps: i32,
    /// How long the channel may stay empty before recording stops.
    pub stop_delay: Duration,
    /// Recordings shorter than this are discarded on finalize.
    pub min_duration: Duration,
    /// Total-size quota over the recording root; `None` disables eviction.
    pub max_total_size: Option<u64>,
    /// Uids ignored when deciding whether the bot is alone.
    pub exclude_uids: Vec<String>,
}

/// Everything a live segment owns for its lifetime.
struct OpenSegment {
    path: PathBuf,
    file_id: String,
    file_name: String,
    start: DateTime<Utc>,
    opened_at: Instant,
    muxer: OggMuxer<File>,
    encoder: OpusEncoder,
    waveforms: WaveformSet,
    participants: Vec<Participant>,
}

/// Control state. `PendingStop` keeps recording until the deadline fires.
enum RecState {
    Idle,
    Active(Box<OpenSegment>),
    PendingStop { segment: Box<OpenSegment>, reason: String, deadline: Instant },
}

impl RecState {
    const fn is_recording(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    fn segment(&self) -> Option<&OpenSegment> {
        match self {
            Self::Idle => None,
            Self::Active(segment) | Self::PendingStop { segment, .. } => Some(segment),
        }
    }

    fn segment_mut(&mut self) -> Option<&mut OpenSegment> {
        match self {
            Self::Idle => None,
            Self::Active(segment) | Self::PendingStop { segment, .. } => Some(segment),
        }
    }
}

/// Fields guarded by the recording mutex.
struct Inner {
    state: RecState,
    buffers: HashMap<ClientId, PcmBuffer>,
    accumulator: MixAccumulator,
    frame_scratch: Box<[u8; FRAME_BYTES]>,
    mixed_scratch: Box<[i16; FRAME_SAMPLES]>,
    last_flush: Instant,
    last_alone_check: Instant,
    alone: bool,
    stop_timer: Option<JoinHandle<()>>,
}

/// Index refresh gathered under the lock, written after releasing it.
struct LiveUpdate {
    file_id: String,
    size_bytes: u64,
    duration_ms: u64,
    participants: Vec<Participant>,
}

struct TickOutcome {
    update: Option<LiveUpdate>,
    /// Muxer invariant violation; the segment must be finalized.
    segment_failed: bool,
}

/// Per-bot channel recording engine.
pub struct Recorder {
    config: RecorderConfig,
    enabled: AtomicBool,
    connected: AtomicBool,
    disposed: AtomicBool,
    index: Arc<RecordingIndex>,
    source: Arc<dyn ChannelSource>,
    inner: Mutex<Inner>,
    epoch: Instant,
    self_weak: Weak<Self>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        index: Arc<RecordingIndex>,
        source: Arc<dyn ChannelSource>,
    ) -> Arc<Self> {
        if let Err(e) = std::fs::create_dir_all(&config.root) {
            tracing::warn!(root = %config.root.display(), "cannot create recording root: {e}");
        }
        let enabled = config.enabled;
        Arc::new_cyclic(|self_weak| Self {
            config,
            enabled: AtomicBool::new(enabled),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            index,
            source,
            inner: Mutex::new(Inner {
                state: RecState::Idle,
                buffers: HashMap::new(),
                accumulator: MixAccumulator::new(),
                frame_scratch: Box::new([0u8; FRAME_BYTES]),
                mixed_scratch: Box::new([0i16; FRAME_SAMPLES]),
                last_flush: Instant::now(),
                last_alone_check: Instant::now(),
                alone: true,
                stop_timer: None,
            }),
            epoch: Instant::now(),
            self_weak: self_weak.clone(),
            tick_task: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Starts the 20 ms mix timer.
    pub fn spawn_tick(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MIX_TICK);
            loop {
                interval.tick().await;
                let Some(recorder) = weak.upgrade() else { break };
                if recorder.disposed.load(Ordering::Acquire) {
                    break;
                }
                recorder.tick();
            }
        });
        *self.guard(&self.tick_task) = Some(handle);
    }

    /// Registers the recorder on the voice client's event bus; the handle is
    /// released on dispose.
    pub fn attach(self: &Arc<Self>, bus: &ChannelEventBus) {
        let events: Arc<dyn ChannelEvents> = self.clone();
        let subscription = bus.subscribe(Arc::downgrade(&events));
        self.guard(&self.subscriptions).push(subscription);
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub const fn bot_id(&self) -> i64 {
        self.config.bot_id
    }

    // --- Signals (§ control state machine) ---

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was == enabled {
            return;
        }
        tracing::info!(enabled, "recording toggled");
        if enabled {
            self.try_start();
        } else {
            self.stop("recording disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn on_connected(&self) {
        self.connected.store(true, Ordering::Release);
        self.evaluate_alone();
        self.try_start();
    }

    pub fn on_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.stop("bot disconnected");
    }

    /// Membership changed: refresh the snapshot, persist it, and re-evaluate
    /// aloneness regardless of the current state.
    pub fn on_participants_changed(&self) {
        let update = {
            let mut inner = self.lock();
            inner.state.segment_mut().map(|seg| {
                merge_participants(&mut seg.participants, self.source.channel_clients());
                LiveUpdate {
                    file_id: seg.file_id.clone(),
                    size_bytes: file_size(&seg.path),
                    duration_ms: seg.muxer.duration_ms(),
                    participants: seg.participants.clone(),
                }
            })
        };
        if let Some(update) = update {
            self.apply_live_update(&update);
        }
        self.evaluate_alone();
    }

    /// PCM ingress from the voice client. Accepted only while recording and
    /// only from clients sharing the bot's channel.
    pub fn ingest_pcm(&self, client: ClientId, pcm: &[u8]) {
        if pcm.is_empty() || !self.source.in_bot_channel(client) {
            return;
        }
        let now_ms = self.now_ms();
        let mut inner = self.lock();
        if !inner.state.is_recording() {
            return;
        }
        inner
            .buffers
            .entry(client)
            .or_insert_with(|| PcmBuffer::new(now_ms))
            .write(pcm, now_ms);
    }

    // --- Accessors for the HTTP surface ---

    pub fn status(&self) -> RecordingStatus {
        let current = self.live_info();
        RecordingStatus {
            enabled: self.is_enabled(),
            active: current.is_some(),
            current,
        }
    }

    /// Live view of the open segment, size and duration re-read under the
    /// recording mutex.
    pub fn live_info(&self) -> Option<RecordingInfo> {
        let inner = self.lock();
        inner.state.segment().map(|seg| {
            let base = seg.file_name.trim_end_matches(&format!(".{AUDIO_EXT}"));
            let waveforms = seg
                .waveforms
                .track_uids()
                .map(|uid| WaveformInfo {
                    uid: uid.clone(),
                    name: seg
                        .participants
                        .iter()
                        .find(|p| &p.uid == uid)
                        .map_or_else(|| uid.clone(), |p| p.name.clone()),
                    sample_rate: waveform::WAVEFORM_SAMPLE_RATE,
                    samples: seg.waveforms.sample_count(),
                    max_sample: 0,
                    size_bytes: waveform::TSWF_HEADER_SIZE
                        + u64::from(seg.waveforms.sample_count()),
                    file_id: rebase_file_id(&seg.file_id, &waveform::track_file_name(base, uid)),
                })
                .collect();
            let now = Utc::now();
            RecordingInfo {
                id: RecordingInfo::id_from_file_id(&seg.file_id),
                bot_id: self.config.bot_id,
                file_id: seg.file_id.clone(),
                file_name: seg.file_name.clone(),
                start: seg.start,
                end: None,
                size_bytes: file_size(&seg.path),
                duration_ms: Some(seg.muxer.duration_ms()),
                is_open: true,
                participants: seg.participants.clone(),
                waveforms,
                created: seg.start,
                updated: now,
            }
        })
    }

    pub fn current_file_id(&self) -> Option<String> {
        self.lock().state.segment().map(|seg| seg.file_id.clone())
    }

    pub fn is_current_open(&self, file_id: &str) -> bool {
        self.current_file_id().as_deref() == Some(file_id)
    }

    /// Lists index rows, replacing the open segment's row with the live view.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<RecordingInfo>> {
        let mut rows = self.index.list(self.config.bot_id, filter)?;
        if let Some(live) = self.live_info() {
            for row in &mut rows {
                if row.file_id == live.file_id {
                    *row = live.clone();
                }
            }
        }
        Ok(rows)
    }

    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn list_participants(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Participant>> {
        self.index.list_participants(self.config.bot_id, from, to)
    }

    /// Deletes a finalized recording: audio file, sidecars, empty parent
    /// directories and the index row. Refuses the currently open segment.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Index`] on database errors.
    pub fn delete(&self, file_id: &str) -> Result<DeleteOutcome> {
        if self.is_current_open(file_id) {
            return Ok(DeleteOutcome::RefusedOpen);
        }
        let outcome = self.index.delete(self.config.bot_id, file_id)?;
        if outcome == DeleteOutcome::Deleted {
            let path = self.config.root.join(file_id.replace('/', std::path::MAIN_SEPARATOR_STR));
            segment::remove_segment_files(&self.config.root, &path);
            tracing::info!(file_id, "recording deleted");
        }
        Ok(outcome)
    }

    /// Stops the timer, finalizes any open segment and releases all event
    /// subscriptions. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("disposing recorder");
        if let Some(handle) = self.guard(&self.tick_task).take() {
            handle.abort();
        }
        self.guard(&self.subscriptions).clear();
        self.stop("shutdown");
    }

    // --- Mix tick ---

    fn tick(&self) {
        self.maybe_rotate();

        // Backstop for the one-shot stop timer (it may not have been armed
        // when the alone transition happened off-runtime).
        let overdue = {
            let inner = self.lock();
            match &inner.state {
                RecState::PendingStop { reason, deadline, .. }
                    if Instant::now() >= *deadline =>
                {
                    Some(reason.clone())
                },
                _ => None,
            }
        };
        if let Some(reason) = overdue {
            self.stop(&reason);
        }

        let outcome = {
            let mut inner = self.lock();
            self.tick_locked(&mut inner)
        };
        if let Some(update) = outcome.update {
            self.apply_live_update(&update);
        }
        if outcome.segment_failed {
            self.stop("muxer failure");
        }

        self.maybe_check_alone();
    }

    #[allow(clippy::cognitive_complexity)] // one tick, in mix order
    fn tick_locked(&self, inner: &mut Inner) -> TickOutcome {
        let mut outcome = TickOutcome { update: None, segment_failed: false };
        if !inner.state.is_recording() {
            return outcome;
        }

        let now = Instant::now();
        let now_ms = self.now_ms();
        let stale_ms = SENDER_STALE_AFTER.as_millis() as u64;
        inner.buffers.retain(|client, buffer| {
            let stale = now_ms.saturating_sub(buffer.last_write_ms()) > stale_ms;
            if stale {
                tracing::debug!(client, "dropping stale sender");
            }
            !stale
        });

        let Inner { state, buffers, accumulator, frame_scratch, mixed_scratch, last_flush, .. } =
            inner;

        accumulator.clear();
        let mut levels: Vec<(Participant, u8)> = Vec::new();
        for (client, buffer) in buffers.iter_mut() {
            if !buffer.read_frame(frame_scratch.as_mut_slice()) {
                continue;
            }
            let level = accumulator.accumulate(frame_scratch);
            if let Some(participant) = self.source.identity(*client) {
                levels.push((participant, level));
            }
        }
        accumulator.write_mixed(mixed_scratch);
        let mixed = mix::mixed_level(levels.iter().map(|(_, level)| *level));

        let Some(seg) = state.segment_mut() else {
            return outcome;
        };

        // A sender that actually spoke belongs in the participant list even
        // if it joined between membership events.
        for (participant, _) in &levels {
            if !seg.participants.iter().any(|p| p.uid == participant.uid) {
                seg.participants.push(participant.clone());
            }
        }

        match seg.encoder.encode_frame(mixed_scratch) {
            Ok(packet) => {
                if let Err(e) = seg.muxer.write_packet(packet) {
                    tracing::error!(file_id = %seg.file_id, "muxer failed, closing segment: {e}");
                    outcome.segment_failed = true;
                    return outcome;
                }
            },
            Err(e) => {
                // Dropped frame; the next tick continues.
                tracing::warn!("opus encode failed: {e}");
            },
        }

        if let Err(e) = seg.waveforms.append_tick(&levels, mixed) {
            tracing::warn!("waveform append failed: {e}");
        }

        if now.duration_since(*last_flush) >= FLUSH_INTERVAL {
            *last_flush = now;
            if let Err(e) = seg.muxer.flush() {
                tracing::warn!("muxer flush failed: {e}");
            }
            if let Err(e) = seg.waveforms.flush() {
                tracing::warn!("waveform flush failed: {e}");
            }
            outcome.update = Some(LiveUpdate {
                file_id: seg.file_id.clone(),
                size_bytes: file_size(&seg.path),
                duration_ms: seg.muxer.duration_ms(),
                participants: seg.participants.clone(),
            });
        }

        outcome
    }

    fn apply_live_update(&self, update: &LiveUpdate) {
        if let Err(e) = self.index.update_live(
            self.config.bot_id,
            &update.file_id,
            update.size_bytes,
            update.duration_ms,
            &update.participants,
        ) {
            tracing::warn!(file_id = %update.file_id, "index refresh failed: {e}");
        }
    }

    // --- Lifecycle ---

    fn try_start(&self) {
        if self.disposed.load(Ordering::Acquire)
            || !self.is_enabled()
            || !self.connected.load(Ordering::Acquire)
        {
            return;
        }
        if self.compute_alone() {
            return;
        }
        if self.lock().state.is_recording() {
            return;
        }

        let prepared = match self.prepare_segment() {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!("failed to start recording: {e}");
                return;
            },
        };

        let leftover = {
            let mut inner = self.lock();
            if inner.state.is_recording() {
                Some(prepared) // lost a race; discard outside the lock
            } else {
                tracing::info!(file_id = %prepared.file_id, "recording started");
                inner.alone = false;
                inner.state = RecState::Active(Box::new(prepared));
                None
            }
        };
        if let Some(seg) = leftover {
            self.abort_prepared(seg);
        }
    }

    /// Creates the segment file, muxer, encoder, waveform set and index row.
    /// Runs without the recording mutex; failures clean up everything.
    fn prepare_segment(&self) -> Result<OpenSegment> {
        let start = truncate_to_second(Utc::now());
        let day_dir = self.config.root.join(segment::format_day(start));
        std::fs::create_dir_all(&day_dir)?;

        let base = format!("{}__{OPEN_MARKER}", segment::format_time(start));
        let (path, file_name) = segment::allocate_name(&day_dir, &base, AUDIO_EXT)?;
        let file_id = segment::file_id_for(&self.config.root, &path)
            .ok_or_else(|| RecError::Runtime("segment path outside root".to_string()))?;

        match self.build_segment(&path, &file_id, &file_name, start, &day_dir) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                // Leave nothing behind on a failed start.
                let _ = std::fs::remove_file(&path);
                segment::remove_sidecars(&path);
                if let Err(index_err) = self.index.remove_row(self.config.bot_id, &file_id) {
                    tracing::debug!("start cleanup: {index_err}");
                }
                Err(e)
            },
        }
    }

    fn build_segment(
        &self,
        path: &Path,
        file_id: &str,
        file_name: &str,
        start: DateTime<Utc>,
        day_dir: &Path,
    ) -> Result<OpenSegment> {
        let file = File::create(path)?;
        let muxer = OggMuxer::new(file, 2)?;
        let wf_base = file_name
            .strip_suffix(&format!(".{AUDIO_EXT}"))
            .unwrap_or(file_name);
        let waveforms = WaveformSet::create(day_dir, wf_base)?;
        let encoder = OpusEncoder::new(self.config.bitrate_kbps.max(1) * 1000)?;
        let participants = self.source.channel_clients();

        let now = Utc::now();
        self.index.insert(&RecordingInfo {
            id: RecordingInfo::id_from_file_id(file_id),
            bot_id: self.config.bot_id,
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            start,
            end: None,
            size_bytes: 0,
            duration_ms: None,
            is_open: true,
            participants: participants.clone(),
            waveforms: Vec::new(),
            created: now,
            updated: now,
        })?;

        Ok(OpenSegment {
            path: path.to_path_buf(),
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            start,
            opened_at: Instant::now(),
            muxer,
            encoder,
            waveforms,
            participants,
        })
    }

    fn abort_prepared(&self, seg: OpenSegment) {
        let OpenSegment { path, file_id, waveforms, .. } = seg;
        waveforms.discard();
        let _ = std::fs::remove_file(&path);
        if let Err(e) = self.index.remove_row(self.config.bot_id, &file_id) {
            tracing::debug!("prepared segment cleanup: {e}");
        }
    }

    /// Hourly rotation: prepare outside the lock, swap inside, finalize the
    /// old segment outside again.
    fn maybe_rotate(&self) {
        let due = self
            .lock()
            .state
            .segment()
            .is_some_and(|seg| seg.opened_at.elapsed() >= SEGMENT_MAX_AGE);
        if !due {
            return;
        }

        let prepared = match self.prepare_segment() {
            Ok(prepared) => prepared,
            Err(e) => {
                // Keep the current segment; retry on a later tick.
                tracing::error!("rotation failed: {e}");
                return;
            },
        };

        let swapped = {
            let mut inner = self.lock();
            match inner.state.segment_mut() {
                Some(current) => Ok(std::mem::replace(current, prepared)),
                None => Err(prepared), // stopped while preparing
            }
        };

        match swapped {
            Ok(old) => {
                tracing::info!(file_id = %old.file_id, "rotated segment");
                self.finalize_segment(old, "rotation");
            },
            Err(prepared) => self.abort_prepared(prepared),
        }
    }

    fn stop(&self, reason: &str) {
        let old = {
            let mut inner = self.lock();
            if let Some(timer) = inner.stop_timer.take() {
                timer.abort();
            }
            inner.buffers.clear();
            match std::mem::replace(&mut inner.state, RecState::Idle) {
                RecState::Idle => None,
                RecState::Active(segment) | RecState::PendingStop { segment, .. } => Some(segment),
            }
        };
        if let Some(seg) = old {
            tracing::info!(file_id = %seg.file_id, reason, "recording stopped");
            self.finalize_segment(*seg, reason);
        }
    }

    /// Finalizes a closed segment: EOS page, minimum-duration check, renames,
    /// waveform headers, index row, quota. Never called under the mutex.
    #[allow(clippy::cognitive_complexity)] // the finalize pipeline is one sequence
    fn finalize_segment(&self, mut seg: OpenSegment, reason: &str) {
        if let Err(e) = seg.muxer.finish() {
            tracing::warn!(file_id = %seg.file_id, "failed to write EOS page: {e}");
        }
        let duration = Duration::from_millis(seg.muxer.duration_ms());
        let end = truncate_to_second(Utc::now()).max(seg.start);

        if duration < self.config.min_duration {
            tracing::info!(
                file_id = %seg.file_id,
                ?duration,
                reason,
                "recording discarded (too short)"
            );
            seg.waveforms.discard();
            segment::remove_segment_files(&self.config.root, &seg.path);
            if let Err(e) = self.index.remove_row(self.config.bot_id, &seg.file_id) {
                tracing::warn!("failed to drop discarded row: {e}");
            }
            return;
        }

        let Some(final_name) = segment::finalized_name(&seg.file_name, end) else {
            tracing::error!(file = %seg.file_name, "segment has no open marker; leaving as-is");
            return;
        };
        let final_stem = final_name.trim_end_matches(&format!(".{AUDIO_EXT}")).to_string();
        let (final_path, final_name) =
            match segment::allocate_name(&seg.path.parent().unwrap_or(&self.config.root), &final_stem, AUDIO_EXT)
            {
                Ok(allocated) => allocated,
                Err(e) => {
                    tracing::error!("cannot allocate finalized name: {e}");
                    return;
                },
            };
        if let Err(e) = std::fs::rename(&seg.path, &final_path) {
            tracing::error!(from = %seg.path.display(), "finalize rename failed: {e}");
            return;
        }

        let new_file_id = segment::file_id_for(&self.config.root, &final_path)
            .unwrap_or_else(|| seg.file_id.clone());
        let final_base = final_name.trim_end_matches(&format!(".{AUDIO_EXT}"));
        let mut waveforms = match seg.waveforms.finalize(final_base) {
            Ok(infos) => infos,
            Err(e) => {
                tracing::warn!("waveform finalize failed: {e}");
                Vec::new()
            },
        };
        // Sidecar ids are file names; anchor them next to the audio file.
        for wf in &mut waveforms {
            wf.file_id = rebase_file_id(&new_file_id, &wf.file_id);
        }
        let info = RecordingInfo {
            id: RecordingInfo::id_from_file_id(&new_file_id),
            bot_id: self.config.bot_id,
            file_id: new_file_id,
            file_name: final_name,
            start: seg.start,
            end: Some(end),
            size_bytes: file_size(&final_path),
            duration_ms: Some(duration.as_millis() as u64),
            is_open: false,
            participants: seg.participants,
            waveforms,
            created: seg.start,
            updated: Utc::now(),
        };
        if let Err(e) = self.index.finalize_row(&seg.file_id, &info) {
            tracing::warn!(file_id = %info.file_id, "index finalize failed: {e}");
        }
        tracing::info!(
            file_id = %info.file_id,
            duration_ms = info.duration_ms,
            reason,
            "segment finalized"
        );

        if let Some(limit) = self.config.max_total_size {
            quota::enforce(
                &self.config.root,
                limit,
                &self.index,
                self.config.bot_id,
                self.current_file_id().as_deref(),
            );
        }
    }

    // --- Aloneness ---

    fn compute_alone(&self) -> bool {
        !self
            .source
            .channel_clients()
            .iter()
            .any(|p| !self.config.exclude_uids.contains(&p.uid))
    }

    /// Tick-driven check, rate-limited to once per second.
    fn maybe_check_alone(&self) {
        {
            let mut inner = self.lock();
            if inner.last_alone_check.elapsed() < ALONE_CHECK_INTERVAL {
                return;
            }
            inner.last_alone_check = Instant::now();
        }
        self.evaluate_alone();
    }

    fn evaluate_alone(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let alone = self.compute_alone();

        enum Action {
            None,
            Start,
            ArmTimer(Duration),
        }

        let action = {
            let mut inner = self.lock();
            inner.alone = alone;
            let prior = std::mem::replace(&mut inner.state, RecState::Idle);
            let (next, action) = match (prior, alone) {
                (RecState::Active(segment), true) => {
                    let delay = self.config.stop_delay;
                    let reason = format!("channel empty > {delay:?}");
                    tracing::info!(%reason, "scheduling delayed stop");
                    let pending = RecState::PendingStop {
                        segment,
                        reason,
                        deadline: Instant::now() + delay,
                    };
                    (pending, Action::ArmTimer(delay))
                },
                (RecState::PendingStop { segment, .. }, false) => {
                    tracing::info!("channel repopulated, resuming");
                    if let Some(timer) = inner.stop_timer.take() {
                        timer.abort();
                    }
                    (RecState::Active(segment), Action::None)
                },
                (RecState::Idle, false) => (RecState::Idle, Action::Start),
                (other, _) => (other, Action::None),
            };
            inner.state = next;
            action
        };

        match action {
            Action::Start => self.try_start(),
            Action::ArmTimer(delay) => self.arm_stop_timer(delay),
            Action::None => {},
        }
    }

    fn arm_stop_timer(&self, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Off-runtime signal; the tick's deadline backstop takes over.
            tracing::debug!("no runtime for stop timer, relying on tick deadline");
            return;
        };
        let weak = self.self_weak.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(recorder) = weak.upgrade() {
                recorder.on_stop_deadline();
            }
        });
        let mut inner = self.lock();
        if let Some(previous) = inner.stop_timer.replace(handle) {
            previous.abort();
        }
    }

    fn on_stop_deadline(&self) {
        let reason = {
            let inner = self.lock();
            match &inner.state {
                RecState::PendingStop { reason, .. } => Some(reason.clone()),
                _ => None,
            }
        };
        if let Some(reason) = reason {
            self.stop(&reason);
        }
    }

    // --- Plumbing ---

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[allow(clippy::unwrap_used)] // Mutex poisoning is a fatal error
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    #[allow(clippy::unwrap_used)] // Mutex poisoning is a fatal error
    fn guard<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap()
    }
}

impl ChannelEvents for Recorder {
    fn pcm(&self, client: ClientId, pcm: &[u8]) {
        self.ingest_pcm(client, pcm);
    }

    fn connected(&self) {
        self.on_connected();
    }

    fn disconnected(&self) {
        self.on_disconnected();
    }

    fn participants_changed(&self) {
        self.on_participants_changed();
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        // Dispose normally runs earlier; this only aborts a leaked timer.
        if let Some(handle) = self.tick_task.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

fn merge_participants(existing: &mut Vec<Participant>, current: Vec<Participant>) {
    for participant in current {
        match existing.iter_mut().find(|p| p.uid == participant.uid) {
            Some(known) => {
                if !participant.name.is_empty() {
                    known.name = participant.name;
                }
            },
            None => existing.push(participant),
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Replaces the file-name component of a slash-normalized file id.
fn rebase_file_id(file_id: &str, new_name: &str) -> String {
    match file_id.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{new_name}"),
        None => new_name.to_string(),
    }
}
