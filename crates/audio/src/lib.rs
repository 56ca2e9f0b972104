// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TSRec Audio - the sample-level building blocks of the recording engine.
//!
//! ## Modules
//!
//! - [`pcm`]: per-sender jitter buffer for decoded PCM
//! - [`mix`]: 20 ms frame accumulation, saturation and loudness math
//! - [`opus`]: Opus encoder wrapper producing one packet per mix tick
//! - [`ogg`]: Ogg/Opus muxer with CRC-correct, granule-tracked pages
//! - [`waveform`]: TSWF loudness sidecar writer

pub mod mix;
pub mod ogg;
pub mod opus;
pub mod pcm;
pub mod waveform;

pub use mix::{FRAME_BYTES, FRAME_SAMPLES, MIX_TICK, OPUS_SAMPLE_RATE};
pub use ogg::OggMuxer;
pub use opus::OpusEncoder;
pub use pcm::PcmBuffer;
pub use waveform::WaveformSet;
