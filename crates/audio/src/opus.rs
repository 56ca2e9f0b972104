// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Opus encoder wrapper.
//!
//! One encoder per segment, fed exactly one 20 ms stereo frame per mix tick.
//! The encode path is synchronous and runs inside the tick.

use tsrec_core::{RecError, Result};

use crate::mix::{FRAME_SAMPLES, OPUS_SAMPLE_RATE};

/// Output buffer size for encoded Opus packets.
const OPUS_OUTPUT_BUFFER_SIZE: usize = 4000;

/// Stereo Opus encoder producing one packet per mix frame.
pub struct OpusEncoder {
    encoder: opus::Encoder,
    output: Box<[u8; OPUS_OUTPUT_BUFFER_SIZE]>,
}

impl OpusEncoder {
    /// Creates a 48 kHz stereo encoder with the given bitrate.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Codec`] if the encoder rejects the configuration.
    pub fn new(bitrate_bps: i32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(OPUS_SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Audio)
                .map_err(|e| RecError::Codec(format!("failed to create Opus encoder: {e}")))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate_bps.max(1000)))
            .map_err(|e| RecError::Codec(format!("failed to set Opus bitrate: {e}")))?;
        Ok(Self { encoder, output: Box::new([0u8; OPUS_OUTPUT_BUFFER_SIZE]) })
    }

    /// Encodes one interleaved stereo frame and returns the packet bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Codec`] on encoder failure; the caller drops the
    /// frame and the tick continues.
    pub fn encode_frame(&mut self, pcm: &[i16; FRAME_SAMPLES]) -> Result<&[u8]> {
        let written = self
            .encoder
            .encode(pcm.as_slice(), self.output.as_mut_slice())
            .map_err(|e| RecError::Codec(format!("Opus encode failed: {e}")))?;
        Ok(&self.output[..written])
    }
}
