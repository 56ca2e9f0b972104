// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ogg/Opus muxer.
//!
//! Writes a valid Ogg stream (ref: <https://www.rfc-editor.org/rfc/rfc7845.html>):
//! two header pages (`OpusHead`, `OpusTags`) followed by data pages whose
//! granule positions count 48 kHz output samples. Pages carry the standard
//! Ogg CRC-32 so the file is playable up to the last flushed page while it is
//! still being appended to.
//!
//! The module also contains the read-side helpers the engine and the HTTP
//! layer need for files produced by this muxer: extracting the header pages
//! of an open segment and recovering the final granule position of an
//! orphaned one.

use std::io::Write;

use tsrec_core::{RecError, Result};

use crate::mix::OPUS_SAMPLE_RATE;

pub const PAGE_HEADER_SIGNATURE: &[u8] = b"OggS";
pub const PAGE_HEADER_SIZE: usize = 27;

const ID_SIGNATURE: &[u8] = b"OpusHead";
const COMMENT_SIGNATURE: &[u8] = b"OpusTags";
const VENDOR: &str = concat!("tsrec ", env!("CARGO_PKG_VERSION"));

const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

/// Maximum entries in one page's lacing table.
const MAX_PAGE_SEGMENTS: usize = 255;

/// Fallback samples-per-packet when a code-3 packet is too short to carry its
/// frame count byte (one 20 ms frame).
const DEFAULT_SAMPLES_PER_PACKET: u32 = 960;

/// Ogg CRC-32: polynomial 0x04C11DB7, no reflection, initial value 0.
fn generate_checksum_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    const POLY: u32 = 0x04c1_1db7;

    for (i, entry) in table.iter_mut().enumerate() {
        let mut r = (i as u32) << 24;
        for _ in 0..8 {
            if (r & 0x8000_0000) != 0 {
                r = (r << 1) ^ POLY;
            } else {
                r <<= 1;
            }
        }
        *entry = r;
    }
    table
}

/// Number of 48 kHz samples contained in one Opus packet, derived from the
/// TOC byte (RFC 6716 §3.1).
pub fn packet_samples(packet: &[u8]) -> u32 {
    let Some(&toc) = packet.first() else {
        return 0;
    };
    let config = u32::from(toc >> 3);
    let code = toc & 0b11;

    let frame_count = match code {
        0 => 1,
        1 | 2 => 2,
        _ => {
            // Code 3: frame count lives in the next byte.
            let Some(&count_byte) = packet.get(1) else {
                return DEFAULT_SAMPLES_PER_PACKET;
            };
            u32::from(count_byte & 0x3F)
        },
    };

    let frame_size = match config {
        0..=11 => [480, 960, 1920, 2880][(config % 4) as usize],
        12..=15 => {
            if config % 2 == 0 {
                480
            } else {
                960
            }
        },
        _ => [120, 240, 480, 960][((config - 16) % 4) as usize],
    };

    frame_count * frame_size
}

/// Ogg/Opus muxer over any byte sink.
///
/// Packets accumulate into the current page; a page is flushed when its
/// lacing table would overflow, on explicit [`flush`](Self::flush), and with
/// the EOS flag set on [`finish`](Self::finish).
pub struct OggMuxer<W: Write> {
    writer: W,
    serial: u32,
    sequence: u32,
    /// Total 48 kHz samples across all accepted packets.
    granule: u64,
    page_payload: Vec<u8>,
    lacing: Vec<u8>,
    checksum_table: [u32; 256],
    finished: bool,
}

impl<W: Write> OggMuxer<W> {
    /// Creates the muxer and writes the two header pages.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying sink.
    pub fn new(writer: W, channels: u8) -> Result<Self> {
        Self::with_serial(writer, channels, rand::random::<u32>())
    }

    /// Like [`new`](Self::new) with a caller-chosen stream serial.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying sink.
    pub fn with_serial(writer: W, channels: u8, serial: u32) -> Result<Self> {
        let mut muxer = Self {
            writer,
            serial,
            sequence: 0,
            granule: 0,
            page_payload: Vec::new(),
            lacing: Vec::new(),
            checksum_table: generate_checksum_table(),
            finished: false,
        };
        muxer.write_headers(channels)?;
        Ok(muxer)
    }

    fn write_headers(&mut self, channels: u8) -> Result<()> {
        // OpusHead (19 bytes), RFC 7845 §5.1.
        let mut id_header = Vec::with_capacity(19);
        id_header.extend_from_slice(ID_SIGNATURE);
        id_header.push(1); // version
        id_header.push(channels);
        id_header.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
        id_header.extend_from_slice(&OPUS_SAMPLE_RATE.to_le_bytes());
        id_header.extend_from_slice(&0u16.to_le_bytes()); // output gain
        id_header.push(0); // channel mapping family
        self.write_page(FLAG_BOS, 0, &id_header)?;

        // OpusTags, RFC 7845 §5.2. No user comments.
        let mut comment_header = Vec::with_capacity(8 + 4 + VENDOR.len() + 4);
        comment_header.extend_from_slice(COMMENT_SIGNATURE);
        #[allow(clippy::cast_possible_truncation)]
        comment_header.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
        comment_header.extend_from_slice(VENDOR.as_bytes());
        comment_header.extend_from_slice(&0u32.to_le_bytes());
        self.write_page(0, 0, &comment_header)?;

        Ok(())
    }

    /// Appends one Opus packet to the current page, flushing first when the
    /// lacing table would overflow.
    ///
    /// # Errors
    ///
    /// [`RecError::Muxer`] when the packet cannot be laced into a single
    /// page; I/O errors from page flushes.
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        if self.finished {
            return Err(RecError::Muxer("write after finish".to_string()));
        }

        let full_runs = packet.len() / 255;
        // A length that is an exact multiple of 255 needs a trailing
        // zero-length segment to terminate the packet.
        let entries = full_runs + 1;

        if entries > MAX_PAGE_SEGMENTS {
            return Err(RecError::Muxer(format!(
                "packet of {} bytes does not fit a single page",
                packet.len()
            )));
        }
        if self.lacing.len() + entries > MAX_PAGE_SEGMENTS {
            self.flush()?;
        }

        for _ in 0..full_runs {
            self.lacing.push(255);
        }
        #[allow(clippy::cast_possible_truncation)]
        self.lacing.push((packet.len() % 255) as u8);
        self.page_payload.extend_from_slice(packet);
        self.granule += u64::from(packet_samples(packet));

        if self.lacing.len() == MAX_PAGE_SEGMENTS {
            self.flush()?;
        }
        Ok(())
    }

    /// Finalizes the current page and pushes it to the sink, making the file
    /// playable up to the current granule position.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying sink.
    pub fn flush(&mut self) -> Result<()> {
        if self.lacing.is_empty() {
            return Ok(());
        }
        self.emit_page(0)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes any pending packets and writes the final page with EOS set.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying sink.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.emit_page(FLAG_EOS)?;
        self.writer.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Total 48 kHz samples accepted so far.
    pub const fn granule(&self) -> u64 {
        self.granule
    }

    /// Stream duration implied by the granule position.
    pub const fn duration_ms(&self) -> u64 {
        self.granule * 1000 / OPUS_SAMPLE_RATE as u64
    }

    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Emits the pending payload as one page (possibly empty, for a bare EOS
    /// page) with the given extra flags.
    fn emit_page(&mut self, flags: u8) -> Result<()> {
        self.write_page_raw(flags, self.granule)
    }

    fn write_page(&mut self, flags: u8, granule: u64, payload: &[u8]) -> Result<()> {
        debug_assert!(self.lacing.is_empty() && self.page_payload.is_empty());
        let full_runs = payload.len() / 255;
        for _ in 0..full_runs {
            self.lacing.push(255);
        }
        #[allow(clippy::cast_possible_truncation)]
        self.lacing.push((payload.len() % 255) as u8);
        self.page_payload.extend_from_slice(payload);
        self.write_page_raw(flags, granule)
    }

    fn write_page_raw(&mut self, flags: u8, granule: u64) -> Result<()> {
        let mut page =
            Vec::with_capacity(PAGE_HEADER_SIZE + 1 + self.lacing.len() + self.page_payload.len());
        page.extend_from_slice(PAGE_HEADER_SIGNATURE);
        page.push(0); // stream structure version
        page.push(flags);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.sequence.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes()); // checksum placeholder
        #[allow(clippy::cast_possible_truncation)]
        page.push(self.lacing.len() as u8);
        page.extend_from_slice(&self.lacing);
        page.extend_from_slice(&self.page_payload);

        let mut checksum = 0u32;
        for byte in &page {
            checksum = (checksum << 8)
                ^ self.checksum_table[(((checksum >> 24) as u8) ^ *byte) as usize];
        }
        page[22..26].copy_from_slice(&checksum.to_le_bytes());

        self.writer.write_all(&page)?;
        self.sequence += 1;
        self.lacing.clear();
        self.page_payload.clear();
        Ok(())
    }
}

/// Byte length of the first two pages (the Opus headers) of `buf`, or `None`
/// when fewer than two complete pages are present.
pub fn header_pages_len(buf: &[u8]) -> Option<usize> {
    let mut pos = 0usize;
    for _ in 0..2 {
        let rel = find_signature(buf.get(pos..)?)?;
        let start = pos + rel;
        let segment_count = *buf.get(start + 26)? as usize;
        let lacing = buf.get(start + PAGE_HEADER_SIZE..start + PAGE_HEADER_SIZE + segment_count)?;
        let payload: usize = lacing.iter().map(|&b| b as usize).sum();
        pos = start + PAGE_HEADER_SIZE + segment_count + payload;
        if pos > buf.len() {
            return None;
        }
    }
    Some(pos)
}

/// Granule position of the last page whose header starts inside `tail`.
///
/// Callers pass the final few KiB of a segment file; a page header that
/// started before the window is invisible, which only costs one page of
/// accuracy.
pub fn last_granule(tail: &[u8]) -> Option<u64> {
    let mut best = None;
    let mut pos = 0usize;
    while let Some(rel) = find_signature(&tail[pos..]) {
        let start = pos + rel;
        if start + PAGE_HEADER_SIZE > tail.len() {
            break;
        }
        let mut granule_bytes = [0u8; 8];
        granule_bytes.copy_from_slice(&tail[start + 6..start + 14]);
        best = Some(u64::from_le_bytes(granule_bytes));
        pos = start + 4;
    }
    best
}

fn find_signature(buf: &[u8]) -> Option<usize> {
    buf.windows(PAGE_HEADER_SIGNATURE.len()).position(|w| w == PAGE_HEADER_SIGNATURE)
}
