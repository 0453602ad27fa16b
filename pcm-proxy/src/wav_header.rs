//! RIFF/WAVE header synthesis for decoder output.
//!
//! The decoder always emits 16-bit stereo PCM at 44.1 kHz, so the full size of
//! the resource can be predicted from the track duration alone. The player does
//! all of its range math against that size, so it must never change once a
//! track has been accepted.

pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u16 = 2;
pub const BYTES_PER_SAMPLE: u16 = 2;
pub const HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = BYTES_PER_SAMPLE * 8;
const BLOCK_ALIGN: u16 = CHANNELS * BYTES_PER_SAMPLE;
const BYTE_RATE: u32 = SAMPLE_RATE * BLOCK_ALIGN as u32;
const PCM_FORMAT: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;
/// Most samples whose header plus payload still fits in a `u64`.
const MAX_SAMPLES: u64 = (u64::MAX - HEADER_LEN as u64) / BLOCK_ALIGN as u64;

/// A synthesized header plus the exact length of the resource it describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    bytes: [u8; HEADER_LEN],
    data_size: u64,
}

impl ContainerHeader {
    /// Build the header for a track of `duration_seconds`.
    ///
    /// Zero, negative and non-finite durations produce a valid empty resource.
    /// Absurdly long durations are capped so `total_length` never overflows.
    pub fn synthesize(duration_seconds: f64) -> Self {
        let num_samples = sample_count(duration_seconds);
        let data_size = num_samples * BLOCK_ALIGN as u64;

        // RIFF size fields are 32 bits wide; very long tracks saturate there
        // while total_length stays exact.
        let data_field = u32::try_from(data_size).unwrap_or(u32::MAX);
        let riff_field = data_field.saturating_add(HEADER_LEN as u32 - 8);

        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(b"RIFF");
        bytes[4..8].copy_from_slice(&riff_field.to_le_bytes());
        bytes[8..12].copy_from_slice(b"WAVE");
        bytes[12..16].copy_from_slice(b"fmt ");
        bytes[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
        bytes[20..22].copy_from_slice(&PCM_FORMAT.to_le_bytes());
        bytes[22..24].copy_from_slice(&CHANNELS.to_le_bytes());
        bytes[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
        bytes[28..32].copy_from_slice(&BYTE_RATE.to_le_bytes());
        bytes[32..34].copy_from_slice(&BLOCK_ALIGN.to_le_bytes());
        bytes[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
        bytes[36..40].copy_from_slice(b"data");
        bytes[40..44].copy_from_slice(&data_field.to_le_bytes());

        Self { bytes, data_size }
    }

    pub fn bytes(&self) -> &[u8; HEADER_LEN] {
        &self.bytes
    }

    /// Size of the PCM payload that follows the header.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Header plus payload, i.e. the `Content-Length` of a full response.
    pub fn total_length(&self) -> u64 {
        HEADER_LEN as u64 + self.data_size
    }
}

fn sample_count(duration_seconds: f64) -> u64 {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return 0;
    }
    // Float to int casts saturate, so only the cap is needed here.
    ((SAMPLE_RATE as f64 * duration_seconds).floor() as u64).min(MAX_SAMPLES)
}
