//! Audio decoding
//!
//! Uses symphonia for format-agnostic decoding (WAV, MP3, FLAC, Vorbis, AAC/M4A).

use crate::error::EngineError;
use crate::ingest::UploadedAudio;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decoded audio at its native sample rate
#[derive(Debug)]
pub struct DecodedAudio {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count before downmix
    pub channels: usize,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Decode an upload to mono f32 PCM.
///
/// Stops early with [`EngineError::Decode`] once the decoded audio exceeds
/// `max_duration`, and with [`EngineError::Cancelled`] when `cancel` fires
/// (checked between packets). Packets the codec rejects are skipped; audio
/// with no decodable packets is an error.
pub fn decode_to_mono(
    audio: &UploadedAudio,
    max_duration: Duration,
    cancel: &CancellationToken,
) -> Result<DecodedAudio, EngineError> {
    let source = audio
        .open()
        .map_err(|e| EngineError::Internal(format!("failed to open upload: {}", e)))?;
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    hint.with_extension(audio.format().extension());

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| EngineError::Decode(format!("unrecognized {} stream: {}", audio.format(), e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::Decode("no audio track found".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| EngineError::Decode(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut skipped_packets = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(EngineError::Decode(format!("error reading packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                skipped_packets += 1;
                debug!(reason = msg, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(EngineError::Decode(format!("decode failed: {}", e))),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count();

        let buf = sample_buf.get_or_insert_with(|| {
            SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
        });
        if buf.capacity() < decoded.capacity() * channels {
            *buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        }
        buf.copy_interleaved_ref(decoded);
        downmix_into(buf.samples(), channels, &mut samples);

        if sample_rate > 0 {
            let seconds = samples.len() as f64 / sample_rate as f64;
            if seconds > max_duration.as_secs_f64() {
                return Err(EngineError::Decode(format!(
                    "Audio too long: {:.1}s > {}s",
                    seconds,
                    max_duration.as_secs()
                )));
            }
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(EngineError::Decode(format!(
            "no decodable audio ({} packets rejected)",
            skipped_packets
        )));
    }

    debug!(
        sample_rate,
        channels,
        frames = samples.len(),
        skipped_packets,
        "Audio decoding complete"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Average interleaved channels into mono and append to `out`
fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}
