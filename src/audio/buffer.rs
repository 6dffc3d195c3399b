use std::io::Cursor;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hound::{SampleFormat, WavSpec, WavWriter};

use super::InputFormat;
use crate::error::{Result, VoxError};

/// A finished recording, ready to upload.
#[derive(Debug, Clone)]
pub struct AudioBlob {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub duration: Duration,
    pub recorded_at: DateTime<Utc>,
}

impl AudioBlob {
    pub const FILE_NAME: &'static str = "voice_input.wav";
    pub const WAV_MIME: &'static str = "audio/wav";

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Mono samples accumulated for one recording attempt.
#[derive(Debug)]
pub struct CaptureBuffer {
    samples: Vec<f32>,
    format: InputFormat,
    started_at: DateTime<Utc>,
}

impl CaptureBuffer {
    #[must_use]
    pub fn new(format: InputFormat) -> Self {
        Self {
            samples: Vec::new(),
            format,
            started_at: Utc::now(),
        }
    }

    /// Append one interleaved frame, averaging channels down to mono.
    pub fn push_interleaved(&mut self, data: &[f32]) {
        let channels = usize::from(self.format.channels.max(1));
        if channels == 1 {
            self.samples.extend_from_slice(data);
            return;
        }
        self.samples.extend(
            data.chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        let rate = f64::from(self.format.sample_rate.max(1));
        Duration::from_secs_f64(self.samples.len() as f64 / rate)
    }

    /// Encode the buffer as 16-bit mono WAV at the input's native rate.
    pub fn finish(self) -> Result<AudioBlob> {
        let duration = self.duration();
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| VoxError::Audio(format!("failed to create WAV writer: {e}")))?;
            for &sample in &self.samples {
                let clamped = sample.clamp(-1.0, 1.0);
                writer
                    .write_sample((clamped * f32::from(i16::MAX)) as i16)
                    .map_err(|e| VoxError::Audio(format!("failed to write WAV sample: {e}")))?;
            }
            writer
                .finalize()
                .map_err(|e| VoxError::Audio(format!("failed to finalize WAV: {e}")))?;
        }

        Ok(AudioBlob {
            bytes: cursor.into_inner(),
            mime: AudioBlob::WAV_MIME,
            duration,
            recorded_at: self.started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONO_16K: InputFormat = InputFormat {
        sample_rate: 16000,
        channels: 1,
    };

    #[test]
    fn stereo_is_downmixed() {
        let mut buffer = CaptureBuffer::new(InputFormat {
            sample_rate: 16000,
            channels: 2,
        });
        buffer.push_interleaved(&[1.0, 0.0, 0.5, 0.5, -1.0, -1.0]);
        assert_eq!(buffer.samples, vec![0.5, 0.5, -1.0]);
    }

    #[test]
    fn finish_writes_wav_of_expected_size() {
        let mut buffer = CaptureBuffer::new(MONO_16K);
        buffer.push_interleaved(&vec![0.25; 16000]);
        let blob = buffer.finish().unwrap_or_else(|e| panic!("{e}"));

        // 44-byte header + 2 bytes per sample
        assert_eq!(blob.len(), 44 + 32000);
        assert_eq!(blob.mime, "audio/wav");
        assert_eq!(blob.duration, Duration::from_secs(1));
        assert_eq!(&blob.bytes[..4], b"RIFF");
    }

    #[test]
    fn samples_are_clamped() {
        let mut buffer = CaptureBuffer::new(MONO_16K);
        buffer.push_interleaved(&[1.5, -1.5]);
        let blob = buffer.finish().unwrap_or_else(|e| panic!("{e}"));

        let mut reader =
            hound::WavReader::new(Cursor::new(blob.bytes)).unwrap_or_else(|e| panic!("{e}"));
        let samples: Vec<i16> = reader
            .samples::<i16>()
            .map(|s| s.unwrap_or_else(|e| panic!("{e}")))
            .collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX]);
    }

    #[test]
    fn empty_buffer_is_header_only() {
        let blob = CaptureBuffer::new(MONO_16K)
            .finish()
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(blob.len(), 44);
        assert_eq!(blob.duration, Duration::ZERO);
    }
}
