//! Passthrough recording and upload (§6, supplemented per `s3_upload.py`).
//!
//! `s3_upload.py` hand-rolls a 44-byte RIFF/WAVE/PCM16 header with
//! `struct.pack`; the corpus reaches for `hound` for this instead (see
//! `DESIGN.md`), so the header bytes themselves are never touched here.
//! The original uploads to S3 via `boto3`; no S3 SDK appears anywhere in
//! the retrieved corpus, so the uploader is a generic HTTP PUT behind a
//! trait, backed by `reqwest` (already part of the teacher's stack).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::error;

use crate::constants::SAMPLE_RATE;

/// Writes a PCM16 WAV file to `path` as samples arrive, then hands the
/// finished file back to the caller for upload. Writing straight to a
/// file (rather than an in-memory buffer) matches how `hound` is used
/// elsewhere in the corpus and avoids holding the whole recording in RAM.
pub struct ToneRecorder {
    path: PathBuf,
    writer: Option<WavWriter<std::io::BufWriter<std::fs::File>>>,
}

impl ToneRecorder {
    pub fn start(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path = path.as_ref().to_path_buf();
        let writer = WavWriter::create(&path, spec).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Self { path, writer: Some(writer) })
    }

    pub fn write_samples(&mut self, samples: &[i16]) {
        if let Some(writer) = self.writer.as_mut() {
            for &s in samples {
                if let Err(e) = writer.write_sample(s) {
                    error!(error = %e, "failed to write recording sample");
                    break;
                }
            }
        }
    }

    /// Finalizes the WAV header and returns the completed file's path.
    pub fn finish(mut self) -> PathBuf {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                error!(error = %e, "failed to finalize recording");
            }
        }
        self.path
    }
}

#[async_trait]
pub trait ObjectStoreUploader: Send + Sync {
    async fn upload(&self, path: &Path, tone_a_hz: f64, tone_b_hz: f64) -> anyhow::Result<()>;
}

pub struct HttpObjectStoreUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStoreUploader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn object_key(tone_a_hz: f64, tone_b_hz: f64) -> String {
        let timestamp = PathBuf::from("recordings");
        format!(
            "{}/{}-{:.0}-{:.0}.wav",
            timestamp.display(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            tone_a_hz,
            tone_b_hz
        )
    }
}

#[async_trait]
impl ObjectStoreUploader for HttpObjectStoreUploader {
    async fn upload(&self, path: &Path, tone_a_hz: f64, tone_b_hz: f64) -> anyhow::Result<()> {
        let data = tokio::fs::read(path).await?;
        let key = Self::object_key(tone_a_hz, tone_b_hz);
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), key);
        let response = self.client.put(&url).body(data).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_writes_a_valid_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.wav");
        let mut recorder = ToneRecorder::start(&path).unwrap();
        recorder.write_samples(&[0, 100, -100, i16::MAX, i16::MIN]);
        let finished = recorder.finish();
        assert_eq!(finished, path);

        let reader = hound::WavReader::open(&finished).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
    }

    #[test]
    fn object_key_contains_tone_frequencies() {
        let key = HttpObjectStoreUploader::object_key(800.0, 1000.0);
        assert!(key.contains("800"));
        assert!(key.contains("1000"));
        assert!(key.starts_with("recordings/"));
    }
}
