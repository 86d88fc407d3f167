//! The output WAV file, grown one chunk at a time.
//!
//! WAV has no append primitive, so every append reads the existing samples back and
//! rewrites the whole file. The rewrite goes to a temporary sibling which is then
//! renamed over the original; an interrupted write leaves the previous audio intact.
//!
//! Samples are stored as mono 16-bit PCM. The RIFF size fields are 32-bit, which caps
//! a file at about 24 hours of 24 kHz audio; appends past that are refused.

use super::AudioError;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, warn};
use std::io::BufWriter;
use std::path::Path;
use tempfile::NamedTempFile;

/// Bytes per stored sample (16-bit PCM).
const BYTES_PER_SAMPLE: u64 = 2;

/// Upper bound on the header bytes counted in the RIFF size field.
const HEADER_RESERVE: u64 = 64;

/// Most samples a single output file can hold.
pub const MAX_SAMPLES: usize = ((u32::MAX as u64 - HEADER_RESERVE) / BYTES_PER_SAMPLE) as usize;

/// Result of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendStats {
    /// Samples in the file after the append
    pub total_samples: usize,
    /// Samples added by this append
    pub appended: usize,
    /// Sample rate the file was written with
    pub sample_rate: u32,
    /// Whether the file was (re)created rather than extended
    pub created: bool,
}

/// Append `samples` to the WAV file at `path`.
///
/// When `is_first_chunk` is set, or the file does not exist yet, a new file is
/// written and any previous content is discarded. Otherwise the existing samples
/// are read back and the concatenation is written in their place.
pub fn append_samples(
    path: &Path,
    samples: &[f32],
    sample_rate: u32,
    is_first_chunk: bool,
) -> Result<AppendStats, AudioError> {
    if is_first_chunk || !path.exists() {
        check_capacity(path, samples.len())?;
        write_wav(path, samples, sample_rate)?;
        debug!("Created {} with {} samples", path.display(), samples.len());
        return Ok(AppendStats {
            total_samples: samples.len(),
            appended: samples.len(),
            sample_rate,
            created: true,
        });
    }

    let (mut combined, existing_rate) = read_wav(path)?;
    if existing_rate != sample_rate {
        warn!(
            "Sample rate mismatch in {}: existing {}, new {}",
            path.display(),
            existing_rate,
            sample_rate
        );
    }

    check_capacity(path, combined.len() + samples.len())?;
    combined.extend_from_slice(samples);
    write_wav(path, &combined, sample_rate)?;

    Ok(AppendStats {
        total_samples: combined.len(),
        appended: samples.len(),
        sample_rate,
        created: false,
    })
}

/// Read every sample of a WAV file as `f32`, along with its sample rate.
///
/// Multi-channel files are flattened: the interleaved sample sequence is returned
/// as a single channel.
pub fn read_wav(path: &Path) -> Result<(Vec<f32>, u32), AudioError> {
    let read_err = |source| AudioError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = WavReader::open(path).map_err(read_err)?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err)?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_err)?
        }
    };

    if spec.channels > 1 {
        debug!(
            "Flattening {}-channel audio from {}",
            spec.channels,
            path.display()
        );
    }

    Ok((samples, spec.sample_rate))
}

/// Number of samples stored in a WAV file (all channels).
pub fn sample_count(path: &Path) -> Result<usize, AudioError> {
    let reader = WavReader::open(path).map_err(|source| AudioError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(reader.len() as usize)
}

/// Fail when `total_samples` would overflow the WAV size fields.
fn check_capacity(path: &Path, total_samples: usize) -> Result<(), AudioError> {
    if total_samples > MAX_SAMPLES {
        return Err(AudioError::TooLong {
            path: path.to_path_buf(),
            samples: total_samples,
            max: MAX_SAMPLES,
        });
    }
    Ok(())
}

/// Convert a float sample to 16-bit PCM, clipping to [-1, 1].
fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Write mono 16-bit PCM samples to `path`, replacing it atomically.
fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
    if sample_rate == 0 {
        return Err(AudioError::InvalidSampleRate(sample_rate));
    }

    let io_err = |source| AudioError::Io {
        path: path.to_path_buf(),
        source,
    };
    let write_err = |source| AudioError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(dir).map_err(io_err)?;

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    {
        let mut writer = WavWriter::new(BufWriter::new(temp.as_file()), spec).map_err(write_err)?;
        for &sample in samples {
            writer.write_sample(to_pcm16(sample)).map_err(write_err)?;
        }
        writer.finalize().map_err(write_err)?;
    }

    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
