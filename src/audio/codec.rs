use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;
use std::path::Path;

use crate::error::AudioError;

const RESAMPLE_CHUNK: usize = 1024;

/// 16-bit little-endian mono PCM -> f32 in [-1, 1).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::OddPayload(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

pub fn duration_secs(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64
}

/// Concatenate buffers in order into a 16-bit mono WAV file image.
pub fn encode_wav<'a, I>(buffers: I, sample_rate: u32) -> Result<Vec<u8>, AudioError>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for buffer in buffers {
            for &sample in buffer {
                let clamped = sample.clamp(-1.0, 1.0);
                writer.write_sample((clamped * i16::MAX as f32) as i16)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

pub fn write_wav<'a, I>(path: &Path, buffers: I, sample_rate: u32) -> Result<(), AudioError>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let bytes = encode_wav(buffers, sample_rate)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Convert mono audio between sample rates.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, AudioError> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    let expected = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    let mut pos = 0;

    // Tail is zero-padded; keep feeding until the delayed output covers everything
    while out.len() < expected + delay {
        let need = resampler.input_frames_next();
        let mut chunk = vec![0.0f32; need];
        if pos < samples.len() {
            let n = need.min(samples.len() - pos);
            chunk[..n].copy_from_slice(&samples[pos..pos + n]);
            pos += n;
        }
        let frames = resampler
            .process(&[chunk], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        match frames.into_iter().next() {
            Some(channel) if !channel.is_empty() => out.extend_from_slice(&channel),
            _ => return Err(AudioError::Resample("resampler produced no output".into())),
        }
    }

    Ok(out[delay..delay + expected].to_vec())
}
