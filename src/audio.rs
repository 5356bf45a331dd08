use std::fs;
use std::path::Path;

use anyhow::Context;
use hound::{SampleFormat, WavSpec, WavWriter};

pub const SAMPLE_RATE: u32 = 22050;
/// Audio samples per mel frame.
pub const HOP_LENGTH: usize = 256;
pub const NUM_MELS: usize = 80;
/// Classes per coarse or fine byte.
pub const N_CLASSES: usize = 256;
/// Offset-encoded value of a zero sample.
pub const SILENCE: u16 = 1 << 15;

pub fn to_unsigned(sample: i16) -> u16 {
    (i32::from(sample) + 32768) as u16
}

pub fn to_signed(value: u16) -> i16 {
    (i32::from(value) - 32768) as i16
}

pub fn split(value: u16) -> (u32, u32) {
    (u32::from(value >> 8), u32::from(value & 0xff))
}

pub fn combine(coarse: u32, fine: u32) -> u16 {
    ((coarse.min(255) << 8) | fine.min(255)) as u16
}

/// Network input for a coarse or fine class, in [-1, 1].
pub fn class_to_float(class: u32) -> f32 {
    class as f32 / 127.5 - 1.0
}

pub fn sample_to_float(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

pub fn write_wav(path: &Path, samples: &[i16]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finalize WAV file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_encoding_boundaries() {
        assert_eq!(to_unsigned(i16::MIN), 0);
        assert_eq!(to_unsigned(0), SILENCE);
        assert_eq!(to_unsigned(i16::MAX), u16::MAX);
        assert_eq!(to_signed(SILENCE), 0);
        assert_eq!(to_signed(to_unsigned(-1234)), -1234);
    }

    #[test]
    fn coarse_fine_split() {
        assert_eq!(split(SILENCE), (128, 0));
        assert_eq!(split(0x12ab), (0x12, 0xab));
        assert_eq!(combine(0x12, 0xab), 0x12ab);
        assert_eq!(combine(255, 255), u16::MAX);
    }

    #[test]
    fn class_inputs_span_unit_interval() {
        assert_eq!(class_to_float(0), -1.0);
        assert_eq!(class_to_float(255), 1.0);
        assert!(class_to_float(128).abs() < 0.01);
    }

    #[test]
    fn wav_is_mono_16_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.wav");
        write_wav(&path, &[0, 100, -100, i16::MAX]).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 100, -100, i16::MAX]);
    }
}
