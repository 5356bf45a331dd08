use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use ndarray::{Array1, Array2};
use ndarray_npy::read_npy;
use rand::rngs::StdRng;
use rand::Rng;

use crate::audio::{self, NUM_MELS, SILENCE};

/// Clips taken from each end of the id list for listening tests.
const TEST_FROM_END: usize = 3;
const TEST_FROM_START: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train_ids: Vec<String>,
    pub test_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Clip {
    pub id: String,
    pub samples: Vec<i16>,
    /// `[NUM_MELS, frames]`, present only for mel-conditioned models.
    pub mel: Option<Array2<f32>>,
}

#[derive(Debug, Clone)]
pub struct AudiobookDataset {
    pub ids: Vec<String>,
    pub data_path: PathBuf,
    pub with_mels: bool,
}

/// Fixed-length training windows, cut at random offsets.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub seq_len: usize,
    pub hop: usize,
    /// Extra mel frames on each side of the window.
    pub mel_pad: usize,
}

impl WindowConfig {
    pub fn frames(&self) -> usize {
        self.seq_len / self.hop
    }
}

#[derive(Debug)]
pub struct Batch {
    /// `(batch, seq_len + 1)` coarse classes; column 0 is the sample before the window.
    pub coarse: Tensor,
    /// `(batch, seq_len + 1)` fine classes.
    pub fine: Tensor,
    /// `(batch, seq_len)` target samples as floats in [-1, 1).
    pub audio: Tensor,
    /// `(batch, NUM_MELS, frames + 2 * mel_pad)`.
    pub mel: Option<Tensor>,
}

pub fn load_dataset_ids(data_path: &Path) -> anyhow::Result<Vec<String>> {
    let index_path = data_path.join("dataset_ids.json");
    let text = fs::read_to_string(&index_path)
        .with_context(|| format!("Failed to read dataset index: {}", index_path.display()))?;
    let ids: Vec<String> = serde_json::from_str(&text)
        .with_context(|| format!("Invalid dataset index: {}", index_path.display()))?;
    Ok(ids)
}

/// Test ids are the last three followed by the first three; everything but
/// the last three is trained on.
pub fn split_ids(ids: Vec<String>, count: Option<usize>) -> DatasetSplit {
    let tail_start = ids.len().saturating_sub(TEST_FROM_END);
    let mut test_ids: Vec<String> = ids[tail_start..].to_vec();
    test_ids.extend(ids.iter().take(TEST_FROM_START).cloned());
    if let Some(count) = count {
        test_ids.truncate(count);
    }

    let mut train_ids = ids;
    train_ids.truncate(tail_start);
    DatasetSplit {
        train_ids,
        test_ids,
    }
}

impl AudiobookDataset {
    pub fn new(ids: Vec<String>, data_path: impl Into<PathBuf>, with_mels: bool) -> Self {
        Self {
            ids,
            data_path: data_path.into(),
            with_mels,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn load_clip(&self, index: usize) -> anyhow::Result<Clip> {
        let id = self
            .ids
            .get(index)
            .with_context(|| format!("Clip index out of bounds: {index}"))?;
        self.load_clip_by_id(id)
    }

    pub fn load_clip_by_id(&self, id: &str) -> anyhow::Result<Clip> {
        let quant_path = self.data_path.join("quant").join(format!("{id}.npy"));
        let samples: Array1<i16> = read_npy(&quant_path)
            .with_context(|| format!("Failed to read samples: {}", quant_path.display()))?;

        let mel = if self.with_mels {
            let mel_path = self.data_path.join("mel").join(format!("{id}.npy"));
            let mel: Array2<f32> = read_npy(&mel_path)
                .with_context(|| format!("Failed to read mel: {}", mel_path.display()))?;
            if mel.nrows() != NUM_MELS {
                anyhow::bail!(
                    "Expected {NUM_MELS} mel channels in {}, got {}",
                    mel_path.display(),
                    mel.nrows()
                );
            }
            Some(mel)
        } else {
            None
        };

        Ok(Clip {
            id: id.to_string(),
            samples: samples.to_vec(),
            mel,
        })
    }
}

pub fn collate(
    clips: &[Clip],
    window: &WindowConfig,
    rng: &mut StdRng,
    device: &Device,
) -> anyhow::Result<Batch> {
    if clips.is_empty() {
        anyhow::bail!("Cannot collate an empty batch");
    }
    let seq_len = window.seq_len;
    let frames = window.frames();
    let mel_width = frames + 2 * window.mel_pad;
    let with_mels = clips[0].mel.is_some();

    let mut coarse = Vec::with_capacity(clips.len() * (seq_len + 1));
    let mut fine = Vec::with_capacity(clips.len() * (seq_len + 1));
    let mut audio = Vec::with_capacity(clips.len() * seq_len);
    let mut mels = Vec::with_capacity(if with_mels {
        clips.len() * NUM_MELS * mel_width
    } else {
        0
    });

    for clip in clips {
        let offset = match (&clip.mel, with_mels) {
            (Some(mel), true) => {
                let max_frame = mel.ncols().saturating_sub(frames);
                let frame_offset = rng.random_range(0..=max_frame);
                push_mel_window(&mut mels, mel, frame_offset, mel_width, window.mel_pad);
                frame_offset * window.hop
            }
            (None, false) => {
                let max_offset = clip.samples.len().saturating_sub(seq_len);
                rng.random_range(0..=max_offset)
            }
            _ => anyhow::bail!("Clip {} does not match the batch's mel layout", clip.id),
        };

        for j in 0..=seq_len {
            let value = (offset + j)
                .checked_sub(1)
                .and_then(|idx| clip.samples.get(idx))
                .map(|sample| audio::to_unsigned(*sample))
                .unwrap_or(SILENCE);
            let (c, f) = audio::split(value);
            coarse.push(c);
            fine.push(f);
            if j > 0 {
                audio.push(audio::sample_to_float(audio::to_signed(value)));
            }
        }
    }

    let batch = clips.len();
    let mel = if with_mels {
        Some(Tensor::from_vec(mels, (batch, NUM_MELS, mel_width), device)?)
    } else {
        None
    };
    Ok(Batch {
        coarse: Tensor::from_vec(coarse, (batch, seq_len + 1), device)?,
        fine: Tensor::from_vec(fine, (batch, seq_len + 1), device)?,
        audio: Tensor::from_vec(audio, (batch, seq_len), device)?,
        mel,
    })
}

/// Appends `width` frames starting `pad` frames before `frame_offset`, zero outside the clip.
fn push_mel_window(
    out: &mut Vec<f32>,
    mel: &Array2<f32>,
    frame_offset: usize,
    width: usize,
    pad: usize,
) {
    for channel in 0..NUM_MELS {
        for k in 0..width {
            let value = (frame_offset + k)
                .checked_sub(pad)
                .filter(|frame| *frame < mel.ncols())
                .map(|frame| mel[[channel, frame]])
                .unwrap_or(0.0);
            out.push(value);
        }
    }
}

/// Mel frames padded by `pad` zero frames on both sides, as a `(1, NUM_MELS, frames)` tensor.
pub fn padded_mel_tensor(mel: &Array2<f32>, pad: usize, device: &Device) -> anyhow::Result<Tensor> {
    let width = mel.ncols() + 2 * pad;
    let mut values = Vec::with_capacity(NUM_MELS * width);
    push_mel_window(&mut values, mel, 0, width, pad);
    Ok(Tensor::from_vec(values, (1, NUM_MELS, width), device)?)
}
