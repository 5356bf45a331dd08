use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Module, VarBuilder};

use super::decoder::{class_losses, teacher_inputs, WaveRnnDecoder};
use super::upsample::UpsampleNetwork;
use super::{scalar, ModelDims, Sampling, StepLoss, Vocoder, SEQ_LEN};
use crate::audio::{self, HOP_LENGTH, NUM_MELS};
use crate::config::ModelKind;
use crate::dataset::{padded_mel_tensor, Batch, Clip, WindowConfig};

/// Mel frames of context on each side of a window.
pub const PAD: usize = 2;
pub const UPSAMPLE_FACTORS: [usize; 3] = [4, 8, 8];
const AUX_DIMS: usize = 128;

/// Mel-conditioned WaveRNN.
#[derive(Debug)]
pub struct WaveRnn {
    mel_conv: Conv1d,
    upsample: UpsampleNetwork,
    decoder: WaveRnnDecoder,
    dtype: DType,
}

impl WaveRnn {
    pub fn new(dims: ModelDims, vb: VarBuilder) -> Result<Self> {
        let dtype = vb.dtype();
        let mel_conv = conv1d(
            NUM_MELS,
            AUX_DIMS,
            2 * PAD + 1,
            Conv1dConfig::default(),
            vb.pp("mel_conv"),
        )?;
        let upsample = UpsampleNetwork::new(AUX_DIMS, &UPSAMPLE_FACTORS, vb.pp("upsample"))?;
        if upsample.total_factor() != HOP_LENGTH {
            candle_core::bail!(
                "upsample factors multiply to {}, expected the hop length {HOP_LENGTH}",
                upsample.total_factor()
            );
        }
        let decoder = WaveRnnDecoder::new(dims.rnn_dims, dims.fc_dims, AUX_DIMS, vb.pp("decoder"))?;
        Ok(Self {
            mel_conv,
            upsample,
            decoder,
            dtype,
        })
    }

    /// `(batch, NUM_MELS, frames + 2 * PAD)` mels to `(batch, frames * hop, AUX_DIMS)`.
    fn condition(&self, mel: &Tensor) -> Result<Tensor> {
        let aux = self.mel_conv.forward(&mel.to_dtype(self.dtype)?)?.relu()?;
        self.upsample.forward(&aux)?.transpose(1, 2)?.contiguous()
    }

    fn device(&self) -> Device {
        self.mel_conv.weight().device().clone()
    }
}

impl Vocoder for WaveRnn {
    fn kind(&self) -> ModelKind {
        ModelKind::Wavernn
    }

    fn window(&self) -> WindowConfig {
        WindowConfig {
            seq_len: SEQ_LEN,
            hop: HOP_LENGTH,
            mel_pad: PAD,
        }
    }

    fn forward_loss(&self, batch: &Batch, _train: bool) -> anyhow::Result<StepLoss> {
        let mel = batch
            .mel
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("wavernn batches need mel frames"))?;
        let cond = self.condition(mel)?;
        let inputs = teacher_inputs(batch, self.dtype)?;
        let (coarse, fine) = self
            .decoder
            .forward(Some(&cond), &inputs.prev, &inputs.coarse)?;
        let (loss_c, loss_f) = class_losses(&coarse, &fine, &inputs)?;
        let parts = vec![("c", scalar(&loss_c)?), ("f", scalar(&loss_f)?)];
        Ok(StepLoss {
            loss: (loss_c + loss_f)?,
            parts,
        })
    }

    fn generate(&self, clip: &Clip, sampling: &mut Sampling<'_>) -> anyhow::Result<Vec<i16>> {
        let mel = clip
            .mel
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("clip {} has no mel frames", clip.id))?;
        let device = self.device();
        let cond = self.condition(&padded_mel_tensor(mel, PAD, &device)?)?;
        let len = mel.ncols() * HOP_LENGTH;
        let samples = self
            .decoder
            .generate(Some(&cond), len, self.dtype, sampling)?;
        Ok(samples.into_iter().map(audio::to_signed).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util;
    use super::*;
    use crate::dataset::collate;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn clip(frames: usize) -> Clip {
        Clip {
            id: "m".into(),
            samples: (0..frames * HOP_LENGTH)
                .map(|i| ((i * 13) % 4000) as i16 - 2000)
                .collect(),
            mel: Some(Array2::from_shape_fn((NUM_MELS, frames), |(c, t)| {
                ((c + t) % 7) as f32 / 7.0
            })),
        }
    }

    #[test]
    fn mel_conditioned_training_step() {
        let (varmap, model) = test_util::tiny(ModelKind::Wavernn);
        let batch = test_util::batch_for(model.as_ref(), &[clip(8), clip(6)]);
        assert_eq!(batch.mel.as_ref().unwrap().dims(), &[2, NUM_MELS, 5 + 2 * PAD]);
        test_util::assert_trains(&varmap, model.as_ref(), &batch);
    }

    #[test]
    fn half_precision_trains_and_generates() {
        test_util::assert_half_precision(ModelKind::Wavernn, &clip(6), 6 * HOP_LENGTH);
    }

    #[test]
    fn generates_one_hop_per_frame() {
        let (_varmap, model) = test_util::tiny(ModelKind::Wavernn);
        assert_eq!(
            test_util::generate(model.as_ref(), &clip(1)).len(),
            HOP_LENGTH
        );
    }

    #[test]
    fn batches_without_mels_are_rejected() {
        let (_varmap, model) = test_util::tiny(ModelKind::Wavernn);
        let clip = Clip {
            id: "x".into(),
            samples: vec![0; SEQ_LEN],
            mel: None,
        };
        let nocond_window = WindowConfig {
            seq_len: SEQ_LEN,
            hop: HOP_LENGTH,
            mel_pad: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let batch = collate(&[clip], &nocond_window, &mut rng, &Device::Cpu).unwrap();
        assert!(model.forward_loss(&batch, true).is_err());
    }
}
