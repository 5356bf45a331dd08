use candle_core::{DType, Result};
use candle_nn::VarBuilder;

use super::decoder::{class_losses, teacher_inputs, WaveRnnDecoder};
use super::{scalar, ModelDims, Sampling, StepLoss, Vocoder, SEQ_LEN};
use crate::audio::{self, HOP_LENGTH};
use crate::config::ModelKind;
use crate::dataset::{Batch, Clip, WindowConfig};

/// WaveRNN without any conditioning input.
#[derive(Debug)]
pub struct NoCond {
    decoder: WaveRnnDecoder,
    dtype: DType,
}

impl NoCond {
    pub fn new(dims: ModelDims, vb: VarBuilder) -> Result<Self> {
        let dtype = vb.dtype();
        let decoder = WaveRnnDecoder::new(dims.rnn_dims, dims.fc_dims, 0, vb.pp("decoder"))?;
        Ok(Self { decoder, dtype })
    }
}

impl Vocoder for NoCond {
    fn kind(&self) -> ModelKind {
        ModelKind::NoCond
    }

    fn window(&self) -> WindowConfig {
        WindowConfig {
            seq_len: SEQ_LEN,
            hop: HOP_LENGTH,
            mel_pad: 0,
        }
    }

    fn forward_loss(&self, batch: &Batch, _train: bool) -> anyhow::Result<StepLoss> {
        let inputs = teacher_inputs(batch, self.dtype)?;
        let (coarse, fine) = self.decoder.forward(None, &inputs.prev, &inputs.coarse)?;
        let (loss_c, loss_f) = class_losses(&coarse, &fine, &inputs)?;
        let parts = vec![("c", scalar(&loss_c)?), ("f", scalar(&loss_f)?)];
        Ok(StepLoss {
            loss: (loss_c + loss_f)?,
            parts,
        })
    }

    /// Unconditioned audio as long as the reference clip.
    fn generate(&self, clip: &Clip, sampling: &mut Sampling<'_>) -> anyhow::Result<Vec<i16>> {
        let samples = self
            .decoder
            .generate(None, clip.samples.len(), self.dtype, sampling)?;
        Ok(samples.into_iter().map(audio::to_signed).collect())
    }
}
