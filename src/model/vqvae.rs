use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Module, VarBuilder};

use super::decoder::{class_losses, teacher_inputs, WaveRnnDecoder};
use super::upsample::UpsampleNetwork;
use super::vq::{VectorQuant, VqOutput};
use super::{scalar, ModelDims, Sampling, StepLoss, Vocoder, SEQ_LEN};
use crate::audio::{self, HOP_LENGTH};
use crate::config::ModelKind;
use crate::dataset::{Batch, Clip, WindowConfig};

pub const UPSAMPLE_FACTORS: [usize; 3] = [4, 4, 4];
const ENCODER_CHANNELS: usize = 128;
const VQ_DIMS: usize = 128;
const VQ_CODES: usize = 512;
/// Jitter on the encoder's input audio.
const NOISE_Y_STD: f64 = 0.01;
/// Jitter on the decoder's previous-sample inputs, about one class step.
const NOISE_X_STD: f64 = 1.0 / 127.5;

/// Strided convolutions from audio to one latent vector per `prod(factors)` samples.
#[derive(Debug)]
struct Encoder {
    downsample: Vec<Conv1d>,
    proj: Conv1d,
}

impl Encoder {
    fn new(factors: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut downsample = Vec::with_capacity(factors.len());
        let mut in_channels = 1;
        for (i, &factor) in factors.iter().enumerate() {
            let cfg = Conv1dConfig {
                stride: factor,
                padding: factor / 2,
                ..Default::default()
            };
            downsample.push(conv1d(
                in_channels,
                ENCODER_CHANNELS,
                2 * factor,
                cfg,
                vb.pp(format!("down{i}")),
            )?);
            in_channels = ENCODER_CHANNELS;
        }
        let proj = conv1d(
            ENCODER_CHANNELS,
            VQ_DIMS,
            1,
            Conv1dConfig::default(),
            vb.pp("proj"),
        )?;
        Ok(Self { downsample, proj })
    }

    /// `(batch, samples)` to `(batch, frames, VQ_DIMS)`.
    fn forward(&self, audio: &Tensor) -> Result<Tensor> {
        let mut x = audio.unsqueeze(1)?;
        for conv in &self.downsample {
            x = conv.forward(&x)?.relu()?;
        }
        self.proj.forward(&x)?.transpose(1, 2)?.contiguous()
    }
}

#[derive(Debug)]
pub struct VqVae {
    encoder: Encoder,
    vq: VectorQuant,
    upsample: UpsampleNetwork,
    decoder: WaveRnnDecoder,
    noise_x: bool,
    noise_y: bool,
    dtype: DType,
}

impl VqVae {
    pub fn new(dims: ModelDims, vb: VarBuilder) -> Result<Self> {
        Self::with_options(dims, true, true, true, vb)
    }

    pub fn with_options(
        dims: ModelDims,
        normalize_vq: bool,
        noise_x: bool,
        noise_y: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dtype = vb.dtype();
        Ok(Self {
            encoder: Encoder::new(&UPSAMPLE_FACTORS, vb.pp("encoder"))?,
            vq: VectorQuant::new(VQ_CODES, VQ_DIMS, normalize_vq, vb.pp("vq"))?,
            upsample: UpsampleNetwork::new(VQ_DIMS, &UPSAMPLE_FACTORS, vb.pp("upsample"))?,
            decoder: WaveRnnDecoder::new(dims.rnn_dims, dims.fc_dims, VQ_DIMS, vb.pp("decoder"))?,
            noise_x,
            noise_y,
            dtype,
        })
    }

    /// Samples per latent frame.
    pub fn frame_size(&self) -> usize {
        self.upsample.total_factor()
    }

    /// Encodes, quantises and upsamples `(batch, samples)` audio into a
    /// `(batch, samples, VQ_DIMS)` decoder condition.
    fn condition(&self, audio: &Tensor, train: bool) -> Result<(Tensor, VqOutput)> {
        let mut y = audio.to_dtype(self.dtype)?;
        if train && self.noise_y {
            y = (&y + y.randn_like(0.0, NOISE_Y_STD)?)?;
        }
        let vq = self.vq.forward(&self.encoder.forward(&y)?)?;
        let cond = self
            .upsample
            .forward(&vq.quantized.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?;
        Ok((cond, vq))
    }

    fn device(&self) -> Device {
        self.encoder.proj.weight().device().clone()
    }
}

impl Vocoder for VqVae {
    fn kind(&self) -> ModelKind {
        ModelKind::Vqvae
    }

    fn window(&self) -> WindowConfig {
        WindowConfig {
            seq_len: SEQ_LEN,
            hop: HOP_LENGTH,
            mel_pad: 0,
        }
    }

    fn forward_loss(&self, batch: &Batch, train: bool) -> anyhow::Result<StepLoss> {
        let (_, samples) = batch.audio.dims2()?;
        if samples % self.frame_size() != 0 {
            anyhow::bail!(
                "vqvae windows must be a multiple of {} samples, got {samples}",
                self.frame_size()
            );
        }
        let (cond, vq) = self.condition(&batch.audio, train)?;
        let inputs = teacher_inputs(batch, self.dtype)?;
        let prev = if train && self.noise_x {
            (&inputs.prev + inputs.prev.randn_like(0.0, NOISE_X_STD)?)?
        } else {
            inputs.prev.clone()
        };
        let (coarse, fine) = self.decoder.forward(Some(&cond), &prev, &inputs.coarse)?;
        let (loss_c, loss_f) = class_losses(&coarse, &fine, &inputs)?;
        let vq_loss = vq.vq_loss.to_dtype(DType::F32)?;
        let commit_loss = vq.commit_loss.to_dtype(DType::F32)?;

        let parts = vec![
            ("c", scalar(&loss_c)?),
            ("f", scalar(&loss_f)?),
            ("vq", scalar(&vq_loss)?),
            ("vqc", scalar(&commit_loss)?),
            ("entropy", vq.entropy),
        ];
        let loss = (((loss_c + loss_f)? + vq_loss)? + commit_loss)?;
        Ok(StepLoss { loss, parts })
    }

    /// Reconstructs a clip through the bottleneck.
    fn generate(&self, clip: &Clip, sampling: &mut Sampling<'_>) -> anyhow::Result<Vec<i16>> {
        let frame = self.frame_size();
        let padded_len = clip.samples.len().div_ceil(frame).max(1) * frame;
        let mut values: Vec<f32> = clip
            .samples
            .iter()
            .map(|s| audio::sample_to_float(*s))
            .collect();
        values.resize(padded_len, 0.0);

        let input = Tensor::from_vec(values, (1, padded_len), &self.device())?;
        let (cond, _) = self.condition(&input, false)?;
        let samples = self
            .decoder
            .generate(Some(&cond), clip.samples.len(), self.dtype, sampling)?;
        Ok(samples.into_iter().map(audio::to_signed).collect())
    }
}
