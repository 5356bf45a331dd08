//! The three vocoder variants behind one [`Vocoder`] interface.
//!
//! All of them decode audio with [`decoder::WaveRnnDecoder`]; they differ in what
//! conditions it: nothing (`nc`), upsampled mel frames (`wavernn`) or a
//! vector-quantised encoding of the audio itself (`vqvae`).

pub mod decoder;
pub mod nocond;
pub mod upsample;
pub mod vq;
pub mod vqvae;
pub mod wavernn;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use indicatif::ProgressBar;
use rand::rngs::StdRng;

use crate::audio::HOP_LENGTH;
use crate::config::ModelKind;
use crate::dataset::{Batch, Clip, WindowConfig};

#[derive(Debug, Clone, Copy)]
pub struct ModelDims {
    pub rnn_dims: usize,
    pub fc_dims: usize,
}

/// Teacher-forced loss of one batch plus named scalars for logging.
#[derive(Debug)]
pub struct StepLoss {
    pub loss: Tensor,
    pub parts: Vec<(&'static str, f64)>,
}

pub struct Sampling<'a> {
    pub rng: &'a mut StdRng,
    /// Take the most likely class instead of sampling.
    pub deterministic: bool,
    pub progress: &'a ProgressBar,
}

pub trait Vocoder {
    fn kind(&self) -> ModelKind;

    /// Training windows this model expects from `collate`.
    fn window(&self) -> WindowConfig;

    fn forward_loss(&self, batch: &Batch, train: bool) -> anyhow::Result<StepLoss>;

    fn generate(&self, clip: &Clip, sampling: &mut Sampling<'_>) -> anyhow::Result<Vec<i16>>;
}

/// Training windows are five mel frames long.
pub const SEQ_LEN: usize = HOP_LENGTH * 5;

pub fn build_model(kind: ModelKind, dims: ModelDims, vb: VarBuilder) -> Result<Box<dyn Vocoder>> {
    Ok(match kind {
        ModelKind::Vqvae => Box::new(vqvae::VqVae::new(dims, vb)?),
        ModelKind::Wavernn => Box::new(wavernn::WaveRnn::new(dims, vb)?),
        ModelKind::NoCond => Box::new(nocond::NoCond::new(dims, vb)?),
    })
}

pub(crate) fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?))
}
