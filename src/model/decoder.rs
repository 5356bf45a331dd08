use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::{linear, Linear, Module, VarBuilder};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;

use super::Sampling;
use crate::audio::{self, N_CLASSES, SILENCE};
use crate::dataset::Batch;

/// Backpropagation through time is truncated to this many steps.
pub const TBPTT_STEPS: usize = 128;

/// Dual-softmax WaveRNN. The coarse GRU sees `[cond, c(t-1), f(t-1)]`, the
/// fine GRU additionally sees the current coarse class `c(t)`.
#[derive(Debug)]
pub struct WaveRnnDecoder {
    coarse_rnn: GRU,
    fine_rnn: GRU,
    coarse_fc1: Linear,
    coarse_fc2: Linear,
    fine_fc1: Linear,
    fine_fc2: Linear,
    cond_dims: usize,
}

/// Teacher-forcing inputs and targets cut from a batch.
#[derive(Debug)]
pub struct TeacherInputs {
    /// `(batch, seq, 2)` previous coarse and fine inputs.
    pub prev: Tensor,
    /// `(batch, seq, 1)` current coarse input.
    pub coarse: Tensor,
    /// `(batch * seq)` class targets.
    pub coarse_target: Tensor,
    pub fine_target: Tensor,
}

impl WaveRnnDecoder {
    pub fn new(rnn_dims: usize, fc_dims: usize, cond_dims: usize, vb: VarBuilder) -> Result<Self> {
        let half = rnn_dims / 2;
        let coarse_rnn = gru(cond_dims + 2, half, GRUConfig::default(), vb.pp("coarse_rnn"))?;
        let fine_rnn = gru(cond_dims + 3, half, GRUConfig::default(), vb.pp("fine_rnn"))?;
        Ok(Self {
            coarse_rnn,
            fine_rnn,
            coarse_fc1: linear(half, fc_dims, vb.pp("coarse_fc1"))?,
            coarse_fc2: linear(fc_dims, N_CLASSES, vb.pp("coarse_fc2"))?,
            fine_fc1: linear(half, fc_dims, vb.pp("fine_fc1"))?,
            fine_fc2: linear(fc_dims, N_CLASSES, vb.pp("fine_fc2"))?,
            cond_dims,
        })
    }

    /// Logits for every position of a teacher-forced sequence.
    pub fn forward(
        &self,
        cond: Option<&Tensor>,
        prev: &Tensor,
        coarse: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let coarse_in = match cond {
            Some(cond) => Tensor::cat(&[cond, prev], D::Minus1)?,
            None => prev.clone(),
        };
        let fine_in = Tensor::cat(&[&coarse_in, coarse], D::Minus1)?;

        let hc = run_sequence(&self.coarse_rnn, &coarse_in)?;
        let hf = run_sequence(&self.fine_rnn, &fine_in)?;
        let coarse_logits = self
            .coarse_fc2
            .forward(&self.coarse_fc1.forward(&hc)?.relu()?)?;
        let fine_logits = self.fine_fc2.forward(&self.fine_fc1.forward(&hf)?.relu()?)?;
        Ok((coarse_logits, fine_logits))
    }

    /// Autoregressive sample-level decoding. `cond` is `(1, len, cond_dims)`
    /// or `None` for the unconditioned model.
    pub fn generate(
        &self,
        cond: Option<&Tensor>,
        len: usize,
        dtype: DType,
        sampling: &mut Sampling<'_>,
    ) -> Result<Vec<u16>> {
        let device = self.coarse_fc1.weight().device().clone();
        if let Some(cond) = cond {
            let (_, cond_len, cond_dims) = cond.dims3()?;
            if cond_len < len || cond_dims != self.cond_dims {
                candle_core::bail!(
                    "condition shape {:?} does not cover {len} samples of {} dims",
                    cond.dims(),
                    self.cond_dims
                );
            }
        }

        let mut coarse_state = self.coarse_rnn.zero_state(1)?;
        let mut fine_state = self.fine_rnn.zero_state(1)?;
        let (mut c_prev, mut f_prev) = audio::split(SILENCE);
        let mut out = Vec::with_capacity(len);

        for t in 0..len {
            let prev = Tensor::from_vec(
                vec![audio::class_to_float(c_prev), audio::class_to_float(f_prev)],
                (1, 2),
                &device,
            )?
            .to_dtype(dtype)?;
            let coarse_in = match cond {
                Some(cond) => Tensor::cat(&[&cond.i((.., t, ..))?, &prev], 1)?,
                None => prev,
            };

            coarse_state = self.coarse_rnn.step(&coarse_in, &coarse_state)?;
            let logits = self
                .coarse_fc2
                .forward(&self.coarse_fc1.forward(coarse_state.h())?.relu()?)?;
            let c = pick_class(&logits, sampling)?;

            let c_in = Tensor::from_vec(vec![audio::class_to_float(c)], (1, 1), &device)?
                .to_dtype(dtype)?;
            let fine_in = Tensor::cat(&[&coarse_in, &c_in], 1)?;
            fine_state = self.fine_rnn.step(&fine_in, &fine_state)?;
            let logits = self
                .fine_fc2
                .forward(&self.fine_fc1.forward(fine_state.h())?.relu()?)?;
            let f = pick_class(&logits, sampling)?;

            out.push(audio::combine(c, f));
            c_prev = c;
            f_prev = f;
            if t % 1000 == 999 {
                sampling.progress.inc(1000);
            }
        }
        sampling.progress.inc((len % 1000) as u64);
        Ok(out)
    }
}

/// Runs `rnn` over `(batch, seq, features)`, detaching the hidden state every
/// `TBPTT_STEPS` so the autograd graph stays shallow.
fn run_sequence(rnn: &GRU, input: &Tensor) -> Result<Tensor> {
    let (batch, seq, _) = input.dims3()?;
    let mut state = rnn.zero_state(batch)?;
    let mut outputs = Vec::with_capacity(seq.div_ceil(TBPTT_STEPS));
    let mut start = 0;
    while start < seq {
        let len = TBPTT_STEPS.min(seq - start);
        let chunk = input.narrow(1, start, len)?.contiguous()?;
        let states = rnn.seq_init(&chunk, &state)?;
        let hidden: Vec<Tensor> = states.iter().map(|s| s.h().clone()).collect();
        outputs.push(Tensor::stack(&hidden, 1)?);
        if let Some(last) = states.last() {
            state = GRUState {
                h: last.h().detach(),
            };
        }
        start += len;
    }
    Tensor::cat(&outputs, 1)
}

fn pick_class(logits: &Tensor, sampling: &mut Sampling<'_>) -> Result<u32> {
    let logits = logits.to_dtype(DType::F32)?.squeeze(0)?;
    if sampling.deterministic {
        return logits.argmax(D::Minus1)?.to_scalar::<u32>();
    }
    let probs = candle_nn::ops::softmax_last_dim(&logits)?.to_vec1::<f32>()?;
    let dist = WeightedIndex::new(&probs).map_err(candle_core::Error::wrap)?;
    Ok(dist.sample(&mut *sampling.rng) as u32)
}

/// Classes as network inputs in [-1, 1].
fn classes_to_input(classes: &Tensor, dtype: DType) -> Result<Tensor> {
    classes
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .to_dtype(dtype)
}

pub fn teacher_inputs(batch: &Batch, dtype: DType) -> Result<TeacherInputs> {
    let (_, width) = batch.coarse.dims2()?;
    let seq = width - 1;
    let c_prev = classes_to_input(&batch.coarse.narrow(1, 0, seq)?, dtype)?;
    let f_prev = classes_to_input(&batch.fine.narrow(1, 0, seq)?, dtype)?;
    let c_target = batch.coarse.narrow(1, 1, seq)?;
    let f_target = batch.fine.narrow(1, 1, seq)?;

    Ok(TeacherInputs {
        prev: Tensor::stack(&[&c_prev, &f_prev], 2)?,
        coarse: classes_to_input(&c_target, dtype)?.unsqueeze(2)?,
        coarse_target: c_target.flatten_all()?,
        fine_target: f_target.flatten_all()?,
    })
}

/// Mean cross-entropy of coarse and fine logits against their targets.
pub fn class_losses(
    coarse_logits: &Tensor,
    fine_logits: &Tensor,
    inputs: &TeacherInputs,
) -> Result<(Tensor, Tensor)> {
    let flat = |logits: &Tensor| -> Result<Tensor> {
        logits
            .to_dtype(DType::F32)?
            .reshape(((), N_CLASSES))
    };
    let loss_c = candle_nn::loss::cross_entropy(&flat(coarse_logits)?, &inputs.coarse_target)?;
    let loss_f = candle_nn::loss::cross_entropy(&flat(fine_logits)?, &inputs.fine_target)?;
    Ok((loss_c, loss_f))
}
