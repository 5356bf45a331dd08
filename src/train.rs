use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::checkpoint;
use crate::dataset::{collate, AudiobookDataset};
use crate::generate::{do_generate, GenerateOptions};
use crate::model::{scalar, Vocoder};
use crate::paths::Paths;

/// Thousands of steps between history snapshots with listening tests.
const SNAPSHOT_EVERY_K: usize = 50;

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub log_every_batches: usize,
    pub seed: u64,
    pub generate: GenerateOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EpochSummary {
    epoch: usize,
    step: usize,
    losses: BTreeMap<String, f64>,
    epoch_seconds: f64,
}

/// Running means of the named loss parts.
#[derive(Debug, Default)]
struct LossTracker {
    sums: BTreeMap<&'static str, f64>,
    batches: usize,
}

impl LossTracker {
    fn add(&mut self, parts: &[(&'static str, f64)]) {
        for (name, value) in parts {
            *self.sums.entry(*name).or_insert(0.0) += *value;
        }
        self.batches += 1;
    }

    fn means(&self) -> BTreeMap<String, f64> {
        let n = self.batches.max(1) as f64;
        self.sums
            .iter()
            .map(|(name, sum)| (name.to_string(), sum / n))
            .collect()
    }

    fn summary(&self) -> String {
        self.means()
            .iter()
            .map(|(name, mean)| format!("{name}={mean:.4}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn reset(&mut self) {
        self.sums.clear();
        self.batches = 0;
    }
}

/// Trains until `opts.epochs` have passed, checkpointing after every epoch.
/// Returns the final step.
#[allow(clippy::too_many_arguments)]
pub fn do_train(
    model: &dyn Vocoder,
    varmap: &VarMap,
    paths: &Paths,
    dataset: &AudiobookDataset,
    valid: &AudiobookDataset,
    opts: &TrainOptions,
    mut step: usize,
    device: &Device,
) -> anyhow::Result<usize> {
    if dataset.is_empty() {
        anyhow::bail!("Need at least one training clip, the dataset index only holds test clips");
    }

    let vars = varmap.all_vars();
    let dtype = vars.first().map(|var| var.dtype()).unwrap_or(DType::F32);
    let mut optimizer = AdamW::new(vars, adamw_params(opts.lr, dtype))?;
    let window = model.window();
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut saved_k = step / 1000;
    let mut history = if step > 0 {
        read_history(paths)?
    } else {
        Vec::new()
    };
    let prior_epochs = history.len();

    for epoch in 1..=opts.epochs {
        let epoch_started = Instant::now();
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        indices.shuffle(&mut rng);

        let num_batches = indices.len().div_ceil(opts.batch_size);
        let progress = ProgressBar::new(num_batches as u64);
        progress.set_style(progress_style());

        let mut epoch_losses = LossTracker::default();
        let mut interval_losses = LossTracker::default();
        let mut interval_started = Instant::now();

        for batch_indices in indices.chunks(opts.batch_size) {
            let clips = batch_indices
                .iter()
                .map(|&index| dataset.load_clip(index))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let batch = collate(&clips, &window, &mut rng, device)?;

            let loss = model.forward_loss(&batch, true)?;
            let total = scalar(&loss.loss)?;
            if !total.is_finite() {
                anyhow::bail!("Loss became {total} at step {step}");
            }
            optimizer.backward_step(&loss.loss)?;
            step += 1;

            epoch_losses.add(&loss.parts);
            interval_losses.add(&loss.parts);
            progress.set_message(format!("{} step={}k", interval_losses.summary(), step / 1000));
            progress.inc(1);

            if opts.log_every_batches > 0 && step % opts.log_every_batches == 0 {
                let speed = interval_losses.batches as f64
                    / interval_started.elapsed().as_secs_f64().max(1e-9);
                progress.suspend(|| {
                    tracing::info!(
                        "Epoch: {epoch}/{} -- Step: {step} -- Loss: {} -- Speed: {speed:.3} steps/sec",
                        opts.epochs,
                        interval_losses.summary(),
                    )
                });
                interval_losses.reset();
                interval_started = Instant::now();
            }
        }
        progress.finish_and_clear();

        checkpoint::save(paths, varmap, step)?;

        let summary = EpochSummary {
            epoch: prior_epochs + epoch,
            step,
            losses: epoch_losses.means(),
            epoch_seconds: epoch_started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            "Epoch {epoch}/{}: {} ({:.1}s, step {step})",
            opts.epochs,
            epoch_losses.summary(),
            summary.epoch_seconds
        );
        history.push(summary);
        write_history(paths, &history)?;

        let k = step / 1000;
        if k > saved_k + SNAPSHOT_EVERY_K {
            let hist_path = checkpoint::save_history(paths, varmap, step)?;
            tracing::info!("saved snapshot {}", hist_path.display());
            saved_k = k;
            do_generate(model, paths, step, valid, &opts.generate)?;
        }
    }

    Ok(step)
}

/// Adam without weight decay. The f32 default epsilon rounds to zero in f16,
/// which turns parameters with a zero gradient into NaN.
pub(crate) fn adamw_params(lr: f64, dtype: DType) -> ParamsAdamW {
    let defaults = ParamsAdamW::default();
    ParamsAdamW {
        lr,
        weight_decay: 0.0,
        eps: match dtype {
            DType::F16 => 1e-4,
            _ => defaults.eps,
        },
        ..defaults
    }
}

/// Earlier epochs of a resumed run, empty when none were recorded.
fn read_history(paths: &Paths) -> anyhow::Result<Vec<EpochSummary>> {
    let history_path = paths.history_path();
    if !history_path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&history_path).with_context(|| {
        format!("Failed reading training history: {}", history_path.display())
    })?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid training history: {}", history_path.display()))
}

fn write_history(paths: &Paths, history: &[EpochSummary]) -> anyhow::Result<()> {
    let history_path = paths.history_path();
    fs::write(&history_path, serde_json::to_string_pretty(history)?).with_context(|| {
        format!(
            "Failed writing training history: {}",
            history_path.display()
        )
    })
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
