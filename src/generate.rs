use std::path::PathBuf;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::audio::{self, HOP_LENGTH};
use crate::dataset::AudiobookDataset;
use crate::model::{Sampling, Vocoder};
use crate::paths::Paths;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub deterministic: bool,
    pub seed: u64,
}

/// Writes a target and a generated WAV for every clip in `test_set`.
/// Returns the generated files.
pub fn do_generate(
    model: &dyn Vocoder,
    paths: &Paths,
    step: usize,
    test_set: &AudiobookDataset,
    opts: &GenerateOptions,
) -> anyhow::Result<Vec<PathBuf>> {
    let k = step / 1000;
    let out_dir = paths.gen_path();
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut written = Vec::with_capacity(test_set.len());

    for (i, id) in test_set.ids.iter().enumerate() {
        let clip = test_set.load_clip_by_id(id)?;
        let target_path = out_dir.join(format!("{k}k_steps_{i}_target.wav"));
        audio::write_wav(&target_path, &clip.samples)?;

        let expected = clip
            .mel
            .as_ref()
            .map(|mel| mel.ncols() * HOP_LENGTH)
            .unwrap_or(clip.samples.len());
        let progress = ProgressBar::new(expected as u64);
        progress.set_style(progress_style());
        progress.set_message(id.clone());

        let started = Instant::now();
        let samples = model.generate(
            &clip,
            &mut Sampling {
                rng: &mut rng,
                deterministic: opts.deterministic,
                progress: &progress,
            },
        )?;
        progress.finish_and_clear();
        let seconds = started.elapsed().as_secs_f64();

        let gen_path = out_dir.join(format!("{k}k_steps_{i}_generated.wav"));
        audio::write_wav(&gen_path, &samples)?;
        tracing::info!(
            "{id}: {} samples in {seconds:.1}s ({:.0} samples/sec) -> {}",
            samples.len(),
            samples.len() as f64 / seconds.max(1e-9),
            gen_path.display()
        );
        written.push(gen_path);
    }

    Ok(written)
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} [{elapsed_precise}] {bar:40.green/white} {pos}/{len} samples")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
