use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::{VarBuilder, VarMap};

use crate::checkpoint::{self, SessionPlan, StartPoint};
use crate::config::RunConfig;
use crate::dataset::{load_dataset_ids, split_ids, AudiobookDataset};
use crate::generate::{do_generate, GenerateOptions};
use crate::model::{build_model, ModelDims};
use crate::train::{do_train, TrainOptions};

const SESSION_RULE: &str = "------------------------------------------------------------";

/// Loads the dataset, builds and restores the model, then generates or trains.
pub fn run(cfg: &RunConfig, plan: SessionPlan) -> anyhow::Result<()> {
    let SessionPlan { paths, start } = plan;

    let data_path = PathBuf::from(&cfg.data_path);
    let split = split_ids(load_dataset_ids(&data_path)?, cfg.count);
    let with_mels = cfg.model.uses_mels();
    let dataset = AudiobookDataset::new(split.train_ids, &data_path, with_mels);
    let test_set = AudiobookDataset::new(split.test_ids, &data_path, with_mels);
    tracing::info!("dataset size: {}", dataset.len());

    let device = cfg.device.resolve()?;
    tracing::info!("Using device: {device:?}, precision: {:?}", cfg.precision());

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, cfg.precision().dtype(), &device);
    let model = build_model(
        cfg.model,
        ModelDims {
            rnn_dims: cfg.rnn_dims,
            fc_dims: cfg.fc_dims,
        },
        vb,
    )?;

    for partial in &cfg.partial {
        let report = checkpoint::load_partial(Path::new(partial), &varmap)?;
        tracing::info!(
            "partially loaded {partial}: {} tensors, {} shape mismatches, {} missing, {} unexpected",
            report.loaded,
            report.shape_mismatched,
            report.missing,
            report.unexpected
        );
    }

    let step = match &start {
        StartPoint::Scratch => {
            tracing::info!("starting {:?} from scratch", model.kind());
            0
        }
        StartPoint::Restore(path) => {
            let step = checkpoint::restore(path, &varmap)?;
            tracing::info!("restored {} at step {step}", path.display());
            step
        }
    };

    let generate_opts = GenerateOptions {
        deterministic: cfg.deterministic,
        seed: cfg.seed,
    };

    if cfg.generate {
        do_generate(model.as_ref(), &paths, step, &test_set, &generate_opts)?;
        return Ok(());
    }

    tracing::info!("{SESSION_RULE}");
    tracing::info!("-- New training session starts here ------------------------");
    tracing::info!("{}", chrono::Utc::now().format("%c UTC"));

    fs::create_dir_all(&paths.checkpoint_dir).with_context(|| {
        format!(
            "Failed creating checkpoint directory: {}",
            paths.checkpoint_dir.display()
        )
    })?;
    let config_path = paths.config_path();
    fs::write(&config_path, serde_json::to_string_pretty(cfg)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;

    let opts = TrainOptions {
        epochs: cfg.epochs,
        batch_size: cfg.batch_size,
        lr: cfg.lr,
        log_every_batches: cfg.log_every_batches,
        seed: cfg.seed,
        generate: generate_opts,
    };
    let step = do_train(
        model.as_ref(),
        &varmap,
        &paths,
        &dataset,
        &test_set,
        &opts,
        step,
        &device,
    )?;
    tracing::info!("training finished at step {step}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;
    use candle_core::Device;
    use clap::Parser;
    use ndarray::Array1;
    use ndarray_npy::write_npy;

    fn dataset(root: &Path, ids: &[&str]) {
        fs::create_dir_all(root.join("quant")).unwrap();
        fs::write(
            root.join("dataset_ids.json"),
            serde_json::to_string(ids).unwrap(),
        )
        .unwrap();
        for id in ids {
            let samples: Array1<i16> = (0..64).map(|i| (i * 50) as i16).collect();
            write_npy(root.join("quant").join(format!("{id}.npy")), &samples).unwrap();
        }
    }

    fn cfg(root: &Path, extra: &[&str]) -> RunConfig {
        let mut args: Vec<String> = [
            "wavernn",
            "--model",
            "nc",
            "--rnn-dims",
            "8",
            "--fc-dims",
            "8",
            "--device",
            "cpu",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for (flag, dir) in [
            ("--data-path", "data"),
            ("--checkpoint-dir", "ckpt"),
            ("--output-dir", "out"),
            ("--log-dir", "log"),
        ] {
            args.push(flag.to_string());
            args.push(root.join(dir).display().to_string());
        }
        args.extend(extra.iter().map(|s| s.to_string()));
        RunConfig::try_parse_from(args).unwrap()
    }

    #[test]
    fn generate_session_writes_count_clips() {
        let dir = tempfile::tempdir().unwrap();
        dataset(&dir.path().join("data"), &["a", "b", "c", "d", "e"]);
        let config = cfg(dir.path(), &["--generate", "--count", "2"]);
        let plan = checkpoint::plan_start(&config).unwrap();
        assert_eq!(plan.start, StartPoint::Scratch);

        run(&config, plan).unwrap();

        let out = Paths::new("nc", "", dir.path().join("out"), "").gen_path();
        assert!(out.join("0k_steps_0_generated.wav").exists());
        assert!(out.join("0k_steps_1_target.wav").exists());
        assert!(!out.join("0k_steps_2_target.wav").exists());
    }

    #[test]
    fn generate_restores_and_partial_loads_saved_parameters() {
        let dir = tempfile::tempdir().unwrap();
        dataset(&dir.path().join("data"), &["a", "b", "c", "d", "e"]);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &Device::Cpu);
        build_model(
            crate::config::ModelKind::NoCond,
            ModelDims {
                rnn_dims: 8,
                fc_dims: 8,
            },
            vb,
        )
        .unwrap();
        let saved = Paths::new("nc", dir.path().join("ckpt"), "out", "log");
        checkpoint::save(&saved, &varmap, 4000).unwrap();
        let load = checkpoint::save_history(&saved, &varmap, 4000).unwrap();
        let load = load.display().to_string();

        let config = cfg(
            dir.path(),
            &["-g", "-c", "1", "--load", load.as_str(), "--partial", load.as_str()],
        );
        let plan = checkpoint::plan_start(&config).unwrap();
        run(&config, plan).unwrap();

        let out = Paths::new("nc", "", dir.path().join("out"), "").gen_path();
        assert!(out.join("4k_steps_0_generated.wav").exists());
    }

    #[test]
    fn training_session_dumps_config_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..5).map(|i| format!("clip{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        dataset(&dir.path().join("data"), &id_refs);
        let config = cfg(dir.path(), &["--epochs", "1", "--batch-size", "2"]);
        let plan = checkpoint::plan_start(&config).unwrap();
        let paths = plan.paths.clone();

        run(&config, plan).unwrap();

        assert!(paths.config_path().exists());
        assert_eq!(checkpoint::read_step(&paths.model_path()).unwrap(), 1);
    }
}
