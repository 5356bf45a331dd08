use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::paths::Paths;

const CHECKPOINT_EXT: &str = ".safetensors";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("refusing to load {path} because its basename ({found}) is not {expected}")]
    BasenameMismatch {
        path: String,
        found: String,
        expected: String,
    },
    #[error("checkpoint {path} has no tensor named {name}")]
    MissingTensor { path: String, name: String },
    #[error("tensor {name} in {path} has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        path: String,
        name: String,
        found: Vec<usize>,
        expected: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Scratch,
    Restore(PathBuf),
}

/// Resolved output paths and the parameter source for one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub paths: Paths,
    pub start: StartPoint,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepRecord {
    step: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartialLoad {
    pub loaded: usize,
    pub shape_mismatched: usize,
    pub missing: usize,
    pub unexpected: usize,
}

/// Run name a checkpoint file was saved under: `dir/vq_adv_150000.safetensors` -> `vq_adv`.
pub fn checkpoint_model_name(path: &str) -> String {
    let file_name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let stem = file_name
        .strip_suffix(CHECKPOINT_EXT)
        .unwrap_or(&file_name);
    match split_step_suffix(stem) {
        Some((name, _)) => name.to_string(),
        None => stem.to_string(),
    }
}

/// Family part of a run name, the text before the first underscore.
pub fn model_basename(name: &str) -> &str {
    name.split('_').next().unwrap_or(name)
}

fn split_step_suffix(stem: &str) -> Option<(&str, usize)> {
    let (name, digits) = stem.rsplit_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|step| (name, step))
}

pub fn plan_start(cfg: &RunConfig) -> Result<SessionPlan, CheckpointError> {
    let paths = Paths::new(
        cfg.run_name(),
        &cfg.checkpoint_dir,
        &cfg.output_dir,
        &cfg.log_dir,
    );

    if cfg.scratch || (cfg.load.is_none() && !paths.model_path().exists()) {
        return Ok(SessionPlan {
            paths,
            start: StartPoint::Scratch,
        });
    }

    let Some(load) = &cfg.load else {
        let model_path = paths.model_path();
        return Ok(SessionPlan {
            paths,
            start: StartPoint::Restore(model_path),
        });
    };

    let prev_model_name = checkpoint_model_name(load);
    let prev_basename = model_basename(&prev_model_name);
    let basename = model_basename(&paths.name);
    if prev_basename != basename && !cfg.force {
        return Err(CheckpointError::BasenameMismatch {
            path: load.clone(),
            found: prev_basename.to_string(),
            expected: basename.to_string(),
        });
    }

    let paths = if cfg.generate {
        paths.renamed(prev_model_name)
    } else {
        paths
    };
    Ok(SessionPlan {
        paths,
        start: StartPoint::Restore(PathBuf::from(load)),
    })
}

fn read_tensors(path: &Path) -> anyhow::Result<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))
}

/// Strict load: every model parameter must be present with the same shape.
/// Returns the training step the checkpoint belongs to.
pub fn restore(path: &Path, varmap: &VarMap) -> anyhow::Result<usize> {
    let tensors = read_tensors(path)?;
    let path_str = path.display().to_string();
    {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Parameter map lock poisoned"))?;
        for (name, var) in vars.iter() {
            let src = tensors
                .get(name)
                .ok_or_else(|| CheckpointError::MissingTensor {
                    path: path_str.clone(),
                    name: name.clone(),
                })?;
            if src.dims() != var.dims() {
                return Err(CheckpointError::ShapeMismatch {
                    path: path_str.clone(),
                    name: name.clone(),
                    found: src.dims().to_vec(),
                    expected: var.dims().to_vec(),
                }
                .into());
            }
            var.set(&src.to_dtype(var.dtype())?.to_device(var.device())?)
                .with_context(|| format!("Failed to assign parameter {name}"))?;
        }
    }
    read_step(path)
}

/// Non-strict load used for `--partial`: copies whatever matches by name and shape.
pub fn load_partial(path: &Path, varmap: &VarMap) -> anyhow::Result<PartialLoad> {
    let tensors = read_tensors(path)?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("Parameter map lock poisoned"))?;

    let mut report = PartialLoad {
        unexpected: tensors.keys().filter(|k| !vars.contains_key(*k)).count(),
        ..Default::default()
    };
    for (name, var) in vars.iter() {
        match tensors.get(name) {
            Some(src) if src.dims() == var.dims() => {
                var.set(&src.to_dtype(var.dtype())?.to_device(var.device())?)
                    .with_context(|| format!("Failed to assign parameter {name}"))?;
                report.loaded += 1;
            }
            Some(src) => {
                tracing::warn!(
                    "skipping {name} from {}: shape {:?} != {:?}",
                    path.display(),
                    src.dims(),
                    var.dims()
                );
                report.shape_mismatched += 1;
            }
            None => report.missing += 1,
        }
    }
    Ok(report)
}

/// Step from a `_<step>` file suffix, else from the `<stem>_step.json` sidecar.
pub fn read_step(path: &Path) -> anyhow::Result<usize> {
    let stem = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem.strip_suffix(CHECKPOINT_EXT).unwrap_or(&stem);
    if let Some((_, step)) = split_step_suffix(stem) {
        return Ok(step);
    }

    let sidecar = path.with_file_name(format!("{stem}_step.json"));
    if !sidecar.exists() {
        tracing::warn!(
            "no step record at {}, assuming step 0",
            sidecar.display()
        );
        return Ok(0);
    }
    let text = fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed reading step record: {}", sidecar.display()))?;
    let record: StepRecord = serde_json::from_str(&text)
        .with_context(|| format!("Invalid step record: {}", sidecar.display()))?;
    Ok(record.step)
}

/// Latest parameters plus step record, overwritten every epoch.
pub fn save(paths: &Paths, varmap: &VarMap, step: usize) -> anyhow::Result<()> {
    fs::create_dir_all(&paths.checkpoint_dir).with_context(|| {
        format!(
            "Failed creating checkpoint directory: {}",
            paths.checkpoint_dir.display()
        )
    })?;
    let model_path = paths.model_path();
    varmap
        .save(&model_path)
        .with_context(|| format!("Failed writing checkpoint: {}", model_path.display()))?;
    let step_path = paths.step_path();
    fs::write(&step_path, serde_json::to_string(&StepRecord { step })?)
        .with_context(|| format!("Failed writing step record: {}", step_path.display()))?;
    Ok(())
}

pub fn save_history(paths: &Paths, varmap: &VarMap, step: usize) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&paths.checkpoint_dir).with_context(|| {
        format!(
            "Failed creating checkpoint directory: {}",
            paths.checkpoint_dir.display()
        )
    })?;
    let hist_path = paths.model_hist_path(step);
    varmap
        .save(&hist_path)
        .with_context(|| format!("Failed writing checkpoint: {}", hist_path.display()))?;
    Ok(hist_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use clap::Parser;

    fn cfg(args: &[&str], dir: &Path) -> RunConfig {
        let ckpt = dir.join("ckpt");
        let mut full = vec![
            "wavernn".to_string(),
            "--checkpoint-dir".to_string(),
            ckpt.display().to_string(),
        ];
        full.extend(args.iter().map(|a| a.to_string()));
        RunConfig::try_parse_from(full).unwrap()
    }

    fn varmap_with(shapes: &[(&str, (usize, usize))]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, shape) in shapes {
            vb.get_with_hints(*shape, name, candle_nn::Init::Const(1.0))
                .unwrap();
        }
        varmap
    }

    #[test]
    fn model_name_strips_extension_and_step() {
        assert_eq!(
            checkpoint_model_name("ckpt/vq.41.xy_adv15_150000.safetensors"),
            "vq.41.xy_adv15"
        );
        assert_eq!(
            checkpoint_model_name("vq.41.xy_adv15.safetensors"),
            "vq.41.xy_adv15"
        );
        assert_eq!(checkpoint_model_name("wavernn_x"), "wavernn_x");
        assert_eq!(model_basename("vq.41.xy_adv15"), "vq.41.xy");
        assert_eq!(model_basename("nc"), "nc");
    }

    #[test]
    fn scratch_when_nothing_to_restore() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_start(&cfg(&[], dir.path())).unwrap();
        assert_eq!(plan.start, StartPoint::Scratch);
        assert_eq!(plan.paths.name, "vqvae");
    }

    #[test]
    fn restores_own_checkpoint_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let config = cfg(&[], dir.path());
        let paths = Paths::new("vqvae", &config.checkpoint_dir, "out", "log");
        fs::create_dir_all(&paths.checkpoint_dir).unwrap();
        fs::write(paths.model_path(), b"").unwrap();

        let plan = plan_start(&config).unwrap();
        assert_eq!(plan.start, StartPoint::Restore(paths.model_path()));

        let plan = plan_start(&cfg(&["--scratch"], dir.path())).unwrap();
        assert_eq!(plan.start, StartPoint::Scratch);
    }

    #[test]
    fn mismatched_basename_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let err = plan_start(&cfg(&["--load", "other/wavernn_2000.safetensors"], dir.path()))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::BasenameMismatch { .. }));
        assert_eq!(
            err.to_string(),
            "refusing to load other/wavernn_2000.safetensors because its basename (wavernn) is not vqvae"
        );

        let plan = plan_start(&cfg(
            &["--load", "other/wavernn_2000.safetensors", "--force"],
            dir.path(),
        ))
        .unwrap();
        assert_eq!(
            plan.start,
            StartPoint::Restore(PathBuf::from("other/wavernn_2000.safetensors"))
        );
        assert_eq!(plan.paths.name, "vqvae");
    }

    #[test]
    fn generate_from_loaded_checkpoint_uses_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_start(&cfg(
            &["-g", "--load", "x/vqvae_lowlr_3000.safetensors"],
            dir.path(),
        ))
        .unwrap();
        assert_eq!(plan.paths.name, "vqvae_lowlr");
    }

    #[test]
    fn step_from_suffix_or_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            read_step(&dir.path().join("nc_12000.safetensors")).unwrap(),
            12000
        );
        let paths = Paths::new("nc", dir.path(), "out", "log");
        assert_eq!(read_step(&paths.model_path()).unwrap(), 0);
        fs::write(paths.step_path(), r#"{"step":345}"#).unwrap();
        assert_eq!(read_step(&paths.model_path()).unwrap(), 345);
    }

    #[test]
    fn save_then_restore_roundtrips_step_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new("nc", dir.path().join("ckpt"), "out", "log");
        let source = varmap_with(&[("a", (2, 3)), ("b", (4, 1))]);
        save(&paths, &source, 777).unwrap();

        let target = VarMap::new();
        let vb = VarBuilder::from_varmap(&target, DType::F32, &Device::Cpu);
        let a = vb
            .get_with_hints((2, 3), "a", candle_nn::Init::Const(0.0))
            .unwrap();
        vb.get_with_hints((4, 1), "b", candle_nn::Init::Const(0.0))
            .unwrap();

        let step = restore(&paths.model_path(), &target).unwrap();
        assert_eq!(step, 777);
        let values = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn strict_restore_rejects_missing_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new("nc", dir.path(), "out", "log");
        save(&paths, &varmap_with(&[("a", (2, 3))]), 1).unwrap();

        let target = varmap_with(&[("a", (2, 3)), ("c", (1, 1))]);
        let err = restore(&paths.model_path(), &target).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::MissingTensor { .. })
        ));
    }

    #[test]
    fn partial_load_skips_what_does_not_fit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new("vqvae", dir.path(), "out", "log");
        save(
            &paths,
            &varmap_with(&[("a", (2, 3)), ("b", (5, 5)), ("extra", (1, 1))]),
            1,
        )
        .unwrap();

        let target = varmap_with(&[("a", (2, 3)), ("b", (4, 4)), ("c", (1, 1))]);
        let report = load_partial(&paths.model_path(), &target).unwrap();
        assert_eq!(
            report,
            PartialLoad {
                loaded: 1,
                shape_mismatched: 1,
                missing: 1,
                unexpected: 1,
            }
        );
    }
}
