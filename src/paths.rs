use std::path::{Path, PathBuf};

/// Where a named run keeps its checkpoints, generated audio and log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub name: String,
    pub checkpoint_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    pub fn new(
        name: impl Into<String>,
        checkpoint_dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        log_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            name: name.into(),
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            log_dir: log_dir.as_ref().to_path_buf(),
        }
    }

    /// Same directories, different run name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}.safetensors", self.name))
    }

    pub fn model_hist_path(&self, step: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}_{step}.safetensors", self.name))
    }

    pub fn step_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}_step.json", self.name))
    }

    pub fn config_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}_config.json", self.name))
    }

    pub fn history_path(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}_history.json", self.name))
    }

    pub fn gen_path(&self) -> PathBuf {
        self.output_dir.join(&self.name)
    }

    pub fn logfile_path(&self) -> PathBuf {
        self.log_dir.join(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_run_name() {
        let paths = Paths::new("vq.41.xy_adv15", "ckpt", "out", "log");
        assert_eq!(
            paths.model_path(),
            PathBuf::from("ckpt/vq.41.xy_adv15.safetensors")
        );
        assert_eq!(
            paths.model_hist_path(150_000),
            PathBuf::from("ckpt/vq.41.xy_adv15_150000.safetensors")
        );
        assert_eq!(
            paths.step_path(),
            PathBuf::from("ckpt/vq.41.xy_adv15_step.json")
        );
        assert_eq!(paths.gen_path(), PathBuf::from("out/vq.41.xy_adv15"));
        assert_eq!(paths.logfile_path(), PathBuf::from("log/vq.41.xy_adv15"));
    }

    #[test]
    fn renamed_keeps_directories() {
        let paths = Paths::new("a", "ckpt", "out", "log").renamed("b");
        assert_eq!(paths.model_path(), PathBuf::from("ckpt/b.safetensors"));
        assert_eq!(paths.gen_path(), PathBuf::from("out/b"));
    }
}
