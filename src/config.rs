use clap::{Parser, ValueEnum};
use serde::Serialize;

/// Model variants the driver can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ModelKind {
    /// VQ-VAE: audio encoder, vector-quantized bottleneck, WaveRNN decoder.
    Vqvae,
    /// Mel-conditioned WaveRNN.
    Wavernn,
    /// Unconditioned WaveRNN.
    #[value(name = "nc")]
    NoCond,
}

impl ModelKind {
    pub fn default_run_name(self) -> &'static str {
        match self {
            ModelKind::Vqvae => "vqvae",
            ModelKind::Wavernn => "wavernn",
            ModelKind::NoCond => "nc",
        }
    }

    pub fn uses_mels(self) -> bool {
        matches!(self, ModelKind::Wavernn)
    }
}

/// Where tensors live. `auto` takes CUDA device 0 when the build and host have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[value(rename_all = "lower")]
pub enum DeviceChoice {
    Auto,
    Cpu,
    Cuda,
}

impl DeviceChoice {
    pub fn resolve(self) -> anyhow::Result<candle_core::Device> {
        use candle_core::Device;
        match self {
            DeviceChoice::Auto => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
            DeviceChoice::Cpu => Ok(Device::Cpu),
            DeviceChoice::Cuda => Device::new_cuda(0).map_err(|err| {
                anyhow::anyhow!("--device cuda needs a CUDA build and device 0: {err}")
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Precision {
    F32,
    F16,
}

impl Precision {
    pub fn dtype(self) -> candle_core::DType {
        match self {
            Precision::F32 => candle_core::DType::F32,
            Precision::F16 => candle_core::DType::F16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "wavernn",
    about = "Train or run some neural net: WaveRNN vocoders and a VQ-VAE using Candle"
)]
pub struct RunConfig {
    #[arg(long, short = 'g', help = "Generate audio for the test clips instead of training")]
    pub generate: bool,

    #[arg(long, conflicts_with = "half", help = "Use 32-bit parameters (default)")]
    pub float: bool,

    #[arg(long, help = "Use 16-bit parameters")]
    pub half: bool,

    #[arg(long, short = 'l', help = "Checkpoint to restore instead of the run's own")]
    pub load: Option<String>,

    #[arg(long, help = "Start from freshly initialised parameters")]
    pub scratch: bool,

    #[arg(long, short = 'm', value_enum, default_value_t = ModelKind::Vqvae)]
    pub model: ModelKind,

    #[arg(long, help = "skip the version check")]
    pub force: bool,

    #[arg(long, short = 'c', help = "number of audio files to generate")]
    pub count: Option<usize>,

    #[arg(long, help = "model to partially load")]
    pub partial: Vec<String>,

    #[arg(
        long,
        env = "WAVERNN_DATA_PATH",
        default_value = "/mnt/backup/dataset/lj2",
        help = "Dataset root containing dataset_ids.json, quant/ and mel/"
    )]
    pub data_path: String,

    #[arg(long, help = "Run name used for checkpoints, outputs and the log file")]
    pub name: Option<String>,

    #[arg(long, default_value = "model_checkpoints")]
    pub checkpoint_dir: String,

    #[arg(long, default_value = "model_outputs")]
    pub output_dir: String,

    #[arg(long, default_value = "log")]
    pub log_dir: String,

    #[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
    pub device: DeviceChoice,

    #[arg(long, default_value_t = 1000)]
    pub epochs: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    #[arg(long, default_value_t = 896)]
    pub rnn_dims: usize,

    #[arg(long, default_value_t = 896)]
    pub fc_dims: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 50)]
    pub log_every_batches: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Pick the most likely sample at each step instead of sampling"
    )]
    pub deterministic: bool,
}

impl RunConfig {
    pub fn precision(&self) -> Precision {
        if self.half {
            Precision::F16
        } else {
            Precision::F32
        }
    }

    pub fn run_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.model.default_run_name())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.count == Some(0) {
            anyhow::bail!("--count must be > 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("--batch-size must be > 0");
        }
        if self.epochs == 0 {
            anyhow::bail!("--epochs must be > 0");
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            anyhow::bail!("--lr must be > 0, got {}", self.lr);
        }
        if self.rnn_dims < 2 || self.rnn_dims % 2 != 0 {
            anyhow::bail!(
                "--rnn-dims must be even and >= 2, got {}",
                self.rnn_dims
            );
        }
        if self.fc_dims == 0 {
            anyhow::bail!("--fc-dims must be > 0");
        }
        if self.run_name().is_empty() {
            anyhow::bail!("--name must not be empty");
        }
        Ok(())
    }
}
