use candle_core::{Result, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Module, VarBuilder};

/// Stretches a `(batch, channels, frames)` condition to sample rate. Each
/// factor repeats frames and then smooths them with a residual convolution.
#[derive(Debug)]
pub struct UpsampleNetwork {
    stages: Vec<(usize, Conv1d)>,
}

impl UpsampleNetwork {
    pub fn new(channels: usize, factors: &[usize], vb: VarBuilder) -> Result<Self> {
        let stages = factors
            .iter()
            .enumerate()
            .map(|(i, &factor)| {
                let cfg = Conv1dConfig {
                    padding: factor,
                    ..Default::default()
                };
                let conv = conv1d(channels, channels, 2 * factor + 1, cfg, vb.pp(format!("up{i}")))?;
                Ok((factor, conv))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    pub fn total_factor(&self) -> usize {
        self.stages.iter().map(|(factor, _)| factor).product()
    }
}

impl Module for UpsampleNetwork {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (factor, conv) in &self.stages {
            let stretched = repeat_frames(&x, *factor)?;
            x = (conv.forward(&stretched)? + stretched)?;
        }
        Ok(x)
    }
}

/// Nearest-neighbour repeat along the last axis.
pub fn repeat_frames(x: &Tensor, factor: usize) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    x.unsqueeze(3)?
        .broadcast_as((b, c, t, factor))?
        .contiguous()?
        .reshape((b, c, t * factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn repeat_frames_duplicates_in_order() {
        let x = Tensor::new(&[[[1f32, 2., 3.]]], &Device::Cpu).unwrap();
        let y = repeat_frames(&x, 2).unwrap();
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1., 1., 2., 2., 3., 3.]
        );
    }

    #[test]
    fn output_length_is_frames_times_factors() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = UpsampleNetwork::new(3, &[2, 4], vb).unwrap();
        assert_eq!(net.total_factor(), 8);
        let x = Tensor::zeros((2, 3, 5), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[2, 3, 40]);
    }
}
