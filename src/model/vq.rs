use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Weight of the commitment term relative to the codebook term.
const COMMITMENT_COST: f64 = 0.25;
/// Norm of inputs and codes once normalised, as a multiple of `sqrt(dims)`.
const NORM_SCALE: f64 = 0.3;

/// Nearest-neighbour vector quantiser with a straight-through gradient.
#[derive(Debug)]
pub struct VectorQuant {
    embedding: Tensor,
    normalize: bool,
    target_norm: f64,
}

#[derive(Debug)]
pub struct VqOutput {
    /// Quantised vectors with the encoder's gradient passed straight through.
    pub quantized: Tensor,
    /// Pulls codes towards the encoder outputs.
    pub vq_loss: Tensor,
    /// Pulls encoder outputs towards their codes.
    pub commit_loss: Tensor,
    /// Code usage entropy in nats.
    pub entropy: f64,
}

impl VectorQuant {
    pub fn new(n_codes: usize, dims: usize, normalize: bool, vb: VarBuilder) -> Result<Self> {
        let embedding = vb.get_with_hints(
            (n_codes, dims),
            "embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            embedding,
            normalize,
            target_norm: NORM_SCALE * (dims as f64).sqrt(),
        })
    }

    fn normalized(&self, x: &Tensor) -> Result<Tensor> {
        if !self.normalize {
            return Ok(x.clone());
        }
        // f16 cannot hold the epsilon.
        let x32 = x.to_dtype(DType::F32)?;
        let norm = x32.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.affine(1.0, 1e-8)?;
        x32.broadcast_div(&norm)?
            .affine(self.target_norm, 0.0)?
            .to_dtype(x.dtype())
    }

    /// Quantises `(batch, frames, dims)` encoder outputs.
    pub fn forward(&self, z: &Tensor) -> Result<VqOutput> {
        let (b, t, d) = z.dims3()?;
        let z = self.normalized(z)?;
        let codebook = self.normalized(&self.embedding)?;

        let flat = z.reshape((b * t, d))?;
        let indices = nearest_codes(&flat, &codebook)?;
        let q = codebook.index_select(&indices, 0)?.reshape((b, t, d))?;

        let vq_loss = candle_nn::loss::mse(&q, &z.detach())?;
        let commit_loss = candle_nn::loss::mse(&z, &q.detach())?.affine(COMMITMENT_COST, 0.0)?;
        let quantized = (&z + (&q - &z)?.detach())?;
        let entropy = code_entropy(&indices.to_vec1::<u32>()?);

        Ok(VqOutput {
            quantized,
            vq_loss,
            commit_loss,
            entropy,
        })
    }
}

/// Index of the closest code for every row of `flat`.
fn nearest_codes(flat: &Tensor, codebook: &Tensor) -> Result<Tensor> {
    let flat = flat.to_dtype(DType::F32)?.detach();
    let codebook = codebook.to_dtype(DType::F32)?.detach();
    let x2 = flat.sqr()?.sum_keepdim(1)?;
    let e2 = codebook.sqr()?.sum_keepdim(1)?.t()?;
    let xe = flat.matmul(&codebook.t()?)?;
    let dist = x2.broadcast_add(&e2)?.broadcast_sub(&xe.affine(2.0, 0.0)?)?;
    dist.argmin(D::Minus1)
}

fn code_entropy(indices: &[u32]) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for index in indices {
        *counts.entry(*index).or_insert(0usize) += 1;
    }
    let total = indices.len() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.ln()
        })
        .sum()
}
