//! Posterior-mean accumulation over retained Gibbs draws.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

use crate::error::{CsxError, Result};
use crate::gibbs::ChainState;

/// Running sums of retained draws. Effects are accumulated on the per-allele scale.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorAccumulator {
    n: usize,
    sample_sizes: Vec<f64>,
    beta_sum: Array2<f64>, // n_pops x n_variants
    meta_sum: Option<Array1<f64>>,
    psi_sum: Array1<f64>,
    sigma_sum: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSummary {
    /// Per-allele posterior-mean effects, one row per population.
    pub beta: Array2<f64>,
    /// Precision-weighted combination across populations.
    pub meta: Option<Array1<f64>>,
    pub psi: Array1<f64>,
    pub sigma: Array1<f64>,
    pub n_retained: usize,
    /// Number of (population, block) updates skipped because the precision matrix could not be
    /// factored.
    pub unstable_updates: usize,
}

impl PosteriorSummary {
    pub fn n_pops(&self) -> usize {
        self.beta.nrows()
    }

    pub fn n_variants(&self) -> usize {
        self.beta.ncols()
    }

    /// Largest absolute posterior-mean effect of population `k`.
    pub fn max_abs_effect(&self, k: usize) -> f64 {
        self.beta
            .row(k)
            .mapv(f64::abs)
            .max()
            .copied()
            .unwrap_or(0.0)
    }
}

impl PosteriorAccumulator {
    pub fn new(sample_sizes: &[f64], n_variants: usize, meta: bool) -> Self {
        let n_pops = sample_sizes.len();
        Self {
            n: 0,
            sample_sizes: sample_sizes.to_vec(),
            beta_sum: Array2::zeros((n_pops, n_variants)),
            meta_sum: meta.then(|| Array1::zeros(n_variants)),
            psi_sum: Array1::zeros(n_variants),
            sigma_sum: Array1::zeros(n_pops),
        }
    }

    pub fn push(&mut self, state: &ChainState) -> Result<()> {
        let n_pops = self.sample_sizes.len();
        if state.sigma.len() != n_pops {
            return Err(CsxError::State(format!(
                "state has {} populations, accumulator {}",
                state.sigma.len(),
                n_pops
            )));
        }
        for blk in &state.blocks {
            let block = blk.block();
            let start = block.start;
            if block.end() > self.psi_sum.len() {
                return Err(CsxError::State(format!(
                    "block ending at {} exceeds {} accumulated variants",
                    block.end(),
                    self.psi_sum.len()
                )));
            }
            for i in 0..block.len() {
                let j = start + i;
                self.psi_sum[j] += blk.psi[i];
                let (mut num, mut den) = (0.0, 0.0);
                for k in 0..n_pops {
                    let scale = block.scale[k][i];
                    let per_allele = blk.beta[k][i] / scale;
                    self.beta_sum[[k, j]] += per_allele;
                    let w = self.sample_sizes[k] * scale * scale / state.sigma[k];
                    num += w * per_allele;
                    den += w;
                }
                if let Some(meta) = self.meta_sum.as_mut() {
                    meta[j] += if den > 0.0 { num / den } else { 0.0 };
                }
            }
        }
        for (acc, s) in self.sigma_sum.iter_mut().zip(&state.sigma) {
            *acc += s;
        }
        self.n += 1;
        Ok(())
    }

    pub fn finalize(self, unstable_updates: usize) -> Result<PosteriorSummary> {
        if self.n == 0 {
            return Err(CsxError::State(
                "no retained samples to summarize".to_string(),
            ));
        }
        let n = self.n as f64;
        Ok(PosteriorSummary {
            beta: self.beta_sum / n,
            meta: self.meta_sum.map(|m| m / n),
            psi: self.psi_sum / n,
            sigma: self.sigma_sum / n,
            n_retained: self.n,
            unstable_updates,
        })
    }
}
