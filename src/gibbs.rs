//! Coupled multi-population Gibbs sampler.
//!
//! Every population k has its own effect vector β⁽ᵏ⁾ and residual variance σ_k, while the local
//! shrinkage scales ψ_j (and their auxiliaries δ_j) are shared, so evidence from one population
//! moves the prior of the others:
//!
//! ```text
//! β_j⁽ᵏ⁾ | ψ_j, σ_k ~ N(0, σ_k / n_k · φ ψ_j)
//! ψ_j | δ_j         ~ Gamma(a, rate δ_j)
//! δ_j               ~ Gamma(b, rate 1)
//! ```
//!
//! Blocks are updated in parallel and each owns its random stream, so a chain is reproducible
//! from its seed regardless of the number of worker threads.

use indicatif::ProgressBar;
use log::{debug, warn};
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use rayon::prelude::*;

use crate::config::{stream_seed, ChainConfig};
use crate::core::{run_chain, run_chain_with_progress, ChainPhase, MarkovChain};
use crate::distributions::Gig;
use crate::error::{CsxError, Result};
use crate::harmonize::LdBlock;
use crate::stats::{PosteriorAccumulator, PosteriorSummary};

/// Lower bound of ψ_j after each update.
pub const PSI_FLOOR: f64 = 1e-12;
/// Lower bound of the GIG `b` parameter in the ψ update.
const GIG_B_FLOOR: f64 = 1e-300;
/// Relative ridge added to a precision matrix that fails to factor.
const RIDGE: f64 = 1e-6;

/// Sufficient statistics of one block's effect draws, used by the residual variance update.
#[derive(Debug, Clone)]
struct BlockTerms {
    /// βᵀb per population.
    cross: Vec<f64>,
    /// βᵀMβ per population.
    quad: Vec<f64>,
    /// Σ β² / (φψ) per population.
    shrink: Vec<f64>,
    unstable: usize,
}

/// Sampler context of one LD block.
#[derive(Debug, Clone)]
pub struct BlockState {
    block: LdBlock,
    pub beta: Vec<DVector<f64>>,
    pub psi: DVector<f64>,
    pub delta: DVector<f64>,
    rng: SmallRng,
}

impl BlockState {
    /// Zero effects, ψ_j = 1/φ and δ_j = 1.
    pub fn new(block: LdBlock, phi: f64, seed: u64) -> Self {
        let m = block.len();
        Self {
            beta: (0..block.n_pops()).map(|_| DVector::zeros(m)).collect(),
            psi: DVector::from_element(m, 1.0 / phi),
            delta: DVector::from_element(m, 1.0),
            block,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn block(&self) -> &LdBlock {
        &self.block
    }

    fn draw_effects(&mut self, sample_sizes: &[f64], sigma: &[f64], phi: f64) -> BlockTerms {
        let n_pops = sample_sizes.len();
        let m = self.block.len();
        let prior_prec = self.psi.map(|psi| 1.0 / (phi * psi));
        let mut terms = BlockTerms {
            cross: vec![0.0; n_pops],
            quad: vec![0.0; n_pops],
            shrink: vec![0.0; n_pops],
            unstable: 0,
        };

        for k in 0..n_pops {
            let z = DVector::<f64>::from_fn(m, |_, _| StandardNormal.sample(&mut self.rng));
            let b = &self.block.effects[k];
            let precision = |ridge: f64| -> DMatrix<f64> {
                let mut mat = self.block.ld[k].clone();
                for i in 0..m {
                    mat[(i, i)] += prior_prec[i] + ridge;
                }
                mat
            };

            let drawn = Cholesky::new(precision(0.0))
                .or_else(|| {
                    let mean_diag = (self.block.ld[k].diagonal() + &prior_prec).mean();
                    Cholesky::new(precision(RIDGE * mean_diag.max(1.0)))
                })
                .and_then(|chol| {
                    // β = L⁻ᵀ (L⁻¹ b + sqrt(σ/n) z) has mean M⁻¹b and covariance σ/n · M⁻¹.
                    let l = chol.l();
                    let y = l.solve_lower_triangular(b)?;
                    let scale = (sigma[k] / sample_sizes[k]).sqrt();
                    l.tr_solve_lower_triangular(&(y + z * scale))
                })
                .filter(|beta| beta.iter().all(|x| x.is_finite()));

            match drawn {
                Some(beta) => {
                    let shrink = beta
                        .iter()
                        .zip(prior_prec.iter())
                        .map(|(x, p)| x * x * p)
                        .sum::<f64>();
                    let ld_quad = beta.dot(&(&self.block.ld[k] * &beta));
                    terms.cross[k] = beta.dot(b);
                    terms.quad[k] = ld_quad + shrink;
                    terms.shrink[k] = shrink;
                    self.beta[k] = beta;
                }
                None => {
                    self.beta[k].fill(0.0);
                    terms.unstable += 1;
                }
            }
        }
        terms
    }

    fn update_scales(
        &mut self,
        config: &ChainConfig,
        sample_sizes: &[f64],
        sigma: &[f64],
    ) -> Result<()> {
        let n_pops = sample_sizes.len();
        let p = config.a - n_pops as f64 / 2.0;
        for i in 0..self.block.len() {
            let rate = self.psi[i] + 1.0;
            let delta = Gamma::new(config.a + config.b, 1.0 / rate)
                .map_err(|e| CsxError::Numerical(format!("δ update: {e}")))?
                .sample(&mut self.rng)
                .max(f64::MIN_POSITIVE);

            let tail = (0..n_pops)
                .map(|k| sample_sizes[k] * self.beta[k][i].powi(2) / (sigma[k] * config.phi))
                .sum::<f64>()
                .max(GIG_B_FLOOR);
            let psi = Gig::new(p, 2.0 * delta, tail)?.sample(&mut self.rng);

            self.delta[i] = delta;
            self.psi[i] = psi.max(PSI_FLOOR).min(1.0 / config.phi);
        }
        Ok(())
    }
}

/// Full state of a chain: every block's context and the per-population residual variances.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub blocks: Vec<BlockState>,
    pub sigma: Vec<f64>,
}

pub struct CoupledGibbs {
    config: ChainConfig,
    sample_sizes: Vec<f64>,
    n_variants: usize,
    state: ChainState,
    /// Drives the sequential residual variance update.
    rng: SmallRng,
    iteration: usize,
    phase: ChainPhase,
    unstable: usize,
}

impl CoupledGibbs {
    /// Validates the configuration and block shapes and sets up the initial state.
    pub fn new(config: &ChainConfig, sample_sizes: &[f64], blocks: Vec<LdBlock>) -> Result<Self> {
        config.validate()?;
        if sample_sizes.is_empty() {
            return Err(CsxError::Config("at least one population is required".into()));
        }
        if let Some(n) = sample_sizes.iter().find(|n| !(n.is_finite() && **n > 0.0)) {
            return Err(CsxError::Config(format!(
                "GWAS sample sizes must be positive, got {n}"
            )));
        }

        let mut offset = 0;
        for block in &blocks {
            if block.n_pops() != sample_sizes.len() {
                return Err(CsxError::Config(format!(
                    "block at {} carries {} populations, expected {}",
                    block.start,
                    block.n_pops(),
                    sample_sizes.len()
                )));
            }
            if block.start != offset {
                return Err(CsxError::Config(format!(
                    "blocks must be contiguous: expected start {offset}, found {}",
                    block.start
                )));
            }
            offset = block.end();
        }

        let states = blocks
            .into_iter()
            .enumerate()
            .map(|(b, block)| {
                BlockState::new(block, config.phi, stream_seed(config.seed, b as u64 + 1))
            })
            .collect();

        Ok(Self {
            config: config.clone(),
            sample_sizes: sample_sizes.to_vec(),
            n_variants: offset,
            state: ChainState {
                blocks: states,
                sigma: vec![1.0; sample_sizes.len()],
            },
            rng: SmallRng::seed_from_u64(stream_seed(config.seed, 0)),
            iteration: 0,
            phase: ChainPhase::Initializing,
            unstable: 0,
        })
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    /// Number of skipped (population, block) effect updates so far.
    pub fn unstable_updates(&self) -> usize {
        self.unstable
    }

    /// Runs the chain to completion and returns the posterior means.
    pub fn run(&mut self) -> Result<PosteriorSummary> {
        let config = self.config.clone();
        let mut acc = PosteriorAccumulator::new(&self.sample_sizes, self.n_variants, config.meta);
        run_chain(self, &config, |state| acc.push(state))?;
        acc.finalize(self.unstable)
    }

    pub fn run_with_progress(&mut self, pb: &ProgressBar) -> Result<PosteriorSummary> {
        let config = self.config.clone();
        let mut acc = PosteriorAccumulator::new(&self.sample_sizes, self.n_variants, config.meta);
        run_chain_with_progress(self, &config, pb, |state| acc.push(state))?;
        acc.finalize(self.unstable)
    }

    fn update_sigma(&mut self, terms: &[BlockTerms]) -> Result<()> {
        let p = self.n_variants as f64;
        for (k, &n) in self.sample_sizes.iter().enumerate() {
            let (cross, quad, shrink) = terms.iter().fold((0.0, 0.0, 0.0), |acc, t| {
                (acc.0 + t.cross[k], acc.1 + t.quad[k], acc.2 + t.shrink[k])
            });
            let err = (n / 2.0 * (1.0 - 2.0 * cross + quad))
                .max(n / 2.0 * shrink)
                .max(f64::MIN_POSITIVE);
            let precision = Gamma::new((n + p) / 2.0, 1.0 / err)
                .map_err(|e| CsxError::Numerical(format!("σ update: {e}")))?
                .sample(&mut self.rng);
            self.state.sigma[k] = 1.0 / precision;
        }
        Ok(())
    }
}

impl MarkovChain for CoupledGibbs {
    type State = ChainState;

    /// One sweep: effects per block, residual variances, then the shared local scales.
    fn step(&mut self) -> Result<&ChainState> {
        if self.iteration >= self.config.n_iter {
            return Err(CsxError::State(format!(
                "chain already completed its {} iterations",
                self.config.n_iter
            )));
        }
        let phi = self.config.phi;
        let sizes = &self.sample_sizes;
        let sigma = self.state.sigma.clone();

        let terms: Vec<BlockTerms> = self
            .state
            .blocks
            .par_iter_mut()
            .map(|blk| blk.draw_effects(sizes, &sigma, phi))
            .collect();
        let unstable: usize = terms.iter().map(|t| t.unstable).sum();

        self.update_sigma(&terms)?;

        let config = &self.config;
        let sizes = &self.sample_sizes;
        let sigma = &self.state.sigma;
        self.state
            .blocks
            .par_iter_mut()
            .try_for_each(|blk| blk.update_scales(config, sizes, sigma))?;

        self.iteration += 1;
        if unstable > 0 {
            warn!(
                "iteration {}: {unstable} block update(s) skipped, precision matrix not positive definite",
                self.iteration
            );
            self.unstable += unstable;
        }
        let phase = ChainPhase::at(self.iteration, &self.config);
        if phase != self.phase {
            debug!("iteration {}: {:?} -> {:?}", self.iteration, self.phase, phase);
            self.phase = phase;
        }
        Ok(&self.state)
    }

    fn current_state(&self) -> &ChainState {
        &self.state
    }

    fn iteration(&self) -> usize {
        self.iteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(seed: u64) -> ChainConfig {
        ChainConfig {
            n_iter: 400,
            n_burnin: 200,
            thin: 2,
            meta: true,
            ..ChainConfig::with_defaults(2, seed)
        }
    }

    fn ar1(m: usize, rho: f64) -> DMatrix<f64> {
        DMatrix::from_fn(m, m, |i, j| rho.powi((i as i32 - j as i32).abs()))
    }

    fn two_pop_blocks() -> Vec<LdBlock> {
        let first = LdBlock::new(
            0,
            vec![ar1(3, 0.3), ar1(3, 0.5)],
            vec![
                DVector::from_vec(vec![0.05, 0.01, 0.0]),
                DVector::from_vec(vec![0.04, 0.0, -0.01]),
            ],
        )
        .unwrap();
        let second = LdBlock::new(
            3,
            vec![ar1(2, 0.2), ar1(2, 0.1)],
            vec![
                DVector::from_vec(vec![0.0, -0.03]),
                DVector::from_vec(vec![0.01, -0.02]),
            ],
        )
        .unwrap();
        vec![first, second]
    }

    #[test]
    fn test_same_seed_same_summary() {
        let a = CoupledGibbs::new(&config(42), &[2000.0, 1000.0], two_pop_blocks())
            .unwrap()
            .run()
            .unwrap();
        let b = CoupledGibbs::new(&config(42), &[2000.0, 1000.0], two_pop_blocks())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(a, b);

        let c = CoupledGibbs::new(&config(43), &[2000.0, 1000.0], two_pop_blocks())
            .unwrap()
            .run()
            .unwrap();
        assert_ne!(a.beta, c.beta);
    }

    #[test]
    fn test_thread_count_does_not_change_draws() {
        let run_with = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| {
                    CoupledGibbs::new(&config(7), &[2000.0, 1000.0], two_pop_blocks())
                        .unwrap()
                        .run()
                        .unwrap()
                })
        };
        assert_eq!(run_with(1), run_with(4));
    }

    #[test]
    fn test_phases_and_termination() {
        let cfg = ChainConfig {
            n_iter: 10,
            n_burnin: 4,
            thin: 1,
            ..ChainConfig::with_defaults(2, 1)
        };
        let mut chain = CoupledGibbs::new(&cfg, &[1000.0, 1000.0], two_pop_blocks()).unwrap();
        assert_eq!(chain.phase(), ChainPhase::Initializing);
        for _ in 0..4 {
            chain.step().unwrap();
        }
        assert_eq!(chain.phase(), ChainPhase::BurnIn);
        let summary = chain.run().unwrap();
        assert_eq!(chain.phase(), ChainPhase::Finalizing);
        assert_eq!(summary.n_retained, cfg.n_retained());
        assert_eq!(summary.n_retained, 6);
        assert!(matches!(chain.step(), Err(CsxError::State(_))));

        // A draw stepped by hand after burn-in would be lost, so the run refuses to start.
        let mut early = CoupledGibbs::new(&cfg, &[1000.0, 1000.0], two_pop_blocks()).unwrap();
        for _ in 0..5 {
            early.step().unwrap();
        }
        assert_eq!(early.phase(), ChainPhase::Sampling);
        assert!(matches!(early.run(), Err(CsxError::State(_))));
        assert!(matches!(
            early.run_with_progress(&ProgressBar::hidden()),
            Err(CsxError::State(_))
        ));
    }

    #[test]
    fn test_strong_signal_kept_and_null_shrunk() {
        let cfg = ChainConfig {
            n_iter: 1500,
            n_burnin: 500,
            thin: 5,
            ..ChainConfig::with_defaults(1, 11)
        };
        let block = LdBlock::new(
            0,
            vec![DMatrix::identity(2, 2)],
            vec![DVector::from_vec(vec![0.5, 0.0])],
        )
        .unwrap();
        let summary = CoupledGibbs::new(&cfg, &[10_000.0], vec![block])
            .unwrap()
            .run()
            .unwrap();
        // ψ is capped at 1/φ, so a lone strong signal keeps half its marginal effect.
        assert_abs_diff_eq!(summary.beta[[0, 0]], 0.25, epsilon = 0.02);
        assert_abs_diff_eq!(summary.beta[[0, 1]], 0.0, epsilon = 0.01);
        assert!(summary.psi[0] > summary.psi[1]);
        assert!(summary.psi.iter().all(|&p| p >= PSI_FLOOR && p <= 1.0 / cfg.phi));
    }

    #[test]
    fn test_unfactorable_block_is_skipped() {
        let cfg = ChainConfig {
            n_iter: 50,
            n_burnin: 10,
            thin: 1,
            ..ChainConfig::with_defaults(1, 3)
        };
        let block = LdBlock::new(
            0,
            vec![DMatrix::identity(2, 2) * -10.0],
            vec![DVector::from_vec(vec![0.1, 0.1])],
        )
        .unwrap();
        let mut chain = CoupledGibbs::new(&cfg, &[1000.0], vec![block]).unwrap();
        let summary = chain.run().unwrap();
        assert!(summary.unstable_updates > 0);
        assert!(summary.beta.iter().all(|b| b.is_finite()));
        assert!(summary.sigma.iter().all(|s| s.is_finite() && *s > 0.0));
    }

    #[test]
    fn test_invalid_setups_rejected() {
        let mut bad_phi = config(1);
        bad_phi.phi = 0.0;
        assert!(matches!(
            CoupledGibbs::new(&bad_phi, &[1000.0, 1000.0], two_pop_blocks()),
            Err(CsxError::Config(_))
        ));
        assert!(CoupledGibbs::new(&config(1), &[1000.0], two_pop_blocks()).is_err());
        assert!(CoupledGibbs::new(&config(1), &[1000.0, 0.0], two_pop_blocks()).is_err());

        let mut gapped = two_pop_blocks();
        gapped.remove(0);
        assert!(CoupledGibbs::new(&config(1), &[1000.0, 1000.0], gapped).is_err());
    }

    #[test]
    fn test_no_blocks_runs() {
        let summary = CoupledGibbs::new(&config(5), &[1000.0, 1000.0], Vec::new())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.n_variants(), 0);
        assert_eq!(summary.n_retained, config(5).n_retained());
    }
}
