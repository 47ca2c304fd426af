/*!
Immutable run configuration.

A [`RunConfig`] is built once from the command line (or directly by library users), validated,
and then passed by reference to the harmonizer, the sampler and the orchestrator. Nothing in the
crate reads configuration from global state.
*/

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{CsxError, Result};

/// Discovery populations with a reference panel layout under `ldblk_1kg_<code>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Population {
    Afr,
    Amr,
    Eas,
    Eur,
    Sas,
}

impl Population {
    /// Upper-case population code used in output file names.
    pub fn code(&self) -> &'static str {
        match self {
            Population::Afr => "AFR",
            Population::Amr => "AMR",
            Population::Eas => "EAS",
            Population::Eur => "EUR",
            Population::Sas => "SAS",
        }
    }
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Population {
    type Err = CsxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AFR" => Ok(Population::Afr),
            "AMR" => Ok(Population::Amr),
            "EAS" => Ok(Population::Eas),
            "EUR" => Ok(Population::Eur),
            "SAS" => Ok(Population::Sas),
            other => Err(CsxError::Config(format!(
                "unknown population code '{other}' (expected one of AFR, AMR, EAS, EUR, SAS)"
            ))),
        }
    }
}

/// Settings of one MCMC chain. Created once, never mutated; per-chromosome copies only differ
/// in their derived seed (see [`ChainConfig::for_chromosome`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    /// Global shrinkage constant φ.
    pub phi: f64,
    /// Shape of the local scale ψ_j ~ Gamma(a, δ_j).
    pub a: f64,
    /// Shape of the auxiliary δ_j ~ Gamma(b, 1).
    pub b: f64,
    pub n_iter: usize,
    pub n_burnin: usize,
    pub thin: usize,
    /// Also emit the precision-weighted cross-population combination.
    pub meta: bool,
    pub seed: u64,
}

impl ChainConfig {
    pub const DEFAULT_A: f64 = 1.0;
    pub const DEFAULT_B: f64 = 0.5;
    pub const DEFAULT_PHI: f64 = 1e-2;
    pub const DEFAULT_THIN: usize = 5;

    /// Default chain lengths scale with the number of discovery populations.
    pub fn with_defaults(n_pops: usize, seed: u64) -> Self {
        Self {
            phi: Self::DEFAULT_PHI,
            a: Self::DEFAULT_A,
            b: Self::DEFAULT_B,
            n_iter: 1000 * n_pops.max(1),
            n_burnin: 500 * n_pops.max(1),
            thin: Self::DEFAULT_THIN,
            meta: false,
            seed,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.phi.is_finite() && self.phi > 0.0) {
            return Err(CsxError::Config(format!(
                "phi must be a positive finite number, got {}",
                self.phi
            )));
        }
        if !(self.a.is_finite() && self.a > 0.0) {
            return Err(CsxError::Config(format!("a must be positive, got {}", self.a)));
        }
        if !(self.b.is_finite() && self.b > 0.0) {
            return Err(CsxError::Config(format!("b must be positive, got {}", self.b)));
        }
        if self.thin == 0 {
            return Err(CsxError::Config("thin must be at least 1".into()));
        }
        if self.n_burnin >= self.n_iter {
            return Err(CsxError::Config(format!(
                "n_burnin ({}) must be smaller than n_iter ({})",
                self.n_burnin, self.n_iter
            )));
        }
        if self.n_retained() == 0 {
            return Err(CsxError::Config(format!(
                "no iteration is retained with n_iter={}, n_burnin={}, thin={}",
                self.n_iter, self.n_burnin, self.thin
            )));
        }
        Ok(())
    }

    /// Whether the 1-based iteration `itr` contributes to the posterior mean.
    pub fn retains(&self, itr: usize) -> bool {
        itr > self.n_burnin && itr % self.thin == 0
    }

    /// Number of iterations that contribute to the posterior mean.
    pub fn n_retained(&self) -> usize {
        (self.n_iter / self.thin).saturating_sub(self.n_burnin / self.thin)
    }

    /// Copy of this configuration whose seed is scoped to one chromosome.
    pub fn for_chromosome(&self, chrom: u8) -> Self {
        Self {
            seed: stream_seed(self.seed, chrom as u64),
            ..self.clone()
        }
    }
}

/// Full configuration of a multi-chromosome run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub ref_dir: PathBuf,
    /// PLINK prefix of the validation variant list (`<prefix>.bim`).
    pub bim_prefix: PathBuf,
    pub sst_files: Vec<PathBuf>,
    pub n_gwas: Vec<f64>,
    pub pops: Vec<Population>,
    pub chroms: Vec<u8>,
    pub out_dir: PathBuf,
    pub out_name: String,
    /// Upper bound on chromosomes processed concurrently; 0 lets rayon decide.
    pub threads: usize,
    pub progress: bool,
    pub chain: ChainConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pops.is_empty() {
            return Err(CsxError::Config("at least one population is required".into()));
        }
        if self.sst_files.len() != self.pops.len() || self.n_gwas.len() != self.pops.len() {
            return Err(CsxError::Config(format!(
                "list lengths differ: {} populations, {} association files, {} sample sizes",
                self.pops.len(),
                self.sst_files.len(),
                self.n_gwas.len()
            )));
        }
        for (i, pop) in self.pops.iter().enumerate() {
            if self.pops[..i].contains(pop) {
                return Err(CsxError::Config(format!("population {pop} listed twice")));
            }
        }
        if let Some(n) = self.n_gwas.iter().find(|n| !(n.is_finite() && **n > 0.0)) {
            return Err(CsxError::Config(format!(
                "GWAS sample sizes must be positive, got {n}"
            )));
        }
        if self.chroms.is_empty() {
            return Err(CsxError::Config("no chromosome requested".into()));
        }
        if let Some(c) = self.chroms.iter().find(|c| !(1..=22).contains(*c)) {
            return Err(CsxError::Config(format!(
                "chromosome {c} is outside the autosomal range 1-22"
            )));
        }
        if self.out_name.is_empty() {
            return Err(CsxError::Config("output name must not be empty".into()));
        }
        self.chain.validate()
    }
}

/// Splits a comma-separated command-line list, ignoring empty entries.
pub fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

pub fn parse_populations(raw: &str) -> Result<Vec<Population>> {
    split_list(raw).into_iter().map(Population::from_str).collect()
}

pub fn parse_sample_sizes(raw: &str) -> Result<Vec<f64>> {
    split_list(raw)
        .into_iter()
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| CsxError::Config(format!("invalid GWAS sample size '{s}'")))
        })
        .collect()
}

/// Parses chromosome lists such as `1,2,5-7`.
pub fn parse_chromosomes(raw: &str) -> Result<Vec<u8>> {
    let bad = |s: &str| CsxError::Config(format!("invalid chromosome specification '{s}'"));
    let mut out = Vec::new();
    for item in split_list(raw) {
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo: u8 = lo.trim().parse().map_err(|_| bad(item))?;
                let hi: u8 = hi.trim().parse().map_err(|_| bad(item))?;
                if lo > hi {
                    return Err(bad(item));
                }
                out.extend(lo..=hi);
            }
            None => out.push(item.parse().map_err(|_| bad(item))?),
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// SplitMix64 mixing of a base seed with a stream index. Used to give every chromosome and
/// every block its own reproducible random stream.
pub fn stream_seed(seed: u64, lane: u64) -> u64 {
    let mut z = seed
        .wrapping_add(lane.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
