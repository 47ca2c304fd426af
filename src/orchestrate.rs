//! Per-chromosome pipeline: load references, harmonize, sample, write weight files.
//!
//! Chromosomes share no mutable state and run in parallel on a bounded rayon pool. A failure on
//! one chromosome is recorded in the [`RunReport`] and does not stop the others.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use indicatif::{MultiProgress, ProgressBar};
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::config::RunConfig;
use crate::core::progress_style;
use crate::error::{CsxError, Result};
use crate::gibbs::CoupledGibbs;
use crate::harmonize::{apply_snp_info, harmonize, Harmonized, Variant, SAMPLE_SIZE_RATIO};
use crate::io::{
    bim_path, ld_reference_path, read_ld_reference, read_snp_info, read_sumstats,
    read_validation, snp_info_path, write_weights, SnpInfo, SumstatRecord, ValidationVariant,
    WeightRow,
};
use crate::stats::PosteriorSummary;

/// Label of the cross-population combination in file names.
pub const META_LABEL: &str = "META";

#[derive(Debug, Clone, PartialEq)]
pub enum ChromosomeStatus {
    Completed {
        n_variants: usize,
        unstable_updates: usize,
        files: Vec<PathBuf>,
    },
    /// No variant survived harmonization. Empty weight files were written.
    Empty { files: Vec<PathBuf> },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChromosomeOutcome {
    pub chrom: u8,
    pub status: ChromosomeStatus,
}

impl fmt::Display for ChromosomeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            ChromosomeStatus::Completed {
                n_variants,
                unstable_updates,
                ..
            } => write!(
                f,
                "chr{}: {n_variants} variants, {unstable_updates} skipped block updates",
                self.chrom
            ),
            ChromosomeStatus::Empty { .. } => write!(f, "chr{}: no overlapping variants", self.chrom),
            ChromosomeStatus::Failed(msg) => write!(f, "chr{}: failed: {msg}", self.chrom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunReport {
    pub outcomes: Vec<ChromosomeOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &ChromosomeOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ChromosomeStatus::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Formats φ like `1e-02`.
pub fn format_phi(phi: f64) -> String {
    let raw = format!("{phi:.0e}");
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => raw,
    }
}

/// `<out_dir>/<out_name>_<label>_pst_eff_a<a>_b<b>_phi<phi>_chr<chrom>.txt`
pub fn output_path(config: &RunConfig, label: &str, chrom: u8) -> PathBuf {
    let chain = &config.chain;
    config.out_dir.join(format!(
        "{}_{}_pst_eff_a{}_b{:.1}_phi{}_chr{}.txt",
        config.out_name,
        label,
        chain.a.trunc() as i64,
        chain.b,
        format_phi(chain.phi),
        chrom
    ))
}

fn labels(config: &RunConfig) -> Vec<String> {
    let mut labels: Vec<String> = config.pops.iter().map(|p| p.code().to_string()).collect();
    if config.chain.meta {
        labels.push(META_LABEL.to_string());
    }
    labels
}

/// Runs every requested chromosome. Errors returned here are fatal for the whole run; per
/// chromosome failures are reported in the [`RunReport`].
pub fn run(config: &RunConfig) -> Result<RunReport> {
    config.validate()?;
    fs::create_dir_all(&config.out_dir).map_err(|e| CsxError::io(&config.out_dir, e))?;

    let bim = bim_path(&config.bim_prefix);
    let validation = read_validation(&bim)?;
    info!("{}: {} validation variants", bim.display(), validation.len());

    let sumstats = config
        .sst_files
        .iter()
        .zip(&config.pops)
        .map(|(path, pop)| {
            let records = read_sumstats(path)?;
            info!("{pop}: {} association rows from {}", records.len(), path.display());
            Ok(records)
        })
        .collect::<Result<Vec<_>>>()?;

    let snp_info_file = snp_info_path(&config.ref_dir);
    let snp_info = if snp_info_file.is_file() {
        let info = read_snp_info(&snp_info_file)?;
        info!("{}: {} reference SNPs", snp_info_file.display(), info.len());
        Some(info)
    } else {
        warn!(
            "{} not found, using the LD panels' own variant lists and frequencies",
            snp_info_file.display()
        );
        None
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()
        .map_err(|e| CsxError::Config(format!("cannot build thread pool: {e}")))?;
    let multi = config.progress.then(MultiProgress::new);

    let outcomes: Vec<ChromosomeOutcome> = pool.install(|| {
        config
            .chroms
            .par_iter()
            .map(|&chrom| {
                let status = match process_chromosome(
                    config,
                    chrom,
                    &validation,
                    &sumstats,
                    snp_info.as_ref(),
                    multi.as_ref(),
                ) {
                    Ok(status) => status,
                    Err(e) => {
                        error!("chr{chrom}: {e}");
                        ChromosomeStatus::Failed(e.to_string())
                    }
                };
                ChromosomeOutcome { chrom, status }
            })
            .collect()
    });

    Ok(RunReport { outcomes })
}

/// Loads the LD references of one chromosome, harmonizes, samples and writes its weight files.
/// When a SNP information table is given, each reference is first restricted to it.
pub fn process_chromosome(
    config: &RunConfig,
    chrom: u8,
    validation: &[ValidationVariant],
    sumstats: &[Vec<SumstatRecord>],
    snp_info: Option<&SnpInfo>,
    multi: Option<&MultiProgress>,
) -> Result<ChromosomeStatus> {
    let mut references = config
        .pops
        .iter()
        .map(|&pop| read_ld_reference(&ld_reference_path(&config.ref_dir, pop, chrom), chrom))
        .collect::<Result<Vec<_>>>()?;
    if let Some(info) = snp_info {
        for (reference, &pop) in references.iter_mut().zip(&config.pops) {
            let removed = apply_snp_info(reference, info, pop);
            if removed > 0 {
                debug!("chr{chrom} {pop}: {removed} panel variants not in the SNP information table");
            }
        }
    }
    let Harmonized {
        variants,
        blocks,
        sample_size_outliers,
    } = harmonize(chrom, validation, sumstats, &config.n_gwas, &references)?;
    drop(references);
    for (pop, outliers) in config.pops.iter().zip(sample_size_outliers) {
        if outliers > 0 {
            warn!(
                "chr{chrom} {pop}: {outliers} variants report a sample size more than \
                 {SAMPLE_SIZE_RATIO}x away from the configured one"
            );
        }
    }

    if variants.is_empty() {
        warn!("chr{chrom}: no variants shared by all inputs, writing empty weight files");
        let files = write_outputs(config, chrom, &variants, None)?;
        return Ok(ChromosomeStatus::Empty { files });
    }

    let chain_config = config.chain.for_chromosome(chrom);
    let n_blocks = blocks.len();
    let mut chain = CoupledGibbs::new(&chain_config, &config.n_gwas, blocks)?;
    info!(
        "chr{chrom}: sampling {} variants in {n_blocks} blocks ({} iterations, seed {})",
        variants.len(),
        chain_config.n_iter,
        chain_config.seed
    );

    let summary = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new(chain_config.n_iter as u64));
            pb.set_prefix(format!("chr{chrom}"));
            pb.set_style(progress_style());
            chain.run_with_progress(&pb)?
        }
        None => chain.run()?,
    };

    for (k, pop) in config.pops.iter().enumerate() {
        debug!(
            "chr{chrom} {pop}: sigma {:.4}, max |effect| {:.3e}",
            summary.sigma[k],
            summary.max_abs_effect(k)
        );
    }
    if summary.unstable_updates > 0 {
        warn!(
            "chr{chrom}: {} block updates were skipped for numerical instability",
            summary.unstable_updates
        );
    }

    let files = write_outputs(config, chrom, &variants, Some(&summary))?;
    info!("chr{chrom}: wrote {} weight files", files.len());
    Ok(ChromosomeStatus::Completed {
        n_variants: variants.len(),
        unstable_updates: summary.unstable_updates,
        files,
    })
}

/// Writes one file per population (and META). `summary` is `None` for an empty chromosome.
fn write_outputs(
    config: &RunConfig,
    chrom: u8,
    variants: &[Variant],
    summary: Option<&PosteriorSummary>,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for (k, label) in labels(config).iter().enumerate() {
        let path = output_path(config, label, chrom);
        let effects: Vec<f64> = match summary {
            None => Vec::new(),
            Some(s) if k < s.n_pops() => s.beta.row(k).to_vec(),
            Some(s) => s
                .meta
                .as_ref()
                .map(|m| m.to_vec())
                .ok_or_else(|| CsxError::State("meta effects were not accumulated".into()))?,
        };
        let rows = variants.iter().zip(effects).map(|(v, effect)| WeightRow {
            chrom,
            id: &v.id,
            pos: v.pos,
            a1: &v.a1,
            effect,
        });
        write_weights(&path, rows)?;
        files.push(path);
    }
    Ok(files)
}
