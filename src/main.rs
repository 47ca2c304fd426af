use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};
use rand::Rng;

use mini_csx::config::{
    parse_chromosomes, parse_populations, parse_sample_sizes, split_list, ChainConfig, RunConfig,
};
use mini_csx::orchestrate;
use mini_csx::Result;

#[derive(Parser, Debug)]
#[command(
    name = "mini-csx",
    version,
    about = "Cross-population continuous-shrinkage weights for polygenic risk scores."
)]
struct Args {
    /// Directory holding the `ldblk_1kg_<pop>` LD reference folders.
    #[arg(long = "ref_dir")]
    ref_dir: PathBuf,

    /// Prefix of the validation PLINK `.bim` file.
    #[arg(long = "bim_prefix")]
    bim_prefix: PathBuf,

    /// Comma-separated association files, one per population.
    #[arg(long = "sst_file")]
    sst_file: String,

    /// Comma-separated GWAS sample sizes, in the same order as `--sst_file`.
    #[arg(long = "n_gwas")]
    n_gwas: String,

    /// Comma-separated population codes (AFR, AMR, EAS, EUR, SAS).
    #[arg(long)]
    pop: String,

    /// Chromosomes to process, e.g. `1,3,5-7`.
    #[arg(long, default_value = "1-22")]
    chrom: String,

    #[arg(long, default_value_t = ChainConfig::DEFAULT_PHI)]
    phi: f64,

    #[arg(long, default_value_t = ChainConfig::DEFAULT_A)]
    a: f64,

    #[arg(long, default_value_t = ChainConfig::DEFAULT_B)]
    b: f64,

    /// Total MCMC iterations [default: 1000 per population].
    #[arg(long = "n_iter")]
    n_iter: Option<usize>,

    /// Burn-in iterations [default: 500 per population].
    #[arg(long = "n_burnin")]
    n_burnin: Option<usize>,

    #[arg(long, default_value_t = ChainConfig::DEFAULT_THIN)]
    thin: usize,

    /// Also write the precision-weighted META combination.
    #[arg(long)]
    meta: bool,

    #[arg(long = "out_dir")]
    out_dir: PathBuf,

    #[arg(long = "out_name")]
    out_name: String,

    /// Random seed. Drawn and logged when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Worker threads, 0 for one per core.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Show a progress bar per chromosome.
    #[arg(long)]
    progress: bool,
}

fn build_config(args: Args) -> Result<RunConfig> {
    let pops = parse_populations(&args.pop)?;
    let seed = args.seed.unwrap_or_else(|| {
        let seed = rand::thread_rng().gen::<u64>();
        info!("no --seed given, using {seed}");
        seed
    });

    let mut chain = ChainConfig::with_defaults(pops.len(), seed);
    chain.phi = args.phi;
    chain.a = args.a;
    chain.b = args.b;
    chain.thin = args.thin;
    chain.meta = args.meta;
    if let Some(n_iter) = args.n_iter {
        chain.n_iter = n_iter;
    }
    if let Some(n_burnin) = args.n_burnin {
        chain.n_burnin = n_burnin;
    }

    let config = RunConfig {
        ref_dir: args.ref_dir,
        bim_prefix: args.bim_prefix,
        sst_files: split_list(&args.sst_file).into_iter().map(PathBuf::from).collect(),
        n_gwas: parse_sample_sizes(&args.n_gwas)?,
        pops,
        chroms: parse_chromosomes(&args.chrom)?,
        out_dir: args.out_dir,
        out_name: args.out_name,
        threads: args.threads,
        progress: args.progress,
        chain,
    };
    config.validate()?;
    Ok(config)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    };

    let report = match orchestrate::run(&config) {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };
    for outcome in &report.outcomes {
        info!("{outcome}");
    }
    if !report.is_success() {
        error!(
            "{} of {} chromosomes failed",
            report.failures().count(),
            report.outcomes.len()
        );
        process::exit(1);
    }
}
