use indicatif::{ProgressBar, ProgressStyle};

use crate::config::ChainConfig;
use crate::error::{CsxError, Result};

pub trait MarkovChain {
    type State;

    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> Result<&Self::State>;

    /// Get the current state without stepping.
    fn current_state(&self) -> &Self::State;

    /// Number of completed iterations.
    fn iteration(&self) -> usize;
}

/// Lifecycle of a chain, derived from its iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Initializing,
    BurnIn,
    Sampling,
    Finalizing,
}

impl ChainPhase {
    /// Phase of a chain that has completed `itr` iterations.
    pub fn at(itr: usize, config: &ChainConfig) -> Self {
        if itr == 0 {
            ChainPhase::Initializing
        } else if itr >= config.n_iter {
            ChainPhase::Finalizing
        } else if itr <= config.n_burnin {
            ChainPhase::BurnIn
        } else {
            ChainPhase::Sampling
        }
    }
}

/// Runs the remaining iterations of `chain` and hands every retained state to `on_retained`.
/// Returns the number of retained states. Fails if the chain was already stepped past an
/// iteration that should have been retained.
pub fn run_chain<M, F>(chain: &mut M, config: &ChainConfig, on_retained: F) -> Result<usize>
where
    M: MarkovChain,
    F: FnMut(&M::State) -> Result<()>,
{
    drive(chain, config, None, on_retained)
}

pub fn run_chain_with_progress<M, F>(
    chain: &mut M,
    config: &ChainConfig,
    pb: &ProgressBar,
    on_retained: F,
) -> Result<usize>
where
    M: MarkovChain,
    F: FnMut(&M::State) -> Result<()>,
{
    pb.set_length(config.n_iter as u64);
    pb.set_position(chain.iteration() as u64);
    let retained = drive(chain, config, Some(pb), on_retained)?;
    pb.finish_with_message("Done!");
    Ok(retained)
}

fn drive<M, F>(
    chain: &mut M,
    config: &ChainConfig,
    pb: Option<&ProgressBar>,
    mut on_retained: F,
) -> Result<usize>
where
    M: MarkovChain,
    F: FnMut(&M::State) -> Result<()>,
{
    let done = chain.iteration();
    if let Some(missed) = (1..=done).find(|&t| config.retains(t)) {
        return Err(CsxError::State(format!(
            "iteration {missed} was stepped before the run started and would not be retained"
        )));
    }
    let mut retained = 0;
    for itr in done + 1..=config.n_iter {
        let state = chain.step()?;
        if config.retains(itr) {
            on_retained(state)?;
            retained += 1;
        }
        if let Some(pb) = pb {
            pb.inc(1);
        }
    }
    Ok(retained)
}

pub fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts its own iterations.
    struct Counter {
        state: usize,
    }

    impl MarkovChain for Counter {
        type State = usize;

        fn step(&mut self) -> Result<&usize> {
            self.state += 1;
            Ok(&self.state)
        }

        fn current_state(&self) -> &usize {
            &self.state
        }

        fn iteration(&self) -> usize {
            self.state
        }
    }

    fn config(n_iter: usize, n_burnin: usize, thin: usize) -> ChainConfig {
        ChainConfig {
            n_iter,
            n_burnin,
            thin,
            ..ChainConfig::with_defaults(1, 0)
        }
    }

    #[test]
    fn test_run_chain_retention() {
        let cfg = config(20, 10, 5);
        let mut chain = Counter { state: 0 };
        let mut seen = Vec::new();
        let n = run_chain(&mut chain, &cfg, |s| {
            seen.push(*s);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![15, 20]);
        assert_eq!(n, cfg.n_retained());
        assert_eq!(*chain.current_state(), 20);
    }

    #[test]
    fn test_resume_after_burn_in_only() {
        let cfg = config(20, 10, 5);
        let mut chain = Counter { state: 10 };
        let mut seen = Vec::new();
        run_chain(&mut chain, &cfg, |s| {
            seen.push(*s);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![15, 20]);

        let mut late = Counter { state: 15 };
        assert!(matches!(
            run_chain(&mut late, &cfg, |_| Ok(())),
            Err(CsxError::State(_))
        ));
        assert_eq!(late.state, 15);
    }

    #[test]
    fn test_run_chain_with_progress() {
        let cfg = config(12, 4, 2);
        let mut chain = Counter { state: 0 };
        let pb = ProgressBar::hidden();
        let n = run_chain_with_progress(&mut chain, &cfg, &pb, |_| Ok(())).unwrap();
        assert_eq!(n, 4);
        assert_eq!(pb.position(), 12);
    }

    #[test]
    fn test_chain_phase() {
        let cfg = config(10, 4, 1);
        assert_eq!(ChainPhase::at(0, &cfg), ChainPhase::Initializing);
        assert_eq!(ChainPhase::at(4, &cfg), ChainPhase::BurnIn);
        assert_eq!(ChainPhase::at(5, &cfg), ChainPhase::Sampling);
        assert_eq!(ChainPhase::at(10, &cfg), ChainPhase::Finalizing);
    }
}
