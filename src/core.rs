//! Markov chain abstraction and parallel chain driver used for posterior refinement.

use rayon::prelude::*;

use crate::error::Result;

pub trait MarkovChain {
    type State;

    /// Does one transition of the chain, returning the new current state.
    fn step(&mut self) -> Result<&Self::State>;

    /// The current state without stepping.
    fn current_state(&self) -> &Self::State;
}

/// Advances `chain` by `n_steps` transitions.
pub fn run_chain<M: MarkovChain>(chain: &mut M, n_steps: usize) -> Result<()> {
    for _ in 0..n_steps {
        chain.step()?;
    }
    Ok(())
}

/// Advances every chain by `n_steps` transitions in parallel.
///
/// Each chain owns its random stream, so the result does not depend on how
/// rayon schedules the chains.
pub fn run_chains<M>(chains: &mut [M], n_steps: usize) -> Result<()>
where
    M: MarkovChain + Send,
{
    chains
        .par_iter_mut()
        .try_for_each(|chain| run_chain(chain, n_steps))
}

#[cfg(test)]
mod tests {
    use super::*;

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
    }

    #[test]
    fn runs_all_chains() {
        let mut chains: Vec<Counter> = (0..8).map(|i| Counter { state: i }).collect();
        run_chains(&mut chains, 5).unwrap();
        for (i, chain) in chains.iter().enumerate() {
            assert_eq!(*chain.current_state(), i + 5);
        }
    }

    #[test]
    fn single_chain_advances() {
        let mut chain = Counter { state: 0 };
        run_chain(&mut chain, 7).unwrap();
        assert_eq!(*chain.current_state(), 7);
    }
}
