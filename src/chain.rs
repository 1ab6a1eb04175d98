use anyhow::{Context, Result};
use rand::Rng;

use crate::{
    adapt_strategy::{AdaptOptions, CombinedCollector, GlobalStrategy},
    density::{CpuLogpFunc, LogDensity},
    euclidean_hamiltonian::{EuclideanHamiltonian, State},
    nuts::{draw, NutsOptions, SampleInfo},
};

/// Problems with a draw that do not stop sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingWarning {
    /// The first leapfrog step of the trajectory diverged, so the draw
    /// repeats the previous position.
    NoValidTrajectory,
}

/// Sampler statistics of a single draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawStats {
    /// The depth of the trajectory tree.
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub index_in_trajectory: i64,
    /// Number of leapfrog steps of the trajectory.
    pub n_steps: u64,
    /// The step size used for the trajectory.
    pub step_size: f64,
    pub energy: f64,
    pub energy_error: f64,
    pub logp: f64,
    pub mean_tree_accept: f64,
    pub diverging: bool,
    pub warning: Option<SamplingWarning>,
    pub tuning: bool,
}

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
pub(crate) struct NutsChain<F: CpuLogpFunc, R: Rng> {
    logp: F,
    hamiltonian: EuclideanHamiltonian,
    collector: CombinedCollector,
    options: NutsOptions,
    rng: R,
    state: Option<State>,
    chain: u64,
    draw_count: u64,
    strategy: GlobalStrategy,
}

impl<F: CpuLogpFunc, R: Rng> NutsChain<F, R> {
    pub(crate) fn new(
        logp: F,
        adapt_options: &AdaptOptions,
        num_tune: u64,
        options: NutsOptions,
        max_energy_error: f64,
        rng: R,
        chain: u64,
    ) -> Self {
        let dim = logp.dim();
        let strategy = GlobalStrategy::new(adapt_options, num_tune, dim);
        let collector = strategy.new_collector(dim);
        let hamiltonian = EuclideanHamiltonian::new(
            dim,
            max_energy_error,
            adapt_options.step_size.initial_step,
        );
        NutsChain {
            logp,
            hamiltonian,
            collector,
            options,
            rng,
            state: None,
            chain,
            draw_count: 0,
            strategy,
        }
    }

    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error.
    pub(crate) fn set_position(&mut self, position: &[f64]) -> Result<()> {
        let state = self.hamiltonian.init_state(&mut self.logp, position)?;
        self.strategy.init(
            &mut self.logp,
            &self.options,
            &mut self.hamiltonian,
            &state,
            &mut self.rng,
        );
        self.state = Some(state);
        Ok(())
    }

    /// Draw a new sample and return the unconstrained position and some
    /// diagnostic information.
    pub(crate) fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats)> {
        let state = self
            .state
            .as_ref()
            .context("Chain has no initial position")?;
        let step_size = self.hamiltonian.step_size();
        let (state, info) = draw(
            &mut self.logp,
            state,
            &mut self.rng,
            &self.hamiltonian,
            &self.options,
            &mut self.collector,
        )
        .with_context(|| format!("Sampling failed in chain {}", self.chain))?;

        let tuning = self.strategy.is_tuning(self.draw_count);
        self.strategy
            .adapt(&mut self.hamiltonian, self.draw_count, &self.collector);

        let stats = self.stats(&state, &info, step_size, tuning);
        let position = state.position.clone();

        self.draw_count += 1;
        self.state = Some(state);
        Ok((position, stats))
    }

    fn stats(&self, state: &State, info: &SampleInfo, step_size: f64, tuning: bool) -> DrawStats {
        DrawStats {
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            index_in_trajectory: state.index_in_trajectory,
            n_steps: self.strategy.n_steps(),
            step_size,
            energy: state.energy(),
            energy_error: state.energy_error(),
            logp: state.logp(),
            mean_tree_accept: self.strategy.mean_tree_accept(),
            diverging: info.divergence_info.is_some(),
            warning: info.no_valid_step.then_some(SamplingWarning::NoValidTrajectory),
            tuning,
        }
    }

    pub(crate) fn logp_func(&self) -> &F {
        &self.logp
    }

    /// The dimensionality of the posterior.
    pub(crate) fn dim(&self) -> usize {
        self.logp.dim()
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }
}

impl<R: Rng> NutsChain<LogDensity<'_>, R> {
    /// Draw a new sample and map it to the values of all free and
    /// deterministic nodes.
    pub(crate) fn expanded_draw(&mut self) -> Result<(Vec<Vec<f64>>, DrawStats)> {
        let (position, stats) = self.draw()?;
        let values = self
            .logp
            .expand(&position)
            .with_context(|| format!("Could not compute draw values in chain {}", self.chain))?;
        Ok((values, stats))
    }
}
