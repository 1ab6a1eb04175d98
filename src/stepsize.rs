use rand::Rng;

use crate::{
    density::CpuLogpFunc,
    euclidean_hamiltonian::{
        Direction, DivergenceInfo, EuclideanHamiltonian, EuclideanPoint, LeapfrogResult, State,
    },
    nuts::{Collector, NutsOptions},
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Restart the adaptation around a new step size.
    pub(crate) fn reset(&mut self, initial_step: f64) {
        *self = DualAverage::new(self.settings, initial_step);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean acceptance probability of all leapfrog steps in a trajectory.
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
    pub(crate) mean_sym: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
            mean_sym: RunningMean::new(),
        }
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &EuclideanPoint,
        end: &EuclideanPoint,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => {
                self.mean.add(0.);
                self.mean_sym.add(0.);
            }
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
                self.mean_sym
                    .add(2. * diff.min(0.).exp() / (1. + diff.exp()));
            }
        };
    }

    fn register_init(&mut self, state: &EuclideanPoint, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
        self.mean_sym.reset();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    /// The acceptance rate that the dual averaging aims for.
    pub target_accept: f64,
    /// Step size used before the initial search, and the fallback if the
    /// search fails.
    pub initial_step: f64,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            initial_step: 0.1,
            params: DualAverageOptions::default(),
        }
    }
}

/// Adapts the step size of the hamiltonian during warmup.
pub(crate) struct StepSizeStrategy {
    step_size_adapt: DualAverage,
    options: DualAverageSettings,
    last_mean_tree_accept: f64,
    last_n_steps: u64,
}

impl StepSizeStrategy {
    pub(crate) fn new(options: DualAverageSettings) -> Self {
        Self {
            step_size_adapt: DualAverage::new(options.params, options.initial_step),
            options,
            last_mean_tree_accept: 0.,
            last_n_steps: 0,
        }
    }

    /// Look for a step size with an acceptance rate close to the target by
    /// repeatedly doubling or halving it for a single leapfrog step.
    pub(crate) fn init<F: CpuLogpFunc, R: Rng + ?Sized>(
        &mut self,
        logp: &mut F,
        options: &NutsOptions,
        hamiltonian: &mut EuclideanHamiltonian,
        state: &State,
        rng: &mut R,
    ) {
        let state = hamiltonian.initialize_trajectory(state, rng);

        *hamiltonian.step_size_mut() = self.options.initial_step;

        let Some(accept_stat) = single_step_accept(logp, hamiltonian, &state, Direction::Forward, options)
        else {
            return;
        };

        let dir = if accept_stat > self.options.target_accept {
            Direction::Forward
        } else {
            Direction::Backward
        };

        for _ in 0..100 {
            let Some(accept_stat) = single_step_accept(logp, hamiltonian, &state, dir, options)
            else {
                *hamiltonian.step_size_mut() = self.options.initial_step;
                return;
            };
            match dir {
                Direction::Forward => {
                    if (accept_stat <= self.options.target_accept) | (hamiltonian.step_size() > 1e5)
                    {
                        self.step_size_adapt =
                            DualAverage::new(self.options.params, hamiltonian.step_size());
                        return;
                    }
                    *hamiltonian.step_size_mut() *= 2.;
                }
                Direction::Backward => {
                    if (accept_stat >= self.options.target_accept)
                        | (hamiltonian.step_size() < 1e-10)
                    {
                        self.step_size_adapt =
                            DualAverage::new(self.options.params, hamiltonian.step_size());
                        return;
                    }
                    *hamiltonian.step_size_mut() /= 2.;
                }
            }
        }
        // If we don't find something better, use the specified initial value
        *hamiltonian.step_size_mut() = self.options.initial_step;
    }

    /// Feed the acceptance rate of the latest trajectory into the dual
    /// averaging and set the new step size.
    pub(crate) fn adapt(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        collector: &AcceptanceRateCollector,
    ) {
        self.update_stats(collector);
        self.step_size_adapt
            .advance(self.last_mean_tree_accept, self.options.target_accept);
        *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size();
    }

    pub(crate) fn update_stats(&mut self, collector: &AcceptanceRateCollector) {
        self.last_mean_tree_accept = collector.mean.current();
        self.last_n_steps = collector.mean.count();
    }

    /// Restart the dual averaging at the current step size, after the
    /// mass matrix changed.
    pub(crate) fn reset(&mut self, hamiltonian: &EuclideanHamiltonian) {
        self.step_size_adapt.reset(hamiltonian.step_size());
    }

    /// Fix the step size to the averaged iterate.
    pub(crate) fn finalize(&mut self, hamiltonian: &mut EuclideanHamiltonian) {
        *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size_adapted();
    }

    pub(crate) fn last_mean_tree_accept(&self) -> f64 {
        self.last_mean_tree_accept
    }

    pub(crate) fn last_n_steps(&self) -> u64 {
        self.last_n_steps
    }
}

fn single_step_accept<F: CpuLogpFunc>(
    logp: &mut F,
    hamiltonian: &EuclideanHamiltonian,
    state: &State,
    dir: Direction,
    options: &NutsOptions,
) -> Option<f64> {
    let mut collector = AcceptanceRateCollector::new();
    collector.register_init(state, options);
    match hamiltonian.leapfrog(logp, state, dir, &mut collector) {
        LeapfrogResult::Ok(_) => Some(collector.mean.current()),
        _ => None,
    }
}
