use rand::Rng;

use crate::{
    density::CpuLogpFunc,
    euclidean_hamiltonian::{DivergenceInfo, EuclideanHamiltonian, EuclideanPoint, State},
    mass_matrix::{DiagAdaptSettings, DrawCollector, MassMatrixStrategy},
    nuts::{Collector, NutsOptions, SampleInfo},
    stepsize::{AcceptanceRateCollector, DualAverageSettings, StepSizeStrategy},
};

/// Warmup shorter than this only adapts the step size.
const MIN_TUNE_FOR_MASS_MATRIX: u64 = 20;

/// Options for the warmup of a chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptOptions {
    pub step_size: DualAverageSettings,
    pub mass_matrix: DiagAdaptSettings,
}

/// The draws used to estimate the mass matrix during warmup.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WindowSchedule {
    /// First draw (starting at 0) that enters a variance window.
    pub(crate) start: u64,
    /// Draw counts after which the mass matrix is updated.
    pub(crate) ends: Vec<u64>,
}

impl WindowSchedule {
    /// The windows double in length, and the last window is stretched up
    /// to the terminal buffer. Buffers that do not fit into a short warmup
    /// are scaled down to 15% (initial), 10% (terminal) and the rest.
    pub(crate) fn new(num_tune: u64, settings: &DiagAdaptSettings) -> Self {
        if num_tune < MIN_TUNE_FOR_MASS_MATRIX {
            return Self {
                start: num_tune,
                ends: vec![],
            };
        }
        let (init, term, base) = if settings.initial_buffer
            + settings.terminal_buffer
            + settings.base_window
            > num_tune
        {
            let init = num_tune * 15 / 100;
            let term = num_tune / 10;
            (init, term, num_tune - init - term)
        } else {
            (
                settings.initial_buffer,
                settings.terminal_buffer,
                settings.base_window,
            )
        };

        let last = num_tune - term;
        let mut ends = vec![];
        let mut start = init;
        let mut size = base.max(1);
        loop {
            let mut end = start + size;
            if end + 2 * size > last {
                end = last;
            }
            ends.push(end);
            if end >= last {
                break;
            }
            start = end;
            size *= 2;
        }
        Self { start: init, ends }
    }
}

/// Adapts step size and mass matrix together during warmup.
pub(crate) struct GlobalStrategy {
    step_size: StepSizeStrategy,
    mass_matrix: MassMatrixStrategy,
    num_tune: u64,
    windows: WindowSchedule,
    next_window: usize,
}

impl GlobalStrategy {
    pub(crate) fn new(options: &AdaptOptions, num_tune: u64, dim: usize) -> Self {
        Self {
            step_size: StepSizeStrategy::new(options.step_size),
            mass_matrix: MassMatrixStrategy::new(options.mass_matrix, dim),
            num_tune,
            windows: WindowSchedule::new(num_tune, &options.mass_matrix),
            next_window: 0,
        }
    }

    pub(crate) fn init<F: CpuLogpFunc, R: Rng + ?Sized>(
        &mut self,
        logp: &mut F,
        options: &NutsOptions,
        hamiltonian: &mut EuclideanHamiltonian,
        state: &State,
        rng: &mut R,
    ) {
        self.step_size
            .init(logp, options, hamiltonian, state, rng);
    }

    /// Update the hamiltonian after draw number `draw` (starting at 0).
    pub(crate) fn adapt(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        draw: u64,
        collector: &CombinedCollector,
    ) {
        if draw >= self.num_tune {
            self.step_size.update_stats(&collector.acceptance);
            return;
        }

        self.step_size.adapt(hamiltonian, &collector.acceptance);

        let count = draw + 1;
        if let Some(&end) = self.windows.ends.get(self.next_window) {
            if draw >= self.windows.start {
                self.mass_matrix.update_estimators(&collector.draw);
            }
            if count == end {
                if self.mass_matrix.end_window(&mut hamiltonian.mass_matrix) {
                    self.step_size.reset(hamiltonian);
                }
                self.next_window += 1;
            }
        }

        if count == self.num_tune {
            self.step_size.finalize(hamiltonian);
        }
    }

    pub(crate) fn new_collector(&self, dim: usize) -> CombinedCollector {
        CombinedCollector {
            acceptance: AcceptanceRateCollector::new(),
            draw: DrawCollector::new(dim),
        }
    }

    pub(crate) fn is_tuning(&self, draw: u64) -> bool {
        draw < self.num_tune
    }

    pub(crate) fn mean_tree_accept(&self) -> f64 {
        self.step_size.last_mean_tree_accept()
    }

    pub(crate) fn n_steps(&self) -> u64 {
        self.step_size.last_n_steps()
    }
}

pub(crate) struct CombinedCollector {
    pub(crate) acceptance: AcceptanceRateCollector,
    pub(crate) draw: DrawCollector,
}

impl Collector for CombinedCollector {
    fn register_leapfrog(
        &mut self,
        start: &EuclideanPoint,
        end: &EuclideanPoint,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.acceptance
            .register_leapfrog(start, end, divergence_info);
        self.draw.register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &EuclideanPoint, info: &SampleInfo) {
        self.acceptance.register_draw(state, info);
        self.draw.register_draw(state, info);
    }

    fn register_init(&mut self, state: &EuclideanPoint, options: &NutsOptions) {
        self.acceptance.register_init(state, options);
        self.draw.register_init(state, options);
    }
}
