use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    euclidean_hamiltonian::EuclideanPoint,
    math::{multiply, vector_dot},
    nuts::{Collector, SampleInfo},
};

/// Diagonal mass matrix, stored as the inverse (the posterior variance
/// estimate) together with the inverse standard deviations.
#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        izip!(
            self.variance.iter_mut(),
            self.inv_stds.iter_mut(),
            new_variance
        )
        .for_each(|(var, inv_std, x)| {
            assert!(x.is_finite(), "Illegal value on mass matrix: {}", x);
            assert!(x > 0f64, "Illegal value on mass matrix: {}", x);
            *var = x;
            *inv_std = (1. / x).sqrt();
        });
    }

    pub(crate) fn update_velocity(&self, state: &mut EuclideanPoint) {
        multiply(&self.variance, &state.momentum, &mut state.velocity);
    }

    pub(crate) fn update_kinetic_energy(&self, state: &mut EuclideanPoint) {
        state.kinetic_energy = 0.5 * vector_dot(&state.momentum, &state.velocity);
    }

    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(
        &self,
        state: &mut EuclideanPoint,
        rng: &mut R,
    ) {
        state
            .momentum
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }
}

/// Welford estimator of the elementwise mean and variance of a sequence
/// of vectors.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    variance: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            variance: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let count = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.variance.iter_mut()).for_each(
            |(&x, mean, var)| {
                let delta = x - *mean;
                *mean += delta / count;
                *var += delta * (x - *mean);
            },
        );
    }

    /// The sum of squared deviations and the factor that turns it into the
    /// sample variance.
    pub(crate) fn current(&self) -> (&[f64], f64) {
        assert!(self.count > 1);
        (&self.variance, ((self.count - 1) as f64).recip())
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Stores the position of the latest draw, and whether it should be used
/// to estimate the posterior variance.
pub(crate) struct DrawCollector {
    pub(crate) draw: Box<[f64]>,
    pub(crate) is_good: bool,
}

impl DrawCollector {
    pub(crate) fn new(dim: usize) -> Self {
        DrawCollector {
            draw: vec![0f64; dim].into(),
            is_good: true,
        }
    }
}

impl Collector for DrawCollector {
    fn register_draw(&mut self, state: &EuclideanPoint, info: &SampleInfo) {
        self.draw.copy_from_slice(&state.position);
        let idx = state.index_in_trajectory;
        if info.divergence_info.is_some() {
            self.is_good = (idx <= -4) | (idx >= 4);
        } else {
            self.is_good = idx != 0;
        }
    }
}

/// Settings for the windowed diagonal mass matrix adaptation.
#[derive(Debug, Clone, Copy)]
pub struct DiagAdaptSettings {
    /// Number of tuning draws before the first variance window.
    pub initial_buffer: u64,
    /// Number of tuning draws after the last variance window, where only
    /// the step size is adapted.
    pub terminal_buffer: u64,
    /// Length of the first variance window. Each following window is
    /// twice as long.
    pub base_window: u64,
    /// Shrink the variance estimate towards a small constant.
    pub regularize: bool,
}

impl Default for DiagAdaptSettings {
    fn default() -> Self {
        Self {
            initial_buffer: 75,
            terminal_buffer: 50,
            base_window: 25,
            regularize: true,
        }
    }
}

const LOWER_LIMIT: f64 = 1e-20f64;
const UPPER_LIMIT: f64 = 1e20f64;

/// Computes the diagonal of the inverse mass matrix from a variance
/// estimate accumulated over a window of tuning draws.
pub(crate) struct MassMatrixStrategy {
    variance: RunningVariance,
    settings: DiagAdaptSettings,
}

impl MassMatrixStrategy {
    pub(crate) fn new(settings: DiagAdaptSettings, dim: usize) -> Self {
        Self {
            variance: RunningVariance::new(dim),
            settings,
        }
    }

    pub(crate) fn update_estimators(&mut self, collector: &DrawCollector) {
        if collector.is_good {
            self.variance.add_sample(&collector.draw);
        }
    }

    pub(crate) fn current_count(&self) -> u64 {
        self.variance.count()
    }

    /// Update the mass matrix from the current window and start a new one.
    ///
    /// Returns whether the mass matrix was changed.
    pub(crate) fn end_window(&mut self, mass_matrix: &mut DiagMassMatrix) -> bool {
        let dim = mass_matrix.variance.len();
        let variance = std::mem::replace(&mut self.variance, RunningVariance::new(dim));
        if variance.count() < 3 {
            return false;
        }
        let (sum_sq, scale) = variance.current();
        let n = variance.count() as f64;
        let regularize = self.settings.regularize;
        mass_matrix.update_diag(sum_sq.iter().map(|&s| {
            let var = s * scale;
            let var = if regularize {
                (n / (n + 5.)) * var + 1e-3 * (5. / (n + 5.))
            } else {
                var
            };
            var.clamp(LOWER_LIMIT, UPPER_LIMIT)
        }));
        true
    }
}
