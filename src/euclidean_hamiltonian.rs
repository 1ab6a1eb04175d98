use std::{rc::Rc, sync::Arc};

use rand_distr::{Distribution, StandardUniform};

use crate::{
    density::CpuLogpFunc,
    mass_matrix::DiagMassMatrix,
    math::{axpy, axpy_out, scalar_prods2, scalar_prods3},
    nuts::{Collector, LogpError, NutsError},
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg the density
///   was not finite)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// A point in phase space, shared between the nodes of a trajectory tree.
pub(crate) type State = Rc<EuclideanPoint>;

pub(crate) enum LeapfrogResult<T, E> {
    Ok(T),
    Divergence(DivergenceInfo),
    Err(E),
}

#[derive(Debug, Clone)]
pub struct EuclideanPoint {
    pub position: Box<[f64]>,
    pub velocity: Box<[f64]>,
    pub gradient: Box<[f64]>,
    pub momentum: Box<[f64]>,
    pub kinetic_energy: f64,
    pub potential_energy: f64,
    pub index_in_trajectory: i64,
    /// Sum of the momenta from the start of the trajectory to this point.
    pub p_sum: Box<[f64]>,
    pub initial_energy: f64,
}

impl EuclideanPoint {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            position: vec![0f64; dim].into(),
            velocity: vec![0f64; dim].into(),
            gradient: vec![0f64; dim].into(),
            momentum: vec![0f64; dim].into(),
            kinetic_energy: 0f64,
            potential_energy: 0f64,
            index_in_trajectory: 0,
            p_sum: vec![0f64; dim].into(),
            initial_energy: 0f64,
        }
    }

    pub fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    /// The generalized no-u-turn criterion between two points of the same
    /// trajectory.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.index_in_trajectory < other.index_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.index_in_trajectory;
        let b = end.index_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(
                &end.p_sum,
                &start.p_sum,
                &start.momentum,
                &end.velocity,
                &start.velocity,
            )
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.velocity, &start.velocity)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(
                &start.p_sum,
                &end.p_sum,
                &end.momentum,
                &end.velocity,
                &start.velocity,
            )
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(
            &self.gradient,
            &self.momentum,
            epsilon / 2.,
            &mut out.momentum,
        );
    }

    fn position_step(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&out.velocity, &self.position, epsilon, &mut out.position);
    }

    fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.gradient, &mut self.momentum, epsilon / 2.);
    }

    fn set_psum(&self, out: &mut Self) {
        assert!(out.index_in_trajectory != 0);

        if out.index_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    fn update_potential_gradient<F: CpuLogpFunc>(
        &mut self,
        logp_func: &mut F,
    ) -> Result<(), F::LogpError> {
        let logp = logp_func.logp(&self.position, &mut self.gradient)?;
        self.potential_energy = -logp;
        Ok(())
    }
}

/// The hamiltonian defined by the log density and a diagonal mass matrix.
#[derive(Debug, Clone)]
pub struct EuclideanHamiltonian {
    pub(crate) mass_matrix: DiagMassMatrix,
    max_energy_error: f64,
    step_size: f64,
    dim: usize,
}

impl EuclideanHamiltonian {
    pub(crate) fn new(dim: usize, max_energy_error: f64, step_size: f64) -> Self {
        Self {
            mass_matrix: DiagMassMatrix::new(dim),
            max_energy_error,
            step_size,
            dim,
        }
    }

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub(crate) fn leapfrog<F: CpuLogpFunc, C: Collector>(
        &self,
        logp_func: &mut F,
        start: &EuclideanPoint,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<State, F::LogpError> {
        let mut out = EuclideanPoint::new(self.dim);
        out.initial_energy = start.initial_energy;

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.mass_matrix.update_velocity(&mut out);

        start.position_step(&mut out, epsilon);
        if let Err(logp_error) = out.update_potential_gradient(logp_func) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(logp_error);
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.position.clone()),
                start_gradient: Some(start.gradient.clone()),
                start_momentum: Some(start.momentum.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return LeapfrogResult::Divergence(div_info);
        }

        out.second_momentum_halfstep(epsilon);

        self.mass_matrix.update_velocity(&mut out);
        self.mass_matrix.update_kinetic_energy(&mut out);

        out.index_in_trajectory = start.index_in_trajectory + sign;

        start.set_psum(&mut out);

        let energy_error = out.energy_error();
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.position.clone()),
                start_gradient: Some(start.gradient.clone()),
                end_location: Some(out.position.clone()),
                start_momentum: Some(start.momentum.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: Some(out.index_in_trajectory),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(Rc::new(out))
    }

    /// Initialize a state at a new location.
    ///
    /// The momentum is left at zero, it is set by `initialize_trajectory`.
    pub(crate) fn init_state<F: CpuLogpFunc>(
        &self,
        logp_func: &mut F,
        init: &[f64],
    ) -> Result<State, NutsError> {
        let mut point = EuclideanPoint::new(self.dim);
        point.position.copy_from_slice(init);

        point
            .update_potential_gradient(logp_func)
            .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
        if !point.gradient.iter().all(|g| g.is_finite() & (*g != 0.)) {
            Err(NutsError::BadInitGrad())
        } else {
            Ok(Rc::new(point))
        }
    }

    /// Draw a new momentum and make the state the first point of a new
    /// trajectory.
    pub(crate) fn initialize_trajectory<R: rand::Rng + ?Sized>(
        &self,
        state: &State,
        rng: &mut R,
    ) -> State {
        let mut inner = EuclideanPoint::clone(state);
        self.mass_matrix.randomize_momentum(&mut inner, rng);
        self.mass_matrix.update_velocity(&mut inner);
        self.mass_matrix.update_kinetic_energy(&mut inner);
        inner.index_in_trajectory = 0;
        inner.initial_energy = inner.energy();
        inner.p_sum.copy_from_slice(&inner.momentum);
        Rc::new(inner)
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub(crate) fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    pub fn mass_matrix(&self) -> &DiagMassMatrix {
        &self.mass_matrix
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
pub(crate) mod test_logps {
    use thiserror::Error;

    use crate::{density::CpuLogpFunc, nuts::LogpError};

    /// Independent normal distributions with unit variance around `mu`.
    #[derive(Clone, Debug)]
    pub(crate) struct NormalLogp {
        pub(crate) dim: usize,
        pub(crate) mu: f64,
    }

    #[derive(Error, Debug)]
    pub(crate) enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    impl CpuLogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2.;
                *g = -val;
            }
            Ok(logp)
        }
    }
}
