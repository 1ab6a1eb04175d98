use thiserror::Error;

use crate::{
    density::CpuLogpFunc,
    euclidean_hamiltonian::{
        Direction, DivergenceInfo, EuclideanHamiltonian, EuclideanPoint, LeapfrogResult, State,
    },
    math::logaddexp,
};

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not initialize state because of bad initial gradient.")]
    BadInitGrad(),

    #[error("Chain {chain} found no valid trajectory in any of its {iterations} warmup iterations ({divergences} divergences)")]
    SamplerDivergenceExceeded {
        chain: u64,
        divergences: u64,
        iterations: u64,
    },
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Callbacks for various events during a Nuts sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for mass matrix adaptation.
pub(crate) trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &EuclideanPoint,
        _end: &EuclideanPoint,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &EuclideanPoint, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &EuclideanPoint, _options: &NutsOptions) {}
}

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub(crate) struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,

    /// The very first leapfrog step diverged, so the draw is the
    /// initial point of the trajectory.
    pub no_valid_step: bool,
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    log_size: f64,
    depth: u64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult<E> {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(E),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            is_main: true,
        }
    }

    #[inline]
    fn extend<F, R, C>(
        mut self,
        logp: &mut F,
        rng: &mut R,
        hamiltonian: &EuclideanHamiltonian,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult<F::LogpError>
    where
        F: CpuLogpFunc,
        R: rand::Rng + ?Sized,
        C: Collector,
    {
        let mut other = match self.single_step(logp, hamiltonian, direction, collector) {
            LeapfrogResult::Ok(tree) => tree,
            LeapfrogResult::Divergence(info) => return ExtendResult::Diverging(self, info),
            LeapfrogResult::Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(logp, rng, hamiltonian, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    #[inline]
    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory <= self.right.index_in_trajectory);
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory <= 0);
            assert!(self.right.index_in_trajectory >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || (rng.random_bool((other.log_size - self_log_size).exp()))
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    #[inline]
    fn single_step<F: CpuLogpFunc, C: Collector>(
        &self,
        logp: &mut F,
        hamiltonian: &EuclideanHamiltonian,
        direction: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<NutsTree, F::LogpError> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(logp, start, direction, collector) {
            LeapfrogResult::Ok(end) => end,
            LeapfrogResult::Divergence(info) => return LeapfrogResult::Divergence(info),
            LeapfrogResult::Err(error) => return LeapfrogResult::Err(error),
        };

        let log_size = -end.energy_error();
        LeapfrogResult::Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            is_main: false,
        })
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        let no_valid_step = divergence_info.is_some() & (self.depth == 0);
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
            no_valid_step,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
}

/// Draw a new point from a trajectory that starts at `init`.
pub(crate) fn draw<F, R, C>(
    logp: &mut F,
    init: &State,
    rng: &mut R,
    hamiltonian: &EuclideanHamiltonian,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    F: CpuLogpFunc,
    R: rand::Rng + ?Sized,
    C: Collector,
{
    let init = hamiltonian.initialize_trajectory(init, rng);
    collector.register_init(&init, options);

    let mut tree = NutsTree::new(init);
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(logp, rng, hamiltonian, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(NutsError::LogpFailure(Box::new(error)));
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}
