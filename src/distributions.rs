//! Parametric distributions with log-densities and their gradients.
//!
//! Every distribution is a small immutable value. The evaluator in
//! [`crate::density`] resolves the parameters of a node for each element and
//! then calls the scalar kernels defined here, so the kernels do not validate
//! their parameters: invalid parameters produce `NaN` or `-inf`, which the
//! evaluator reports as a non-finite density.

use rand::Rng;
use rand_distr::{Distribution as _, StandardNormal};
use statrs::function::gamma::{digamma, ln_gamma};

use crate::model::ModelError;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;
const LN_2: f64 = std::f64::consts::LN_2;

/// The kinds of distributions a node can be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionKind {
    Normal,
    HalfNormal,
    Gamma,
}

impl DistributionKind {
    /// Number of parameters of the distribution.
    pub fn num_params(&self) -> usize {
        match self {
            DistributionKind::Normal => 2,
            DistributionKind::HalfNormal => 1,
            DistributionKind::Gamma => 2,
        }
    }

    /// Names of the parameters, in the order they are passed.
    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            DistributionKind::Normal => &["mu", "sigma"],
            DistributionKind::HalfNormal => &["sigma"],
            DistributionKind::Gamma => &["alpha", "beta"],
        }
    }

    /// Build a distribution from already resolved parameter values.
    ///
    /// `params` must contain at least `num_params` values. No validation is
    /// performed.
    pub(crate) fn with_params(&self, params: &[f64]) -> Distribution {
        match self {
            DistributionKind::Normal => Distribution::Normal {
                mu: params[0],
                sigma: params[1],
            },
            DistributionKind::HalfNormal => Distribution::HalfNormal { sigma: params[0] },
            DistributionKind::Gamma => Distribution::Gamma {
                alpha: params[0],
                beta: params[1],
            },
        }
    }

    pub fn support(&self) -> Support {
        match self {
            DistributionKind::Normal => Support::Real,
            DistributionKind::HalfNormal => Support::NonNegative,
            DistributionKind::Gamma => Support::Positive,
        }
    }

    /// The transform used to map the support onto the real line.
    pub fn default_transform(&self) -> Transform {
        match self.support() {
            Support::Real => Transform::Identity,
            Support::NonNegative | Support::Positive => Transform::Log,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    NonNegative,
    Positive,
}

/// A fully parameterized distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Normal { mu: f64, sigma: f64 },
    HalfNormal { sigma: f64 },
    /// Gamma distribution with shape `alpha` and rate `beta`.
    Gamma { alpha: f64, beta: f64 },
}

fn check_positive(name: &'static str, value: f64) -> Result<f64, ModelError> {
    if value.is_finite() && value > 0. {
        Ok(value)
    } else {
        Err(ModelError::InvalidParameter {
            name: name.to_string(),
            reason: format!("must be finite and positive, got {value}"),
        })
    }
}

impl Distribution {
    pub fn normal(mu: f64, sigma: f64) -> Result<Self, ModelError> {
        if !mu.is_finite() {
            return Err(ModelError::InvalidParameter {
                name: "mu".to_string(),
                reason: format!("must be finite, got {mu}"),
            });
        }
        let sigma = check_positive("sigma", sigma)?;
        Ok(Distribution::Normal { mu, sigma })
    }

    pub fn half_normal(sigma: f64) -> Result<Self, ModelError> {
        let sigma = check_positive("sigma", sigma)?;
        Ok(Distribution::HalfNormal { sigma })
    }

    pub fn gamma(alpha: f64, beta: f64) -> Result<Self, ModelError> {
        let alpha = check_positive("alpha", alpha)?;
        let beta = check_positive("beta", beta)?;
        Ok(Distribution::Gamma { alpha, beta })
    }

    pub fn kind(&self) -> DistributionKind {
        match self {
            Distribution::Normal { .. } => DistributionKind::Normal,
            Distribution::HalfNormal { .. } => DistributionKind::HalfNormal,
            Distribution::Gamma { .. } => DistributionKind::Gamma,
        }
    }

    pub fn support(&self) -> Support {
        self.kind().support()
    }

    pub fn default_transform(&self) -> Transform {
        self.kind().default_transform()
    }

    /// Log-density at `x`. Outside of the support this is `-inf`, and `NaN`
    /// for Gamma parameters that are not positive.
    #[inline]
    pub fn log_prob(&self, x: f64) -> f64 {
        match *self {
            Distribution::Normal { mu, sigma } => {
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
            }
            Distribution::HalfNormal { sigma } => {
                if x < 0. {
                    return f64::NEG_INFINITY;
                }
                let z = x / sigma;
                LN_2 - 0.5 * z * z - sigma.ln() - LN_SQRT_2PI
            }
            Distribution::Gamma { alpha, beta } => {
                if !(alpha > 0.) | !(beta > 0.) {
                    return f64::NAN;
                }
                if x <= 0. {
                    return f64::NEG_INFINITY;
                }
                alpha * beta.ln() - ln_gamma(alpha) + (alpha - 1.) * x.ln() - beta * x
            }
        }
    }

    /// Derivative of the log-density with respect to the value.
    #[inline]
    pub fn grad_log_prob(&self, x: f64) -> f64 {
        match *self {
            Distribution::Normal { mu, sigma } => -(x - mu) / (sigma * sigma),
            Distribution::HalfNormal { sigma } => {
                if x < 0. {
                    return f64::NAN;
                }
                -x / (sigma * sigma)
            }
            Distribution::Gamma { alpha, beta } => {
                if (x <= 0.) | !(alpha > 0.) | !(beta > 0.) {
                    return f64::NAN;
                }
                (alpha - 1.) / x - beta
            }
        }
    }

    /// Derivatives of the log-density with respect to each parameter, in
    /// the order of [`DistributionKind::param_names`]. Unused slots are zero.
    #[inline]
    pub fn grad_log_prob_wrt_params(&self, x: f64) -> [f64; 2] {
        match *self {
            Distribution::Normal { mu, sigma } => {
                let diff = x - mu;
                let var = sigma * sigma;
                [diff / var, -1. / sigma + diff * diff / (var * sigma)]
            }
            Distribution::HalfNormal { sigma } => {
                [-1. / sigma + x * x / (sigma * sigma * sigma), 0.]
            }
            Distribution::Gamma { alpha, beta } => {
                [beta.ln() - digamma(alpha) + x.ln(), alpha / beta - x]
            }
        }
    }

    /// Sum of the log-densities of all values.
    pub fn log_prob_sum(&self, values: &[f64]) -> f64 {
        values.iter().map(|&x| self.log_prob(x)).sum()
    }

    /// Elementwise derivative of the log-density with respect to the values.
    pub fn grad_log_prob_wrt_value(&self, values: &[f64], out: &mut [f64]) {
        assert!(values.len() == out.len());
        values
            .iter()
            .zip(out.iter_mut())
            .for_each(|(&x, out)| *out = self.grad_log_prob(x));
    }

    /// The mode of the distribution (the mean for the Gamma if alpha < 1).
    pub fn mode(&self) -> f64 {
        match *self {
            Distribution::Normal { mu, .. } => mu,
            Distribution::HalfNormal { .. } => 0.,
            Distribution::Gamma { alpha, beta } => {
                if alpha >= 1. {
                    (alpha - 1.) / beta
                } else {
                    alpha / beta
                }
            }
        }
    }

    /// Draw a single value. Returns `NaN` if the parameters are invalid.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Distribution::Normal { mu, sigma } => {
                if !(sigma > 0.) {
                    return f64::NAN;
                }
                let z: f64 = StandardNormal.sample(rng);
                mu + sigma * z
            }
            Distribution::HalfNormal { sigma } => {
                if !(sigma > 0.) {
                    return f64::NAN;
                }
                let z: f64 = StandardNormal.sample(rng);
                (sigma * z).abs()
            }
            Distribution::Gamma { alpha, beta } => {
                match rand_distr::Gamma::new(alpha, beta.recip()) {
                    Ok(dist) => dist.sample(rng),
                    Err(_) => f64::NAN,
                }
            }
        }
    }
}

/// Bijection between the support of a distribution and the real line.
///
/// `forward` maps a constrained value to the unconstrained space the sampler
/// works in, `inverse` maps it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    Log,
}

impl Transform {
    #[inline]
    pub fn forward(&self, x: f64) -> f64 {
        match self {
            Transform::Identity => x,
            Transform::Log => x.ln(),
        }
    }

    #[inline]
    pub fn inverse(&self, u: f64) -> f64 {
        match self {
            Transform::Identity => u,
            Transform::Log => u.exp(),
        }
    }

    /// `log |d inverse(u) / du|`
    #[inline]
    pub fn log_det_jacobian(&self, u: f64) -> f64 {
        match self {
            Transform::Identity => 0.,
            Transform::Log => u,
        }
    }

    /// `d inverse(u) / du`, given `x = inverse(u)`.
    #[inline]
    pub(crate) fn inverse_derivative(&self, x: f64) -> f64 {
        match self {
            Transform::Identity => 1.,
            Transform::Log => x,
        }
    }

    /// `d log_det_jacobian(u) / du`
    #[inline]
    pub(crate) fn log_det_jacobian_grad(&self) -> f64 {
        match self {
            Transform::Identity => 0.,
            Transform::Log => 1.,
        }
    }
}
