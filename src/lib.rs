//! Build Bayesian models as graphs of random variables and sample their
//! posterior with the No-U-Turn Sampler.
//!
//! ```no_run
//! use nuts_graph::{sample, summarize, DistSpec, Model, NutsSettings};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut model = Model::new();
//! let mu = model.add_free("mu", DistSpec::normal(0., 10.), vec![])?;
//! let sigma = model.add_free("sigma", DistSpec::half_normal(5.), vec![])?;
//! model.add_observed("y", DistSpec::normal(mu, sigma), vec![1.2, 0.4, 2.1])?;
//!
//! let trace = sample(&model, &NutsSettings::default())?;
//! println!("{}", summarize(&trace, 0.94).to_table());
//! # Ok(())
//! # }
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod density;
pub(crate) mod diagnostics;
pub(crate) mod distributions;
pub(crate) mod euclidean_hamiltonian;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod ops;
pub(crate) mod predictive;
pub(crate) mod sampler;
pub(crate) mod stepsize;
pub(crate) mod trace;

pub use adapt_strategy::AdaptOptions;
pub use chain::{DrawStats, SamplingWarning};
pub use density::{CpuLogpFunc, DataOverride, DensityError, LogDensity, VariableInfo};
pub use diagnostics::{
    ess_bulk, highest_density_interval, r_hat, summarize, summarize_chain, DiagnosticsReport,
    ParamSummary,
};
pub use distributions::{Distribution, DistributionKind, Support, Transform};
pub use euclidean_hamiltonian::DivergenceInfo;
pub use mass_matrix::DiagAdaptSettings;
pub use model::{DistSpec, Model, ModelError, Node, NodeKind, NodeRef, Param};
pub use nuts::{LogpError, NutsError, NutsOptions};
pub use ops::{DeterministicFn, Op};
pub use predictive::{
    predict, PredictOptions, PredictiveSamples, PredictiveTarget, Subsample,
};
pub use sampler::{sample, sample_with_stop, ChainProgress, NutsSettings, Sampler, StopSignal};
pub use stepsize::{DualAverageOptions, DualAverageSettings};
pub use trace::{ChainTrace, Draw, Trace};
