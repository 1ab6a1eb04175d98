//! Posterior predictive sampling.
//!
//! For every selected posterior draw the deterministic nodes are evaluated
//! again, optionally against new data, and one value per observation is
//! drawn from the distribution of each target node.

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    density::{DataOverride, Evaluator},
    model::{check_param_sizes, DistSpec, Model, ModelError, NodeKind},
    math::shape_size,
    trace::{ChainTrace, Draw, Trace},
};

/// Offset of the random streams used for prediction, so that they never
/// overlap with the streams of the sampler.
const PREDICTIVE_STREAM_OFFSET: u64 = 1_000_000;

/// Which posterior draws to use for prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subsample {
    #[default]
    All,
    /// Every k-th draw of each chain, starting with the first.
    Thin(usize),
    /// The first n draws of each chain.
    First(usize),
}

impl Subsample {
    fn select<'a>(&self, chain: &'a ChainTrace) -> Vec<&'a Draw> {
        let draws = chain.draws().iter();
        match *self {
            Subsample::All => draws.collect(),
            Subsample::Thin(k) => draws.step_by(k.max(1)).collect(),
            Subsample::First(n) => draws.take(n).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictOptions {
    /// Names of the observed nodes to predict. All observed nodes if empty.
    pub targets: Vec<String>,
    /// New values for data nodes, validated like [`Model::rebind`].
    pub data: HashMap<String, DataOverride>,
    pub subsample: Subsample,
    pub seed: u64,
}

/// Predictive samples of one observed node.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveTarget {
    pub name: String,
    /// Number of predicted observations per draw.
    pub size: usize,
    /// Samples indexed by chain, draw and observation.
    pub samples: Vec<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveSamples {
    targets: Vec<PredictiveTarget>,
    /// The posterior draw index of each predictive draw, per chain.
    draws: Vec<Vec<u64>>,
    chains: Vec<u64>,
}

impl PredictiveSamples {
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn target(&self, name: &str) -> Option<&PredictiveTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Samples of a target, indexed by chain, draw and observation.
    pub fn get(&self, name: &str) -> Option<&[Vec<Vec<f64>>]> {
        self.target(name).map(|t| t.samples.as_slice())
    }

    /// Samples of a target from all chains.
    pub fn pooled(&self, name: &str) -> Option<Vec<&[f64]>> {
        self.target(name).map(|t| {
            t.samples
                .iter()
                .flatten()
                .map(|draw| draw.as_slice())
                .collect()
        })
    }

    /// Mean prediction of every observation.
    pub fn mean(&self, name: &str) -> Option<Vec<f64>> {
        let target = self.target(name)?;
        let mut mean = vec![0f64; target.size];
        let mut count = 0usize;
        for draw in target.samples.iter().flatten() {
            mean.iter_mut().zip(draw).for_each(|(m, &x)| *m += x);
            count += 1;
        }
        if count == 0 {
            return None;
        }
        mean.iter_mut().for_each(|m| *m /= count as f64);
        Some(mean)
    }

    /// Posterior draw indices used for each chain.
    pub fn draw_indices(&self) -> &[Vec<u64>] {
        &self.draws
    }

    pub fn chains(&self) -> &[u64] {
        &self.chains
    }
}

struct TargetNode<'model> {
    name: &'model str,
    spec: &'model DistSpec,
    size: usize,
}

/// Draw posterior predictive samples for observed nodes of `model`.
///
/// `trace` must come from sampling the same model.
pub fn predict(
    model: &Model,
    trace: &Trace,
    options: &PredictOptions,
) -> Result<PredictiveSamples, ModelError> {
    let mut overrides = HashMap::with_capacity(options.data.len());
    for (name, data) in options.data.iter() {
        let index = model.data_index(name)?;
        model.check_rebind(index, &data.values, &data.shape)?;
        overrides.insert(index, data.clone());
    }

    let mut evaluator = Evaluator::new(model, &overrides)?;

    let target_names: Vec<&str> = if options.targets.is_empty() {
        model
            .observed_nodes()
            .into_iter()
            .filter_map(|node| model.node_name(node))
            .collect()
    } else {
        options.targets.iter().map(|name| name.as_str()).collect()
    };

    let mut targets = Vec::with_capacity(target_names.len());
    for name in target_names {
        let node = model
            .node(name)
            .and_then(|node| model.get(node))
            .ok_or_else(|| ModelError::UnknownNode(name.to_string()))?;
        let NodeKind::Observed { spec, values } = node.kind() else {
            return Err(ModelError::UnknownNode(name.to_string()));
        };
        let param_size = spec
            .parents()
            .map(|parent| shape_size(&evaluator.shapes[parent.index()]))
            .max()
            .unwrap_or(1);
        let size = if param_size > 1 {
            param_size
        } else {
            values.len()
        };
        check_param_sizes(node.name(), spec, &evaluator.shapes, size)?;
        targets.push(TargetNode {
            name: node.name(),
            spec,
            size,
        });
    }

    // Free variables in the trace, with their position among the draw values
    let mut free = Vec::new();
    for (position, var) in trace.variables().iter().enumerate() {
        let node = model
            .nodes()
            .get(var.index)
            .filter(|node| node.name() == var.name)
            .ok_or_else(|| ModelError::UnknownNode(var.name.clone()))?;
        if let NodeKind::Free { .. } = node.kind() {
            if evaluator.values[var.index].len() != var.size() {
                return Err(ModelError::ShapeMismatch {
                    name: var.name.clone(),
                    reason: format!(
                        "trace has {} values per draw, the model expects {}",
                        var.size(),
                        evaluator.values[var.index].len()
                    ),
                });
            }
            free.push((position, var.index));
        }
    }

    let mut samples: Vec<Vec<Vec<Vec<f64>>>> = vec![Vec::new(); targets.len()];
    let mut draw_indices = Vec::with_capacity(trace.num_chains());
    let mut chain_ids = Vec::with_capacity(trace.num_chains());

    for chain in trace.chains() {
        let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
        rng.set_stream(PREDICTIVE_STREAM_OFFSET + chain.chain());

        let selected = options.subsample.select(chain);
        let mut chain_samples: Vec<Vec<Vec<f64>>> = targets
            .iter()
            .map(|_| Vec::with_capacity(selected.len()))
            .collect();

        for draw in selected.iter() {
            for &(position, index) in free.iter() {
                evaluator.set_values(index, &draw.values[position]);
            }
            evaluator.forward();
            for (target, out) in targets.iter().zip(chain_samples.iter_mut()) {
                let values = (0..target.size)
                    .map(|i| evaluator.distribution(target.spec, i).sample(&mut rng))
                    .collect();
                out.push(values);
            }
        }

        for (all, chain_samples) in samples.iter_mut().zip(chain_samples) {
            all.push(chain_samples);
        }
        draw_indices.push(selected.iter().map(|draw| draw.draw).collect());
        chain_ids.push(chain.chain());
    }

    let targets = targets
        .into_iter()
        .zip(samples)
        .map(|(target, samples)| PredictiveTarget {
            name: target.name.to_string(),
            size: target.size,
            samples,
        })
        .collect();

    Ok(PredictiveSamples {
        targets,
        draws: draw_indices,
        chains: chain_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::DrawStats,
        density::LogDensity,
        ops::Op,
        trace::ChainTrace,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn regression() -> Result<Model, ModelError> {
        let mut model = Model::new();
        let x = model.add_data("x", vec![0., 1., 2.], vec![3])?;
        let intercept = model.add_free("intercept", DistSpec::normal(0., 10.), vec![])?;
        let sigma = model.add_free("sigma", DistSpec::half_normal(1.), vec![])?;
        let mu = model.add_deterministic("mu", Op::Add, &[x, intercept])?;
        model.add_observed("y", DistSpec::normal(mu, sigma), vec![1., 2., 3.])?;
        Ok(model)
    }

    fn stats() -> DrawStats {
        DrawStats {
            depth: 1,
            maxdepth_reached: false,
            index_in_trajectory: 1,
            n_steps: 1,
            step_size: 0.1,
            energy: 0.,
            energy_error: 0.,
            logp: 0.,
            mean_tree_accept: 1.,
            diverging: false,
            warning: None,
            tuning: false,
        }
    }

    /// A trace with fixed draws of intercept and a tiny sigma.
    fn fixed_trace(model: &Model, draws_per_chain: usize) -> anyhow::Result<Trace> {
        let mut density = LogDensity::new(model)?;
        let variables = density.variables().to_vec();
        let mut chains = vec![];
        for chain in 0..2u64 {
            let mut trace = ChainTrace::new(chain);
            for i in 0..draws_per_chain {
                let intercept = (chain * 100 + i as u64) as f64;
                let values = HashMap::from([("intercept", vec![intercept]), ("sigma", vec![1e-6])]);
                let position = density.unconstrain(&values)?;
                trace.push(density.expand(&position)?, stats(), false);
            }
            chains.push(trace);
        }
        Ok(Trace::new(variables, chains))
    }

    #[test]
    fn predictions_follow_draws() -> anyhow::Result<()> {
        let model = regression()?;
        let trace = fixed_trace(&model, 4)?;
        let predictions = predict(&model, &trace, &PredictOptions::default())?;
        assert_eq!(predictions.target_names(), vec!["y"]);
        let samples = predictions.get("y").unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].len(), 4);
        assert_eq!(samples[1][2].len(), 3);
        // mu = x + intercept with intercept = 102
        assert_relative_eq!(samples[1][2][0], 102., epsilon = 1e-3);
        assert_relative_eq!(samples[1][2][2], 104., epsilon = 1e-3);
        assert_eq!(predictions.pooled("y").unwrap().len(), 8);
        let mean = predictions.mean("y").unwrap();
        assert_relative_eq!(mean[0], (0. + 1. + 2. + 3. + 100. + 101. + 102. + 103.) / 8., epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn new_data_changes_shape() -> anyhow::Result<()> {
        let model = regression()?;
        let trace = fixed_trace(&model, 2)?;
        let options = PredictOptions {
            data: HashMap::from([(
                "x".to_string(),
                DataOverride {
                    values: vec![10., 20., 30., 40., 50.],
                    shape: vec![5],
                },
            )]),
            subsample: Subsample::First(1),
            ..Default::default()
        };
        let predictions = predict(&model, &trace, &options)?;
        let samples = predictions.get("y").unwrap();
        assert_eq!(samples[0].len(), 1);
        assert_eq!(samples[0][0].len(), 5);
        assert_relative_eq!(samples[0][0][4], 50., epsilon = 1e-3);
        assert_eq!(predictions.draw_indices(), &[vec![0], vec![0]]);

        // The model data stays untouched
        assert_eq!(model.data_value("x").unwrap(), &[0., 1., 2.]);
        Ok(())
    }

    #[test]
    fn thinning_and_seeds() -> anyhow::Result<()> {
        let model = regression()?;
        let trace = fixed_trace(&model, 6)?;
        let options = PredictOptions {
            subsample: Subsample::Thin(2),
            seed: 3,
            ..Default::default()
        };
        let first = predict(&model, &trace, &options)?;
        let second = predict(&model, &trace, &options)?;
        assert_eq!(first, second);
        assert_eq!(first.draw_indices()[0], vec![0, 2, 4]);
        Ok(())
    }

    #[test]
    fn invalid_requests() -> anyhow::Result<()> {
        let model = regression()?;
        let trace = fixed_trace(&model, 1)?;

        let options = PredictOptions {
            targets: vec!["mu".to_string()],
            ..Default::default()
        };
        assert_eq!(
            predict(&model, &trace, &options),
            Err(ModelError::UnknownNode("mu".to_string()))
        );

        let options = PredictOptions {
            data: HashMap::from([(
                "x".to_string(),
                DataOverride {
                    values: vec![1., 2., 3., 4.],
                    shape: vec![2, 2],
                },
            )]),
            ..Default::default()
        };
        assert!(matches!(
            predict(&model, &trace, &options),
            Err(ModelError::ShapeMismatch { .. })
        ));

        let options = PredictOptions {
            data: HashMap::from([(
                "intercept".to_string(),
                DataOverride {
                    values: vec![1.],
                    shape: vec![],
                },
            )]),
            ..Default::default()
        };
        assert!(matches!(
            predict(&model, &trace, &options),
            Err(ModelError::UnknownNode(_))
        ));
        Ok(())
    }
}
