//! Joint log density of a model and its gradient.
//!
//! [`LogDensity`] walks the frozen graph once forward to compute the values
//! of all nodes and the log density, and once backward to accumulate
//! adjoints into the gradient with respect to the unconstrained position.

use std::{collections::HashMap, fmt::Debug};

use rand::Rng;
use thiserror::Error;

use crate::{
    distributions::{Distribution, Transform},
    math::{bcast, shape_size},
    model::{check_param_sizes, DistSpec, Model, ModelError, NodeKind, NodeRef, Param},
    nuts::LogpError,
};

/// A log density function over an unconstrained parameter vector.
pub trait CpuLogpFunc {
    type LogpError: Debug + Send + Sync + LogpError + 'static;

    /// Dimension of the parameter vector.
    fn dim(&self) -> usize;

    /// Return the log density at `position` and write its gradient to `grad`.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;
}

#[derive(Error, Debug)]
pub enum DensityError {
    #[error("Log density or gradient is not finite (logp = {logp})")]
    NonFinite { logp: f64 },
    #[error("Node shapes do not fit the model data")]
    Shape(#[source] ModelError),
    #[error("Expected a position of length {expected}, got {found}")]
    Dimension { expected: usize, found: usize },
}

impl LogpError for DensityError {
    fn is_recoverable(&self) -> bool {
        matches!(self, DensityError::NonFinite { .. })
    }
}

/// Replacement values for a data node.
#[derive(Debug, Clone, PartialEq)]
pub struct DataOverride {
    pub values: Vec<f64>,
    pub shape: Vec<usize>,
}

/// Node values of a model at one point of the parameter space.
///
/// This is shared by the log density and the posterior predictive, which
/// evaluate the same forward pass with different data.
#[derive(Debug, Clone)]
pub(crate) struct Evaluator<'model> {
    model: &'model Model,
    pub(crate) shapes: Vec<Vec<usize>>,
    pub(crate) values: Vec<Vec<f64>>,
    adjoints: Vec<Vec<f64>>,
    needs_grad: Vec<bool>,
    /// Offset of every free node in the position vector.
    offsets: Vec<Option<usize>>,
    scratch: Vec<Vec<f64>>,
    dim: usize,
}

impl<'model> Evaluator<'model> {
    pub(crate) fn new(
        model: &'model Model,
        overrides: &HashMap<usize, DataOverride>,
    ) -> Result<Self, ModelError> {
        let data_shapes = overrides
            .iter()
            .map(|(&index, data)| (index, data.shape.clone()))
            .collect();
        let shapes = model.resolve_shapes(&data_shapes)?;

        let mut values = Vec::with_capacity(shapes.len());
        let mut needs_grad = Vec::with_capacity(shapes.len());
        let mut offsets = Vec::with_capacity(shapes.len());
        let mut dim = 0;
        let mut max_parents = 0;

        for (index, (node, shape)) in model.nodes().iter().zip(&shapes).enumerate() {
            let size = shape_size(shape);
            let (value, grad, offset) = match node.kind() {
                NodeKind::Free { .. } => {
                    let offset = dim;
                    dim += size;
                    (vec![0f64; size], true, Some(offset))
                }
                NodeKind::Observed { values, .. } => (values.to_vec(), false, None),
                NodeKind::Data { values, .. } => {
                    let values = match overrides.get(&index) {
                        Some(data) => data.values.clone(),
                        None => values.to_vec(),
                    };
                    (values, false, None)
                }
                NodeKind::Deterministic { parents, .. } => {
                    max_parents = max_parents.max(parents.len());
                    let grad = parents.iter().any(|parent| needs_grad[parent.index()]);
                    (vec![0f64; size], grad, None)
                }
            };
            values.push(value);
            needs_grad.push(grad);
            offsets.push(offset);
        }

        let adjoints = values.iter().map(|v| vec![0f64; v.len()]).collect();

        Ok(Self {
            model,
            shapes,
            values,
            adjoints,
            needs_grad,
            offsets,
            scratch: vec![Vec::new(); max_parents],
            dim,
        })
    }

    /// Set the free nodes from an unconstrained position and return the log
    /// determinant of the Jacobian of the transformations.
    fn set_position(&mut self, position: &[f64]) -> f64 {
        let mut log_det = 0f64;
        for (index, node) in self.model.nodes().iter().enumerate() {
            let NodeKind::Free { transform, .. } = node.kind() else {
                continue;
            };
            let Some(offset) = self.offsets[index] else {
                continue;
            };
            let values = &mut self.values[index];
            let source = &position[offset..offset + values.len()];
            values.iter_mut().zip(source).for_each(|(x, &u)| {
                *x = transform.inverse(u);
                log_det += transform.log_det_jacobian(u);
            });
        }
        log_det
    }

    /// Set the constrained values of a free node.
    pub(crate) fn set_values(&mut self, index: usize, values: &[f64]) {
        self.values[index].copy_from_slice(values);
    }

    /// Evaluate all deterministic nodes in order.
    pub(crate) fn forward(&mut self) {
        for (index, node) in self.model.nodes().iter().enumerate() {
            let NodeKind::Deterministic { op, parents, .. } = node.kind() else {
                continue;
            };
            let (before, after) = self.values.split_at_mut(index);
            with_parent_values(before, parents, |parent_values| {
                op.forward(parent_values, &mut after[0])
            });
        }
    }

    /// The distribution of element `i` of a node with the given spec.
    pub(crate) fn distribution(&self, spec: &DistSpec, i: usize) -> Distribution {
        let mut params = [0f64; 2];
        for (out, param) in params.iter_mut().zip(&spec.params) {
            *out = match param {
                Param::Const(value) => *value,
                Param::Node(node) => bcast(&self.values[node.index()], i),
            };
        }
        spec.kind.with_params(&params)
    }

    /// Log density of the values of node `value_index`. Seeds the adjoints of
    /// the parameters, and of the values themselves if `seed_value` is set.
    fn accumulate_term(
        &mut self,
        spec: &DistSpec,
        value_index: usize,
        seed_value: bool,
    ) -> f64 {
        let mut logp = 0f64;
        let n = self.values[value_index].len();
        for i in 0..n {
            let dist = self.distribution(spec, i);
            let x = self.values[value_index][i];
            logp += dist.log_prob(x);
            if seed_value {
                self.adjoints[value_index][i] += dist.grad_log_prob(x);
            }
            let grads = dist.grad_log_prob_wrt_params(x);
            for (param, grad) in spec.params.iter().zip(grads) {
                if let Param::Node(node) = param {
                    if !self.needs_grad[node.index()] {
                        continue;
                    }
                    let adjoint = &mut self.adjoints[node.index()];
                    if adjoint.len() == 1 {
                        adjoint[0] += grad;
                    } else {
                        adjoint[i] += grad;
                    }
                }
            }
        }
        logp
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, DensityError> {
        if position.len() != self.dim {
            return Err(DensityError::Dimension {
                expected: self.dim,
                found: position.len(),
            });
        }
        let mut logp = self.set_position(position);
        self.forward();

        self.adjoints.iter_mut().for_each(|adj| adj.fill(0.));

        let model = self.model;
        for (index, node) in model.nodes().iter().enumerate() {
            match node.kind() {
                NodeKind::Free { spec, .. } => logp += self.accumulate_term(spec, index, true),
                NodeKind::Observed { spec, .. } => {
                    logp += self.accumulate_term(spec, index, false)
                }
                _ => {}
            }
        }

        for (index, node) in model.nodes().iter().enumerate().rev() {
            match node.kind() {
                NodeKind::Deterministic { op, parents, .. } => {
                    if !self.needs_grad[index] {
                        continue;
                    }
                    for (scratch, parent) in self.scratch.iter_mut().zip(parents) {
                        scratch.clear();
                        scratch.resize(self.values[parent.index()].len(), 0.);
                    }
                    let output = &self.values[index];
                    let out_adjoint = &self.adjoints[index];
                    let scratch = &mut self.scratch[..parents.len()];
                    with_parent_values(&self.values, parents, |parent_values| {
                        with_parent_adjoints(scratch, |parent_adjoints| {
                            op.backward(parent_values, output, out_adjoint, parent_adjoints)
                        })
                    });
                    for (scratch, parent) in self.scratch.iter().zip(parents) {
                        self.adjoints[parent.index()]
                            .iter_mut()
                            .zip(scratch)
                            .for_each(|(adj, g)| *adj += g);
                    }
                }
                NodeKind::Free { transform, .. } => {
                    let Some(offset) = self.offsets[index] else {
                        continue;
                    };
                    let values = &self.values[index];
                    let out = &mut gradient[offset..offset + values.len()];
                    out.iter_mut()
                        .zip(values.iter().zip(&self.adjoints[index]))
                        .for_each(|(out, (&x, &adj))| {
                            *out = adj * transform.inverse_derivative(x)
                                + transform.log_det_jacobian_grad();
                        });
                }
                _ => {}
            }
        }

        if !logp.is_finite() | gradient.iter().any(|g| !g.is_finite()) {
            return Err(DensityError::NonFinite { logp });
        }
        Ok(logp)
    }
}

/// Call `f` with the values of `parents`. Up to three parents are passed on
/// the stack, so the built-in ops never allocate during evaluation.
fn with_parent_values<R>(
    values: &[Vec<f64>],
    parents: &[NodeRef],
    f: impl FnOnce(&[&[f64]]) -> R,
) -> R {
    match parents {
        [a] => f(&[values[a.index()].as_slice()]),
        [a, b] => f(&[values[a.index()].as_slice(), values[b.index()].as_slice()]),
        [a, b, c] => f(&[
            values[a.index()].as_slice(),
            values[b.index()].as_slice(),
            values[c.index()].as_slice(),
        ]),
        _ => {
            let parent_values: Vec<&[f64]> = parents
                .iter()
                .map(|parent| values[parent.index()].as_slice())
                .collect();
            f(&parent_values)
        }
    }
}

/// Call `f` with mutable views of the adjoint scratch buffers.
fn with_parent_adjoints<R>(
    scratch: &mut [Vec<f64>],
    f: impl FnOnce(&mut [&mut [f64]]) -> R,
) -> R {
    match scratch {
        [a] => f(&mut [a.as_mut_slice()]),
        [a, b] => f(&mut [a.as_mut_slice(), b.as_mut_slice()]),
        [a, b, c] => f(&mut [a.as_mut_slice(), b.as_mut_slice(), c.as_mut_slice()]),
        _ => {
            let mut parent_adjoints: Vec<&mut [f64]> =
                scratch.iter_mut().map(|s| s.as_mut_slice()).collect();
            f(&mut parent_adjoints)
        }
    }
}

/// The joint log density of a model in its unconstrained space.
///
/// Creating a `LogDensity` freezes the model. It keeps a shared borrow of
/// the model, so data can not be rebound while it is alive. Each chain
/// clones its own copy, because evaluation needs scratch space.
#[derive(Debug, Clone)]
pub struct LogDensity<'model> {
    model: &'model Model,
    evaluator: Evaluator<'model>,
    variables: Vec<VariableInfo>,
}

/// Name and shape of a variable that is stored in the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub(crate) index: usize,
}

impl VariableInfo {
    pub fn size(&self) -> usize {
        shape_size(&self.shape)
    }
}

impl<'model> LogDensity<'model> {
    pub fn new(model: &'model Model) -> Result<Self, DensityError> {
        model.freeze();
        let evaluator = Evaluator::new(model, &HashMap::new()).map_err(DensityError::Shape)?;

        for node in model.nodes() {
            if let NodeKind::Observed { spec, values } = node.kind() {
                check_param_sizes(node.name(), spec, &evaluator.shapes, values.len())
                    .map_err(DensityError::Shape)?;
            }
        }

        let variables = model
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                matches!(
                    node.kind(),
                    NodeKind::Free { .. } | NodeKind::Deterministic { .. }
                )
            })
            .map(|(index, node)| VariableInfo {
                name: node.name().to_string(),
                shape: evaluator.shapes[index].clone(),
                index,
            })
            .collect();

        Ok(Self {
            model,
            evaluator,
            variables,
        })
    }

    pub fn model(&self) -> &'model Model {
        self.model
    }

    /// Free and deterministic nodes, in the order `expand` returns them.
    pub fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    /// Constrained values of all free and deterministic nodes at `position`.
    pub fn expand(&mut self, position: &[f64]) -> Result<Vec<Vec<f64>>, DensityError> {
        if position.len() != self.evaluator.dim {
            return Err(DensityError::Dimension {
                expected: self.evaluator.dim,
                found: position.len(),
            });
        }
        self.evaluator.set_position(position);
        self.evaluator.forward();
        Ok(self
            .variables
            .iter()
            .map(|var| self.evaluator.values[var.index].clone())
            .collect())
    }

    /// Map constrained values of every free node to a position.
    pub fn unconstrain(&self, values: &HashMap<&str, Vec<f64>>) -> Result<Vec<f64>, ModelError> {
        let mut position = vec![0f64; self.evaluator.dim];
        for (index, node) in self.model.nodes().iter().enumerate() {
            let NodeKind::Free { transform, .. } = node.kind() else {
                continue;
            };
            let Some(offset) = self.evaluator.offsets[index] else {
                continue;
            };
            let size = self.evaluator.values[index].len();
            let Some(given) = values.get(node.name()) else {
                return Err(ModelError::UnknownNode(node.name().to_string()));
            };
            if given.len() != size {
                return Err(ModelError::ShapeMismatch {
                    name: node.name().to_string(),
                    reason: format!("expected {size} values, got {}", given.len()),
                });
            }
            position[offset..offset + size]
                .iter_mut()
                .zip(given)
                .for_each(|(u, &x)| *u = transform.forward(x));
        }
        Ok(position)
    }

    /// Offset and transform of a free node in the position vector.
    pub fn free_layout(&self, node: NodeRef) -> Option<(usize, usize, Transform)> {
        let NodeKind::Free { transform, .. } = self.model.get(node)?.kind() else {
            return None;
        };
        let offset = self.evaluator.offsets[node.index()]?;
        Some((offset, self.evaluator.values[node.index()].len(), *transform))
    }

    /// Fill `position` with a uniform jitter in `(-2, 2)`.
    pub fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) {
        position
            .iter_mut()
            .for_each(|x| *x = rng.random_range(-2f64..2f64));
    }
}

impl CpuLogpFunc for LogDensity<'_> {
    type LogpError = DensityError;

    fn dim(&self) -> usize {
        self.evaluator.dim
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, DensityError> {
        self.evaluator.logp(position, grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn check_gradient(density: &mut LogDensity, position: &[f64]) {
        let mut grad = vec![0f64; position.len()];
        density.logp(position, &mut grad).unwrap();

        let h = 1e-6;
        let mut scratch = vec![0f64; position.len()];
        for i in 0..position.len() {
            let mut plus = position.to_vec();
            plus[i] += h;
            let mut minus = position.to_vec();
            minus[i] -= h;
            let numeric = (density.logp(&plus, &mut scratch).unwrap()
                - density.logp(&minus, &mut scratch).unwrap())
                / (2. * h);
            assert!(
                (numeric - grad[i]).abs() < 1e-4 * (1. + numeric.abs()),
                "element {i}: {numeric} vs {}",
                grad[i]
            );
        }
    }

    fn regression_model() -> anyhow::Result<Model> {
        let mut model = Model::new();
        let x = model.add_data("x", vec![-1., 0., 0.5, 2.], vec![4])?;
        let intercept = model.add_free("intercept", DistSpec::normal(0., 10.), vec![])?;
        let slope = model.add_free("slope", DistSpec::normal(0., 10.), vec![])?;
        let sigma = model.add_free("sigma", DistSpec::half_normal(1.), vec![])?;
        let scaled = model.add_deterministic("scaled", Op::Mul, &[x, slope])?;
        let mu = model.add_deterministic("mu", Op::Add, &[scaled, intercept])?;
        model.add_observed("y", DistSpec::normal(mu, sigma), vec![-1., 2., 3., 7.])?;
        Ok(model)
    }

    #[test]
    fn standard_normal() -> anyhow::Result<()> {
        let mut model = Model::new();
        model.add_free("x", DistSpec::normal(0., 1.), vec![2])?;
        let mut density = LogDensity::new(&model)?;
        assert!(model.is_frozen());
        assert_eq!(density.dim(), 2);

        let mut grad = [0f64; 2];
        let logp = density.logp(&[1., -2.], &mut grad)?;
        let expected = -0.5 * (1. + 4.) - 2. * 0.5 * (2. * std::f64::consts::PI).ln();
        assert_relative_eq!(logp, expected, epsilon = 1e-12);
        assert_eq!(grad, [-1., 2.]);
        Ok(())
    }

    #[test]
    fn log_transform_jacobian() -> anyhow::Result<()> {
        let mut model = Model::new();
        model.add_free("sigma", DistSpec::half_normal(2.), vec![])?;
        let mut density = LogDensity::new(&model)?;

        let u = 0.3f64;
        let mut grad = [0f64];
        let logp = density.logp(&[u], &mut grad)?;
        let expected = Distribution::half_normal(2.)?.log_prob(u.exp()) + u;
        assert_relative_eq!(logp, expected, epsilon = 1e-12);
        check_gradient(&mut density, &[u]);
        Ok(())
    }

    #[test]
    fn regression_gradient() -> anyhow::Result<()> {
        let model = regression_model()?;
        let mut density = LogDensity::new(&model)?;
        check_gradient(&mut density, &[0.5, 1.5, -0.2]);
        check_gradient(&mut density, &[-2., 3., 0.7]);
        Ok(())
    }

    #[test]
    fn hierarchical_gradient() -> anyhow::Result<()> {
        let mut model = Model::new();
        let v = model.add_free("v", DistSpec::normal(0., 3.), vec![])?;
        let half = model.add_deterministic("half", Op::Scale(0.5), &[v])?;
        let scale = model.add_deterministic("scale", Op::Exp, &[half])?;
        let rate = model.add_free("rate", DistSpec::gamma(2., 1.), vec![])?;
        let x = model.add_free("x", DistSpec::normal(0., scale), vec![3])?;
        let total = model.add_deterministic("total", Op::Sum, &[x])?;
        model.add_observed("obs", DistSpec::normal(total, rate), vec![0.4])?;

        let mut density = LogDensity::new(&model)?;
        assert_eq!(density.dim(), 5);
        check_gradient(&mut density, &[0.3, -0.4, 0.1, 0.2, -0.5]);
        Ok(())
    }

    #[test]
    fn dot_product_gradient() -> anyhow::Result<()> {
        let mut model = Model::new();
        let design = model.add_data("design", vec![1., 0.5, -1., 2., 0.3, 0.], vec![3, 2])?;
        let coefs = model.add_free("coefs", DistSpec::normal(0., 2.), vec![2])?;
        let mu = model.add_deterministic("mu", Op::Dot, &[design, coefs])?;
        model.add_observed("y", DistSpec::normal(mu, 0.5), vec![0.2, 1.1, 0.4])?;
        let mut density = LogDensity::new(&model)?;
        check_gradient(&mut density, &[0.4, -0.8]);
        Ok(())
    }

    #[test]
    fn non_finite_is_recoverable() -> anyhow::Result<()> {
        let mut model = Model::new();
        let a = model.add_free("a", DistSpec::normal(0., 1.), vec![])?;
        model.add_observed("y", DistSpec::normal(0., a), vec![1.])?;
        let mut density = LogDensity::new(&model)?;

        let mut grad = [0f64];
        let err = density.logp(&[-1.], &mut grad).unwrap_err();
        assert!(err.is_recoverable());

        let err = density.logp(&[1., 2.], &mut [0f64; 2]).unwrap_err();
        assert!(!err.is_recoverable());
        Ok(())
    }

    #[test]
    fn node_valued_gamma_shape() -> anyhow::Result<()> {
        let mut model = Model::new();
        let alpha = model.add_free("alpha", DistSpec::normal(0., 2.), vec![])?;
        model.add_observed("y", DistSpec::gamma(alpha, 1.), vec![0.5, 1.5])?;
        let mut density = LogDensity::new(&model)?;

        let mut grad = [0f64];
        assert!(density.logp(&[2.], &mut grad)?.is_finite());
        let err = density.logp(&[-1.5], &mut grad).unwrap_err();
        assert!(matches!(err, DensityError::NonFinite { .. }));
        assert!(err.is_recoverable());
        Ok(())
    }

    /// `w0 * x0 + ... + wn * xn` over scalar parents `[w0, x0, w1, x1, ...]`.
    #[derive(Debug)]
    struct WeightedSum;

    impl crate::ops::DeterministicFn for WeightedSum {
        fn output_shape(&self, _parent_shapes: &[&[usize]]) -> Option<Vec<usize>> {
            Some(vec![])
        }

        fn forward(&self, parents: &[&[f64]], out: &mut [f64]) {
            out[0] = parents.chunks(2).map(|pair| pair[0][0] * pair[1][0]).sum();
        }

        fn backward(
            &self,
            parents: &[&[f64]],
            _output: &[f64],
            out_adjoint: &[f64],
            parent_adjoints: &mut [&mut [f64]],
        ) {
            for (i, adjoint) in parent_adjoints.iter_mut().enumerate() {
                adjoint[0] += out_adjoint[0] * parents[i ^ 1][0];
            }
        }
    }

    #[test]
    fn custom_op_arities() -> anyhow::Result<()> {
        for num_terms in 1..=3 {
            let mut model = Model::new();
            let mut parents = vec![];
            for term in 0..num_terms {
                let w = model.add_data(format!("w{term}"), vec![term as f64 + 0.5], vec![])?;
                let x = model.add_free(format!("x{term}"), DistSpec::normal(0., 1.), vec![])?;
                parents.extend([w, x]);
            }
            let func = std::sync::Arc::new(WeightedSum);
            let total = model.add_deterministic("total", Op::Custom(func), &parents)?;
            model.add_observed("y", DistSpec::normal(total, 0.7), vec![1.3])?;

            let mut density = LogDensity::new(&model)?;
            let position: Vec<f64> = (0..num_terms).map(|i| 0.3 - 0.4 * i as f64).collect();
            check_gradient(&mut density, &position);

            // Evaluating twice gives the same result
            let mut first = vec![0f64; num_terms];
            let mut second = vec![0f64; num_terms];
            let a = density.logp(&position, &mut first)?;
            let b = density.logp(&position, &mut second)?;
            assert_eq!(a, b);
            assert_eq!(first, second);
        }
        Ok(())
    }

    #[test]
    fn shape_errors_after_rebind() -> anyhow::Result<()> {
        let mut model = regression_model()?;
        model.rebind("x", vec![1., 2.], vec![2])?;
        let err = LogDensity::new(&model).unwrap_err();
        assert!(matches!(err, DensityError::Shape(_)));
        assert!(!err.is_recoverable());
        Ok(())
    }

    #[test]
    fn expand_and_unconstrain() -> anyhow::Result<()> {
        let model = regression_model()?;
        let mut density = LogDensity::new(&model)?;
        let names: Vec<&str> = density.variables().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["intercept", "slope", "sigma", "scaled", "mu"]);

        let values = density.expand(&[1., 2., 0.])?;
        assert_eq!(values[0], vec![1.]);
        assert_eq!(values[2], vec![1.]);
        assert_eq!(values[4], vec![-1., 1., 2., 5.]);

        let constrained = HashMap::from([
            ("intercept", vec![1.]),
            ("slope", vec![2.]),
            ("sigma", vec![1.]),
        ]);
        assert_eq!(density.unconstrain(&constrained)?, vec![1., 2., 0.]);

        let missing = HashMap::from([("intercept", vec![1.])]);
        assert!(matches!(
            density.unconstrain(&missing),
            Err(ModelError::UnknownNode(_))
        ));

        let sigma = model.node("sigma").unwrap();
        assert_eq!(density.free_layout(sigma), Some((2, 1, Transform::Log)));
        Ok(())
    }
}
