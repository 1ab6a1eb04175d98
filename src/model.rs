//! The model graph.
//!
//! A [`Model`] is an append-only list of named nodes. Every node may only
//! refer to nodes that were registered before it, so the insertion order is
//! a topological order of the graph and evaluation never needs to sort.
//!
//! ```
//! use nuts_graph::{DistSpec, Model, Op};
//!
//! let mut model = Model::new();
//! let x = model.add_data("x", vec![0., 1., 2.], vec![3])?;
//! let slope = model.add_free("slope", DistSpec::normal(0., 10.), vec![])?;
//! let sigma = model.add_free("sigma", DistSpec::half_normal(1.), vec![])?;
//! let mu = model.add_deterministic("mu", Op::Mul, &[x, slope])?;
//! model.add_observed("y", DistSpec::normal(mu, sigma), vec![0.1, 0.9, 2.1])?;
//! assert_eq!(model.dim(), 2);
//! # Ok::<(), nuts_graph::ModelError>(())
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use thiserror::Error;

use crate::{
    distributions::{DistributionKind, Transform},
    math::shape_size,
    ops::Op,
};

static NEXT_MODEL_ID: AtomicUsize = AtomicUsize::new(0);

/// Errors raised while building a model or rebinding data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("A node named '{0}' already exists")]
    DuplicateName(String),
    #[error("Unknown node '{0}'")]
    UnknownNode(String),
    #[error("Shape mismatch for '{name}': {reason}")]
    ShapeMismatch { name: String, reason: String },
    #[error("Adding '{0}' would make the graph cyclic")]
    CyclicGraph(String),
    #[error("The model graph is frozen, no nodes can be added")]
    GraphFrozen,
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
}

/// A handle to a node of a specific model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub(crate) model: usize,
    pub(crate) index: usize,
}

impl NodeRef {
    /// Position of the node in the evaluation order of its model.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A distribution parameter: a constant or the value of another node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param {
    Const(f64),
    Node(NodeRef),
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Const(value)
    }
}

impl From<NodeRef> for Param {
    fn from(node: NodeRef) -> Self {
        Param::Node(node)
    }
}

/// A distribution whose parameters may depend on other nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct DistSpec {
    pub kind: DistributionKind,
    pub params: Vec<Param>,
}

impl DistSpec {
    pub fn normal(mu: impl Into<Param>, sigma: impl Into<Param>) -> Self {
        Self {
            kind: DistributionKind::Normal,
            params: vec![mu.into(), sigma.into()],
        }
    }

    pub fn half_normal(sigma: impl Into<Param>) -> Self {
        Self {
            kind: DistributionKind::HalfNormal,
            params: vec![sigma.into()],
        }
    }

    /// Gamma distribution with shape `alpha` and rate `beta`.
    pub fn gamma(alpha: impl Into<Param>, beta: impl Into<Param>) -> Self {
        Self {
            kind: DistributionKind::Gamma,
            params: vec![alpha.into(), beta.into()],
        }
    }

    pub(crate) fn parents(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.params.iter().filter_map(|param| match param {
            Param::Node(node) => Some(*node),
            Param::Const(_) => None,
        })
    }

    fn check_constants(&self) -> Result<(), ModelError> {
        if self.params.len() != self.kind.num_params() {
            return Err(ModelError::InvalidParameter {
                name: format!("{:?}", self.kind),
                reason: format!(
                    "expected {} parameters, got {}",
                    self.kind.num_params(),
                    self.params.len()
                ),
            });
        }
        for (param, name) in self.params.iter().zip(self.kind.param_names()) {
            let Param::Const(value) = *param else {
                continue;
            };
            let location = (self.kind == DistributionKind::Normal) & (*name == "mu");
            let valid = if location {
                value.is_finite()
            } else {
                value.is_finite() & (value > 0.)
            };
            if !valid {
                return Err(ModelError::InvalidParameter {
                    name: name.to_string(),
                    reason: format!("got {value}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A latent variable, sampled in the unconstrained space of `transform`.
    Free {
        spec: DistSpec,
        shape: Vec<usize>,
        transform: Transform,
    },
    /// A likelihood term with fixed observations.
    Observed { spec: DistSpec, values: Box<[f64]> },
    /// A pure function of its parents.
    Deterministic {
        op: Op,
        parents: Vec<NodeRef>,
        shape: Vec<usize>,
    },
    /// An input array that can be replaced with [`Model::rebind`].
    Data { values: Box<[f64]>, shape: Vec<usize> },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Shape of the node when it was registered, or after the last rebind
    /// for data nodes.
    pub fn shape(&self) -> Vec<usize> {
        match &self.kind {
            NodeKind::Free { shape, .. }
            | NodeKind::Deterministic { shape, .. }
            | NodeKind::Data { shape, .. } => shape.clone(),
            NodeKind::Observed { values, .. } => vec![values.len()],
        }
    }

    pub(crate) fn parents(&self) -> Vec<NodeRef> {
        match &self.kind {
            NodeKind::Free { spec, .. } | NodeKind::Observed { spec, .. } => {
                spec.parents().collect()
            }
            NodeKind::Deterministic { parents, .. } => parents.clone(),
            NodeKind::Data { .. } => vec![],
        }
    }
}

/// A directed acyclic graph of named nodes.
#[derive(Debug)]
pub struct Model {
    id: usize,
    nodes: Vec<Node>,
    names: HashMap<String, usize>,
    frozen: AtomicBool,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            names: HashMap::new(),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register a latent variable.
    ///
    /// Node valued parameters must have size one or the size of `shape`.
    pub fn add_free(
        &mut self,
        name: impl Into<String>,
        spec: DistSpec,
        shape: Vec<usize>,
    ) -> Result<NodeRef, ModelError> {
        let name = name.into();
        self.check_new_node(&name, spec.parents())?;
        spec.check_constants()?;
        let size = shape_size(&shape);
        for param in spec.parents() {
            let param_size = shape_size(&self.nodes[param.index].shape());
            if (param_size != 1) & (param_size != size) {
                return Err(ModelError::ShapeMismatch {
                    name,
                    reason: format!(
                        "parameter '{}' has size {param_size}, the variable has size {size}",
                        self.nodes[param.index].name
                    ),
                });
            }
        }
        let transform = spec.kind.default_transform();
        Ok(self.push(
            name,
            NodeKind::Free {
                spec,
                shape,
                transform,
            },
        ))
    }

    /// Register a likelihood term.
    ///
    /// If any parameter has a size larger than one, the number of
    /// observations must match it.
    pub fn add_observed(
        &mut self,
        name: impl Into<String>,
        spec: DistSpec,
        values: Vec<f64>,
    ) -> Result<NodeRef, ModelError> {
        let name = name.into();
        self.check_new_node(&name, spec.parents())?;
        spec.check_constants()?;
        for param in spec.parents() {
            let param_size = shape_size(&self.nodes[param.index].shape());
            if (param_size != 1) & (param_size != values.len()) {
                return Err(ModelError::ShapeMismatch {
                    name,
                    reason: format!(
                        "parameter '{}' has size {param_size}, but there are {} observations",
                        self.nodes[param.index].name,
                        values.len()
                    ),
                });
            }
        }
        Ok(self.push(
            name,
            NodeKind::Observed {
                spec,
                values: values.into(),
            },
        ))
    }

    /// Register a deterministic function of existing nodes.
    pub fn add_deterministic(
        &mut self,
        name: impl Into<String>,
        op: Op,
        parents: &[NodeRef],
    ) -> Result<NodeRef, ModelError> {
        let name = name.into();
        self.check_new_node(&name, parents.iter().copied())?;
        if let Some(arity) = op.arity() {
            if arity != parents.len() {
                return Err(ModelError::InvalidParameter {
                    name: op.name().to_string(),
                    reason: format!("expected {arity} parents, got {}", parents.len()),
                });
            }
        }
        let parent_shapes: Vec<Vec<usize>> = parents
            .iter()
            .map(|parent| self.nodes[parent.index].shape())
            .collect();
        let parent_shapes: Vec<&[usize]> = parent_shapes.iter().map(|s| s.as_slice()).collect();
        let Some(shape) = op.output_shape(&parent_shapes) else {
            return Err(ModelError::ShapeMismatch {
                name,
                reason: format!(
                    "incompatible parent shapes {parent_shapes:?} for {}",
                    op.name()
                ),
            });
        };
        Ok(self.push(
            name,
            NodeKind::Deterministic {
                op,
                parents: parents.to_vec(),
                shape,
            },
        ))
    }

    /// Register a rebindable input array.
    pub fn add_data(
        &mut self,
        name: impl Into<String>,
        values: Vec<f64>,
        shape: Vec<usize>,
    ) -> Result<NodeRef, ModelError> {
        let name = name.into();
        self.check_new_node(&name, std::iter::empty())?;
        check_data_size(&name, &values, &shape)?;
        Ok(self.push(
            name,
            NodeKind::Data {
                values: values.into(),
                shape,
            },
        ))
    }

    /// Replace the values of a data node.
    ///
    /// The new array must have the same number of dimensions, but the
    /// lengths may differ. Shapes of dependent nodes are checked again
    /// when a log density or a prediction is built from the model.
    pub fn rebind(
        &mut self,
        name: &str,
        values: Vec<f64>,
        shape: Vec<usize>,
    ) -> Result<(), ModelError> {
        let index = self.data_index(name)?;
        self.check_rebind(index, &values, &shape)?;
        self.nodes[index].kind = NodeKind::Data {
            values: values.into(),
            shape,
        };
        Ok(())
    }

    pub(crate) fn data_index(&self, name: &str) -> Result<usize, ModelError> {
        match self.names.get(name) {
            Some(&index) if matches!(self.nodes[index].kind, NodeKind::Data { .. }) => Ok(index),
            _ => Err(ModelError::UnknownNode(name.to_string())),
        }
    }

    pub(crate) fn check_rebind(
        &self,
        index: usize,
        values: &[f64],
        shape: &[usize],
    ) -> Result<(), ModelError> {
        let node = &self.nodes[index];
        let NodeKind::Data { shape: old, .. } = &node.kind else {
            return Err(ModelError::UnknownNode(node.name.clone()));
        };
        if old.len() != shape.len() {
            return Err(ModelError::ShapeMismatch {
                name: node.name.clone(),
                reason: format!(
                    "expected an array with {} dimensions, got {}",
                    old.len(),
                    shape.len()
                ),
            });
        }
        check_data_size(&node.name, values, shape)
    }

    /// Disallow adding further nodes. Rebinding data stays possible.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn node(&self, name: &str) -> Option<NodeRef> {
        self.names.get(name).map(|&index| NodeRef {
            model: self.id,
            index,
        })
    }

    pub fn node_name(&self, node: NodeRef) -> Option<&str> {
        self.get(node).map(|node| node.name())
    }

    pub fn get(&self, node: NodeRef) -> Option<&Node> {
        if node.model != self.id {
            return None;
        }
        self.nodes.get(node.index)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn free_nodes(&self) -> Vec<NodeRef> {
        self.refs_where(|kind| matches!(kind, NodeKind::Free { .. }))
    }

    pub fn deterministic_nodes(&self) -> Vec<NodeRef> {
        self.refs_where(|kind| matches!(kind, NodeKind::Deterministic { .. }))
    }

    pub fn observed_nodes(&self) -> Vec<NodeRef> {
        self.refs_where(|kind| matches!(kind, NodeKind::Observed { .. }))
    }

    pub fn data_value(&self, name: &str) -> Option<&[f64]> {
        let index = self.data_index(name).ok()?;
        match &self.nodes[index].kind {
            NodeKind::Data { values, .. } => Some(values),
            _ => None,
        }
    }

    /// All nodes `node` depends on, directly or indirectly, in evaluation
    /// order.
    pub fn ancestors(&self, node: NodeRef) -> Vec<NodeRef> {
        let mut seen = BTreeSet::new();
        if let Some(node) = self.get(node) {
            let mut stack = node.parents();
            while let Some(parent) = stack.pop() {
                if seen.insert(parent.index) {
                    stack.extend(self.nodes[parent.index].parents());
                }
            }
        }
        seen.into_iter()
            .map(|index| NodeRef {
                model: self.id,
                index,
            })
            .collect()
    }

    /// Dimension of the unconstrained parameter space.
    pub fn dim(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match &node.kind {
                NodeKind::Free { shape, .. } => shape_size(shape),
                _ => 0,
            })
            .sum()
    }

    /// Shapes of all nodes, given the shapes of the data nodes.
    ///
    /// Data shapes that are not listed in `data_shapes` are taken from the
    /// model. Fails if a deterministic node or a distribution parameter does
    /// not fit the new shapes.
    pub(crate) fn resolve_shapes(
        &self,
        data_shapes: &HashMap<usize, Vec<usize>>,
    ) -> Result<Vec<Vec<usize>>, ModelError> {
        let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            let shape = match &node.kind {
                NodeKind::Data { shape, .. } => {
                    data_shapes.get(&index).cloned().unwrap_or_else(|| shape.clone())
                }
                NodeKind::Free { spec, shape, .. } => {
                    check_param_sizes(&node.name, spec, &shapes, shape_size(shape))?;
                    shape.clone()
                }
                NodeKind::Observed { .. } => node.shape(),
                NodeKind::Deterministic { op, parents, .. } => {
                    let parent_shapes: Vec<&[usize]> = parents
                        .iter()
                        .map(|parent| shapes[parent.index].as_slice())
                        .collect();
                    op.output_shape(&parent_shapes).ok_or_else(|| {
                        ModelError::ShapeMismatch {
                            name: node.name.clone(),
                            reason: format!(
                                "incompatible parent shapes {parent_shapes:?} for {}",
                                op.name()
                            ),
                        }
                    })?
                }
            };
            shapes.push(shape);
        }
        Ok(shapes)
    }

    fn refs_where(&self, pred: impl Fn(&NodeKind) -> bool) -> Vec<NodeRef> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| pred(&node.kind))
            .map(|(index, _)| NodeRef {
                model: self.id,
                index,
            })
            .collect()
    }

    fn check_new_node(
        &self,
        name: &str,
        parents: impl Iterator<Item = NodeRef>,
    ) -> Result<(), ModelError> {
        if self.is_frozen() {
            return Err(ModelError::GraphFrozen);
        }
        if self.names.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        let new_index = self.nodes.len();
        for parent in parents {
            if parent.model != self.id {
                return Err(ModelError::UnknownNode(format!("{parent:?}")));
            }
            if parent.index == new_index {
                return Err(ModelError::CyclicGraph(name.to_string()));
            }
            if parent.index > new_index {
                return Err(ModelError::UnknownNode(format!("{parent:?}")));
            }
            if self.ancestors(parent).iter().any(|a| a.index == new_index) {
                return Err(ModelError::CyclicGraph(name.to_string()));
            }
        }
        Ok(())
    }

    fn push(&mut self, name: String, kind: NodeKind) -> NodeRef {
        let index = self.nodes.len();
        self.names.insert(name.clone(), index);
        self.nodes.push(Node { name, kind });
        NodeRef {
            model: self.id,
            index,
        }
    }
}

fn check_data_size(name: &str, values: &[f64], shape: &[usize]) -> Result<(), ModelError> {
    if values.len() != shape_size(shape) {
        return Err(ModelError::ShapeMismatch {
            name: name.to_string(),
            reason: format!(
                "{} values do not fit the shape {shape:?}",
                values.len()
            ),
        });
    }
    Ok(())
}

pub(crate) fn check_param_sizes(
    name: &str,
    spec: &DistSpec,
    shapes: &[Vec<usize>],
    size: usize,
) -> Result<(), ModelError> {
    for param in spec.parents() {
        let param_size = shape_size(&shapes[param.index]);
        if (param_size != 1) & (param_size != size) {
            return Err(ModelError::ShapeMismatch {
                name: name.to_string(),
                reason: format!("a parameter has size {param_size}, expected 1 or {size}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn regression() -> Result<Model, ModelError> {
        let mut model = Model::new();
        let x = model.add_data("x", vec![0., 1., 2.], vec![3])?;
        let intercept = model.add_free("intercept", DistSpec::normal(0., 10.), vec![])?;
        let slope = model.add_free("slope", DistSpec::normal(0., 10.), vec![])?;
        let sigma = model.add_free("sigma", DistSpec::half_normal(1.), vec![])?;
        let scaled = model.add_deterministic("scaled", Op::Mul, &[x, slope])?;
        let mu = model.add_deterministic("mu", Op::Add, &[scaled, intercept])?;
        model.add_observed("y", DistSpec::normal(mu, sigma), vec![1., 2., 3.])?;
        Ok(model)
    }

    #[test]
    fn build_and_lookup() -> Result<(), ModelError> {
        let model = regression()?;
        assert_eq!(model.dim(), 3);
        assert_eq!(model.free_nodes().len(), 3);
        assert_eq!(model.deterministic_nodes().len(), 2);
        assert_eq!(model.observed_nodes().len(), 1);

        let mu = model.node("mu").unwrap();
        assert_eq!(model.node_name(mu), Some("mu"));
        assert_eq!(model.get(mu).unwrap().shape(), vec![3]);
        let names: Vec<&str> = model
            .ancestors(mu)
            .into_iter()
            .map(|node| model.node_name(node).unwrap())
            .collect();
        assert_eq!(names, vec!["x", "intercept", "slope", "scaled"]);
        assert_eq!(model.data_value("x"), Some(&[0., 1., 2.][..]));
        assert_eq!(model.data_value("mu"), None);
        Ok(())
    }

    #[test]
    fn transforms_follow_support() -> Result<(), ModelError> {
        let model = regression()?;
        let sigma = model.get(model.node("sigma").unwrap()).unwrap();
        match sigma.kind() {
            NodeKind::Free { transform, .. } => assert_eq!(*transform, Transform::Log),
            other => panic!("unexpected node {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn duplicate_names() -> Result<(), ModelError> {
        let mut model = regression()?;
        let err = model.add_free("slope", DistSpec::normal(0., 1.), vec![]);
        assert_eq!(err, Err(ModelError::DuplicateName("slope".to_string())));
        Ok(())
    }

    #[test]
    fn frozen_graph() -> Result<(), ModelError> {
        let mut model = regression()?;
        let x = model.node("x").unwrap();
        model.freeze();
        assert!(model.is_frozen());
        assert_eq!(
            model.add_free("z", DistSpec::normal(0., 1.), vec![]),
            Err(ModelError::GraphFrozen)
        );
        assert_eq!(
            model.add_observed("w", DistSpec::normal(0., 1.), vec![1.]),
            Err(ModelError::GraphFrozen)
        );
        assert_eq!(
            model.add_deterministic("e", Op::Exp, &[x]),
            Err(ModelError::GraphFrozen)
        );
        assert_eq!(
            model.add_data("d", vec![1.], vec![1]),
            Err(ModelError::GraphFrozen)
        );
        model.rebind("x", vec![1., 2.], vec![2])?;
        assert_eq!(model.data_value("x"), Some(&[1., 2.][..]));
        Ok(())
    }

    #[test]
    fn shape_checks() -> Result<(), ModelError> {
        let mut model = Model::new();
        let loc = model.add_free("loc", DistSpec::normal(0., 1.), vec![4])?;
        assert!(matches!(
            model.add_free("z", DistSpec::normal(loc, 1.), vec![3]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            model.add_observed("y", DistSpec::normal(loc, 1.), vec![1., 2.]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        let other = model.add_data("a", vec![1., 2., 3.], vec![3])?;
        assert!(matches!(
            model.add_deterministic("sum", Op::Add, &[loc, other]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            model.add_data("bad", vec![1., 2.], vec![3]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn invalid_parameters() {
        let mut model = Model::new();
        assert!(matches!(
            model.add_free("a", DistSpec::normal(0., -1.), vec![]),
            Err(ModelError::InvalidParameter { .. })
        ));
        assert!(matches!(
            model.add_free("b", DistSpec::gamma(0., 1.), vec![]),
            Err(ModelError::InvalidParameter { .. })
        ));
        let spec = DistSpec {
            kind: DistributionKind::HalfNormal,
            params: vec![],
        };
        assert!(matches!(
            model.add_free("c", spec, vec![]),
            Err(ModelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn op_arity() -> Result<(), ModelError> {
        let mut model = Model::new();
        let a = model.add_free("a", DistSpec::normal(0., 1.), vec![])?;
        assert!(matches!(
            model.add_deterministic("e", Op::Exp, &[a, a]),
            Err(ModelError::InvalidParameter { .. })
        ));
        Ok(())
    }

    #[test]
    fn foreign_and_cyclic_references() -> Result<(), ModelError> {
        let mut other = Model::new();
        let foreign = other.add_free("a", DistSpec::normal(0., 1.), vec![])?;

        let mut model = Model::new();
        let a = model.add_free("a", DistSpec::normal(0., 1.), vec![])?;
        assert!(matches!(
            model.add_deterministic("e", Op::Exp, &[foreign]),
            Err(ModelError::UnknownNode(_))
        ));

        let itself = NodeRef {
            model: a.model,
            index: 1,
        };
        assert_eq!(
            model.add_deterministic("e", Op::Add, &[a, itself]),
            Err(ModelError::CyclicGraph("e".to_string()))
        );
        let later = NodeRef {
            model: a.model,
            index: 5,
        };
        assert!(matches!(
            model.add_deterministic("e", Op::Exp, &[later]),
            Err(ModelError::UnknownNode(_))
        ));
        Ok(())
    }

    #[test]
    fn rebind_rules() -> Result<(), ModelError> {
        let mut model = regression()?;
        assert_eq!(
            model.rebind("slope", vec![1.], vec![]),
            Err(ModelError::UnknownNode("slope".to_string()))
        );
        assert_eq!(
            model.rebind("missing", vec![1.], vec![1]),
            Err(ModelError::UnknownNode("missing".to_string()))
        );
        assert!(matches!(
            model.rebind("x", vec![1., 2.], vec![1, 2]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        model.rebind("x", vec![5.; 10], vec![10])?;

        let mut data_shapes = HashMap::new();
        let shapes = model.resolve_shapes(&data_shapes)?;
        let mu = model.node("mu").unwrap();
        assert_eq!(shapes[mu.index()], vec![10]);

        let x = model.node("x").unwrap();
        data_shapes.insert(x.index(), vec![4]);
        let shapes = model.resolve_shapes(&data_shapes)?;
        assert_eq!(shapes[mu.index()], vec![4]);
        Ok(())
    }
}
