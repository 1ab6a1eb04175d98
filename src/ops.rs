//! Deterministic operations between nodes.
//!
//! Each operation knows how to compute its value from the values of its
//! parents (`forward`) and how to pull an adjoint of its output back to its
//! parents (`backward`, a vector-Jacobian product). The log-density
//! evaluator runs `backward` in reverse topological order to accumulate the
//! gradient.
//!
//! Elementwise operations broadcast operands of length one.

use std::{fmt::Debug, sync::Arc};

use crate::math::{bcast, broadcast_len};

/// A user defined deterministic function.
///
/// Implementations must be pure: the output may only depend on the parent
/// values passed in.
pub trait DeterministicFn: Debug + Send + Sync {
    /// Shape of the output given the shapes of the parents, or `None` if the
    /// parents are incompatible.
    fn output_shape(&self, parent_shapes: &[&[usize]]) -> Option<Vec<usize>>;

    /// Compute the output values. `out` has the size of `output_shape`.
    fn forward(&self, parents: &[&[f64]], out: &mut [f64]);

    /// Add the vector-Jacobian product of `out_adjoint` to each entry of
    /// `parent_adjoints`.
    fn backward(
        &self,
        parents: &[&[f64]],
        output: &[f64],
        out_adjoint: &[f64],
        parent_adjoints: &mut [&mut [f64]],
    );
}

#[derive(Debug, Clone)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Exp,
    Log,
    /// Multiply by a constant.
    Scale(f64),
    /// Add a constant.
    Shift(f64),
    /// Sum of all elements.
    Sum,
    /// Product of a row-major `[n, k]` matrix with a `[k]` vector.
    Dot,
    Custom(Arc<dyn DeterministicFn>),
}

impl Op {
    /// Number of parents the operation expects, `None` for custom functions.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Dot => Some(2),
            Op::Exp | Op::Log | Op::Scale(_) | Op::Shift(_) | Op::Sum => Some(1),
            Op::Custom(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Scale(_) => "scale",
            Op::Shift(_) => "shift",
            Op::Sum => "sum",
            Op::Dot => "dot",
            Op::Custom(_) => "custom",
        }
    }

    /// Shape of the result, or `None` if the parent shapes are incompatible.
    pub fn output_shape(&self, parent_shapes: &[&[usize]]) -> Option<Vec<usize>> {
        if let Some(arity) = self.arity() {
            if parent_shapes.len() != arity {
                return None;
            }
        }
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let (a, b) = (parent_shapes[0], parent_shapes[1]);
                let size_a: usize = a.iter().product();
                let size_b: usize = b.iter().product();
                broadcast_len(size_a, size_b)?;
                if size_a >= size_b {
                    Some(a.to_vec())
                } else {
                    Some(b.to_vec())
                }
            }
            Op::Exp | Op::Log | Op::Scale(_) | Op::Shift(_) => Some(parent_shapes[0].to_vec()),
            Op::Sum => Some(vec![]),
            Op::Dot => {
                let (matrix, vector) = (parent_shapes[0], parent_shapes[1]);
                let k: usize = vector.iter().product();
                if k == 0 {
                    return None;
                }
                match matrix {
                    [n, cols] if *cols == k => Some(vec![*n]),
                    [cols] if *cols == k => Some(vec![]),
                    _ => None,
                }
            }
            Op::Custom(func) => func.output_shape(parent_shapes),
        }
    }

    pub(crate) fn forward(&self, parents: &[&[f64]], out: &mut [f64]) {
        match self {
            Op::Add => binary(parents, out, |a, b| a + b),
            Op::Sub => binary(parents, out, |a, b| a - b),
            Op::Mul => binary(parents, out, |a, b| a * b),
            Op::Div => binary(parents, out, |a, b| a / b),
            Op::Exp => unary(parents, out, f64::exp),
            Op::Log => unary(parents, out, f64::ln),
            Op::Scale(c) => unary(parents, out, |x| c * x),
            Op::Shift(c) => unary(parents, out, |x| x + c),
            Op::Sum => out[0] = parents[0].iter().sum(),
            Op::Dot => {
                let (matrix, coefs) = (parents[0], parents[1]);
                let k = coefs.len();
                out.iter_mut()
                    .zip(matrix.chunks_exact(k))
                    .for_each(|(out, row)| {
                        *out = row.iter().zip(coefs).map(|(x, c)| x * c).sum();
                    });
            }
            Op::Custom(func) => func.forward(parents, out),
        }
    }

    pub(crate) fn backward(
        &self,
        parents: &[&[f64]],
        output: &[f64],
        out_adjoint: &[f64],
        parent_adjoints: &mut [&mut [f64]],
    ) {
        match self {
            Op::Add => binary_backward(parents, out_adjoint, parent_adjoints, |_, _| (1., 1.)),
            Op::Sub => binary_backward(parents, out_adjoint, parent_adjoints, |_, _| (1., -1.)),
            Op::Mul => binary_backward(parents, out_adjoint, parent_adjoints, |a, b| (b, a)),
            Op::Div => binary_backward(parents, out_adjoint, parent_adjoints, |a, b| {
                (b.recip(), -a / (b * b))
            }),
            Op::Exp => {
                let adj = &mut *parent_adjoints[0];
                adj.iter_mut()
                    .zip(output.iter().zip(out_adjoint))
                    .for_each(|(adj, (y, g))| *adj += g * y);
            }
            Op::Log => {
                let adj = &mut *parent_adjoints[0];
                adj.iter_mut()
                    .zip(parents[0].iter().zip(out_adjoint))
                    .for_each(|(adj, (x, g))| *adj += g / x);
            }
            Op::Scale(c) => {
                let adj = &mut *parent_adjoints[0];
                adj.iter_mut()
                    .zip(out_adjoint)
                    .for_each(|(adj, g)| *adj += c * g);
            }
            Op::Shift(_) => {
                let adj = &mut *parent_adjoints[0];
                adj.iter_mut()
                    .zip(out_adjoint)
                    .for_each(|(adj, g)| *adj += g);
            }
            Op::Sum => {
                let g = out_adjoint[0];
                parent_adjoints[0].iter_mut().for_each(|adj| *adj += g);
            }
            Op::Dot => {
                let (matrix, coefs) = (parents[0], parents[1]);
                let k = coefs.len();
                let (matrix_adj, rest) = parent_adjoints.split_at_mut(1);
                let matrix_adj = &mut *matrix_adj[0];
                let coef_adj = &mut *rest[0];
                for (i, (row, g)) in matrix.chunks_exact(k).zip(out_adjoint).enumerate() {
                    let row_adj = &mut matrix_adj[i * k..(i + 1) * k];
                    for j in 0..k {
                        coef_adj[j] += g * row[j];
                        row_adj[j] += g * coefs[j];
                    }
                }
            }
            Op::Custom(func) => func.backward(parents, output, out_adjoint, parent_adjoints),
        }
    }
}

fn unary(parents: &[&[f64]], out: &mut [f64], func: impl Fn(f64) -> f64) {
    out.iter_mut()
        .zip(parents[0])
        .for_each(|(out, &x)| *out = func(x));
}

fn binary(parents: &[&[f64]], out: &mut [f64], func: impl Fn(f64, f64) -> f64) {
    let (a, b) = (parents[0], parents[1]);
    out.iter_mut()
        .enumerate()
        .for_each(|(i, out)| *out = func(bcast(a, i), bcast(b, i)));
}

/// `partials(a, b)` returns the derivatives of the output element with
/// respect to `a` and `b`. Broadcast operands receive the sum over all
/// output elements.
fn binary_backward(
    parents: &[&[f64]],
    out_adjoint: &[f64],
    parent_adjoints: &mut [&mut [f64]],
    partials: impl Fn(f64, f64) -> (f64, f64),
) {
    let (a, b) = (parents[0], parents[1]);
    let (adj_a, rest) = parent_adjoints.split_at_mut(1);
    let adj_a = &mut *adj_a[0];
    let adj_b = &mut *rest[0];
    for (i, g) in out_adjoint.iter().enumerate() {
        let (da, db) = partials(bcast(a, i), bcast(b, i));
        if adj_a.len() == 1 {
            adj_a[0] += g * da;
        } else {
            adj_a[i] += g * da;
        }
        if adj_b.len() == 1 {
            adj_b[0] += g * db;
        } else {
            adj_b[i] += g * db;
        }
    }
}
