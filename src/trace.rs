//! Posterior draws of all chains and their sampler statistics.

use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayRef, BooleanBuilder, FixedSizeListBuilder, Float64Builder, PrimitiveBuilder,
        UInt64Builder,
    },
    datatypes::{DataType, Field, Float64Type, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};

use crate::{
    chain::{DrawStats, SamplingWarning},
    density::VariableInfo,
};

/// One iteration of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub chain: u64,
    /// Iteration index, counted separately for warmup and sampling.
    pub draw: u64,
    /// Constrained values of every traced variable, in the order of
    /// [`Trace::variables`].
    pub values: Vec<Vec<f64>>,
    pub stats: DrawStats,
}

impl Draw {
    pub fn diverging(&self) -> bool {
        self.stats.diverging
    }

    pub fn warning(&self) -> Option<SamplingWarning> {
        self.stats.warning
    }
}

/// Draws of a single chain.
#[derive(Debug, Clone, Default)]
pub struct ChainTrace {
    pub(crate) chain: u64,
    pub(crate) draws: Vec<Draw>,
    pub(crate) warmup: Vec<Draw>,
    pub(crate) finished: bool,
}

impl ChainTrace {
    pub(crate) fn new(chain: u64) -> Self {
        Self {
            chain,
            ..Default::default()
        }
    }

    pub(crate) fn push(&mut self, values: Vec<Vec<f64>>, stats: DrawStats, store_warmup: bool) {
        let target = if stats.tuning {
            if !store_warmup {
                return;
            }
            &mut self.warmup
        } else {
            &mut self.draws
        };
        let draw = target.len() as u64;
        target.push(Draw {
            chain: self.chain,
            draw,
            values,
            stats,
        });
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    /// Posterior draws after warmup.
    pub fn draws(&self) -> &[Draw] {
        &self.draws
    }

    /// Warmup draws, if they were stored.
    pub fn warmup(&self) -> &[Draw] {
        &self.warmup
    }

    /// Whether the chain ran all iterations, or was stopped early.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// The posterior draws of all chains, ordered by chain id.
#[derive(Debug, Clone)]
pub struct Trace {
    variables: Vec<VariableInfo>,
    chains: Vec<ChainTrace>,
}

impl Trace {
    pub(crate) fn new(variables: Vec<VariableInfo>, mut chains: Vec<ChainTrace>) -> Self {
        chains.sort_unstable_by_key(|chain| chain.chain);
        Self { variables, chains }
    }

    pub fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    pub fn var_names(&self) -> Vec<&str> {
        self.variables.iter().map(|var| var.name.as_str()).collect()
    }

    pub fn variable(&self, name: &str) -> Option<&VariableInfo> {
        self.variables.iter().find(|var| var.name == name)
    }

    fn var_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|var| var.name == name)
    }

    pub fn chains(&self) -> &[ChainTrace] {
        &self.chains
    }

    pub fn chain(&self, chain: u64) -> Option<&ChainTrace> {
        self.chains.iter().find(|trace| trace.chain == chain)
    }

    /// The values of a variable in every draw of one chain.
    pub fn chain_values(&self, name: &str, chain: u64) -> Option<Vec<&[f64]>> {
        let index = self.var_index(name)?;
        let chain = self.chain(chain)?;
        Some(
            chain
                .draws
                .iter()
                .map(|draw| draw.values[index].as_slice())
                .collect(),
        )
    }

    /// The values of a variable in every draw of all chains.
    pub fn pooled_values(&self, name: &str) -> Option<Vec<&[f64]>> {
        let index = self.var_index(name)?;
        Some(
            self.chains
                .iter()
                .flat_map(|chain| chain.draws.iter())
                .map(|draw| draw.values[index].as_slice())
                .collect(),
        )
    }

    /// Samples of one element of a variable, from one chain or pooled over
    /// all chains.
    pub fn element_samples(
        &self,
        name: &str,
        element: usize,
        chain: Option<u64>,
    ) -> Option<Vec<f64>> {
        let values = match chain {
            Some(chain) => self.chain_values(name, chain)?,
            None => self.pooled_values(name)?,
        };
        values
            .into_iter()
            .map(|value| value.get(element).copied())
            .collect()
    }

    /// Divergence flags of all posterior draws of a chain.
    pub fn divergences(&self, chain: u64) -> Option<Vec<bool>> {
        let chain = self.chain(chain)?;
        Some(chain.draws.iter().map(|draw| draw.diverging()).collect())
    }

    /// Number of diverging posterior draws over all chains.
    pub fn num_divergences(&self) -> usize {
        self.chains
            .iter()
            .flat_map(|chain| chain.draws.iter())
            .filter(|draw| draw.diverging())
            .count()
    }

    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    /// Number of posterior draws over all chains.
    pub fn num_draws(&self) -> usize {
        self.chains.iter().map(|chain| chain.draws.len()).sum()
    }

    /// Export the posterior draws in long form, with one row per draw.
    ///
    /// Scalar variables become `Float64` columns, all other variables
    /// `FixedSizeList<Float64>` columns of their flattened values.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        let num_rows = self.num_draws();
        let mut chain_builder = UInt64Builder::with_capacity(num_rows);
        let mut draw_builder = UInt64Builder::with_capacity(num_rows);
        let mut diverging_builder = BooleanBuilder::with_capacity(num_rows);

        for draw in self.chains.iter().flat_map(|chain| chain.draws.iter()) {
            chain_builder.append_value(draw.chain);
            draw_builder.append_value(draw.draw);
            diverging_builder.append_value(draw.diverging());
        }

        let mut fields = vec![
            Field::new("chain", DataType::UInt64, false),
            Field::new("draw", DataType::UInt64, false),
            Field::new("diverging", DataType::Boolean, false),
        ];
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(chain_builder.finish()),
            Arc::new(draw_builder.finish()),
            Arc::new(diverging_builder.finish()),
        ];

        for (index, var) in self.variables.iter().enumerate() {
            let draws = self.chains.iter().flat_map(|chain| chain.draws.iter());
            if var.shape.is_empty() {
                let mut builder = Float64Builder::with_capacity(num_rows);
                for draw in draws {
                    builder.append_value(draw.values[index][0]);
                }
                fields.push(Field::new(&var.name, DataType::Float64, false));
                columns.push(Arc::new(builder.finish()));
            } else {
                let size = var.size();
                let mut builder = FixedSizeListBuilder::with_capacity(
                    PrimitiveBuilder::<Float64Type>::with_capacity(num_rows * size),
                    size as i32,
                    num_rows,
                );
                for draw in draws {
                    builder.values().append_slice(&draw.values[index]);
                    builder.append(true);
                }
                let array = builder.finish();
                fields.push(Field::new(&var.name, array.data_type().clone(), false));
                columns.push(Arc::new(array));
            }
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::AsArray;
    use arrow::datatypes::UInt64Type;
    use pretty_assertions::assert_eq;

    fn stats(tuning: bool, diverging: bool) -> DrawStats {
        DrawStats {
            depth: 2,
            maxdepth_reached: false,
            index_in_trajectory: 1,
            n_steps: 3,
            step_size: 0.5,
            energy: 1.,
            energy_error: 0.1,
            logp: -1.,
            mean_tree_accept: 0.9,
            diverging,
            warning: None,
            tuning,
        }
    }

    fn variables() -> Vec<VariableInfo> {
        vec![
            VariableInfo {
                name: "mu".to_string(),
                shape: vec![],
                index: 0,
            },
            VariableInfo {
                name: "beta".to_string(),
                shape: vec![2],
                index: 1,
            },
        ]
    }

    fn example_trace() -> Trace {
        let mut chains = vec![];
        for chain in [1u64, 0] {
            let mut trace = ChainTrace::new(chain);
            trace.push(vec![vec![-5.], vec![0., 0.]], stats(true, true), false);
            for i in 0..3 {
                let x = (chain * 10 + i) as f64;
                trace.push(
                    vec![vec![x], vec![x, -x]],
                    stats(false, (chain == 1) & (i == 2)),
                    false,
                );
            }
            trace.finished = true;
            chains.push(trace);
        }
        Trace::new(variables(), chains)
    }

    #[test]
    fn queries() {
        let trace = example_trace();
        assert_eq!(trace.var_names(), vec!["mu", "beta"]);
        assert_eq!(trace.num_chains(), 2);
        assert_eq!(trace.num_draws(), 6);
        assert_eq!(trace.chains()[0].chain(), 0);
        assert!(trace.chains()[0].warmup().is_empty());

        let values = trace.chain_values("beta", 1).unwrap();
        assert_eq!(values, vec![&[10., -10.][..], &[11., -11.], &[12., -12.]]);
        assert_eq!(
            trace.element_samples("mu", 0, None).unwrap(),
            vec![0., 1., 2., 10., 11., 12.]
        );
        assert_eq!(
            trace.element_samples("beta", 1, Some(0)).unwrap(),
            vec![0., -1., -2.]
        );
        assert!(trace.element_samples("beta", 2, None).is_none());
        assert!(trace.pooled_values("sigma").is_none());
        assert!(trace.chain_values("mu", 5).is_none());

        assert_eq!(trace.divergences(1).unwrap(), vec![false, false, true]);
        assert_eq!(trace.num_divergences(), 1);
    }

    #[test]
    fn warmup_is_kept_on_request() {
        let mut trace = ChainTrace::new(0);
        trace.push(vec![vec![1.]], stats(true, false), true);
        trace.push(vec![vec![2.]], stats(false, false), true);
        assert_eq!(trace.warmup().len(), 1);
        assert_eq!(trace.draws().len(), 1);
        assert_eq!(trace.draws()[0].draw, 0);
    }

    #[test]
    fn record_batch() -> anyhow::Result<()> {
        let trace = example_trace();
        let batch = trace.to_record_batch()?;
        assert_eq!(batch.num_rows(), 6);
        assert_eq!(batch.num_columns(), 5);
        let schema = batch.schema();
        assert_eq!(schema.field(3).name(), "mu");
        assert_eq!(schema.field(3).data_type(), &DataType::Float64);

        let chains = batch.column(0).as_primitive::<UInt64Type>();
        assert_eq!(chains.values().to_vec(), vec![0, 0, 0, 1, 1, 1]);

        let beta = batch.column(4).as_fixed_size_list();
        assert_eq!(beta.value_length(), 2);
        let last = beta.value(5);
        let last = last.as_primitive::<Float64Type>();
        assert_eq!(last.values().to_vec(), vec![12., -12.]);
        assert_eq!(batch.column(2).as_boolean().true_count(), 1);
        Ok(())
    }
}
