//! Posterior summaries and convergence diagnostics.
//!
//! R-hat and the bulk effective sample size follow Vehtari et al. (2021),
//! "Rank-normalization, folding, and localization: An improved R-hat for
//! assessing convergence of MCMC".

use statrs::distribution::{ContinuousCDF, Normal};

use crate::trace::{ChainTrace, Trace};

/// Summary of one element of a traced variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSummary {
    /// Display name, with the flat element index for array variables.
    pub name: String,
    pub variable: String,
    pub element: usize,
    pub mean: f64,
    pub sd: f64,
    pub hdi_lower: f64,
    pub hdi_upper: f64,
    pub ess_bulk: f64,
    pub r_hat: f64,
}

/// Summary of all traced variables.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsReport {
    pub params: Vec<ParamSummary>,
    pub hdi_prob: f64,
    pub num_chains: usize,
    /// Number of posterior draws over all chains.
    pub num_draws: usize,
    /// Mean acceptance statistic of the posterior draws of each chain.
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

impl DiagnosticsReport {
    pub fn param(&self, name: &str) -> Option<&ParamSummary> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let lower = ((1. - self.hdi_prob) * 500.).round() / 10.;
        let upper = 100. - lower;

        let mut lines = Vec::new();
        lines.push(format!(
            "{} chains, {} draws",
            self.num_chains, self.num_draws
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<16} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}",
            "Parameter",
            "mean",
            "sd",
            format!("hdi_{lower}%"),
            format!("hdi_{upper}%"),
            "ess_bulk",
            "r_hat"
        ));
        lines.push("─".repeat(80));

        for p in &self.params {
            let ess = if p.ess_bulk.is_finite() {
                format!("{:.0}", p.ess_bulk)
            } else {
                "NaN".to_string()
            };
            lines.push(format!(
                "{:<16} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10} {:>8.4}",
                p.name, p.mean, p.sd, p.hdi_lower, p.hdi_upper, ess, p.r_hat,
            ));
        }

        lines.push("─".repeat(80));

        let avg_accept = mean(&self.accept_rates);
        lines.push(format!(
            "Mean accept rate: {:.2}  │  Divergences: {}",
            avg_accept, self.divergences
        ));

        if self
            .params
            .iter()
            .any(|p| p.r_hat > 1.01 || !p.r_hat.is_finite())
        {
            lines.push("Some R-hat values are above 1.01, the chains may not have converged.".to_string());
        }
        if self.params.iter().any(|p| p.ess_bulk < 400.0) {
            lines.push("Some ESS values are below 400, consider more draws.".to_string());
        }
        if self.divergences > 0 {
            lines.push(format!(
                "{} divergent transitions, results may be biased.",
                self.divergences
            ));
        }

        lines.join("\n")
    }
}

/// The narrowest interval that contains a fraction `prob` of the samples.
///
/// Returns `None` for an empty sample, or if `prob` is not in `(0, 1]`.
pub fn highest_density_interval(samples: &[f64], prob: f64) -> Option<(f64, f64)> {
    if samples.is_empty() || !(prob > 0. && prob <= 1.) {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    let n = sorted.len();
    let window = ((prob * n as f64).ceil() as usize).clamp(1, n);
    let (start, _) = (0..=(n - window))
        .map(|i| (i, sorted[i + window - 1] - sorted[i]))
        .min_by(|a, b| a.1.total_cmp(&b.1))?;
    Some((sorted[start], sorted[start + window - 1]))
}

/// Summarize all variables over the pooled posterior draws.
pub fn summarize(trace: &Trace, hdi_prob: f64) -> DiagnosticsReport {
    report(trace, trace.chains(), hdi_prob)
}

/// Summarize all variables over the posterior draws of a single chain.
pub fn summarize_chain(trace: &Trace, chain: u64, hdi_prob: f64) -> Option<DiagnosticsReport> {
    let chain = trace.chain(chain)?;
    Some(report(trace, std::slice::from_ref(chain), hdi_prob))
}

fn report(trace: &Trace, chains: &[ChainTrace], hdi_prob: f64) -> DiagnosticsReport {
    let mut params = Vec::new();
    for (index, var) in trace.variables().iter().enumerate() {
        for element in 0..var.size() {
            let samples: Vec<Vec<f64>> = chains
                .iter()
                .map(|chain| {
                    chain
                        .draws()
                        .iter()
                        .map(|draw| draw.values[index][element])
                        .collect()
                })
                .collect();
            let name = if var.shape.is_empty() {
                var.name.clone()
            } else {
                format!("{}[{}]", var.name, element)
            };
            params.push(summarize_samples(name, &var.name, element, &samples, hdi_prob));
        }
    }

    let accept_rates = chains
        .iter()
        .map(|chain| {
            let rates: Vec<f64> = chain
                .draws()
                .iter()
                .map(|draw| draw.stats.mean_tree_accept)
                .collect();
            mean(&rates)
        })
        .collect();

    DiagnosticsReport {
        params,
        hdi_prob,
        num_chains: chains.len(),
        num_draws: chains.iter().map(|chain| chain.draws().len()).sum(),
        accept_rates,
        divergences: chains
            .iter()
            .flat_map(|chain| chain.draws())
            .filter(|draw| draw.diverging())
            .count(),
    }
}

fn summarize_samples(
    name: String,
    variable: &str,
    element: usize,
    chains: &[Vec<f64>],
    hdi_prob: f64,
) -> ParamSummary {
    let all: Vec<f64> = chains.iter().flatten().copied().collect();
    let mean = mean(&all);
    let (hdi_lower, hdi_upper) =
        highest_density_interval(&all, hdi_prob).unwrap_or((f64::NAN, f64::NAN));
    ParamSummary {
        name,
        variable: variable.to_string(),
        element,
        mean,
        sd: sd(&all, mean),
        hdi_lower,
        hdi_upper,
        ess_bulk: ess_bulk(chains),
        r_hat: r_hat(chains),
    }
}

/// Split R-hat: split each chain in half, treat as 2M chains, compute R-hat.
///
/// Returns NaN if a chain has fewer than four draws, or the samples are
/// constant or contain non-finite values.
pub fn r_hat(chains: &[Vec<f64>]) -> f64 {
    let Some(split) = split_chains(chains) else {
        return f64::NAN;
    };
    let m = split.len() as f64;
    let n = split[0].len() as f64;

    let chain_means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let grand_mean = mean(&chain_means);

    // Between-chain variance B
    let b = n / (m - 1.0)
        * chain_means
            .iter()
            .map(|&cm| (cm - grand_mean).powi(2))
            .sum::<f64>();

    // Within-chain variance W
    let w = within_variance(&split, &chain_means);

    if w < 1e-30 {
        return f64::NAN;
    }

    let var_hat = (n - 1.0) / n * w + b / n;
    (var_hat / w).sqrt()
}

/// Bulk effective sample size, computed on rank-normalized values.
///
/// Returns NaN under the same conditions as [`r_hat`].
pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    if split_chains(chains).is_none() {
        return f64::NAN;
    }
    ess_raw(&rank_normalize(chains))
}

/// Rank-normalize: replace values with their normal scores.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let total: usize = chains.iter().map(|c| c.len()).sum();

    // Collect (value, chain_idx, draw_idx)
    let mut indexed: Vec<(f64, usize, usize)> = Vec::with_capacity(total);
    for (ci, chain) in chains.iter().enumerate() {
        for (di, &v) in chain.iter().enumerate() {
            indexed.push((v, ci, di));
        }
    }
    indexed.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    // Assign ranks (average ties)
    let mut ranks = vec![0.0f64; total];
    let mut i = 0;
    while i < total {
        let mut j = i;
        while j < total && indexed[j].0 == indexed[i].0 {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        ranks[i..j].iter_mut().for_each(|r| *r = avg_rank);
        i = j.max(i + 1);
    }

    // Normal scores: Φ⁻¹((rank - 3/8) / (N + 1/4))
    let normal = Normal::standard();
    let n_f = total as f64;
    let mut result: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    for (&(_, ci, di), &rank) in indexed.iter().zip(&ranks) {
        let p = (rank - 0.375) / (n_f + 0.25);
        result[ci][di] = normal.inverse_cdf(p);
    }
    result
}

/// ESS of split chains with Geyer's initial monotone sequence.
fn ess_raw(chains: &[Vec<f64>]) -> f64 {
    let Some(split) = split_chains(chains) else {
        return f64::NAN;
    };
    let m = split.len();
    let n = split[0].len();
    let m_f = m as f64;
    let n_f = n as f64;

    let chain_means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let w = within_variance(&split, &chain_means);
    if w < 1e-30 {
        return f64::NAN;
    }
    let b_over_n = if m > 1 {
        let grand_mean = mean(&chain_means);
        chain_means
            .iter()
            .map(|&cm| (cm - grand_mean).powi(2))
            .sum::<f64>()
            / (m_f - 1.0)
    } else {
        0.0
    };
    let var_plus = (n_f - 1.0) / n_f * w + b_over_n;

    // Autocorrelation at a lag, pooled over chains
    let rho = |lag: usize| {
        let gamma = split
            .iter()
            .zip(&chain_means)
            .map(|(chain, &cm)| {
                chain[..n - lag]
                    .iter()
                    .zip(&chain[lag..])
                    .map(|(a, b)| (a - cm) * (b - cm))
                    .sum::<f64>()
                    / n_f
            })
            .sum::<f64>()
            / m_f;
        1.0 - (w - gamma) / var_plus
    };

    // Sum pairs of autocorrelations while they are positive, and force
    // them to be decreasing.
    let mut pair_sum = 0.0f64;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair < 0.0 {
            break;
        }
        let pair = pair.min(previous);
        pair_sum += pair;
        previous = pair;
        lag += 2;
    }

    let total = m_f * n_f;
    let tau = (-1.0 + 2.0 * pair_sum).max(1.0 / total.log10());
    total / tau
}

/// Split every chain in two halves. A chain with an odd number of draws
/// loses its middle draw.
///
/// Returns `None` for chains shorter than four draws or with non-finite
/// values, which can not be ranked.
fn split_chains(chains: &[Vec<f64>]) -> Option<Vec<&[f64]>> {
    let n = chains.iter().map(|c| c.len()).min()?;
    if n < 4 {
        return None;
    }
    if chains.iter().flatten().any(|x| !x.is_finite()) {
        return None;
    }
    let half = n / 2;
    let mut split = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        split.push(&chain[..half]);
        split.push(&chain[chain.len() - half..]);
    }
    Some(split)
}

fn within_variance(chains: &[&[f64]], chain_means: &[f64]) -> f64 {
    let variances: Vec<f64> = chains
        .iter()
        .zip(chain_means)
        .map(|(c, &cm)| sd(c, cm).powi(2))
        .collect();
    mean(&variances)
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn sd(data: &[f64], mean: f64) -> f64 {
    if data.len() < 2 {
        return f64::NAN;
    }
    let sum_sq: f64 = data.iter().map(|&x| (x - mean).powi(2)).sum();
    (sum_sq / (data.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    use crate::{chain::DrawStats, density::VariableInfo};

    fn draw_stats() -> DrawStats {
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
            diverging: false,
            warning: None,
            tuning: false,
        }
    }

    fn normal_chains(num_chains: u64, num_draws: usize) -> Vec<Vec<f64>> {
        (0..num_chains)
            .map(|chain| {
                let mut rng = ChaCha8Rng::seed_from_u64(chain);
                (0..num_draws)
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn hdi_symmetric() {
        let samples: Vec<f64> = (-50..=50).map(|x| x as f64).collect();
        let (lower, upper) = highest_density_interval(&samples, 0.5).unwrap();
        assert_eq!(upper - lower, 50.);

        let (lower, upper) = highest_density_interval(&samples, 1.).unwrap();
        assert_eq!((lower, upper), (-50., 50.));
    }

    #[test]
    fn hdi_skewed() {
        // Most mass close to zero, with a long right tail
        let mut samples = vec![0., 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];
        samples.extend([5., 10.]);
        let (lower, upper) = highest_density_interval(&samples, 0.8).unwrap();
        assert_eq!((lower, upper), (0., 0.7));
    }

    #[test]
    fn hdi_invalid() {
        assert_eq!(highest_density_interval(&[], 0.9), None);
        assert_eq!(highest_density_interval(&[1., 2.], 0.), None);
        assert_eq!(highest_density_interval(&[1., 2.], 1.5), None);
        assert_eq!(highest_density_interval(&[1., 2.], f64::NAN), None);
        assert_eq!(highest_density_interval(&[3.], 0.1), Some((3., 3.)));
    }

    #[test]
    fn normal_hdi_width() {
        let samples = normal_chains(1, 20_000).pop().unwrap();
        let (lower, upper) = highest_density_interval(&samples, 0.95).unwrap();
        assert_relative_eq!(lower, -1.96, epsilon = 0.1);
        assert_relative_eq!(upper, 1.96, epsilon = 0.1);
    }

    #[test]
    fn r_hat_converged() {
        let chains = normal_chains(4, 1000);
        let rh = r_hat(&chains);
        assert!(rh < 1.01, "R-hat should be near 1.0, got {}", rh);
    }

    #[test]
    fn r_hat_diverged() {
        let chain1: Vec<f64> = (0..500).map(|i| 0.0 + (i as f64 * 0.001)).collect();
        let chain2: Vec<f64> = (0..500).map(|i| 100.0 + (i as f64 * 0.001)).collect();
        let rh = r_hat(&[chain1, chain2]);
        assert!(rh > 1.5, "R-hat should be large for diverged chains, got {}", rh);
    }

    #[test]
    fn short_or_constant_chains() {
        assert!(r_hat(&[vec![1., 2., 3.]]).is_nan());
        assert!(ess_bulk(&[vec![1., 2., 3.]]).is_nan());
        assert!(r_hat(&[vec![1.; 10], vec![1.; 10]]).is_nan());
        assert!(r_hat(&[]).is_nan());
    }

    #[test]
    fn non_finite_samples() {
        let mut chains = normal_chains(2, 100);
        chains[1][17] = f64::NAN;
        assert!(r_hat(&chains).is_nan());
        assert!(ess_bulk(&chains).is_nan());
        chains[1][17] = f64::NEG_INFINITY;
        assert!(ess_bulk(&chains).is_nan());
    }

    #[test]
    fn summary_with_nan_deterministic() {
        let variables = vec![
            VariableInfo {
                name: "x".to_string(),
                shape: vec![],
                index: 0,
            },
            VariableInfo {
                name: "log_x".to_string(),
                shape: vec![],
                index: 1,
            },
        ];
        let chains = normal_chains(2, 200)
            .into_iter()
            .enumerate()
            .map(|(chain, draws)| {
                let mut trace = ChainTrace::new(chain as u64);
                for x in draws {
                    trace.push(vec![vec![x], vec![x.ln()]], draw_stats(), false);
                }
                trace.finished = true;
                trace
            })
            .collect();
        let trace = Trace::new(variables, chains);

        let report = summarize(&trace, 0.9);
        let x = report.param("x").unwrap();
        assert!(x.ess_bulk.is_finite());
        assert!(x.r_hat.is_finite());
        let log_x = report.param("log_x").unwrap();
        assert!(log_x.ess_bulk.is_nan());
        assert!(log_x.r_hat.is_nan());
        assert!(log_x.mean.is_nan());
        assert!(report.to_table().contains("log_x"));

        let single = summarize_chain(&trace, 1, 0.9).unwrap();
        assert!(single.param("log_x").unwrap().ess_bulk.is_nan());
    }

    #[test]
    fn ess_independent_draws() {
        let chains = normal_chains(4, 1000);
        let ess = ess_bulk(&chains);
        assert!(ess > 3000., "ESS of independent draws too small: {}", ess);
        assert!(ess < 5000., "ESS of independent draws too large: {}", ess);
    }

    #[test]
    fn ess_autocorrelated_draws() {
        // AR(1) with strong autocorrelation
        let chains: Vec<Vec<f64>> = normal_chains(4, 1000)
            .into_iter()
            .map(|noise| {
                let mut x = 0f64;
                noise
                    .into_iter()
                    .map(|e| {
                        x = 0.9 * x + e;
                        x
                    })
                    .collect()
            })
            .collect();
        let ess = ess_bulk(&chains);
        assert!(ess < 1000., "ESS should be reduced by autocorrelation: {}", ess);
        assert!(ess > 50.);
    }

    proptest! {
        #[test]
        fn hdi_contains_requested_mass(
            samples in prop::collection::vec(-1e3f64..1e3, 1..200),
            prob in 0.01f64..1.,
        ) {
            let (lower, upper) = highest_density_interval(&samples, prob).unwrap();
            prop_assert!(lower <= upper);
            let inside = samples.iter().filter(|&&x| (x >= lower) & (x <= upper)).count();
            prop_assert!(inside as f64 >= (prob * samples.len() as f64).ceil());
        }
    }
}
