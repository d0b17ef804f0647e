//! Post-hoc convergence diagnostics over one or more chains.

use std::collections::BTreeMap;

use crate::chain::DrawStats;
use crate::sampler::ChainResult;

fn autocovariance(series: &[f64], mean: f64, lag: usize) -> f64 {
    let n = series.len();
    series[..n - lag]
        .iter()
        .zip(series[lag..].iter())
        .map(|(&a, &b)| (a - mean) * (b - mean))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size of one scalar parameter.
///
/// Averages the per-lag autocorrelations across chains and truncates the
/// sum at the first non-positive pair of consecutive lags (Geyer's initial
/// positive sequence). The result is clamped to the total number of draws.
///
/// Returns 0 for constant or too-short chains.
pub fn effective_sample_size(chains: &[&[f64]]) -> f64 {
    let Some(n) = chains.iter().map(|chain| chain.len()).min() else {
        return 0.;
    };
    if n < 4 {
        return 0.;
    }
    let total = (n * chains.len()) as f64;

    let means: Vec<f64> = chains
        .iter()
        .map(|chain| chain[..n].iter().sum::<f64>() / n as f64)
        .collect();
    let variances: Vec<f64> = chains
        .iter()
        .zip(means.iter())
        .map(|(chain, &mean)| autocovariance(&chain[..n], mean, 0))
        .collect();
    if variances.iter().any(|&var| var <= 0. || !var.is_finite()) {
        return 0.;
    }

    let mean_autocorr = |lag: usize| -> f64 {
        chains
            .iter()
            .zip(means.iter())
            .zip(variances.iter())
            .map(|((chain, &mean), &var)| autocovariance(&chain[..n], mean, lag) / var)
            .sum::<f64>()
            / chains.len() as f64
    };

    let mut tau = 1.;
    let mut lag = 1;
    while lag + 1 < n {
        let pair = mean_autocorr(lag) + mean_autocorr(lag + 1);
        if pair <= 0. {
            break;
        }
        tau += 2. * pair;
        lag += 2;
    }

    (total / tau).min(total)
}

/// Split-R̂ of one scalar parameter.
///
/// Each chain is split in half, so a single chain still yields a usable
/// statistic. The result is clamped from below to 1.
pub fn split_rhat(chains: &[&[f64]]) -> f64 {
    let Some(n) = chains.iter().map(|chain| chain.len()).min() else {
        return f64::NAN;
    };
    let half = n / 2;
    if half < 2 {
        return f64::NAN;
    }

    let splits: Vec<&[f64]> = chains
        .iter()
        .flat_map(|chain| [&chain[..half], &chain[n - half..]])
        .collect();

    let m = splits.len() as f64;
    let len = half as f64;

    let means: Vec<f64> = splits
        .iter()
        .map(|split| split.iter().sum::<f64>() / len)
        .collect();
    let grand_mean = means.iter().sum::<f64>() / m;

    let between = means
        .iter()
        .map(|&mean| (mean - grand_mean).powi(2))
        .sum::<f64>()
        * len
        / (m - 1.);
    let within = splits
        .iter()
        .zip(means.iter())
        .map(|(split, &mean)| {
            split.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (len - 1.)
        })
        .sum::<f64>()
        / m;

    if within <= 0. || !within.is_finite() {
        return f64::NAN;
    }

    let var_plus = (len - 1.) / len * within + between / len;
    (var_plus / within).sqrt().max(1.)
}

/// Collect one parameter's sampling-phase draws from every chain.
pub fn parameter_chains(results: &[ChainResult], index: usize) -> Vec<Vec<f64>> {
    results
        .iter()
        .map(|result| result.draws.iter().map(|draw| draw[index]).collect())
        .collect()
}

/// Per-parameter convergence statistics plus a tree summary for a run.
#[derive(Debug, Clone)]
pub struct ChainDiagnostics {
    pub ess: BTreeMap<String, f64>,
    pub r_hat: BTreeMap<String, f64>,
    pub tree_summary: SampleSummary,
}

/// Compute effective sample size and split-R̂ for every parameter of a
/// finished run, together with a tree summary over all chains.
///
/// Parameter keys come from `names` when given, for instance from
/// [`TransformSpec::param_names`](crate::transforms::TransformSpec::param_names);
/// otherwise positional `x[i]` names are used.
pub fn diagnostics(results: &[ChainResult], names: Option<&[String]>) -> ChainDiagnostics {
    let dim = results
        .iter()
        .flat_map(|result| result.draws.first())
        .map(|draw| draw.len())
        .next()
        .unwrap_or(0);
    if let Some(names) = names {
        assert!(names.len() == dim);
    }

    let mut ess = BTreeMap::new();
    let mut r_hat = BTreeMap::new();
    for index in 0..dim {
        let name = match names {
            Some(names) => names[index].clone(),
            None => format!("x[{index}]"),
        };
        let chains = parameter_chains(results, index);
        let views: Vec<&[f64]> = chains.iter().map(|chain| chain.as_slice()).collect();
        ess.insert(name.clone(), effective_sample_size(&views));
        r_hat.insert(name, split_rhat(&views));
    }

    ChainDiagnostics {
        ess,
        r_hat,
        tree_summary: summarize(results.iter().flat_map(|result| result.stats.iter())),
    }
}

/// Descriptive summary of per-draw tree statistics.
#[derive(Debug, Clone)]
pub struct SampleSummary {
    pub num_draws: u64,
    pub divergences: u64,
    pub maxdepth_hits: u64,
    pub mean_depth: f64,
    pub mean_accept: f64,
    /// Histogram of tree depths, indexed by depth.
    pub depth_counts: Vec<u64>,
}

/// Summarize per-draw tree statistics. Without any draws all means are 0.
pub fn summarize<'a>(stats: impl IntoIterator<Item = &'a DrawStats>) -> SampleSummary {
    let mut num_draws = 0u64;
    let mut divergences = 0;
    let mut maxdepth_hits = 0;
    let mut depth_sum = 0u64;
    let mut accept_sum = 0f64;
    let mut depth_counts: Vec<u64> = Vec::new();

    for stat in stats {
        num_draws += 1;
        if stat.diverging {
            divergences += 1;
        }
        if stat.maxdepth_reached {
            maxdepth_hits += 1;
        }
        depth_sum += stat.depth;
        accept_sum += stat.mean_tree_accept;
        let depth = stat.depth as usize;
        if depth >= depth_counts.len() {
            depth_counts.resize(depth + 1, 0);
        }
        depth_counts[depth] += 1;
    }

    let n = num_draws.max(1) as f64;
    SampleSummary {
        num_draws,
        divergences,
        maxdepth_hits,
        mean_depth: depth_sum as f64 / n,
        mean_accept: accept_sum / n,
        depth_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn white_noise(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..n).map(|_| rng.sample(StandardNormal)).collect()
    }

    #[test]
    fn ess_of_white_noise_is_near_total() {
        let a = white_noise(1, 2000);
        let b = white_noise(2, 2000);
        let ess = effective_sample_size(&[&a, &b]);
        assert!(ess > 2000.);
        assert!(ess <= 4000.);
    }

    #[test]
    fn ess_shrinks_for_correlated_chains() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut x = 0f64;
        let chain: Vec<f64> = (0..2000)
            .map(|_| {
                let noise: f64 = rng.sample(StandardNormal);
                x = 0.95 * x + noise;
                x
            })
            .collect();
        let ess = effective_sample_size(&[&chain]);
        assert!(ess > 0.);
        assert!(ess < 400.);
    }

    #[test]
    fn ess_of_constant_chain_is_zero() {
        let chain = vec![1.5; 100];
        assert_eq!(effective_sample_size(&[&chain]), 0.);
    }

    #[test]
    fn rhat_is_near_one_for_same_target() {
        let a = white_noise(4, 1000);
        let b = white_noise(5, 1000);
        let rhat = split_rhat(&[&a, &b]);
        assert!(rhat >= 1.);
        assert!(rhat < 1.05);
    }

    #[test]
    fn summary_of_no_draws_is_zeroed() {
        let summary = summarize(std::iter::empty::<&DrawStats>());
        assert_eq!(summary.num_draws, 0);
        assert_eq!(summary.mean_depth, 0.);
        assert_eq!(summary.mean_accept, 0.);
        assert!(summary.depth_counts.is_empty());
    }

    #[test]
    fn rhat_detects_mean_shift() {
        let a = white_noise(6, 500);
        let b: Vec<f64> = white_noise(7, 500).iter().map(|x| x + 10.).collect();
        assert!(split_rhat(&[&a, &b]) > 2.);
    }
}
