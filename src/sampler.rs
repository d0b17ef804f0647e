use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use thiserror::Error;

use crate::adapt::{AdaptOptions, MetricKind};
use crate::chain::{DrawStats, NutsChain};
use crate::hamiltonian::Hamiltonian;
use crate::logp::LogpFunc;
use crate::metric::{DenseMetric, DiagMetric, Metric};
use crate::nuts::{NutsError, NutsOptions};
use crate::stepsize::DualAverageSettings;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Initial position has dimension {actual} but the density expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Chain {chain} failed")]
    Chain {
        chain: u64,
        #[source]
        source: NutsError,
    },
}

/// Settings for the NUTS sampler.
#[derive(Debug, Clone, Copy)]
pub struct NutsSettings {
    /// Warmup draws with step size and metric adaptation.
    pub num_tune: u64,
    /// Draws after warmup, returned in [`ChainResult::draws`].
    pub num_draws: u64,
    pub num_chains: u64,
    pub maxdepth: u64,
    /// Energy error above which a leapfrog step counts as divergent.
    pub max_energy_error: f64,
    pub target_accept: f64,
    pub metric: MetricKind,
    pub seed: u64,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_tune: 300,
            num_draws: 1000,
            num_chains: 4,
            maxdepth: 10,
            max_energy_error: 1000.,
            target_accept: 0.8,
            metric: MetricKind::Diag,
            seed: 0,
        }
    }
}

impl NutsSettings {
    fn validate(&self) -> Result<(), SamplerError> {
        if self.num_tune == 0 {
            return Err(SamplerError::InvalidConfiguration(
                "num_tune must be positive".into(),
            ));
        }
        if self.num_draws == 0 {
            return Err(SamplerError::InvalidConfiguration(
                "num_draws must be positive".into(),
            ));
        }
        if self.num_chains == 0 {
            return Err(SamplerError::InvalidConfiguration(
                "num_chains must be positive".into(),
            ));
        }
        if self.maxdepth == 0 {
            return Err(SamplerError::InvalidConfiguration(
                "maxdepth must be positive".into(),
            ));
        }
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return Err(SamplerError::InvalidConfiguration(format!(
                "target_accept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        Ok(())
    }
}

/// Everything one chain produced.
///
/// Contains only sampling-phase draws; the tuned step size and final metric
/// allow continuing the chain without re-adaptation.
#[derive(Debug)]
pub struct ChainResult {
    pub chain: u64,
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<DrawStats>,
    pub warmup_stats: Vec<DrawStats>,
    pub step_size: f64,
    pub metric: Metric,
    pub divergences: u64,
    pub metric_skips: u64,
    /// Whether the chain was stopped early through the abort flag.
    pub aborted: bool,
}

/// Run several NUTS chains in parallel.
///
/// Chains are seeded from a ChaCha stream derived from `settings.seed`, so
/// runs with the same seed and settings are reproducible.
pub fn sample<F>(
    logp: &F,
    start: &[f64],
    settings: &NutsSettings,
) -> anyhow::Result<Vec<ChainResult>>
where
    F: LogpFunc + Clone + Send + Sync,
{
    sample_with_abort(logp, start, settings, None)
}

/// Like [`sample`], but checks `abort` between draws.
///
/// When the flag is set each chain stops after its current draw and returns
/// the draws completed so far.
pub fn sample_with_abort<F>(
    logp: &F,
    start: &[f64],
    settings: &NutsSettings,
    abort: Option<&AtomicBool>,
) -> anyhow::Result<Vec<ChainResult>>
where
    F: LogpFunc + Clone + Send + Sync,
{
    settings.validate()?;
    if start.len() != logp.dim() {
        return Err(SamplerError::DimensionMismatch {
            expected: logp.dim(),
            actual: start.len(),
        }
        .into());
    }

    let mut seeder = ChaCha8Rng::seed_from_u64(settings.seed);
    let chain_seeds: Vec<u64> = (0..settings.num_chains).map(|_| seeder.random()).collect();

    chain_seeds
        .into_par_iter()
        .enumerate()
        .map(|(chain, seed)| {
            run_chain(logp.clone(), chain as u64, seed, start, settings, abort)
                .with_context(|| format!("while sampling chain {chain}"))
        })
        .collect()
}

fn run_chain<F>(
    logp: F,
    chain: u64,
    seed: u64,
    start: &[f64],
    settings: &NutsSettings,
    abort: Option<&AtomicBool>,
) -> Result<ChainResult, SamplerError>
where
    F: LogpFunc,
{
    let dim = logp.dim();
    let rng = SmallRng::seed_from_u64(seed);
    let metric = match settings.metric {
        MetricKind::Diag => Metric::Diag(DiagMetric::new(dim)),
        MetricKind::Dense => Metric::Dense(DenseMetric::new(dim)),
    };
    let adapt = AdaptOptions {
        dual_average: DualAverageSettings {
            target_accept: settings.target_accept,
            ..DualAverageSettings::default()
        },
        metric: settings.metric,
        ..AdaptOptions::default()
    };
    let hamiltonian = Hamiltonian::new(
        logp,
        metric,
        adapt.dual_average.initial_step,
        settings.max_energy_error,
    );
    let options = NutsOptions {
        maxdepth: settings.maxdepth,
    };

    let mut nuts_chain =
        NutsChain::new(hamiltonian, adapt, settings.num_tune, options, rng, chain, start)
            .map_err(|source| SamplerError::Chain { chain, source })?;

    let total = settings.num_tune + settings.num_draws;
    let mut draws = Vec::with_capacity(settings.num_draws as usize);
    let mut stats = Vec::with_capacity(settings.num_draws as usize);
    let mut warmup_stats = Vec::with_capacity(settings.num_tune as usize);
    let mut divergences = 0;
    let mut aborted = false;

    for idx in 0..total {
        if abort.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            aborted = true;
            break;
        }
        let (position, draw_stats) = nuts_chain
            .draw()
            .map_err(|source| SamplerError::Chain { chain, source })?;
        if idx < settings.num_tune {
            warmup_stats.push(draw_stats);
        } else {
            if draw_stats.diverging {
                divergences += 1;
            }
            stats.push(draw_stats);
            draws.push(position);
        }
    }

    Ok(ChainResult {
        chain,
        draws,
        stats,
        warmup_stats,
        step_size: nuts_chain.step_size(),
        metric: nuts_chain.metric().clone(),
        divergences,
        metric_skips: nuts_chain.metric_skips(),
        aborted,
    })
}

/// Simple densities used by tests and benchmarks.
pub mod test_models {
    use std::convert::Infallible;

    use crate::logp::LogpFunc;

    /// An isotropic normal density with a common mean.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        dim: usize,
        mu: f64,
    }

    impl NormalLogp {
        pub fn new(dim: usize, mu: f64) -> Self {
            Self { dim, mu }
        }
    }

    impl LogpFunc for NormalLogp {
        type Err = Infallible;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err> {
            let mut logp = 0f64;
            for (&x, g) in position.iter().zip(grad.iter_mut()) {
                let diff = x - self.mu;
                logp -= 0.5 * diff * diff;
                *g = -diff;
            }
            Ok(logp)
        }
    }

    /// A bivariate normal with given means, standard deviations and
    /// correlation.
    #[derive(Clone, Debug)]
    pub struct BivariateNormal {
        pub mean: [f64; 2],
        pub sigma: [f64; 2],
        pub rho: f64,
    }

    impl LogpFunc for BivariateNormal {
        type Err = Infallible;

        fn dim(&self) -> usize {
            2
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err> {
            let z0 = (position[0] - self.mean[0]) / self.sigma[0];
            let z1 = (position[1] - self.mean[1]) / self.sigma[1];
            let denom = 1. - self.rho * self.rho;
            let logp = -0.5 * (z0 * z0 - 2. * self.rho * z0 * z1 + z1 * z1) / denom;
            grad[0] = -(z0 - self.rho * z1) / (denom * self.sigma[0]);
            grad[1] = -(z1 - self.rho * z0) / (denom * self.sigma[1]);
            Ok(logp)
        }
    }

    /// The posterior of a Bernoulli success probability with a flat prior,
    /// evaluated on constrained space.
    ///
    /// With `successes` out of `trials` the posterior is
    /// `Beta(successes + 1, trials - successes + 1)`.
    #[derive(Clone, Debug)]
    pub struct BernoulliProblem {
        pub trials: u64,
        pub successes: u64,
    }

    impl LogpFunc for BernoulliProblem {
        type Err = Infallible;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err> {
            let alpha = position[0];
            let s = self.successes as f64;
            let f = (self.trials - self.successes) as f64;
            grad[0] = s / alpha - f / (1. - alpha);
            Ok(s * alpha.ln() + f * (-alpha).ln_1p())
        }
    }

    /// Gaussian linear regression with two coefficients and an unknown
    /// noise scale, flat priors.
    ///
    /// Evaluated on constrained space, so the parameter vector is
    /// `[beta0, beta1, sigma]` with `sigma > 0`. Meant to be wrapped in a
    /// [`TransformedLogp`](crate::TransformedLogp) with a positive block
    /// for `sigma`.
    #[derive(Clone, Debug)]
    pub struct LinearRegression {
        pub predictors: Vec<[f64; 2]>,
        pub responses: Vec<f64>,
    }

    impl LogpFunc for LinearRegression {
        type Err = Infallible;

        fn dim(&self) -> usize {
            3
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err> {
            let (beta, sigma) = (&position[..2], position[2]);
            let n = self.responses.len() as f64;
            let inv_var = (sigma * sigma).recip();

            let mut logp = -n * sigma.ln();
            grad.iter_mut().for_each(|g| *g = 0.);
            for (x, &y) in self.predictors.iter().zip(&self.responses) {
                let resid = y - beta[0] * x[0] - beta[1] * x[1];
                logp -= 0.5 * resid * resid * inv_var;
                grad[0] += resid * x[0] * inv_var;
                grad[1] += resid * x[1] * inv_var;
                grad[2] += resid * resid * inv_var / sigma;
            }
            grad[2] -= n / sigma;
            Ok(logp)
        }
    }

    /// Logistic regression with two coefficients and flat priors.
    #[derive(Clone, Debug)]
    pub struct LogisticRegression {
        pub predictors: Vec<[f64; 2]>,
        /// Outcomes in {0, 1}.
        pub outcomes: Vec<f64>,
    }

    impl LogpFunc for LogisticRegression {
        type Err = Infallible;

        fn dim(&self) -> usize {
            2
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err> {
            let mut logp = 0f64;
            grad.iter_mut().for_each(|g| *g = 0.);
            for (x, &y) in self.predictors.iter().zip(&self.outcomes) {
                let eta = position[0] * x[0] + position[1] * x[1];
                let prob = if eta >= 0. {
                    1. / (1. + (-eta).exp())
                } else {
                    let e = eta.exp();
                    e / (1. + e)
                };
                logp += y * eta - eta.max(0.) - (-eta.abs()).exp().ln_1p();
                grad[0] += (y - prob) * x[0];
                grad[1] += (y - prob) * x[1];
            }
            Ok(logp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_models::NormalLogp;

    #[test]
    fn invalid_settings_are_rejected() {
        let logp = NormalLogp::new(2, 0.);
        let start = [0.1, 0.2];

        let settings = NutsSettings {
            num_tune: 0,
            ..NutsSettings::default()
        };
        let err = sample(&logp, &start, &settings).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SamplerError>(),
            Some(SamplerError::InvalidConfiguration(_))
        ));

        let settings = NutsSettings {
            target_accept: 1.5,
            ..NutsSettings::default()
        };
        assert!(sample(&logp, &start, &settings).is_err());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let logp = NormalLogp::new(3, 0.);
        let err = sample(&logp, &[0.1, 0.2], &NutsSettings::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SamplerError>(),
            Some(SamplerError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let logp = NormalLogp::new(2, 1.);
        let settings = NutsSettings {
            num_tune: 100,
            num_draws: 50,
            num_chains: 2,
            seed: 7,
            ..NutsSettings::default()
        };
        let a = sample(&logp, &[0., 0.], &settings).unwrap();
        let b = sample(&logp, &[0., 0.], &settings).unwrap();
        for (ca, cb) in a.iter().zip(b.iter()) {
            assert_eq!(ca.step_size, cb.step_size);
            assert_eq!(ca.draws, cb.draws);
        }
    }

    #[test]
    fn abort_returns_partial_results() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let logp = NormalLogp::new(2, 0.);
        let settings = NutsSettings {
            num_tune: 50,
            num_draws: 100,
            num_chains: 1,
            ..NutsSettings::default()
        };
        let abort = AtomicBool::new(true);
        abort.store(true, Ordering::Relaxed);
        let results = sample_with_abort(&logp, &[0., 0.], &settings, Some(&abort)).unwrap();
        assert!(results[0].aborted);
        assert!(results[0].draws.is_empty());
    }
}
