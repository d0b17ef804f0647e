use crate::hamiltonian::Hamiltonian;
use crate::logp::LogpFunc;
use crate::metric::{
    regularize_covariance, regularize_variance, DenseMetric, Metric, RunningCovariance,
    RunningVariance,
};
use crate::nuts::NutsOptions;
use crate::state::State;
use crate::stepsize::{AcceptanceRateCollector, DualAverageSettings, StepSizeAdapt};

/// Which metric structure to adapt during warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Diag,
    Dense,
}

/// Step size and metric adaptation toggle and tune independently:
/// disabling one leaves the other fully functional.
#[derive(Debug, Clone, Copy)]
pub struct AdaptOptions {
    pub dual_average: DualAverageSettings,
    pub metric: MetricKind,
    /// Whether to estimate the metric at all. When false the metric the
    /// chain was constructed with is kept for the whole run.
    pub adapt_metric: bool,
    /// Step-size-only draws at the start of warmup.
    pub init_buffer: u64,
    /// Step-size-only draws at the end of warmup.
    pub term_buffer: u64,
    /// Size of the first metric estimation window. Later windows double.
    pub base_window: u64,
}

impl Default for AdaptOptions {
    fn default() -> Self {
        Self {
            dual_average: DualAverageSettings::default(),
            metric: MetricKind::Diag,
            adapt_metric: true,
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

enum Estimator {
    Diag(RunningVariance),
    Dense(RunningCovariance),
}

impl Estimator {
    fn new(kind: MetricKind, dim: usize) -> Self {
        match kind {
            MetricKind::Diag => Estimator::Diag(RunningVariance::new(dim)),
            MetricKind::Dense => Estimator::Dense(RunningCovariance::new(dim)),
        }
    }

    fn add_sample(&mut self, value: &[f64]) {
        match self {
            Estimator::Diag(est) => est.add_sample(value),
            Estimator::Dense(est) => est.add_sample(value),
        }
    }

    fn count(&self) -> u64 {
        match self {
            Estimator::Diag(est) => est.count(),
            Estimator::Dense(est) => est.count(),
        }
    }
}

/// Warmup adaptation of step size and metric.
///
/// The warmup draws split into a leading step-size-only buffer, a series of
/// doubling metric estimation windows, and a trailing step-size-only buffer.
/// At the end of each window the metric is rebuilt from the window's draws
/// and dual averaging restarts under the new metric. Degenerate estimates
/// keep the previous metric and are only counted.
pub(crate) struct GlobalStrategy {
    step_size: StepSizeAdapt,
    estimator: Estimator,
    options: AdaptOptions,
    dim: usize,
    num_tune: u64,
    init_buffer: u64,
    term_buffer: u64,
    window_size: u64,
    window_end: u64,
    metric_skips: u64,
    tuning: bool,
}

impl GlobalStrategy {
    pub(crate) fn new(options: AdaptOptions, num_tune: u64, dim: usize) -> Self {
        let mut init_buffer = options.init_buffer;
        let mut term_buffer = options.term_buffer;
        let mut base_window = options.base_window;
        if num_tune < init_buffer + term_buffer + base_window {
            // Not enough warmup for the default layout, shrink proportionally.
            init_buffer = (0.15 * num_tune as f64).floor() as u64;
            term_buffer = (0.1 * num_tune as f64).floor() as u64;
            base_window = num_tune - init_buffer - term_buffer;
        }
        let window_end = (init_buffer + base_window).min(num_tune.saturating_sub(term_buffer));
        Self {
            step_size: StepSizeAdapt::new(options.dual_average),
            estimator: Estimator::new(options.metric, dim),
            options,
            dim,
            num_tune,
            init_buffer,
            term_buffer,
            window_size: base_window,
            window_end,
            metric_skips: 0,
            tuning: num_tune > 0,
        }
    }

    pub(crate) fn init<F: LogpFunc, R: rand::Rng + ?Sized>(
        &mut self,
        options: &NutsOptions,
        hamiltonian: &mut Hamiltonian<F>,
        position: &[f64],
        rng: &mut R,
    ) {
        self.step_size.init(options, hamiltonian, position, rng);
    }

    pub(crate) fn adapt<F: LogpFunc, R: rand::Rng + ?Sized>(
        &mut self,
        options: &NutsOptions,
        hamiltonian: &mut Hamiltonian<F>,
        draw: u64,
        collector: &AcceptanceRateCollector,
        state: &State,
        rng: &mut R,
    ) {
        if draw >= self.num_tune {
            return;
        }

        self.step_size.adapt(hamiltonian, collector);

        let metric_end = self.num_tune - self.term_buffer;
        if self.options.adapt_metric & (draw >= self.init_buffer) & (draw < metric_end) {
            self.estimator.add_sample(state.position());

            if draw + 1 == self.window_end {
                let updated = self.try_update_metric(hamiltonian);
                if !updated {
                    self.metric_skips += 1;
                }

                self.estimator = Estimator::new(self.options.metric, self.dim);
                self.window_size = self.window_size.saturating_mul(2);
                let mut next_end = self.window_end + self.window_size;
                // If the remainder cannot fit another doubling, absorb it.
                if next_end + 2 * self.window_size > metric_end {
                    next_end = metric_end;
                }
                self.window_end = next_end.min(metric_end);

                if updated {
                    self.step_size.init(options, hamiltonian, state.position(), rng);
                }
            }
        }

        if draw + 1 == self.num_tune {
            self.step_size.finalize(hamiltonian);
            self.tuning = false;
        }
    }

    fn try_update_metric<F: LogpFunc>(&self, hamiltonian: &mut Hamiltonian<F>) -> bool {
        if self.estimator.count() < 3 {
            return false;
        }
        match &self.estimator {
            Estimator::Diag(est) => {
                let count = est.count();
                let Some(vars) = est.current() else {
                    return false;
                };
                let raw: Vec<f64> = vars.collect();
                if raw.iter().any(|&var| !var.is_finite() || var <= 0.) {
                    return false;
                }
                let regularized: Vec<f64> = raw
                    .into_iter()
                    .map(|var| regularize_variance(var, count))
                    .collect();
                let Metric::Diag(metric) = hamiltonian.metric_mut() else {
                    unreachable!("Estimator kind matches metric kind");
                };
                metric.try_update(regularized.into_iter())
            }
            Estimator::Dense(est) => {
                let Some(cov) = est.current() else {
                    return false;
                };
                let degenerate = (0..cov.nrows())
                    .any(|i| !cov[(i, i)].is_finite() || cov[(i, i)] <= 0.);
                if degenerate {
                    return false;
                }
                let cov = regularize_covariance(cov, est.count());
                let Some(metric) = DenseMetric::from_covariance(cov) else {
                    return false;
                };
                hamiltonian.set_metric(Metric::Dense(metric));
                true
            }
        }
    }

    pub(crate) fn is_tuning(&self) -> bool {
        self.tuning
    }

    pub(crate) fn metric_skips(&self) -> u64 {
        self.metric_skips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::DiagMetric;
    use crate::nuts::Collector;
    use crate::sampler::test_models::NormalLogp;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn small_warmup_shrinks_buffers() {
        let strategy = GlobalStrategy::new(AdaptOptions::default(), 40, 2);
        assert_eq!(strategy.init_buffer, 6);
        assert_eq!(strategy.term_buffer, 4);
        assert_eq!(strategy.window_size, 30);
        assert_eq!(strategy.window_end, 36);
    }

    #[test]
    fn degenerate_window_keeps_metric() {
        let dim = 2;
        let mut strategy = GlobalStrategy::new(
            AdaptOptions {
                init_buffer: 0,
                term_buffer: 0,
                base_window: 4,
                ..AdaptOptions::default()
            },
            8,
            dim,
        );
        let logp = NormalLogp::new(dim, 0.);
        let mut hamiltonian =
            Hamiltonian::new(logp, Metric::Diag(DiagMetric::new(dim)), 0.1, 1000.);
        let pool = crate::state::StatePool::new(dim, 4);
        let mut rng = SmallRng::seed_from_u64(1);
        let options = NutsOptions { maxdepth: 10 };

        // Identical positions in every draw give zero variance.
        let state = hamiltonian.init_state(&pool, &[1., 2.]).unwrap();
        let mut collector = AcceptanceRateCollector::new();
        collector.register_init(&state, &options);
        collector.register_leapfrog(&state, &state, None);

        for draw in 0..4 {
            strategy.adapt(&options, &mut hamiltonian, draw, &collector, &state, &mut rng);
        }
        assert_eq!(strategy.metric_skips(), 1);
        let Metric::Diag(metric) = hamiltonian.metric() else {
            panic!("expected diag metric")
        };
        assert_eq!(metric.variance(), &[1., 1.]);
    }
}
