use crate::adapt::{AdaptOptions, GlobalStrategy};
use crate::hamiltonian::{DivergenceInfo, Hamiltonian};
use crate::logp::LogpFunc;
use crate::nuts::{self, NutsOptions, Result};
use crate::state::{State, StatePool};
use crate::stepsize::AcceptanceRateCollector;

/// Per-draw statistics, exported alongside the position.
#[derive(Debug)]
pub struct DrawStats {
    pub draw: u64,
    pub chain: u64,
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub idx_in_trajectory: i64,
    pub logp: f64,
    pub energy: f64,
    pub diverging: bool,
    /// The step size used for this draw's trajectory.
    pub step_size: f64,
    /// The trajectory-averaged Metropolis acceptance statistic.
    pub mean_tree_accept: f64,
    /// Number of leapfrog steps in the trajectory.
    pub n_steps: u64,
    /// Whether this was a warmup draw.
    pub tuning: bool,
    pub divergence_info: Option<DivergenceInfo>,
}

/// A single NUTS chain: trajectory building plus warmup adaptation.
pub struct NutsChain<F: LogpFunc, R: rand::Rng> {
    pool: StatePool,
    hamiltonian: Hamiltonian<F>,
    options: NutsOptions,
    collector: AcceptanceRateCollector,
    strategy: GlobalStrategy,
    rng: R,
    init: State,
    chain: u64,
    draw_count: u64,
}

impl<F: LogpFunc, R: rand::Rng> NutsChain<F, R> {
    pub fn new(
        mut hamiltonian: Hamiltonian<F>,
        adapt: AdaptOptions,
        num_tune: u64,
        options: NutsOptions,
        mut rng: R,
        chain: u64,
        position: &[f64],
    ) -> Result<Self> {
        let pool_size: usize = options.maxdepth.checked_mul(2).unwrap().try_into().unwrap();
        let pool = StatePool::new(hamiltonian.dim(), pool_size);
        let init = hamiltonian.init_state(&pool, position)?;
        let mut strategy = GlobalStrategy::new(adapt, num_tune, hamiltonian.dim());
        strategy.init(&options, &mut hamiltonian, position, &mut rng);
        Ok(NutsChain {
            pool,
            hamiltonian,
            options,
            collector: AcceptanceRateCollector::new(),
            strategy,
            rng,
            init,
            chain,
            draw_count: 0,
        })
    }

    pub fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats)> {
        let step_size = self.hamiltonian.step_size;
        let (state, info) = nuts::draw(
            &self.pool,
            &mut self.init,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;

        let mut position = vec![0f64; self.hamiltonian.dim()].into_boxed_slice();
        state.write_position(&mut position);

        let stats = DrawStats {
            draw: self.draw_count,
            chain: self.chain,
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            idx_in_trajectory: state.index_in_trajectory(),
            logp: -state.potential_energy(),
            energy: state.energy(),
            diverging: info.divergence_info.is_some(),
            step_size,
            mean_tree_accept: self.collector.mean.current(),
            n_steps: self.collector.mean.count(),
            tuning: self.strategy.is_tuning(),
            divergence_info: info.divergence_info,
        };

        self.strategy.adapt(
            &self.options,
            &mut self.hamiltonian,
            self.draw_count,
            &self.collector,
            &state,
            &mut self.rng,
        );

        self.init = state;
        self.draw_count += 1;
        Ok((position, stats))
    }

    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size
    }

    pub fn metric(&self) -> &crate::metric::Metric {
        self.hamiltonian.metric()
    }

    pub(crate) fn metric_skips(&self) -> u64 {
        self.strategy.metric_skips()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{DiagMetric, Metric};
    use crate::sampler::test_models::NormalLogp;
    use crate::stepsize::DualAverageSettings;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn chain_progresses_and_freezes_step_size() {
        let dim = 3;
        let num_tune = 200;
        let logp = NormalLogp::new(dim, 0.);
        let hamiltonian =
            Hamiltonian::new(logp, Metric::Diag(DiagMetric::new(dim)), 0.1, 1000.);
        let rng = SmallRng::seed_from_u64(9);
        let mut chain = NutsChain::new(
            hamiltonian,
            AdaptOptions::default(),
            num_tune,
            NutsOptions { maxdepth: 10 },
            rng,
            0,
            &[1., 1., 1.],
        )
        .unwrap();

        for _ in 0..num_tune {
            let (_, stats) = chain.draw().unwrap();
            assert!(stats.tuning);
        }
        let frozen = chain.step_size();
        for _ in 0..20 {
            let (position, stats) = chain.draw().unwrap();
            assert!(!stats.tuning);
            assert_eq!(stats.step_size, frozen);
            assert!(position.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn disabled_adaptation_keeps_initial_configuration() {
        let dim = 2;
        let num_tune = 120;
        let initial_step = 0.17;
        let logp = NormalLogp::new(dim, 0.);
        let hamiltonian = Hamiltonian::new(
            logp,
            Metric::Diag(DiagMetric::new(dim)),
            initial_step,
            1000.,
        );
        let adapt = AdaptOptions {
            dual_average: DualAverageSettings {
                enabled: false,
                ..DualAverageSettings::default()
            },
            adapt_metric: false,
            ..AdaptOptions::default()
        };
        let mut chain = NutsChain::new(
            hamiltonian,
            adapt,
            num_tune,
            NutsOptions { maxdepth: 10 },
            SmallRng::seed_from_u64(4),
            0,
            &[0.5, -0.5],
        )
        .unwrap();

        for _ in 0..num_tune + 10 {
            let (_, stats) = chain.draw().unwrap();
            assert_eq!(stats.step_size, initial_step);
        }
        assert_eq!(chain.step_size(), initial_step);
        let Metric::Diag(metric) = chain.metric() else {
            panic!("expected diag metric")
        };
        assert_eq!(metric.variance(), &[1., 1.]);
    }
}
