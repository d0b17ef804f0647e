use crate::hamiltonian::{DivergenceInfo, Hamiltonian};
use crate::logp::LogpFunc;
use crate::nuts::{Collector, Direction, NutsOptions};
use crate::state::{State, StatePool};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Dual averaging on the log step size.
#[derive(Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }
}

pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Tracks the mean Metropolis acceptance statistic over a trajectory.
///
/// Divergent leapfrog steps count as zero acceptance.
pub struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        };
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}

/// Settings for the step size adaptation as a whole.
///
/// With `enabled` false the step size stays at its constructed value for
/// the whole run; the initial search, dual averaging and the final freeze
/// all become no-ops.
#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    pub enabled: bool,
    pub target_accept: f64,
    pub initial_step: f64,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_accept: 0.8,
            initial_step: 0.1,
            params: DualAverageOptions::default(),
        }
    }
}

/// Dual averaging driven by trajectory acceptance statistics.
pub(crate) struct StepSizeAdapt {
    dual_avg: DualAverage,
    options: DualAverageSettings,
}

impl StepSizeAdapt {
    pub(crate) fn new(options: DualAverageSettings) -> Self {
        Self {
            dual_avg: DualAverage::new(options.params, options.initial_step),
            options,
        }
    }

    /// Search for a reasonable starting step size.
    ///
    /// Doubles or halves the step until the acceptance probability of a
    /// single leapfrog step crosses one half, then restarts dual averaging
    /// from the step it found.
    pub(crate) fn init<F: LogpFunc, R: rand::Rng + ?Sized>(
        &mut self,
        options: &NutsOptions,
        hamiltonian: &mut Hamiltonian<F>,
        position: &[f64],
        rng: &mut R,
    ) {
        if !self.options.enabled {
            return;
        }
        let pool = StatePool::new(hamiltonian.dim(), 1);

        let Ok(mut state) = hamiltonian.init_state(&pool, position) else {
            return;
        };
        hamiltonian.randomize_momentum(&mut state, rng);
        state.make_init_point();

        let mut collector = AcceptanceRateCollector::new();
        collector.register_init(&state, options);

        hamiltonian.step_size = self.options.initial_step;

        let state_next = hamiltonian.leapfrog(
            &pool,
            &state,
            Direction::Forward,
            state.energy(),
            &mut collector,
        );

        let Ok(_) = state_next else {
            return;
        };

        let accept_stat = collector.mean.current();
        let dir = if accept_stat > 0.5 {
            Direction::Forward
        } else {
            Direction::Backward
        };

        for _ in 0..100 {
            let mut collector = AcceptanceRateCollector::new();
            collector.register_init(&state, options);
            let state_next =
                hamiltonian.leapfrog(&pool, &state, dir, state.energy(), &mut collector);
            let Ok(_) = state_next else {
                hamiltonian.step_size = self.options.initial_step;
                return;
            };
            let accept_stat = collector.mean.current();
            match dir {
                Direction::Forward => {
                    if (accept_stat <= 0.5) | (hamiltonian.step_size > 1e5) {
                        self.dual_avg = DualAverage::new(self.options.params, hamiltonian.step_size);
                        return;
                    }
                    hamiltonian.step_size *= 2.;
                }
                Direction::Backward => {
                    if (accept_stat >= 0.5) | (hamiltonian.step_size < 1e-10) {
                        self.dual_avg = DualAverage::new(self.options.params, hamiltonian.step_size);
                        return;
                    }
                    hamiltonian.step_size /= 2.;
                }
            }
        }
        // If we don't find something better, use the specified initial value
        hamiltonian.step_size = self.options.initial_step;
    }

    /// Advance dual averaging with the latest trajectory and set the step
    /// size for the next warmup draw.
    pub(crate) fn adapt<F: LogpFunc>(
        &mut self,
        hamiltonian: &mut Hamiltonian<F>,
        collector: &AcceptanceRateCollector,
    ) {
        if !self.options.enabled {
            return;
        }
        let mean = collector.mean.current();
        self.dual_avg.advance(mean, self.options.target_accept);
        hamiltonian.step_size = self.dual_avg.current_step_size();
    }

    /// Freeze the step size at the dual averaged estimate for sampling.
    pub(crate) fn finalize<F: LogpFunc>(&mut self, hamiltonian: &mut Hamiltonian<F>) {
        if !self.options.enabled {
            return;
        }
        hamiltonian.step_size = self.dual_avg.current_step_size_adapted();
    }
}
