use crate::logp::{LogpError, LogpFunc};
use crate::metric::Metric;
use crate::nuts::{Collector, Direction, NutsError, Result};
use crate::state::{State, StatePool};

/// Details about a divergence that occured during trajectory building.
#[derive(Debug, Default)]
pub struct DivergenceInfo {
    /// The position where the diverging leapfrog started.
    pub start_location: Option<Box<[f64]>>,
    /// The position where the diverging leapfrog ended.
    pub end_location: Option<Box<[f64]>>,
    /// The energy at the end of the diverging leapfrog, relative to the
    /// energy at the start of the trajectory.
    ///
    /// Not available if the divergence was caused by a logp error.
    pub energy_error: Option<f64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub end_idx_in_trajectory: Option<i64>,
    /// The logp error that caused the divergence, if there was one.
    pub logp_function_error: Option<Box<dyn std::error::Error + Send>>,
}

/// The Hamiltonian defined by the potential of a logp function and the
/// kinetic energy of a Euclidean metric.
pub struct Hamiltonian<F> {
    logp: F,
    metric: Metric,
    pub(crate) step_size: f64,
    pub(crate) max_energy_error: f64,
}

impl<F: LogpFunc> Hamiltonian<F> {
    pub fn new(logp: F, metric: Metric, step_size: f64, max_energy_error: f64) -> Self {
        assert!(logp.dim() == metric.dim());
        Hamiltonian {
            logp,
            metric,
            step_size,
            max_energy_error,
        }
    }

    pub fn dim(&self) -> usize {
        self.metric.dim()
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub(crate) fn metric_mut(&mut self) -> &mut Metric {
        &mut self.metric
    }

    pub(crate) fn set_metric(&mut self, metric: Metric) {
        assert!(metric.dim() == self.dim());
        self.metric = metric;
    }

    /// Evaluate the logp function at the position of a state and update
    /// its potential energy and gradient.
    fn update_potential_gradient(
        &mut self,
        state: &mut State,
    ) -> std::result::Result<(), F::Err> {
        let inner = state
            .try_mut_inner()
            .expect("State already in use");
        let logp = self.logp.logp(&inner.q, &mut inner.grad)?;
        inner.potential_energy = -logp;
        Ok(())
    }

    /// Perform one leapfrog step.
    ///
    /// Returns either an unrecoverable error, a new state or a divergence.
    pub(crate) fn leapfrog<C: Collector>(
        &mut self,
        pool: &StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<State, DivergenceInfo>> {
        let mut out = pool.copy_state(start);

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };
        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.metric
            .update_velocity(out.try_mut_inner().expect("State already in use"));

        start.position_step(&mut out, epsilon);

        if let Err(err) = self.update_potential_gradient(&mut out) {
            if !err.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(err)));
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Box::new(err)),
                start_location: Some(start.position().into()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                ..DivergenceInfo::default()
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return Ok(Err(div_info));
        }

        out.second_momentum_halfstep(epsilon);
        let inner = out.try_mut_inner().expect("State already in use");
        self.metric.update_velocity(inner);
        self.metric.update_kinetic_energy(inner);

        *out.index_in_trajectory_mut() = start.index_in_trajectory() + sign;
        start.set_psum(&mut out, dir);

        let energy_error = out.energy() - initial_energy;
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let div_info = DivergenceInfo {
                energy_error: Some(energy_error),
                start_location: Some(start.position().into()),
                end_location: Some(out.position().into()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                ..DivergenceInfo::default()
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return Ok(Err(div_info));
        }

        collector.register_leapfrog(start, &out, None);
        Ok(Ok(out))
    }

    /// Initialize a state at a new position.
    ///
    /// The momentum is left invalid; it is set later through
    /// [`Hamiltonian::randomize_momentum`]. Any logp failure at the initial
    /// position is unrecoverable.
    pub(crate) fn init_state(&mut self, pool: &StatePool, init: &[f64]) -> Result<State> {
        let mut state = pool.new_state();
        {
            let inner = state.try_mut_inner().expect("State already in use");
            inner.q.copy_from_slice(init);
            inner.idx_in_trajectory = 0;
            inner.p_sum.iter_mut().for_each(|x| *x = 0.);
        }
        self.update_potential_gradient(&mut state)
            .map_err(|err| NutsError::LogpFailure(Box::new(err)))?;
        if !state.potential_energy().is_finite()
            || state.grad.iter().any(|x| !x.is_finite())
        {
            return Err(NutsError::BadInitialPosition);
        }
        Ok(state)
    }

    /// Draw a fresh momentum and update the dependent terms.
    pub(crate) fn randomize_momentum<R: rand::Rng + ?Sized>(
        &self,
        state: &mut State,
        rng: &mut R,
    ) {
        let inner = state.try_mut_inner().expect("State already in use");
        self.metric.randomize_momentum(inner, rng);
        self.metric.update_velocity(inner);
        self.metric.update_kinetic_energy(inner);
    }
}
