use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};
use crate::nuts::Direction;

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerStateReusable>>>,
}

impl StateStorage {
    fn with_capacity(capacity: usize) -> StateStorage {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }
}

/// A pool of phase-space states.
///
/// Trajectory building allocates and drops states constantly, so dropped
/// states return their buffers here instead of to the allocator.
pub struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub fn new(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage::with_capacity(capacity)),
            dim,
        }
    }

    pub fn new_state(&self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => inner,
            None => Rc::new(InnerStateReusable::new(self.dim, self)),
        };
        State {
            inner: std::mem::ManuallyDrop::new(inner),
        }
    }

    pub fn copy_state(&self, state: &State) -> State {
        let mut new_state = self.new_state();

        let inner = new_state
            .try_mut_inner()
            .expect("New state should not have references");

        inner.q.copy_from_slice(&state.q);
        inner.p.copy_from_slice(&state.p);
        inner.v.copy_from_slice(&state.v);
        inner.p_sum.copy_from_slice(&state.p_sum);
        inner.grad.copy_from_slice(&state.grad);
        inner.idx_in_trajectory = state.idx_in_trajectory;
        inner.kinetic_energy = state.kinetic_energy;
        inner.potential_energy = state.potential_energy;

        new_state
    }
}

/// A point in phase space.
///
/// Also stores the velocity and the sum of momentum terms from the initial
/// point of the trajectory to this point, so the termination criterion in
/// `is_turning` has what it needs.
#[derive(Debug, Clone)]
pub struct InnerState {
    pub(crate) q: Box<[f64]>,
    pub(crate) p: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

pub(crate) struct InnerStateReusable {
    inner: InnerState,
    reuser: Weak<StateStorage>,
}

impl InnerStateReusable {
    fn new(dim: usize, owner: &StatePool) -> InnerStateReusable {
        InnerStateReusable {
            inner: InnerState {
                q: vec![0f64; dim].into(),
                p: vec![0f64; dim].into(),
                v: vec![0f64; dim].into(),
                p_sum: vec![0f64; dim].into(),
                grad: vec![0f64; dim].into(),
                idx_in_trajectory: 0,
                kinetic_energy: 0.,
                potential_energy: 0.,
            },
            reuser: Rc::downgrade(&Rc::clone(&owner.storage)),
        }
    }
}

pub struct State {
    inner: std::mem::ManuallyDrop<Rc<InnerStateReusable>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}

#[derive(Debug)]
pub struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(&mut val.inner),
            None => Err(StateInUse {}),
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let rc = unsafe { std::mem::ManuallyDrop::take(&mut self.inner) };
        if (Rc::strong_count(&rc) == 1) & (Rc::weak_count(&rc) == 0) {
            if let Some(storage) = rc.reuser.upgrade() {
                storage.free_states.borrow_mut().push(rc);
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}

impl State {
    /// Compute the generalized U-turn criterion against another state.
    ///
    /// Checks the angle between the velocities at the trajectory endpoints
    /// and the sum of momentum terms between them. The three cases cover
    /// endpoint pairs on either side of the initial point.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    pub(crate) fn write_position(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.q)
    }

    pub fn position(&self) -> &[f64] {
        &self.q
    }

    pub(crate) fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub(crate) fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    /// Set index_in_trajectory to 0 and reinitialize the momentum sum.
    pub(crate) fn make_init_point(&mut self) {
        let InnerState {
            p,
            p_sum,
            idx_in_trajectory,
            ..
        } = self.try_mut_inner().expect("State already in use");
        *idx_in_trajectory = 0;
        p_sum.copy_from_slice(p);
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(
            &self.grad,
            &self.p,
            epsilon / 2.,
            &mut out.try_mut_inner().expect("State already in use").p,
        );
    }

    pub(crate) fn position_step(&self, out: &mut Self, epsilon: f64) {
        let InnerState { q, v, .. } = out.try_mut_inner().expect("State already in use");
        axpy_out(v, &self.q, epsilon, q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        let inner = self.try_mut_inner().expect("State already in use");
        axpy(&inner.grad, &mut inner.p, epsilon / 2.);
    }

    pub(crate) fn set_psum(&self, target: &mut Self, _dir: Direction) {
        let out = target.try_mut_inner().expect("State already in use");

        assert!(out.idx_in_trajectory != 0);

        let InnerState {
            p,
            p_sum,
            idx_in_trajectory,
            ..
        } = out;
        if *idx_in_trajectory == -1 {
            p_sum.copy_from_slice(p);
        } else {
            axpy_out(p, &self.p_sum, 1., p_sum);
        }
    }

    pub(crate) fn index_in_trajectory_mut(&mut self) -> &mut i64 {
        &mut self
            .try_mut_inner()
            .expect("State already in use")
            .idx_in_trajectory
    }
}
