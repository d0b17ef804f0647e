use faer::{Col, ColRef, Mat};
use itertools::izip;
use multiversion::multiversion;
use rand_distr::StandardNormal;

use crate::math::{multiply, vector_dot};
use crate::state::InnerState;

/// The Euclidean metric of the Hamiltonian.
///
/// Stores an estimate of the posterior covariance; the mass matrix is its
/// inverse. Momenta are drawn from `N(0, M)` and the velocity is `M^-1 p`,
/// so the kinetic energy is `p^T M^-1 p / 2`.
#[derive(Debug, Clone)]
pub enum Metric {
    Diag(DiagMetric),
    Dense(DenseMetric),
}

impl Metric {
    pub(crate) fn update_velocity(&self, state: &mut InnerState) {
        match self {
            Metric::Diag(metric) => multiply(&metric.variance, &state.p, &mut state.v),
            Metric::Dense(metric) => {
                let p = ColRef::from_slice(&state.p);
                let v = &metric.cov * p;
                state
                    .v
                    .copy_from_slice(v.try_as_col_major().expect("Col is contiguous").as_slice());
            }
        }
    }

    pub(crate) fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    pub(crate) fn randomize_momentum<R: rand::Rng + ?Sized>(
        &self,
        state: &mut InnerState,
        rng: &mut R,
    ) {
        match self {
            Metric::Diag(metric) => {
                state
                    .p
                    .iter_mut()
                    .zip(metric.inv_stds.iter())
                    .for_each(|(p, &s)| {
                        let norm: f64 = rng.sample(StandardNormal);
                        *p = s * norm;
                    });
            }
            Metric::Dense(metric) => {
                let scaled = Col::from_fn(state.p.len(), |i| {
                    let norm: f64 = rng.sample(StandardNormal);
                    norm * metric.vals_sqrt_inv[i]
                });
                let p: Col<f64> = &metric.vecs * scaled;
                state
                    .p
                    .copy_from_slice(p.try_as_col_major().expect("Col is contiguous").as_slice());
            }
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Metric::Diag(metric) => metric.variance.len(),
            Metric::Dense(metric) => metric.cov.nrows(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagMetric {
    variance: Box<[f64]>,
    inv_stds: Box<[f64]>,
}

impl DiagMetric {
    /// The identity metric.
    pub fn new(ndim: usize) -> Self {
        Self {
            variance: vec![1f64; ndim].into(),
            inv_stds: vec![1f64; ndim].into(),
        }
    }

    /// Replace the diagonal. Fails if any entry is not finite and positive.
    pub(crate) fn try_update(&mut self, new_variance: impl Iterator<Item = f64>) -> bool {
        let mut candidate = vec![0f64; self.variance.len()];
        let mut count = 0;
        for (out, x) in candidate.iter_mut().zip(new_variance) {
            if !x.is_finite() || x <= 0f64 {
                return false;
            }
            *out = x;
            count += 1;
        }
        if count != self.variance.len() {
            return false;
        }
        update_diag(&mut self.variance, &mut self.inv_stds, &candidate);
        true
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
fn update_diag(variance_out: &mut [f64], inv_std_out: &mut [f64], new_variance: &[f64]) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, &x)| {
        *var = x;
        *inv_std = (1. / x).sqrt();
    });
}

/// A dense covariance estimate, eigendecomposed for momentum sampling.
#[derive(Debug, Clone)]
pub struct DenseMetric {
    cov: Mat<f64>,
    vecs: Mat<f64>,
    vals_sqrt_inv: Box<[f64]>,
}

impl DenseMetric {
    pub fn new(ndim: usize) -> Self {
        Self::from_covariance(Mat::identity(ndim, ndim)).expect("Identity is positive definite")
    }

    /// Eigendecompose a covariance matrix.
    ///
    /// Returns `None` if the decomposition fails or any eigenvalue is not
    /// finite and positive, so callers can keep the previous metric.
    pub fn from_covariance(cov: Mat<f64>) -> Option<Self> {
        let eig = cov.self_adjoint_eigen(faer::Side::Lower).ok()?;
        let vals = eig.S().column_vector().to_owned();
        if vals.iter().any(|&x| !x.is_finite() || x <= 0f64) {
            return None;
        }
        let vals_sqrt_inv: Box<[f64]> = vals.iter().map(|&x| x.sqrt().recip()).collect();
        Some(Self {
            cov,
            vecs: eig.U().to_owned(),
            vals_sqrt_inv,
        })
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.cov
    }
}

/// Welford estimator for elementwise variances.
#[derive(Debug)]
pub struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.m2.iter_mut()).for_each(|(&x, mean, m2)| {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        });
    }

    /// The sample variances, or `None` with fewer than two samples.
    pub(crate) fn current(&self) -> Option<impl Iterator<Item = f64> + '_> {
        if self.count < 2 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        Some(self.m2.iter().map(move |&x| x * scale))
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Welford estimator for a full covariance matrix.
///
/// Accumulates in row major slices and only builds a faer matrix when the
/// estimate is read out.
#[derive(Debug)]
pub struct RunningCovariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    delta: Box<[f64]>,
    dim: usize,
    count: u64,
}

impl RunningCovariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim * dim].into(),
            delta: vec![0f64; dim].into(),
            dim,
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.dim);
        self.count += 1;
        let n = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.delta.iter_mut()).for_each(
            |(&x, mean, delta)| {
                *delta = x - *mean;
                *mean += *delta / n;
            },
        );
        for (i, row) in self.m2.chunks_exact_mut(self.dim).enumerate() {
            let delta_i = self.delta[i];
            izip!(row, value, self.mean.iter())
                .for_each(|(m2, &x, &mean)| *m2 += delta_i * (x - mean));
        }
    }

    /// The sample covariance, or `None` with fewer than two samples.
    pub(crate) fn current(&self) -> Option<Mat<f64>> {
        if self.count < 2 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        Some(Mat::from_fn(self.dim, self.dim, |i, j| {
            scale * self.m2[i * self.dim + j]
        }))
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Shrink a variance estimate from `n` samples toward a small diagonal.
pub(crate) fn regularize_variance(var: f64, count: u64) -> f64 {
    let n = count as f64;
    n / (n + 5.) * var + 1e-3 * (5. / (n + 5.))
}

pub(crate) fn regularize_covariance(mut cov: Mat<f64>, count: u64) -> Mat<f64> {
    let n = count as f64;
    cov *= faer::Scale(n / (n + 5.));
    let extra = 1e-3 * (5. / (n + 5.));
    cov.diagonal_mut()
        .column_vector_mut()
        .iter_mut()
        .for_each(|x| *x += extra);
    cov
}
