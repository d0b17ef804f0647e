//! Maps between unconstrained sampling space and constrained parameter space.
//!
//! Each variant is a bijection from a block of unconstrained values to a
//! block of constrained values, with the exact log-absolute-determinant of
//! its Jacobian. The sampler works entirely in unconstrained space; the
//! log-Jacobian is added to the model log-density so that the unconstrained
//! density has the right mass.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Transform block {name} expects {expected} values but got {actual}")]
    BlockSize {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Simplex transforms need at least 2 components")]
    SimplexTooSmall,
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

#[inline]
fn logit(p: f64) -> f64 {
    (p / (1. - p)).ln()
}

/// A single constrained block.
///
/// The transform set is closed: the sampler only ever needs these variants,
/// so a tagged enum keeps dispatch simple and the Jacobian code local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// No constraint; the block passes through unchanged.
    Identity { len: usize },
    /// Strictly positive values via `exp`.
    Positive { len: usize },
    /// Values in (0, 1) via the logistic function.
    UnitInterval { len: usize },
    /// A probability simplex of `len` components via stick breaking.
    ///
    /// Uses `len - 1` unconstrained values.
    Simplex { len: usize },
}

impl Transform {
    pub fn unconstrained_dim(&self) -> usize {
        match *self {
            Transform::Identity { len }
            | Transform::Positive { len }
            | Transform::UnitInterval { len } => len,
            Transform::Simplex { len } => len - 1,
        }
    }

    pub fn constrained_dim(&self) -> usize {
        match *self {
            Transform::Identity { len }
            | Transform::Positive { len }
            | Transform::UnitInterval { len }
            | Transform::Simplex { len } => len,
        }
    }

    /// Map a block to constrained space, returning the log-Jacobian.
    ///
    /// Never fails for finite input; extreme inputs may under/overflow to
    /// infinite log-Jacobians, which the oracle reports as non-finite.
    fn constrain(&self, unc: &[f64], out: &mut [f64]) -> f64 {
        match *self {
            Transform::Identity { .. } => {
                out.copy_from_slice(unc);
                0.
            }
            Transform::Positive { .. } => {
                let mut logj = 0.;
                for (&u, c) in unc.iter().zip(out.iter_mut()) {
                    *c = u.exp();
                    logj += u;
                }
                logj
            }
            Transform::UnitInterval { .. } => {
                let mut logj = 0.;
                for (&u, c) in unc.iter().zip(out.iter_mut()) {
                    let p = sigmoid(u);
                    *c = p;
                    logj += p.ln() + (-u).min(0.) - (1. + (-u.abs()).exp()).ln();
                }
                logj
            }
            Transform::Simplex { len } => {
                let mut logj = 0.;
                let mut remainder = 1.;
                for (k, (&u, c)) in unc.iter().zip(out.iter_mut()).enumerate() {
                    let offset = ((len - 1 - k) as f64).ln();
                    let z = sigmoid(u - offset);
                    *c = remainder * z;
                    logj += z.ln() + (-z).ln_1p() + remainder.ln();
                    remainder *= 1. - z;
                }
                out[len - 1] = remainder;
                logj
            }
        }
    }

    /// Inverse map; the partner of [`Transform::constrain`].
    fn unconstrain(&self, cons: &[f64], out: &mut [f64]) {
        match *self {
            Transform::Identity { .. } => out.copy_from_slice(cons),
            Transform::Positive { .. } => {
                for (&c, u) in cons.iter().zip(out.iter_mut()) {
                    *u = c.ln();
                }
            }
            Transform::UnitInterval { .. } => {
                for (&c, u) in cons.iter().zip(out.iter_mut()) {
                    *u = logit(c);
                }
            }
            Transform::Simplex { len } => {
                let mut remainder = 1.;
                for k in 0..len - 1 {
                    let offset = ((len - 1 - k) as f64).ln();
                    let z = cons[k] / remainder;
                    out[k] = logit(z) + offset;
                    remainder -= cons[k];
                }
            }
        }
    }

    /// Pull a constrained-space gradient back to unconstrained space,
    /// including the gradient of the log-Jacobian.
    ///
    /// `unc` and `cons` must be a matching pair from [`Transform::constrain`].
    fn pullback(&self, unc: &[f64], cons: &[f64], grad_cons: &[f64], grad_unc: &mut [f64]) {
        match *self {
            Transform::Identity { .. } => grad_unc.copy_from_slice(grad_cons),
            Transform::Positive { .. } => {
                for ((c, g), out) in cons.iter().zip(grad_cons).zip(grad_unc.iter_mut()) {
                    *out = c * g + 1.;
                }
            }
            Transform::UnitInterval { .. } => {
                for ((c, g), out) in cons.iter().zip(grad_cons).zip(grad_unc.iter_mut()) {
                    *out = c * (1. - c) * g + 1. - 2. * c;
                }
            }
            Transform::Simplex { len } => {
                let n_unc = len - 1;
                // Recompute the stick fractions and remainders of the
                // forward pass, then sweep backwards with a suffix sum of
                // downstream sensitivities.
                let mut z = vec![0f64; n_unc];
                let mut r = vec![0f64; n_unc];
                let mut remainder = 1.;
                for k in 0..n_unc {
                    let offset = ((len - 1 - k) as f64).ln();
                    z[k] = sigmoid(unc[k] - offset);
                    r[k] = remainder;
                    remainder *= 1. - z[k];
                }
                let mut suffix = cons[len - 1] * grad_cons[len - 1];
                for k in (0..n_unc).rev() {
                    let zk = z[k];
                    grad_unc[k] = zk * (1. - zk) * r[k] * grad_cons[k] - zk * suffix + (1. - zk)
                        - ((n_unc - k) as f64) * zk;
                    suffix += cons[k] * grad_cons[k];
                }
            }
        }
    }
}

/// An ordered, named composition of [`Transform`] blocks.
///
/// The block order is fixed at construction and determines the layout of
/// both the unconstrained vector and the constrained vector.
#[derive(Debug, Clone)]
pub struct TransformSpec {
    blocks: Vec<(String, Transform)>,
    unconstrained_dim: usize,
    constrained_dim: usize,
}

impl TransformSpec {
    pub fn new(blocks: Vec<(String, Transform)>) -> Result<Self, TransformError> {
        for (_, block) in &blocks {
            if let Transform::Simplex { len } = block {
                if *len < 2 {
                    return Err(TransformError::SimplexTooSmall);
                }
            }
        }
        let unconstrained_dim = blocks.iter().map(|(_, t)| t.unconstrained_dim()).sum();
        let constrained_dim = blocks.iter().map(|(_, t)| t.constrained_dim()).sum();
        Ok(TransformSpec {
            blocks,
            unconstrained_dim,
            constrained_dim,
        })
    }

    /// A spec with a single unnamed identity block, for models that are
    /// already unconstrained.
    pub fn identity(dim: usize) -> Self {
        Self::new(vec![("x".into(), Transform::Identity { len: dim })])
            .expect("Identity spec is always valid")
    }

    /// Total unconstrained dimensionality. Fixed for the object's lifetime.
    pub fn dim(&self) -> usize {
        self.unconstrained_dim
    }

    pub fn constrained_dim(&self) -> usize {
        self.constrained_dim
    }

    pub fn blocks(&self) -> &[(String, Transform)] {
        &self.blocks
    }

    /// Flattened names of the unconstrained coordinates, in layout order.
    pub fn param_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.unconstrained_dim);
        for (name, block) in &self.blocks {
            let dim = block.unconstrained_dim();
            if dim == 1 {
                names.push(name.clone());
            } else {
                names.extend((0..dim).map(|i| format!("{}[{}]", name, i)));
            }
        }
        names
    }

    /// Map the full unconstrained vector to constrained space.
    ///
    /// Returns the summed log-Jacobian over all blocks. Deterministic and
    /// total for finite input.
    pub fn constrain(&self, unc: &[f64], out: &mut [f64]) -> f64 {
        assert!(unc.len() == self.unconstrained_dim);
        assert!(out.len() == self.constrained_dim);
        let mut logj = 0.;
        let mut u_off = 0;
        let mut c_off = 0;
        for (_, block) in &self.blocks {
            let u_dim = block.unconstrained_dim();
            let c_dim = block.constrained_dim();
            logj += block.constrain(&unc[u_off..u_off + u_dim], &mut out[c_off..c_off + c_dim]);
            u_off += u_dim;
            c_off += c_dim;
        }
        logj
    }

    /// Map a constrained vector back to unconstrained space.
    pub fn unconstrain(&self, cons: &[f64], out: &mut [f64]) {
        assert!(cons.len() == self.constrained_dim);
        assert!(out.len() == self.unconstrained_dim);
        let mut u_off = 0;
        let mut c_off = 0;
        for (_, block) in &self.blocks {
            let u_dim = block.unconstrained_dim();
            let c_dim = block.constrained_dim();
            block.unconstrain(&cons[c_off..c_off + c_dim], &mut out[u_off..u_off + u_dim]);
            u_off += u_dim;
            c_off += c_dim;
        }
    }

    /// Pull a constrained-space gradient back through every block, adding
    /// each block's log-Jacobian gradient.
    pub(crate) fn pullback(
        &self,
        unc: &[f64],
        cons: &[f64],
        grad_cons: &[f64],
        grad_unc: &mut [f64],
    ) {
        let mut u_off = 0;
        let mut c_off = 0;
        for (_, block) in &self.blocks {
            let u_dim = block.unconstrained_dim();
            let c_dim = block.constrained_dim();
            block.pullback(
                &unc[u_off..u_off + u_dim],
                &cons[c_off..c_off + c_dim],
                &grad_cons[c_off..c_off + c_dim],
                &mut grad_unc[u_off..u_off + u_dim],
            );
            u_off += u_dim;
            c_off += c_dim;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(transform: Transform, unc: &[f64]) -> Vec<f64> {
        let mut cons = vec![0f64; transform.constrained_dim()];
        let mut back = vec![0f64; transform.unconstrained_dim()];
        transform.constrain(unc, &mut cons);
        transform.unconstrain(&cons, &mut back);
        back
    }

    proptest! {
        #[test]
        fn positive_roundtrip(vals in proptest::collection::vec(-20f64..20f64, 1..10)) {
            let back = roundtrip(Transform::Positive { len: vals.len() }, &vals);
            for (&u, &b) in vals.iter().zip(back.iter()) {
                prop_assert!((u - b).abs() < 1e-8);
            }
        }

        #[test]
        fn unit_interval_roundtrip(vals in proptest::collection::vec(-15f64..15f64, 1..10)) {
            let back = roundtrip(Transform::UnitInterval { len: vals.len() }, &vals);
            for (&u, &b) in vals.iter().zip(back.iter()) {
                prop_assert!((u - b).abs() < 1e-6);
            }
        }

        #[test]
        fn simplex_roundtrip(vals in proptest::collection::vec(-5f64..5f64, 1..8)) {
            let len = vals.len() + 1;
            let transform = Transform::Simplex { len };
            let mut cons = vec![0f64; len];
            transform.constrain(&vals, &mut cons);

            let total: f64 = cons.iter().sum();
            prop_assert!((total - 1.).abs() < 1e-12);
            prop_assert!(cons.iter().all(|&x| x > 0.));

            let mut back = vec![0f64; vals.len()];
            transform.unconstrain(&cons, &mut back);
            for (&u, &b) in vals.iter().zip(back.iter()) {
                prop_assert!((u - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn spec_layout() {
        let spec = TransformSpec::new(vec![
            ("sigma".into(), Transform::Positive { len: 1 }),
            ("beta".into(), Transform::Identity { len: 2 }),
            ("theta".into(), Transform::Simplex { len: 3 }),
        ])
        .unwrap();
        assert_eq!(spec.dim(), 5);
        assert_eq!(spec.constrained_dim(), 6);
        assert_eq!(
            spec.param_names(),
            vec!["sigma", "beta[0]", "beta[1]", "theta[0]", "theta[1]"]
        );
    }

    #[test]
    fn simplex_needs_two() {
        let err = TransformSpec::new(vec![("p".into(), Transform::Simplex { len: 1 })]);
        assert!(err.is_err());
    }

    /// The pullback of a composite spec must match central differences of
    /// `f(constrain(u)) + log_jacobian(u)`.
    #[test]
    fn pullback_matches_finite_differences() {
        let spec = TransformSpec::new(vec![
            ("a".into(), Transform::Identity { len: 2 }),
            ("b".into(), Transform::Positive { len: 2 }),
            ("c".into(), Transform::UnitInterval { len: 1 }),
            ("p".into(), Transform::Simplex { len: 4 }),
        ])
        .unwrap();
        let n_unc = spec.dim();
        let n_cons = spec.constrained_dim();

        // A fixed smooth test density on constrained space.
        let weights: Vec<f64> = (0..n_cons).map(|i| 0.3 + 0.1 * i as f64).collect();
        let f = |cons: &[f64]| -> f64 {
            cons.iter()
                .zip(&weights)
                .map(|(&x, &w)| w * x - 0.5 * x * x)
                .sum()
        };
        let grad_f = |cons: &[f64], out: &mut [f64]| {
            for ((&x, &w), g) in cons.iter().zip(&weights).zip(out.iter_mut()) {
                *g = w - x;
            }
        };

        let unc: Vec<f64> = (0..n_unc).map(|i| 0.4 * (i as f64) - 1.1).collect();
        let mut cons = vec![0f64; n_cons];
        spec.constrain(&unc, &mut cons);
        let mut grad_cons = vec![0f64; n_cons];
        grad_f(&cons, &mut grad_cons);
        let mut grad_unc = vec![0f64; n_unc];
        spec.pullback(&unc, &cons, &grad_cons, &mut grad_unc);

        let eval = |unc: &[f64]| -> f64 {
            let mut cons = vec![0f64; n_cons];
            let logj = spec.constrain(unc, &mut cons);
            f(&cons) + logj
        };

        let h = 1e-6;
        for i in 0..n_unc {
            let mut hi = unc.clone();
            let mut lo = unc.clone();
            hi[i] += h;
            lo[i] -= h;
            let numeric = (eval(&hi) - eval(&lo)) / (2. * h);
            assert!(
                (numeric - grad_unc[i]).abs() < 1e-5,
                "coordinate {}: numeric {} != analytic {}",
                i,
                numeric,
                grad_unc[i]
            );
        }
    }
}
