use itertools::izip;
use multiversion::multiversion;

/// Compute `ln(exp(a) + exp(b))` without intermediate overflow.
#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(&x, &y)| x * y).sum()
}

/// Elementwise product `out = a * b`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
pub(crate) fn multiply(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(out.len() == n);
    izip!(a, b, out).for_each(|(&x, &y, o)| *o = x * y);
}

/// In place `y += a * x`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(&x, y)| *y = a.mul_add(x, *y));
}

/// Out of place `out = y + a * x`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);
    izip!(x, y, out).for_each(|(&x, &y, out)| *out = a.mul_add(x, y));
}

/// `(dot(p1 + p2, x), dot(p1 + p2, y))` in one pass, for the turning check.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
pub(crate) fn scalar_prods2(p1: &[f64], p2: &[f64], x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = p1.len();
    assert!(p2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);
    izip!(p1, p2, x, y).fold((0., 0.), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// `(dot(p1 - n1 + p2, x), dot(p1 - n1 + p2, y))` in one pass.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse2", "aarch64+neon"))]
pub(crate) fn scalar_prods3(
    p1: &[f64],
    n1: &[f64],
    p2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = p1.len();
    assert!(n1.len() == n);
    assert!(p2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);
    izip!(p1, n1, p2, x, y).fold((0., 0.), |(s1, s2), (a, b, c, x, y)| {
        (s1 + x * (a - b + c), s2 + y * (a - b + c))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_axpy_out(a in -5f64..5f64, vals in proptest::collection::vec(-10f64..10f64, 1..20)) {
            let x = vals.clone();
            let y: Vec<f64> = vals.iter().map(|v| v + 1.).collect();
            let mut out = vec![0f64; x.len()];
            axpy_out(&x, &y, a, &mut out);
            for ((&x, &y), &out) in x.iter().zip(y.iter()).zip(out.iter()) {
                prop_assert!((out - (a * x + y)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
    }

    #[test]
    fn check_scalar_prods() {
        let a = [1., 2.];
        let b = [0.5, -1.];
        let x = [2., 3.];
        let y = [-1., 1.];
        let (s1, s2) = scalar_prods2(&a, &b, &x, &y);
        assert!((s1 - (1.5 * 2. + 1. * 3.)).abs() < 1e-12);
        assert!((s2 - (1.5 * -1. + 1. * 1.)).abs() < 1e-12);
        let (t1, t2) = scalar_prods3(&a, &b, &a, &x, &y);
        assert!((t1 - (1.5 * 2. + 5. * 3.)).abs() < 1e-12);
        assert!((t2 - (1.5 * -1. + 5. * 1.)).abs() < 1e-12);
    }
}
