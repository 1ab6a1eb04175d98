use itertools::izip;

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

/// Returns `(sum((p1 + p2) * x), sum((p1 + p2) * y))`.
pub(crate) fn scalar_prods2(positive1: &[f64], positive2: &[f64], x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0., 0.), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// Returns `(sum((p1 - n1 + p2) * x), sum((p1 - n1 + p2) * y))`.
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(negative1.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold((0., 0.), |(s1, s2), (a, b, c, x, y)| {
        (s1 + x * (a - b + c), s2 + y * (a - b + c))
    })
}

pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());
    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a * x + y;
    });
}

pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

/// Size of an array with the given shape. Scalars have shape `[]`.
pub(crate) fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Output length of an elementwise operation, where length one broadcasts.
pub(crate) fn broadcast_len(a: usize, b: usize) -> Option<usize> {
    match (a, b) {
        (a, b) if a == b => Some(a),
        (1, b) => Some(b),
        (a, 1) => Some(a),
        _ => None,
    }
}

#[inline]
pub(crate) fn bcast(values: &[f64], i: usize) -> f64 {
    if values.len() == 1 {
        values[0]
    } else {
        values[i]
    }
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
        fn check_scalar_prods(vals in prop::collection::vec(-10f64..10f64, 1..20)) {
            let n = vals.len();
            let ones = vec![1f64; n];
            let zeros = vec![0f64; n];
            let (a, b) = scalar_prods2(&vals, &zeros, &ones, &vals);
            prop_assert!((a - vals.iter().sum::<f64>()).abs() < 1e-8);
            prop_assert!((b - vector_dot(&vals, &vals)).abs() < 1e-8);

            let (c, d) = scalar_prods3(&vals, &vals, &ones, &ones, &vals);
            prop_assert!((c - n as f64).abs() < 1e-8);
            prop_assert!((d - vals.iter().sum::<f64>()).abs() < 1e-8);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
    }

    #[test]
    fn axpy_variants() {
        let x = [1., 2., 3.];
        let mut y = [1., 1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5., 7.]);

        let mut out = [0.; 3];
        axpy_out(&x, &y, -1., &mut out);
        assert_eq!(out, [2., 3., 4.]);

        multiply(&x, &x, &mut out);
        assert_eq!(out, [1., 4., 9.]);
    }

    #[test]
    fn broadcasting() {
        assert_eq!(broadcast_len(1, 5), Some(5));
        assert_eq!(broadcast_len(5, 1), Some(5));
        assert_eq!(broadcast_len(4, 4), Some(4));
        assert_eq!(broadcast_len(3, 4), None);
        assert_eq!(shape_size(&[]), 1);
        assert_eq!(shape_size(&[2, 3]), 6);
        assert_eq!(bcast(&[2.], 7), 2.);
    }
}
