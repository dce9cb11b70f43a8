//! Normal-equations least squares over an LU decomposition with partial pivoting.
//!
//! Every fitting stage in this crate (the TNX CD matrix, the TNX distortion
//! polynomials, the photometric zero-point) routes through [`solve_normal_equations`].
//! There is deliberately only one such routine.

use crate::error::Error;

const SINGULAR_EPS: f64 = 1.0e-20;

//fp solve_normal_equations
/// Solve an overdetermined linear system `basis * c ~= y` in the least-squares
/// sense, where `basis` holds `m` samples of `n` basis functions stored
/// column-major (`basis[term * m + sample]`), and `y` holds the `m` target
/// values.
///
/// Builds the `n x n` normal-equations matrix `A = basis^T * basis` and the
/// vector `Y = basis^T * y`, then solves `A * c = Y` by LU decomposition.
pub fn solve_normal_equations(m: usize, n: usize, basis: &[f64], y: &[f64]) -> Result<Vec<f64>, Error> {
    if m < n {
        return Err(Error::ModelFitFailed(format!(
            "{m} samples is fewer than {n} basis terms"
        )));
    }
    assert_eq!(basis.len(), m * n);
    assert_eq!(y.len(), m);

    let mut a = vec![0.0f64; n * n];
    let mut rhs = vec![0.0f64; n];
    for i in 0..n {
        let li = &basis[i * m..i * m + m];
        for j in 0..n {
            let rj = &basis[j * m..j * m + m];
            let mut t = 0.0;
            for k in 0..m {
                t += li[k] * rj[k];
            }
            a[i * n + j] = t;
        }
        let mut t = 0.0;
        for k in 0..m {
            t += li[k] * y[k];
        }
        rhs[i] = t;
    }

    let idx = lu_decompose(n, &mut a)?;
    lu_back_substitute(n, &a, &idx, &mut rhs);
    Ok(rhs)
}

//fp lu_decompose
/// In-place Crout LU decomposition with implicit partial pivoting and
/// row-equilibration. `a` is `n x n`, row-major. Returns the pivot index
/// array used by [`lu_back_substitute`]; `Err` if the matrix is singular
/// to working precision.
pub fn lu_decompose(n: usize, a: &mut [f64]) -> Result<Vec<usize>, Error> {
    assert_eq!(a.len(), n * n);
    let mut idx = vec![0usize; n];
    let mut scale = vec![0.0f64; n];

    for i in 0..n {
        let mut amax = 0.0f64;
        for j in 0..n {
            let v = a[i * n + j].abs();
            if v > amax {
                amax = v;
            }
        }
        if amax < SINGULAR_EPS {
            return Err(Error::ModelFitFailed("singular matrix in LU decomposition".into()));
        }
        scale[i] = 1.0 / amax;
    }

    for j in 0..n {
        for i in 0..j {
            let mut sum = a[i * n + j];
            for k in 0..i {
                sum -= a[i * n + k] * a[k * n + j];
            }
            a[i * n + j] = sum;
        }

        let mut pivot_max = 0.0f64;
        let mut pivot_row = j;
        for i in j..n {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= a[i * n + k] * a[k * n + j];
            }
            a[i * n + j] = sum;
            let dummy = scale[i] * sum.abs();
            if dummy >= pivot_max {
                pivot_max = dummy;
                pivot_row = i;
            }
        }

        if pivot_row != j {
            for k in 0..n {
                a.swap(pivot_row * n + k, j * n + k);
            }
            scale[pivot_row] = scale[j];
        }
        idx[j] = pivot_row;

        if a[j * n + j].abs() < SINGULAR_EPS {
            return Err(Error::ModelFitFailed("singular pivot in LU decomposition".into()));
        }
        if j != n - 1 {
            let pivot_inv = 1.0 / a[j * n + j];
            for i in (j + 1)..n {
                a[i * n + j] *= pivot_inv;
            }
        }
    }
    Ok(idx)
}

//fp lu_back_substitute
/// Forward/backward substitution against a decomposed matrix from
/// [`lu_decompose`]. `rhs` is replaced with the solution.
pub fn lu_back_substitute(n: usize, a: &[f64], idx: &[usize], rhs: &mut [f64]) {
    let mut ii = None;
    for i in 0..n {
        let p = idx[i];
        let mut sum = rhs[p];
        rhs[p] = rhs[i];
        if let Some(ii) = ii {
            for j in ii..i {
                sum -= a[i * n + j] * rhs[j];
            }
        } else if sum != 0.0 {
            ii = Some(i);
        }
        rhs[i] = sum;
    }
    for i in (0..n).rev() {
        let mut sum = rhs[i];
        for j in (i + 1)..n {
            sum -= a[i * n + j] * rhs[j];
        }
        rhs[i] = sum / a[i * n + i];
    }
}

//a Tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_a_perfect_line() {
        // y = 2 + 3x, sampled exactly: basis terms are [1, x]
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 + 3.0 * x).collect();
        let m = xs.len();
        let mut basis = vec![0.0; 2 * m];
        for (k, x) in xs.iter().enumerate() {
            basis[k] = 1.0;
            basis[m + k] = *x;
        }
        let c = solve_normal_equations(m, 2, &basis, &ys).unwrap();
        assert!((c[0] - 2.0).abs() < 1e-9);
        assert!((c[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_colinear_samples() {
        // Three samples, but only 2 distinct points duplicated -> singular normal matrix
        // when asked to fit more terms than independent information exists.
        let m = 3;
        let n = 3;
        let basis = vec![
            1.0, 1.0, 1.0, // term 0
            1.0, 1.0, 1.0, // term 1 (identical to term 0)
            2.0, 2.0, 2.0, // term 2
        ];
        let y = [1.0, 1.0, 1.0];
        assert!(solve_normal_equations(m, n, &basis, &y).is_err());
    }
}
