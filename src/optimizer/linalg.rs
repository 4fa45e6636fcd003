//! Dense helpers for the normal-equations solve.

/// Assemble `JᵗJ` and `Jᵗr` from a row-major Jacobian.
pub(crate) fn normal_equations(
    jacobian: &[Vec<f64>],
    residual: &[f64],
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let m = jacobian.len();
    let n = if m == 0 { 0 } else { jacobian[0].len() };
    let mut jtj = vec![vec![0.0; n]; n];
    let mut jtr = vec![0.0; n];
    for i in 0..n {
        for k in 0..n {
            for row in 0..m {
                jtj[i][k] += jacobian[row][i] * jacobian[row][k];
            }
        }
        for row in 0..m {
            jtr[i] += jacobian[row][i] * residual[row];
        }
    }
    (jtj, jtr)
}

/// Gaussian elimination with partial pivoting. `None` when a pivot
/// vanishes relative to the matrix scale.
pub(crate) fn solve_dense(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    if n == 0 {
        return Some(Vec::new());
    }
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let pivot_floor = scale * 1e-12;

    let mut aug: Vec<Vec<f64>> = a
        .iter()
        .zip(b)
        .map(|(row, rhs)| {
            let mut extended = row.clone();
            extended.push(*rhs);
            extended
        })
        .collect();

    for i in 0..n {
        let mut max_row = i;
        for k in (i + 1)..n {
            if aug[k][i].abs() > aug[max_row][i].abs() {
                max_row = k;
            }
        }
        aug.swap(i, max_row);

        if aug[i][i].abs() < pivot_floor {
            return None;
        }

        for k in (i + 1)..n {
            let factor = aug[k][i] / aug[i][i];
            for j in i..=n {
                aug[k][j] -= factor * aug[i][j];
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        x[i] = aug[i][n];
        for j in (i + 1)..n {
            x[i] -= aug[i][j] * x[j];
        }
        x[i] /= aug[i][i];
    }
    Some(x)
}

/// Solve the normal equations, falling back to a Tikhonov-regularized
/// system when `JᵗJ` is rank deficient.
///
/// Returns the step and whether regularization was needed. A parameter
/// that is locally non-identifiable must not crash the solve; a wholly
/// degenerate system yields a zero step, which the line search downstream
/// reports as a stall.
pub(crate) fn solve_normal_equations(jtj: &[Vec<f64>], rhs: &[f64]) -> (Vec<f64>, bool) {
    if let Some(step) = solve_dense(jtj, rhs) {
        return (step, false);
    }
    let diag_scale = (0..rhs.len())
        .map(|i| jtj[i][i].abs())
        .fold(0.0f64, f64::max)
        .max(1.0);
    for exponent in [-10, -8, -6, -4, -2] {
        let ridge = diag_scale * 10f64.powi(exponent);
        let mut damped = jtj.to_vec();
        for (i, row) in damped.iter_mut().enumerate() {
            row[i] += ridge;
        }
        if let Some(step) = solve_dense(&damped, rhs) {
            return (step, true);
        }
    }
    (vec![0.0; rhs.len()], true)
}
