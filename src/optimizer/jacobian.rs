use log::warn;

use crate::evaluator::Evaluator;
use crate::measurement::TargetData;

/// Forward-difference estimate of the residual sensitivity matrix.
#[derive(Clone, Debug)]
pub struct JacobianEstimate {
    /// Row-major, one row per flattened residual component, one column per
    /// parameter.
    pub matrix: Vec<Vec<f64>>,
    /// Parameters whose perturbed evaluation failed this iteration; their
    /// columns are zero.
    pub failed_columns: Vec<usize>,
}

/// Estimates the Jacobian of the weighted residual by forward differences.
///
/// Forward differencing halves the number of model runs per iteration
/// compared to central differences; Gauss-Newton only needs a descent
/// direction, so first-order accuracy is enough.
#[derive(Clone, Copy, Debug)]
pub struct JacobianEstimator {
    epsilon: f64,
}

impl JacobianEstimator {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Estimate the Jacobian at `center`.
    ///
    /// All perturbed vectors go through one batched evaluator call; the
    /// center evaluation is reused from the caller as `center_residual`.
    /// Each parameter is perturbed relatively (`center[i] * epsilon`, or
    /// `epsilon` where the component is zero).
    pub fn estimate(
        &self,
        center: &[f64],
        center_residual: &[f64],
        evaluator: &mut dyn Evaluator,
        target: &TargetData,
    ) -> JacobianEstimate {
        let n = center.len();
        let m = center_residual.len();

        let mut deltas = Vec::with_capacity(n);
        let mut points = Vec::with_capacity(n);
        for i in 0..n {
            let delta = if center[i] == 0.0 {
                self.epsilon
            } else {
                center[i] * self.epsilon
            };
            let mut point = center.to_vec();
            point[i] += delta;
            deltas.push(delta);
            points.push(point);
        }

        let evaluations = evaluator.evaluate(&points);

        let mut matrix = vec![vec![0.0; n]; m];
        let mut failed_columns = Vec::new();
        for (i, evaluation) in evaluations.iter().enumerate() {
            let residual = evaluation
                .series()
                .and_then(|series| target.residual(series).ok());
            match residual {
                Some(perturbed) if perturbed.len() == m => {
                    for row in 0..m {
                        matrix[row][i] = (perturbed[row] - center_residual[row]) / deltas[i];
                    }
                }
                _ => {
                    warn!(
                        "parameter {} not identifiable this iteration, perturbed evaluation {} failed{}",
                        i,
                        evaluation.eval_id,
                        evaluation
                            .failure()
                            .map(|f| format!(": {}", f))
                            .unwrap_or_default()
                    );
                    failed_columns.push(i);
                }
            }
        }
        JacobianEstimate {
            matrix,
            failed_columns,
        }
    }
}
