mod jacobian;
mod linalg;
mod linesearch;

pub use jacobian::{JacobianEstimate, JacobianEstimator};
pub use linesearch::{BacktrackingLineSearch, LineSearch, LogParallelLineSearch, StepChoice};

use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::error::EstimationError;
use crate::evaluator::Evaluator;
use crate::measurement::{TargetData, residual_norm};
use crate::types::ParameterSet;

use linalg::{normal_equations, solve_normal_equations};

/// Terminal state of an estimation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// A convergence criterion was met.
    Converged,
    /// The line search found no improving step.
    Stalled,
    /// The iteration cap was reached first.
    MaxIterations,
    /// The starting point could not be evaluated.
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Converged => "converged",
            Self::Stalled => "stalled",
            Self::MaxIterations => "max iterations reached",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Scalar diagnostics of one committed iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub parameters: Vec<f64>,
    pub residual_norm: f64,
    /// Residual norm relative to the first iteration's.
    pub reduction: f64,
    /// Accepted line-search step length, if a step was taken.
    pub step_length: Option<f64>,
    /// Euclidean distance between the old and new parameter vectors.
    pub step_norm: Option<f64>,
    /// The normal-equations solve needed regularization.
    pub degenerate_solve: bool,
    /// Parameters whose Jacobian column degraded to zero this iteration.
    pub nonidentifiable: Vec<usize>,
}

/// Full optimizer state.
///
/// Replaced wholesale at every iteration boundary and committed to the
/// checkpoint store before control returns, so a crash mid-iteration can
/// never leave a partially updated state behind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizerState {
    pub iteration: u32,
    pub parameters: Vec<f64>,
    pub residual_norm: f64,
    /// Residual norm of iteration zero, the baseline for the relative
    /// reduction criterion. Carried in the state so resumed runs keep the
    /// original baseline.
    pub initial_residual_norm: f64,
    pub jacobian: Option<Vec<Vec<f64>>>,
    pub history: Vec<IterationRecord>,
}

impl OptimizerState {
    fn initial(parameters: Vec<f64>, norm: f64) -> Self {
        Self {
            iteration: 0,
            parameters,
            residual_norm: norm,
            initial_residual_norm: norm,
            jacobian: None,
            history: Vec::new(),
        }
    }
}

/// Terminal outcome plus the last committed state of a run.
#[derive(Clone, Debug)]
pub struct EstimationReport {
    pub outcome: RunOutcome,
    pub state: OptimizerState,
}

/// Gauss-Newton driver.
///
/// Each iteration estimates the Jacobian by forward differences, solves
/// the normal equations `(JᵗJ)δ = -Jᵗr` for a descent direction, hands the
/// direction to the line search, clamps the accepted point to the
/// parameter bounds and commits the successor state to the checkpoint
/// store. Resuming from a stored state reproduces the trajectory the
/// uninterrupted run would have taken.
pub struct GaussNewtonOptimizer {
    max_iterations: u32,
    epsilon: f64,
    min_reduction: f64,
    step_tolerance: f64,
    line_search: Box<dyn LineSearch>,
}

impl GaussNewtonOptimizer {
    pub fn new(line_search: Box<dyn LineSearch>) -> Self {
        Self {
            max_iterations: 15,
            epsilon: 1e-3,
            min_reduction: 1e-4,
            step_tolerance: 1e-10,
            line_search,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Relative perturbation used for finite differencing.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Converged once `residual_norm / initial_residual_norm` drops below
    /// this threshold.
    pub fn with_min_reduction(mut self, min_reduction: f64) -> Self {
        self.min_reduction = min_reduction;
        self
    }

    /// Converged once the parameter step norm drops below this threshold.
    pub fn with_step_tolerance(mut self, step_tolerance: f64) -> Self {
        self.step_tolerance = step_tolerance;
        self
    }

    /// Run the estimation to a terminal state.
    ///
    /// Starts from the most recent checkpoint in `store` if one exists,
    /// else from the parameter set's initial values. Only systemic
    /// failures (configuration, checkpoint I/O) are errors; everything
    /// else ends in a reported [`RunOutcome`] with the last valid state
    /// attached.
    pub fn run(
        &self,
        parameters: &ParameterSet,
        target: &TargetData,
        evaluator: &mut dyn Evaluator,
        store: &CheckpointStore,
    ) -> Result<EstimationReport, EstimationError> {
        if parameters.is_empty() {
            return Err(EstimationError::Configuration(
                "no parameters to estimate".to_string(),
            ));
        }
        if target.series_count() == 0 {
            return Err(EstimationError::Configuration(
                "target dataset has no series".to_string(),
            ));
        }

        // INITIALIZING: restore or start fresh, then evaluate the center
        let restored = store.load()?;
        if let Some(state) = &restored {
            if state.parameters.len() != parameters.len() {
                return Err(EstimationError::Configuration(format!(
                    "checkpoint has {} parameters, parameter set has {}",
                    state.parameters.len(),
                    parameters.len()
                )));
            }
            info!(
                "resuming from checkpoint at iteration {} ({})",
                state.iteration,
                store.path().display()
            );
        }
        let start = match &restored {
            Some(state) => state.parameters.clone(),
            None => parameters.to_vector(),
        };

        let center = evaluator.evaluate(std::slice::from_ref(&start));
        let residual = center
            .first()
            .and_then(|e| e.series())
            .and_then(|series| target.residual(series).ok());
        let Some(mut residual) = residual else {
            warn!("initial evaluation failed, cannot start the iteration");
            let state = match restored {
                Some(state) => state,
                None => OptimizerState::initial(start, f64::INFINITY),
            };
            return Ok(EstimationReport {
                outcome: RunOutcome::Failed,
                state,
            });
        };
        let mut norm = residual_norm(&residual);

        let mut state = match restored {
            Some(state) => state,
            None => {
                let state = OptimizerState::initial(start.clone(), norm);
                store.save(&state)?;
                state
            }
        };
        let first_norm = state.initial_residual_norm;
        let mut point = start;
        info!(
            "starting Gauss-Newton: {} parameters, residual norm {:e}",
            parameters.len(),
            norm
        );

        if norm == 0.0 {
            return Ok(EstimationReport {
                outcome: RunOutcome::Converged,
                state,
            });
        }

        let estimator = JacobianEstimator::new(self.epsilon);

        // ITERATING
        while state.iteration < self.max_iterations {
            let iteration = state.iteration + 1;

            let jacobian = estimator.estimate(&point, &residual, evaluator, target);
            let (jtj, jtr) = normal_equations(&jacobian.matrix, &residual);
            let rhs: Vec<f64> = jtr.iter().map(|v| -v).collect();
            let (delta, degenerate) = solve_normal_equations(&jtj, &rhs);
            if degenerate {
                warn!(
                    "[{}] normal equations rank deficient, using regularized solve",
                    iteration
                );
            }

            let choice =
                self.line_search
                    .choose_step(&point, &delta, norm, evaluator, target);

            let Some(choice) = choice else {
                info!(
                    "[{}] {} line search found no improving step, run stalled",
                    iteration,
                    self.line_search.name()
                );
                let record = IterationRecord {
                    iteration,
                    parameters: point.clone(),
                    residual_norm: norm,
                    reduction: norm / first_norm,
                    step_length: None,
                    step_norm: None,
                    degenerate_solve: degenerate,
                    nonidentifiable: jacobian.failed_columns,
                };
                let mut history = state.history;
                history.push(record);
                let state = OptimizerState {
                    iteration,
                    parameters: point,
                    residual_norm: norm,
                    initial_residual_norm: first_norm,
                    jacobian: Some(jacobian.matrix),
                    history,
                };
                store.save(&state)?;
                return Ok(EstimationReport {
                    outcome: RunOutcome::Stalled,
                    state,
                });
            };

            let mut new_point = choice.point;
            parameters.clamp(&mut new_point);
            let step_norm = point
                .iter()
                .zip(&new_point)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            let new_norm = choice.residual_norm;
            let reduction = new_norm / first_norm;
            info!(
                "[{}] x = {:?}, residual norm {:e} (alpha {:.4}, reduction {:e})",
                iteration, new_point, new_norm, choice.alpha, reduction
            );

            let record = IterationRecord {
                iteration,
                parameters: new_point.clone(),
                residual_norm: new_norm,
                reduction,
                step_length: Some(choice.alpha),
                step_norm: Some(step_norm),
                degenerate_solve: degenerate,
                nonidentifiable: jacobian.failed_columns,
            };
            let mut history = state.history;
            history.push(record);
            // only a fully computed successor state is committed
            state = OptimizerState {
                iteration,
                parameters: new_point.clone(),
                residual_norm: new_norm,
                initial_residual_norm: first_norm,
                jacobian: Some(jacobian.matrix),
                history,
            };
            store.save(&state)?;

            point = new_point;
            residual = choice.residual;
            norm = new_norm;

            if reduction < self.min_reduction {
                info!("[{}] converged: relative reduction {:e}", iteration, reduction);
                return Ok(EstimationReport {
                    outcome: RunOutcome::Converged,
                    state,
                });
            }
            if step_norm < self.step_tolerance {
                info!("[{}] converged: step norm {:e}", iteration, step_norm);
                return Ok(EstimationReport {
                    outcome: RunOutcome::Converged,
                    state,
                });
            }
        }

        info!("iteration cap of {} reached", self.max_iterations);
        Ok(EstimationReport {
            outcome: RunOutcome::MaxIterations,
            state,
        })
    }
}
