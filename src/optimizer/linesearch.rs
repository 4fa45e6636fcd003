use log::debug;

use crate::evaluator::Evaluator;
use crate::measurement::{TargetData, residual_norm};

/// An accepted line-search step.
#[derive(Clone, Debug)]
pub struct StepChoice {
    /// Step length along the descent direction.
    pub alpha: f64,
    /// `center + alpha * direction`, before bound clamping by the caller.
    pub point: Vec<f64>,
    /// Weighted residual at the accepted point.
    pub residual: Vec<f64>,
    pub residual_norm: f64,
}

/// Step-length selection along a descent direction.
///
/// Implementations evaluate trial points through the shared evaluator and
/// return `None` when no candidate improves on the center point. The
/// optimizer treats that as a stall, not an error.
pub trait LineSearch {
    fn name(&self) -> &str;

    fn choose_step(
        &self,
        center: &[f64],
        direction: &[f64],
        center_norm: f64,
        evaluator: &mut dyn Evaluator,
        target: &TargetData,
    ) -> Option<StepChoice>;
}

/// Pick the candidate with the lowest residual norm. Exact ties go to the
/// later entry, which corresponds to the larger step length.
pub(crate) fn pick_best(norms: &[Option<f64>]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, norm) in norms.iter().enumerate() {
        let Some(norm) = norm else { continue };
        if norm.is_nan() {
            continue;
        }
        match best {
            Some((_, best_norm)) if *norm > best_norm => {}
            _ => best = Some((index, *norm)),
        }
    }
    best
}

/// Parallel line search over geometrically spaced step lengths.
///
/// All candidates, from `2^-window` up to the full Gauss-Newton step
/// `alpha = 1`, are evaluated in one concurrent batch; the one with the
/// lowest weighted residual norm wins. If every candidate evaluation
/// errors, the window is shifted toward smaller steps and retried up to
/// `max_rounds` times.
#[derive(Clone, Copy, Debug)]
pub struct LogParallelLineSearch {
    candidates: usize,
    window: u32,
    max_rounds: u32,
}

impl Default for LogParallelLineSearch {
    fn default() -> Self {
        Self {
            candidates: 10,
            window: 5,
            max_rounds: 2,
        }
    }
}

impl LogParallelLineSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates.max(2);
        self
    }

    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    fn alphas(&self, highest_power: i32) -> Vec<f64> {
        (0..self.candidates)
            .map(|k| {
                let t = k as f64 / (self.candidates - 1) as f64;
                let exponent = highest_power as f64 - self.window as f64 * (1.0 - t);
                2f64.powf(exponent)
            })
            .collect()
    }
}

impl LineSearch for LogParallelLineSearch {
    fn name(&self) -> &str {
        "log-parallel"
    }

    fn choose_step(
        &self,
        center: &[f64],
        direction: &[f64],
        center_norm: f64,
        evaluator: &mut dyn Evaluator,
        target: &TargetData,
    ) -> Option<StepChoice> {
        let mut highest_power: i32 = 0;
        for round in 0..self.max_rounds {
            let alphas = self.alphas(highest_power);
            let points: Vec<Vec<f64>> = alphas
                .iter()
                .map(|alpha| {
                    center
                        .iter()
                        .zip(direction)
                        .map(|(c, d)| c + alpha * d)
                        .collect()
                })
                .collect();

            let evaluations = evaluator.evaluate(&points);
            let mut residuals: Vec<Option<Vec<f64>>> = Vec::with_capacity(evaluations.len());
            let mut norms: Vec<Option<f64>> = Vec::with_capacity(evaluations.len());
            for (alpha, evaluation) in alphas.iter().zip(&evaluations) {
                let residual = evaluation
                    .series()
                    .and_then(|series| target.residual(series).ok());
                match &residual {
                    Some(r) => {
                        let norm = residual_norm(r);
                        debug!("  alpha {:.5} -> residual norm {:e}", alpha, norm);
                        norms.push(Some(norm));
                    }
                    None => {
                        debug!("  alpha {:.5} -> evaluation {} failed", alpha, evaluation.eval_id);
                        norms.push(None);
                    }
                }
                residuals.push(residual);
            }

            if norms.iter().all(Option::is_none) {
                debug!(
                    "line search round {}: no candidate finished, shifting window down",
                    round + 1
                );
                highest_power -= self.window as i32;
                continue;
            }

            let (best, best_norm) = pick_best(&norms)?;
            if best_norm < center_norm {
                let residual = residuals.swap_remove(best)?;
                let point = points.into_iter().nth(best)?;
                return Some(StepChoice {
                    alpha: alphas[best],
                    point,
                    residual,
                    residual_norm: best_norm,
                });
            }
            // candidates finished but none beats the center
            return None;
        }
        None
    }
}

/// Serial backtracking line search.
///
/// Starts at the full step and halves until the residual norm drops below
/// the center's, one evaluation at a time. Cheaper per round than the
/// parallel search but wastes the evaluator's concurrency.
#[derive(Clone, Copy, Debug)]
pub struct BacktrackingLineSearch {
    shrink: f64,
    max_steps: u32,
}

impl Default for BacktrackingLineSearch {
    fn default() -> Self {
        Self {
            shrink: 0.5,
            max_steps: 15,
        }
    }
}

impl BacktrackingLineSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shrink(mut self, shrink: f64) -> Self {
        self.shrink = shrink.clamp(0.1, 0.9);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }
}

impl LineSearch for BacktrackingLineSearch {
    fn name(&self) -> &str {
        "backtracking"
    }

    fn choose_step(
        &self,
        center: &[f64],
        direction: &[f64],
        center_norm: f64,
        evaluator: &mut dyn Evaluator,
        target: &TargetData,
    ) -> Option<StepChoice> {
        let mut alpha = 1.0;
        for _ in 0..self.max_steps {
            let point: Vec<f64> = center
                .iter()
                .zip(direction)
                .map(|(c, d)| c + alpha * d)
                .collect();
            let evaluations = evaluator.evaluate(std::slice::from_ref(&point));
            let residual = evaluations
                .first()
                .and_then(|e| e.series())
                .and_then(|series| target.residual(series).ok());
            if let Some(residual) = residual {
                let norm = residual_norm(&residual);
                debug!("  alpha {:.5} -> residual norm {:e}", alpha, norm);
                if norm < center_norm {
                    return Some(StepChoice {
                        alpha,
                        point,
                        residual,
                        residual_norm: norm,
                    });
                }
            }
            alpha *= self.shrink;
        }
        None
    }
}
