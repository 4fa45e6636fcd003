//! End-to-end Gauss-Newton runs against an in-process linear model.

use std::path::PathBuf;

use simfit::{
    CheckpointStore, Evaluation, Evaluator, EvaluationFailure, GaussNewtonOptimizer,
    LogParallelLineSearch, MeasurementSeries, ParameterSet, RunOutcome, TargetData,
};

/// In-process stand-in for the external model: y(t) = a * t + b sampled on
/// a fixed grid, plus a configurable failure predicate.
struct LinearModel {
    times: Vec<f64>,
    next_id: u64,
    fail_when: Option<Box<dyn Fn(&[f64]) -> bool>>,
}

impl LinearModel {
    fn new() -> Self {
        Self {
            times: (0..5).map(|i| i as f64 * 0.25).collect(),
            next_id: 0,
            fail_when: None,
        }
    }

    fn failing_when(mut self, predicate: impl Fn(&[f64]) -> bool + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    fn outputs(&self, params: &[f64]) -> Vec<MeasurementSeries> {
        let values: Vec<f64> = self.times.iter().map(|t| params[0] * t + params[1]).collect();
        vec![MeasurementSeries::new(self.times.clone(), values)]
    }
}

impl Evaluator for LinearModel {
    fn evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<Evaluation> {
        vectors
            .iter()
            .map(|v| {
                let eval_id = self.next_id;
                self.next_id += 1;
                let failed = self.fail_when.as_ref().is_some_and(|f| f(v));
                Evaluation {
                    eval_id,
                    parameters: v.clone(),
                    outcome: if failed {
                        Err(EvaluationFailure::ProcessExit {
                            status: "exit status: 1".to_string(),
                        })
                    } else {
                        Ok(self.outputs(v))
                    },
                }
            })
            .collect()
    }
}

fn linear_target() -> TargetData {
    // target generated from the known parameters a = 2, b = -1
    let mut model = LinearModel::new();
    let series = model.evaluate(&[vec![2.0, -1.0]]).remove(0).outcome.unwrap();
    TargetData::new(series)
}

fn scratch_store(name: &str) -> CheckpointStore {
    let dir: PathBuf =
        std::env::temp_dir().join(format!("simfit_estimation_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = CheckpointStore::new(dir.join(name));
    store.clear().unwrap();
    store
}

fn perturbed_start() -> ParameterSet {
    let mut params = ParameterSet::new();
    params.add("slope", 1.4).unwrap();
    params.add("offset", -0.3).unwrap();
    params
}

#[test]
fn recovers_known_parameters_of_a_linear_model() {
    let params = perturbed_start();
    let target = linear_target();
    let mut evaluator = LinearModel::new();
    let store = scratch_store("linear.json");

    let optimizer = GaussNewtonOptimizer::new(Box::new(LogParallelLineSearch::new()))
        .with_max_iterations(10)
        .with_min_reduction(1e-10);
    let report = optimizer
        .run(&params, &target, &mut evaluator, &store)
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Converged);
    assert!(report.state.iteration <= 10);
    assert!((report.state.parameters[0] - 2.0).abs() < 1e-3);
    assert!((report.state.parameters[1] + 1.0).abs() < 1e-3);
    assert!(!report.state.history.is_empty());
}

#[test]
fn batch_with_one_failing_vector_keeps_the_rest() {
    let mut evaluator =
        LinearModel::new().failing_when(|v| v[0] == 5.0);
    let batch = vec![vec![1.0, 0.0], vec![5.0, 0.0], vec![2.0, 0.0]];
    let results = evaluator.evaluate(&batch);

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].parameters, vec![1.0, 0.0]);
    assert_eq!(results[1].parameters, vec![5.0, 0.0]);
    assert_eq!(results[2].parameters, vec![2.0, 0.0]);
    assert!(!results[0].is_failed());
    assert!(results[1].is_failed());
    assert!(!results[2].is_failed());
}

#[test]
fn failed_initial_evaluation_ends_in_failed_outcome() {
    let params = perturbed_start();
    let target = linear_target();
    let mut evaluator = LinearModel::new().failing_when(|_| true);
    let store = scratch_store("failing.json");

    let optimizer = GaussNewtonOptimizer::new(Box::new(LogParallelLineSearch::new()));
    let report = optimizer
        .run(&params, &target, &mut evaluator, &store)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed);
}

/// Exponential decay y(t) = b * exp(-a * t); needs several Gauss-Newton
/// iterations, so a run can be interrupted partway through.
struct DecayModel {
    times: Vec<f64>,
    next_id: u64,
}

impl DecayModel {
    fn new() -> Self {
        Self {
            times: (0..6).map(|i| i as f64 * 0.2).collect(),
            next_id: 0,
        }
    }
}

impl Evaluator for DecayModel {
    fn evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<Evaluation> {
        vectors
            .iter()
            .map(|v| {
                let eval_id = self.next_id;
                self.next_id += 1;
                let values: Vec<f64> =
                    self.times.iter().map(|t| v[1] * (-v[0] * t).exp()).collect();
                Evaluation {
                    eval_id,
                    parameters: v.clone(),
                    outcome: Ok(vec![MeasurementSeries::new(self.times.clone(), values)]),
                }
            })
            .collect()
    }
}

#[test]
fn resumed_run_reaches_the_same_parameters() {
    let mut params = ParameterSet::new();
    params.add("rate", 1.1).unwrap();
    params.add("amplitude", 2.6).unwrap();

    // target generated at the known parameters rate = 1.5, amplitude = 2.0
    let mut model = DecayModel::new();
    let target = TargetData::new(model.evaluate(&[vec![1.5, 2.0]]).remove(0).outcome.unwrap());

    // uninterrupted reference run
    let reference_store = scratch_store("reference.json");
    let mut evaluator = DecayModel::new();
    let full = GaussNewtonOptimizer::new(Box::new(LogParallelLineSearch::new()))
        .with_max_iterations(8)
        .with_min_reduction(1e-12)
        .run(&params, &target, &mut evaluator, &reference_store)
        .unwrap();

    // same run interrupted after two iterations, then resumed
    let resumable_store = scratch_store("resumable.json");
    let mut evaluator = DecayModel::new();
    let partial = GaussNewtonOptimizer::new(Box::new(LogParallelLineSearch::new()))
        .with_max_iterations(2)
        .with_min_reduction(1e-12)
        .run(&params, &target, &mut evaluator, &resumable_store)
        .unwrap();
    assert_eq!(partial.outcome, RunOutcome::MaxIterations);
    assert_eq!(partial.state.iteration, 2);

    let mut evaluator = DecayModel::new();
    let resumed = GaussNewtonOptimizer::new(Box::new(LogParallelLineSearch::new()))
        .with_max_iterations(8)
        .with_min_reduction(1e-12)
        .run(&params, &target, &mut evaluator, &resumable_store)
        .unwrap();

    assert_eq!(resumed.outcome, full.outcome);
    assert_eq!(resumed.state.iteration, full.state.iteration);
    for (a, b) in resumed
        .state
        .parameters
        .iter()
        .zip(&full.state.parameters)
    {
        assert!((a - b).abs() < 1e-9, "resumed {} vs full {}", a, b);
    }
    // the resumed history continues the stored one
    assert_eq!(resumed.state.history.len(), full.state.history.len());
    assert_eq!(
        resumed.state.initial_residual_norm,
        full.state.initial_residual_norm
    );
}

#[test]
fn stalls_when_the_model_cannot_improve() {
    // model ignores its parameters entirely: the Jacobian is zero, the
    // solve degenerates to a zero step and the line search cannot improve
    let times: Vec<f64> = (0..3).map(|i| i as f64).collect();
    let target = TargetData::new(vec![MeasurementSeries::new(
        times.clone(),
        vec![1.0, 1.0, 1.0],
    )]);

    struct ConstantModel {
        times: Vec<f64>,
        next_id: u64,
    }
    impl Evaluator for ConstantModel {
        fn evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<Evaluation> {
            vectors
                .iter()
                .map(|v| {
                    let eval_id = self.next_id;
                    self.next_id += 1;
                    Evaluation {
                        eval_id,
                        parameters: v.clone(),
                        outcome: Ok(vec![MeasurementSeries::new(
                            self.times.clone(),
                            vec![0.0, 0.0, 0.0],
                        )]),
                    }
                })
                .collect()
        }
    }

    let mut params = ParameterSet::new();
    params.add("unused", 1.0).unwrap();
    let store = scratch_store("stall.json");
    let mut evaluator = ConstantModel {
        times,
        next_id: 0,
    };

    let report = GaussNewtonOptimizer::new(Box::new(LogParallelLineSearch::new()))
        .run(&params, &target, &mut evaluator, &store)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Stalled);
    let last = report.state.history.last().unwrap();
    assert!(last.degenerate_solve);
    assert!(last.step_length.is_none());
}
