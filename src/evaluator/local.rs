use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rayon::prelude::*;

use crate::error::{EstimationError, EvaluationFailure};
use crate::evaluator::{Evaluation, Evaluator, EvaluatorConfig};
use crate::measurement::{MeasurementSeries, TargetData};
use crate::types::ParameterSet;

/// Counters describing the work an evaluator instance has performed.
#[derive(Clone, Copy, Debug, Default)]
pub struct EvaluatorStatistics {
    /// External model invocations actually launched.
    pub total_evaluations: u64,
    /// Evaluations served from the exact-match cache instead.
    pub cache_hits: u64,
    /// Batches handed to `evaluate`.
    pub batches: u64,
}

/// Evaluator running the external model as local processes.
///
/// Every evaluation gets a working directory of its own under the
/// configured exchange directory, keyed by an id that increases
/// monotonically over the lifetime of this instance, so concurrent
/// evaluations never collide. Batches execute on an owned thread pool
/// bounded by the configured concurrency; results come back in input
/// order.
pub struct LocalEvaluator {
    config: EvaluatorConfig,
    parameters: ParameterSet,
    target: TargetData,
    pool: rayon::ThreadPool,
    next_id: u64,
    cache: HashMap<Vec<u64>, Evaluation>,
    stats: EvaluatorStatistics,
}

impl LocalEvaluator {
    pub fn new(
        config: EvaluatorConfig,
        parameters: ParameterSet,
        target: TargetData,
    ) -> Result<Self, EstimationError> {
        config.validate()?;
        if parameters.is_empty() {
            return Err(EstimationError::Configuration(
                "evaluator: parameter set is empty".to_string(),
            ));
        }
        fs::create_dir_all(&config.workdir).map_err(|e| {
            EstimationError::Configuration(format!(
                "evaluator: cannot create working directory {}: {}",
                config.workdir.display(),
                e
            ))
        })?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.effective_concurrency())
            .build()
            .map_err(|e| {
                EstimationError::Configuration(format!("evaluator: cannot build worker pool: {}", e))
            })?;
        Ok(Self {
            config,
            parameters,
            target,
            pool,
            next_id: 0,
            cache: HashMap::new(),
            stats: EvaluatorStatistics::default(),
        })
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn statistics(&self) -> EvaluatorStatistics {
        self.stats
    }

    /// Drop all cached evaluations and reset the counters.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.stats = EvaluatorStatistics::default();
    }

    fn cache_key(vector: &[f64]) -> Vec<u64> {
        vector.iter().map(|v| v.to_bits()).collect()
    }

    fn evaluation_dir(&self, eval_id: u64) -> PathBuf {
        self.config.workdir.join(format!("eval_{}", eval_id))
    }

    /// Run one external invocation start to finish: working directory,
    /// parameter file, process, output file.
    fn run_one(
        &self,
        eval_id: u64,
        clamped: &[f64],
    ) -> Result<Vec<MeasurementSeries>, EvaluationFailure> {
        let dir = self.evaluation_dir(eval_id);
        // a directory with this id can only be a leftover of an interrupted run
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| EvaluationFailure::Setup(e.to_string()))?;
        }
        fs::create_dir_all(&dir).map_err(|e| EvaluationFailure::Setup(e.to_string()))?;

        let named: Vec<(String, f64)> = self
            .parameters
            .names()
            .map(str::to_string)
            .zip(clamped.iter().copied())
            .collect();
        let param_path = dir.join(self.config.parameter_format.file_name());
        self.config
            .parameter_format
            .write(&param_path, &named)
            .map_err(|e| EvaluationFailure::Setup(e.to_string()))?;

        let log_file = fs::File::create(dir.join("model_output.txt"))
            .map_err(|e| EvaluationFailure::Setup(e.to_string()))?;
        let err_file = log_file
            .try_clone()
            .map_err(|e| EvaluationFailure::Setup(e.to_string()))?;

        let start = Instant::now();
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg("--evaluation-id")
            .arg(eval_id.to_string())
            .arg("--evaluation-dir")
            .arg(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file))
            .spawn()
            .map_err(|e| EvaluationFailure::Spawn(e.to_string()))?;

        let status = match self.config.timeout {
            None => child
                .wait()
                .map_err(|e| EvaluationFailure::Spawn(e.to_string()))?,
            Some(limit) => loop {
                match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => {
                        if start.elapsed() >= limit {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(EvaluationFailure::Timeout {
                                limit_ms: limit.as_millis() as u64,
                            });
                        }
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(e) => return Err(EvaluationFailure::Spawn(e.to_string())),
                }
            },
        };
        if !status.success() {
            return Err(EvaluationFailure::ProcessExit {
                status: status.to_string(),
            });
        }

        let output_path = dir.join(self.config.output_format.file_name());
        let mut series = self
            .config
            .output_format
            .parse(&output_path, self.config.require_finished_marker)?;
        if series.len() != self.target.series_count() {
            return Err(EvaluationFailure::SeriesCountMismatch {
                expected: self.target.series_count(),
                found: series.len(),
            });
        }
        for (model_series, target_series) in series.iter_mut().zip(self.target.series()) {
            model_series.weight = target_series.weight;
        }
        debug!(
            "evaluation {} finished after {:.1}s",
            eval_id,
            start.elapsed().as_secs_f64()
        );
        Ok(series)
    }
}

impl Evaluator for LocalEvaluator {
    fn evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<Evaluation> {
        self.stats.batches += 1;

        // clamp to bounds, then split the batch into cache hits and work
        let mut hits: Vec<(usize, Evaluation)> = Vec::new();
        let mut jobs: Vec<(usize, u64, Vec<f64>)> = Vec::new();
        for (index, vector) in vectors.iter().enumerate() {
            let clamped = self.parameters.clamped(vector);
            if let Some(cached) = self.cache.get(&Self::cache_key(&clamped)) {
                debug!("evaluation served from cache (id {})", cached.eval_id);
                self.stats.cache_hits += 1;
                hits.push((index, cached.clone()));
            } else {
                let eval_id = self.next_id;
                self.next_id += 1;
                jobs.push((index, eval_id, clamped));
            }
        }
        self.stats.total_evaluations += jobs.len() as u64;

        let evaluator: &Self = self;
        let mut fresh: Vec<(usize, Evaluation)> = self.pool.install(|| {
            jobs.par_iter()
                .map(|(index, eval_id, clamped)| {
                    let outcome = evaluator.run_one(*eval_id, clamped);
                    if let Err(failure) = &outcome {
                        warn!("evaluation {} failed: {}", eval_id, failure);
                    }
                    (
                        *index,
                        Evaluation {
                            eval_id: *eval_id,
                            parameters: clamped.clone(),
                            outcome,
                        },
                    )
                })
                .collect()
        });

        for (_, evaluation) in &fresh {
            if evaluation.outcome.is_ok() {
                self.cache.insert(
                    Self::cache_key(&evaluation.parameters),
                    evaluation.clone(),
                );
            }
        }

        let mut all = hits;
        all.append(&mut fresh);
        all.sort_by_key(|entry| entry.0);
        all.into_iter().map(|(_, evaluation)| evaluation).collect()
    }

    fn parallelism(&self) -> usize {
        self.config.effective_concurrency()
    }
}
