mod adapters;
mod local;

pub use adapters::{OutputFormat, ParameterFormat};
pub use local::{EvaluatorStatistics, LocalEvaluator};

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EstimationError, EvaluationFailure};
use crate::measurement::MeasurementSeries;

/// Output of one black-box call for one parameter vector.
///
/// A failed call is a value, not an error: the failure is attached here and
/// the rest of the batch is unaffected.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Monotonically increasing id assigned by the evaluator instance.
    pub eval_id: u64,
    /// The (clamped) parameter vector this result belongs to.
    pub parameters: Vec<f64>,
    /// Model output series aligned positionally with the target's series,
    /// or the reason this evaluation produced none.
    pub outcome: Result<Vec<MeasurementSeries>, EvaluationFailure>,
}

impl Evaluation {
    pub fn is_failed(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn series(&self) -> Option<&[MeasurementSeries]> {
        self.outcome.as_deref().ok()
    }

    pub fn failure(&self) -> Option<&EvaluationFailure> {
        self.outcome.as_ref().err()
    }
}

/// The black-box abstraction: maps parameter vectors to model outputs.
pub trait Evaluator {
    /// Evaluate a batch of parameter vectors, possibly concurrently up to
    /// [`parallelism`](Evaluator::parallelism) simultaneous invocations.
    ///
    /// Returns one result per input vector, in input order regardless of
    /// completion order, so callers may index into the batch directly.
    fn evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<Evaluation>;

    /// Maximum number of simultaneous external invocations.
    fn parallelism(&self) -> usize {
        1
    }
}

/// Configuration of a [`LocalEvaluator`], validated once at construction.
#[derive(Clone, Debug)]
pub struct EvaluatorConfig {
    /// Model executable to invoke for every evaluation.
    pub command: String,
    /// Fixed command-line arguments passed before the per-evaluation ones.
    pub args: Vec<String>,
    /// Exchange directory; each evaluation gets its own subdirectory.
    pub workdir: PathBuf,
    /// Maximum simultaneous model processes. 0 selects the CPU count.
    pub concurrency: usize,
    /// Wall-clock limit per evaluation; the process is killed on expiry.
    pub timeout: Option<Duration>,
    /// Format of the parameter file the model reads.
    pub parameter_format: ParameterFormat,
    /// Format of the measurement file the model writes.
    pub output_format: OutputFormat,
    /// Treat a tabular output file without the trailing `FINISHED` marker
    /// as an unfinished run.
    pub require_finished_marker: bool,
}

impl EvaluatorConfig {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            concurrency: 0,
            timeout: None,
            parameter_format: ParameterFormat::KeyValue,
            output_format: OutputFormat::Csv,
            require_finished_marker: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameter_format(mut self, format: ParameterFormat) -> Self {
        self.parameter_format = format;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn require_finished_marker(mut self) -> Self {
        self.require_finished_marker = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), EstimationError> {
        if self.command.trim().is_empty() {
            return Err(EstimationError::Configuration(
                "evaluator: model command is empty".to_string(),
            ));
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(EstimationError::Configuration(
                "evaluator: working directory is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            num_cpus::get().max(1)
        } else {
            self.concurrency
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Evaluation, Evaluator};
    use crate::error::EvaluationFailure;
    use crate::measurement::MeasurementSeries;

    /// In-process evaluator backed by a closure, for exercising the
    /// numeric layers without spawning processes.
    pub(crate) struct FnEvaluator<F>
    where
        F: Fn(&[f64]) -> Result<Vec<MeasurementSeries>, EvaluationFailure>,
    {
        model: F,
        next_id: u64,
    }

    impl<F> FnEvaluator<F>
    where
        F: Fn(&[f64]) -> Result<Vec<MeasurementSeries>, EvaluationFailure>,
    {
        pub(crate) fn new(model: F) -> Self {
            Self { model, next_id: 0 }
        }
    }

    impl<F> Evaluator for FnEvaluator<F>
    where
        F: Fn(&[f64]) -> Result<Vec<MeasurementSeries>, EvaluationFailure>,
    {
        fn evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<Evaluation> {
            vectors
                .iter()
                .map(|v| {
                    let eval_id = self.next_id;
                    self.next_id += 1;
                    Evaluation {
                        eval_id,
                        parameters: v.clone(),
                        outcome: (self.model)(v),
                    }
                })
                .collect()
        }
    }
}
