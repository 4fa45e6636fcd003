use std::fs;
use std::path::Path;

use crate::error::{EstimationError, EvaluationFailure};

/// One measurement series: samples of a single output channel over the
/// independent variable (usually simulation time), plus the weight applied
/// to this series when the residual is assembled.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementSeries {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
    pub weight: f64,
}

impl MeasurementSeries {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Self {
        Self {
            times,
            values,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Linearly interpolate this series onto the given sample times.
    ///
    /// Adaptive step control makes the model's time grid drift from the
    /// target's, so samples rarely line up exactly. Outside the covered
    /// range the edge value is held.
    pub(crate) fn sample_at(&self, times: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(times.len());
        for &t in times {
            out.push(self.value_at(t));
        }
        out
    }

    fn value_at(&self, t: f64) -> f64 {
        let n = self.times.len();
        if t <= self.times[0] {
            return self.values[0];
        }
        if t >= self.times[n - 1] {
            return self.values[n - 1];
        }
        let mut hi = 1;
        while self.times[hi] < t {
            hi += 1;
        }
        let (t0, t1) = (self.times[hi - 1], self.times[hi]);
        let (v0, v1) = (self.values[hi - 1], self.values[hi]);
        if t1 == t0 {
            return v1;
        }
        let fraction = (t - t0) / (t1 - t0);
        v0 + fraction * (v1 - v0)
    }
}

/// Result of parsing one tabular measurement file.
pub(crate) struct ParsedTable {
    pub series: Vec<MeasurementSeries>,
    pub finished: bool,
}

/// Parse the tabular `(step, time, value)` format.
///
/// Comment lines (`#`) are skipped, header rows may repeat anywhere in the
/// file, and a trailing `FINISHED` row marks a complete run. A decrease in
/// `step` or `time` relative to the previous row starts a new series.
pub(crate) fn parse_table(text: &str) -> Result<ParsedTable, String> {
    let mut series = Vec::new();
    let mut times: Vec<f64> = Vec::new();
    let mut values: Vec<f64> = Vec::new();
    let mut prev_step = f64::NEG_INFINITY;
    let mut prev_time = f64::NEG_INFINITY;
    let mut finished = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields[0].eq_ignore_ascii_case("finished") {
            finished = true;
            break;
        }
        if fields.len() < 3 {
            return Err(format!("expected 3 columns, got {}: '{}'", fields.len(), line));
        }
        let parsed: Result<Vec<f64>, _> = fields[..3].iter().map(|f| f.parse::<f64>()).collect();
        let row = match parsed {
            Ok(row) => row,
            Err(_) => {
                let lower = line.to_ascii_lowercase();
                if lower.contains("step") || lower.contains("time") || lower.contains("value") {
                    // header row, may repeat when several writers share a file
                    continue;
                }
                return Err(format!("non-numeric row: '{}'", line));
            }
        };
        let (step, time, value) = (row[0], row[1], row[2]);
        if !times.is_empty() && (step < prev_step || time < prev_time) {
            series.push(MeasurementSeries::new(
                std::mem::take(&mut times),
                std::mem::take(&mut values),
            ));
        }
        times.push(time);
        values.push(value);
        prev_step = step;
        prev_time = time;
    }
    if !times.is_empty() {
        series.push(MeasurementSeries::new(times, values));
    }
    Ok(ParsedTable { series, finished })
}

/// The calibration target: one weighted series per model output channel,
/// in model output order.
///
/// Constructed once before the optimization starts and immutable after.
#[derive(Clone, Debug, Default)]
pub struct TargetData {
    series: Vec<MeasurementSeries>,
}

impl TargetData {
    pub fn new(series: Vec<MeasurementSeries>) -> Self {
        Self { series }
    }

    /// Ingest a target dataset from the tabular format. A real measurement
    /// file and a simulated output file are structurally interchangeable.
    pub fn from_csv_str(text: &str) -> Result<Self, EstimationError> {
        let parsed = parse_table(text)
            .map_err(|e| EstimationError::Configuration(format!("target dataset: {}", e)))?;
        if parsed.series.is_empty() {
            return Err(EstimationError::Configuration(
                "target dataset contains no samples".to_string(),
            ));
        }
        Ok(Self::new(parsed.series))
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, EstimationError> {
        let text = fs::read_to_string(path).map_err(|e| {
            EstimationError::Configuration(format!(
                "cannot read target dataset {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_csv_str(&text)
    }

    /// Attach one weight per series, in series order.
    pub fn with_weights(mut self, weights: &[f64]) -> Result<Self, EstimationError> {
        if weights.len() != self.series.len() {
            return Err(EstimationError::Configuration(format!(
                "{} weights given for {} series",
                weights.len(),
                self.series.len()
            )));
        }
        for (series, &weight) in self.series.iter_mut().zip(weights) {
            series.weight = weight;
        }
        Ok(self)
    }

    pub fn series(&self) -> &[MeasurementSeries] {
        &self.series
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Total number of samples across all series, the length of the
    /// flattened residual vector.
    pub fn sample_count(&self) -> usize {
        self.series.iter().map(MeasurementSeries::len).sum()
    }

    /// Weighted residual of a model output against this target, flattened
    /// series-major, sample-minor on the target's sampling.
    ///
    /// Alignment is per series only; sample counts may differ across series
    /// of the same run. Model series are interpolated onto the target's
    /// times where the grids differ.
    pub fn residual(&self, model: &[MeasurementSeries]) -> Result<Vec<f64>, EvaluationFailure> {
        if model.len() != self.series.len() {
            return Err(EvaluationFailure::SeriesCountMismatch {
                expected: self.series.len(),
                found: model.len(),
            });
        }
        let mut out = Vec::with_capacity(self.sample_count());
        for (model_series, target_series) in model.iter().zip(&self.series) {
            if model_series.is_empty() {
                return Err(EvaluationFailure::MalformedOutput(
                    "empty measurement series".to_string(),
                ));
            }
            let aligned = model_series.sample_at(&target_series.times);
            for (m, t) in aligned.iter().zip(&target_series.values) {
                out.push(target_series.weight * (m - t));
            }
        }
        Ok(out)
    }
}

/// Half the squared Euclidean norm of a residual vector.
pub fn residual_norm(residual: &[f64]) -> f64 {
    0.5 * residual.iter().map(|r| r * r).sum::<f64>()
}
