use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Deserialize;

use crate::error::EvaluationFailure;
use crate::measurement::{MeasurementSeries, parse_table};

/// Format of the parameter file written for the external model.
///
/// Closed set of recognized variants, selected by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterFormat {
    /// One `name=value` line per parameter.
    KeyValue,
    /// A single JSON object mapping names to values.
    Json,
}

impl ParameterFormat {
    pub(crate) fn file_name(&self) -> &'static str {
        match self {
            Self::KeyValue => "parameters.txt",
            Self::Json => "parameters.json",
        }
    }

    pub(crate) fn write(&self, path: &Path, named: &[(String, f64)]) -> io::Result<()> {
        match self {
            Self::KeyValue => {
                let mut file = fs::File::create(path)?;
                for (name, value) in named {
                    writeln!(file, "{}={}", name, value)?;
                }
                Ok(())
            }
            Self::Json => {
                let map: serde_json::Map<String, serde_json::Value> = named
                    .iter()
                    .map(|(name, value)| (name.clone(), serde_json::Value::from(*value)))
                    .collect();
                let text = serde_json::to_string_pretty(&map)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                fs::write(path, text)
            }
        }
    }
}

/// Format of the measurement file the external model produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Tabular `step,time,value` rows, one block per output channel.
    Csv,
    /// `{"metadata": {"finished": ...}, "data": [{"time", "value"}, ...]}`,
    /// a single output channel.
    Json,
}

#[derive(Deserialize)]
struct JsonMeasurement {
    metadata: JsonMetadata,
    data: Vec<JsonSample>,
}

#[derive(Deserialize)]
struct JsonMetadata {
    finished: bool,
}

#[derive(Deserialize)]
struct JsonSample {
    time: f64,
    value: f64,
}

impl OutputFormat {
    pub(crate) fn file_name(&self) -> &'static str {
        match self {
            Self::Csv => "measurement.csv",
            Self::Json => "measurement.json",
        }
    }

    pub(crate) fn parse(
        &self,
        path: &Path,
        require_finished: bool,
    ) -> Result<Vec<MeasurementSeries>, EvaluationFailure> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EvaluationFailure::MissingOutput {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(EvaluationFailure::MalformedOutput(e.to_string())),
        };
        match self {
            Self::Csv => {
                let parsed = parse_table(&text).map_err(EvaluationFailure::MalformedOutput)?;
                if require_finished && !parsed.finished {
                    return Err(EvaluationFailure::Unfinished);
                }
                if parsed.series.is_empty() {
                    return Err(EvaluationFailure::MalformedOutput(
                        "measurement file contains no samples".to_string(),
                    ));
                }
                Ok(parsed.series)
            }
            Self::Json => {
                let parsed: JsonMeasurement = serde_json::from_str(&text)
                    .map_err(|e| EvaluationFailure::MalformedOutput(e.to_string()))?;
                // the metadata is explicit about truncated runs
                if !parsed.metadata.finished {
                    return Err(EvaluationFailure::Unfinished);
                }
                if parsed.data.is_empty() {
                    return Err(EvaluationFailure::MalformedOutput(
                        "measurement file contains no samples".to_string(),
                    ));
                }
                let times = parsed.data.iter().map(|s| s.time).collect();
                let values = parsed.data.iter().map(|s| s.value).collect();
                Ok(vec![MeasurementSeries::new(times, values)])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("simfit_adapters_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn key_value_parameter_file_has_one_line_per_parameter() {
        let path = scratch_file("kv_parameters.txt");
        let named = vec![("porosity".to_string(), 0.25), ("k".to_string(), 1e-10)];
        ParameterFormat::KeyValue.write(&path, &named).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "porosity=0.25\nk=0.0000000001\n");
    }

    #[test]
    fn json_parameter_file_round_trips() {
        let path = scratch_file("parameters.json");
        let named = vec![("a".to_string(), 1.5), ("b".to_string(), -2.0)];
        ParameterFormat::Json.write(&path, &named).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["a"], 1.5);
        assert_eq!(parsed["b"], -2.0);
    }

    #[test]
    fn csv_output_requires_finished_only_when_asked() {
        let path = scratch_file("measurement.csv");
        fs::write(&path, "0,0.0,1.0\n1,0.1,2.0\n").unwrap();
        assert!(OutputFormat::Csv.parse(&path, false).is_ok());
        assert_eq!(
            OutputFormat::Csv.parse(&path, true).unwrap_err(),
            EvaluationFailure::Unfinished
        );
        fs::write(&path, "0,0.0,1.0\n1,0.1,2.0\nFINISHED,,\n").unwrap();
        assert!(OutputFormat::Csv.parse(&path, true).is_ok());
    }

    #[test]
    fn missing_output_file_is_reported_as_missing() {
        let path = scratch_file("does_not_exist.csv");
        let _ = fs::remove_file(&path);
        assert!(matches!(
            OutputFormat::Csv.parse(&path, false).unwrap_err(),
            EvaluationFailure::MissingOutput { .. }
        ));
    }

    #[test]
    fn json_output_parses_single_series_and_honors_finished_flag() {
        let path = scratch_file("measurement.json");
        fs::write(
            &path,
            r#"{"metadata": {"finished": true}, "data": [{"time": 0.1, "value": 0.35}, {"time": 0.2, "value": 0.34}]}"#,
        )
        .unwrap();
        let series = OutputFormat::Json.parse(&path, false).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].times, vec![0.1, 0.2]);
        assert_eq!(series[0].values, vec![0.35, 0.34]);

        fs::write(&path, r#"{"metadata": {"finished": false}, "data": []}"#).unwrap();
        assert_eq!(
            OutputFormat::Json.parse(&path, false).unwrap_err(),
            EvaluationFailure::Unfinished
        );
    }
}
