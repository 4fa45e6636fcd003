use crate::error::EstimationError;
use indexmap::IndexMap;

/// A single estimated parameter: name, starting value and box bounds.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Parameter {
    pub fn is_within_bounds(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Ordered, name-unique set of the parameters under estimation.
///
/// The set is the sole authority for the mapping between the named form the
/// external model reads and the dense vector the optimizer works on. The
/// mapping is insertion order and stays fixed for the lifetime of a run.
#[derive(Clone, Debug, Default)]
pub struct ParameterSet {
    params: IndexMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self {
            params: IndexMap::new(),
        }
    }

    /// Add an unbounded parameter.
    pub fn add(&mut self, name: &str, initial: f64) -> Result<(), EstimationError> {
        self.add_bounded(name, initial, f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Add a parameter with box bounds. Fails if the name is already taken
    /// or the invariant `lower <= initial <= upper` does not hold.
    pub fn add_bounded(
        &mut self,
        name: &str,
        initial: f64,
        lower: f64,
        upper: f64,
    ) -> Result<(), EstimationError> {
        if self.params.contains_key(name) {
            return Err(EstimationError::Configuration(format!(
                "parameter '{}' already defined",
                name
            )));
        }
        if !(lower <= initial && initial <= upper) {
            return Err(EstimationError::Configuration(format!(
                "parameter '{}': initial value {} outside bounds [{}, {}]",
                name, initial, lower, upper
            )));
        }
        self.params.insert(
            name.to_string(),
            Parameter {
                name: name.to_string(),
                initial,
                lower,
                upper,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Dense vector of initial values, in insertion order.
    pub fn to_vector(&self) -> Vec<f64> {
        self.params.values().map(|p| p.initial).collect()
    }

    /// Bounds as `(lower, upper)` pairs, in insertion order.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.params.values().map(|p| (p.lower, p.upper)).collect()
    }

    /// Map a dense vector back to named values, preserving parameter order.
    pub fn to_named(&self, vector: &[f64]) -> Result<IndexMap<String, f64>, EstimationError> {
        if vector.len() != self.params.len() {
            return Err(EstimationError::Configuration(format!(
                "vector has {} components, parameter set has {}",
                vector.len(),
                self.params.len()
            )));
        }
        Ok(self
            .params
            .keys()
            .cloned()
            .zip(vector.iter().copied())
            .collect())
    }

    /// Project each component into its `[lower, upper]` interval.
    ///
    /// Silent clipping: bound violations are expected during line search
    /// and must not abort the run.
    pub fn clamp(&self, vector: &mut [f64]) {
        for (value, param) in vector.iter_mut().zip(self.params.values()) {
            *value = value.clamp(param.lower, param.upper);
        }
    }

    /// Clamped copy of `vector`.
    pub fn clamped(&self, vector: &[f64]) -> Vec<f64> {
        let mut out = vector.to_vec();
        self.clamp(&mut out);
        out
    }
}
