// Matrix Expansion
// Expands matrix axes into concrete, labelled parameter bindings

use crate::definition::{MatrixDefinition, Value};
use crate::error::PlanError;

use std::collections::{HashMap, HashSet};

/// One point of a matrix cross-product
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatrixInstance {
    /// `axis=value` pairs joined by `,` in axis declaration order; empty for
    /// an unparameterized job
    pub label: String,
    /// Bindings in axis declaration order
    pub bindings: Vec<(String, Value)>,
}

impl MatrixInstance {
    fn new(bindings: Vec<(String, Value)>) -> Self {
        let label = bindings
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value.as_string()))
            .collect::<Vec<_>>()
            .join(",");
        Self { label, bindings }
    }

    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, v)| v)
    }

    pub fn to_map(&self) -> HashMap<String, Value> {
        self.bindings.iter().cloned().collect()
    }
}

pub struct MatrixExpander;

impl MatrixExpander {
    /// Ordered cross-product of the axes minus excluded combinations.
    ///
    /// The last axis varies fastest. No matrix, or a matrix without axes,
    /// yields one unparameterized instance.
    pub fn expand(job: &str, matrix: Option<&MatrixDefinition>) -> Result<Vec<MatrixInstance>, PlanError> {
        let Some(matrix) = matrix else {
            return Ok(vec![MatrixInstance::default()]);
        };
        Self::validate(job, matrix)?;
        if matrix.axes.is_empty() {
            return Ok(vec![MatrixInstance::default()]);
        }

        let sizes: Vec<usize> = matrix.axes.iter().map(|(_, values)| values.len()).collect();
        let mut cursor = vec![0usize; sizes.len()];
        let mut instances = Vec::new();

        'odometer: loop {
            let bindings: Vec<(String, Value)> = matrix
                .axes
                .iter()
                .zip(&cursor)
                .map(|((axis, values), &i)| (axis.clone(), values[i].clone()))
                .collect();
            if !matrix.exclude.iter().any(|rule| excludes(rule, &bindings)) {
                instances.push(MatrixInstance::new(bindings));
            }

            let mut position = sizes.len();
            loop {
                if position == 0 {
                    break 'odometer;
                }
                position -= 1;
                cursor[position] += 1;
                if cursor[position] < sizes[position] {
                    break;
                }
                cursor[position] = 0;
            }
        }

        if instances.is_empty() {
            return Err(PlanError::invalid_matrix(
                job,
                "exclude rules remove every combination",
            ));
        }
        Ok(instances)
    }

    fn validate(job: &str, matrix: &MatrixDefinition) -> Result<(), PlanError> {
        let mut axes = HashSet::new();
        for (axis, values) in &matrix.axes {
            if !axes.insert(axis.as_str()) {
                return Err(PlanError::invalid_matrix(job, format!("axis '{}' declared twice", axis)));
            }
            if values.is_empty() {
                return Err(PlanError::invalid_matrix(job, format!("axis '{}' has no values", axis)));
            }
            let mut seen = HashSet::new();
            for value in values {
                if !seen.insert(value.as_string()) {
                    return Err(PlanError::invalid_matrix(
                        job,
                        format!("axis '{}' lists value '{}' more than once", axis, value),
                    ));
                }
            }
        }

        for rule in &matrix.exclude {
            if rule.is_empty() {
                return Err(PlanError::invalid_matrix(job, "empty exclude rule"));
            }
            for (axis, value) in rule {
                let Some((_, values)) = matrix.axes.iter().find(|(name, _)| name == axis) else {
                    return Err(PlanError::invalid_matrix(
                        job,
                        format!("exclude references undeclared axis '{}'", axis),
                    ));
                };
                if !values.iter().any(|v| v.as_string() == value.as_string()) {
                    return Err(PlanError::invalid_matrix(
                        job,
                        format!("exclude references undeclared value '{}' for axis '{}'", value, axis),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A rule excludes a combination when every pair it names matches
fn excludes(rule: &[(String, Value)], bindings: &[(String, Value)]) -> bool {
    rule.iter().all(|(axis, value)| {
        bindings
            .iter()
            .any(|(name, bound)| name == axis && bound.as_string() == value.as_string())
    })
}
