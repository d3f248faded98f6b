// Definition Models
// Typed structures for pipeline definitions loaded from YAML

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

// =============================================================================
// Pipeline
// =============================================================================

/// Root of a pipeline definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub name: Option<String>,

    /// Plan-time variables, visible to `when` gates and conditions
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Upper bound on concurrently running jobs
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Lease scopes, in declaration order
    #[serde(default)]
    pub resources: OrderedMap<ResourceScopeSpec>,

    /// Job templates, in declaration order
    #[serde(default)]
    pub jobs: OrderedMap<JobTemplate>,
}

impl PipelineDefinition {
    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.get(name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceScopeSpec> {
        self.resources.get(name)
    }

    /// Copy map keys into the `name` fields of jobs and resource scopes
    pub(crate) fn assign_names(&mut self) {
        for (name, job) in self.jobs.iter_mut() {
            job.name = name.clone();
        }
        for (name, scope) in self.resources.iter_mut() {
            scope.name = name.clone();
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A named unit of work, instantiated once per matrix point
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobTemplate {
    #[serde(skip)]
    pub name: String,

    /// Instantiation gate, evaluated once at plan time
    #[serde(default)]
    pub when: Option<String>,

    /// Runtime job predicate; defaults to `success()`
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub needs: Needs,

    /// Requirement tags used to select a lease scope by its labels
    #[serde(default)]
    pub requires: Vec<String>,

    /// Explicit lease scope; takes precedence over `requires`
    #[serde(default)]
    pub lease: Option<String>,

    /// Cap on concurrently running instances of this template
    #[serde(default)]
    pub max_parallel: Option<usize>,

    #[serde(default)]
    pub matrix: Option<MatrixDefinition>,

    #[serde(default)]
    pub cache: Option<CacheSpec>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// Job dependencies: a single name or a list of names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Needs {
    Single(String),
    Multiple(Vec<String>),
}

impl Default for Needs {
    fn default() -> Self {
        Needs::Multiple(Vec::new())
    }
}

impl Needs {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Needs::Single(name) => vec![name.as_str()],
            Needs::Multiple(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// A single step in a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StepDefinition {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Script run through a shell
    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub shell: Option<String>,

    /// Registered action name
    #[serde(default)]
    pub uses: Option<String>,

    #[serde(default)]
    pub with: HashMap<String, Value>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub timeout_minutes: Option<f64>,

    #[serde(default)]
    pub working_directory: Option<String>,
}

impl StepDefinition {
    /// Identifier used in `steps.<id>` references; falls back to the position
    pub fn key(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("step-{}", index + 1))
    }

    pub fn display_name(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return uses.clone();
        }
        if let Some(run) = &self.run {
            if let Some(first) = run.lines().find(|l| !l.trim().is_empty()) {
                return first.trim().chars().take(60).collect();
            }
        }
        self.key(index)
    }
}

// =============================================================================
// Matrix
// =============================================================================

/// Parameter axes plus exclude rules.
///
/// In YAML every key other than `exclude` is an axis; axes keep their
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixDefinition {
    pub axes: Vec<(String, Vec<Value>)>,
    pub exclude: Vec<Vec<(String, Value)>>,
}

impl<'de> Deserialize<'de> for MatrixDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
        let mut matrix = MatrixDefinition::default();

        for (key, value) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| D::Error::custom("matrix keys must be strings"))?
                .to_string();

            if key == "exclude" {
                let rules = value
                    .as_sequence()
                    .ok_or_else(|| D::Error::custom("matrix exclude must be a list"))?;
                for rule in rules {
                    let rule = rule.as_mapping().ok_or_else(|| {
                        D::Error::custom("each matrix exclude rule must be a mapping")
                    })?;
                    let mut pairs = Vec::with_capacity(rule.len());
                    for (axis, value) in rule {
                        let axis = axis
                            .as_str()
                            .ok_or_else(|| D::Error::custom("exclude keys must be strings"))?;
                        pairs.push((axis.to_string(), scalar(value).map_err(D::Error::custom)?));
                    }
                    matrix.exclude.push(pairs);
                }
                continue;
            }

            let values = match &value {
                serde_yaml::Value::Sequence(items) => items
                    .iter()
                    .map(scalar)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(D::Error::custom)?,
                other => vec![scalar(other).map_err(D::Error::custom)?],
            };
            matrix.axes.push((key, values));
        }

        Ok(matrix)
    }
}

impl Serialize for MatrixDefinition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.axes.len() + 1))?;
        for (axis, values) in &self.axes {
            map.serialize_entry(axis, values)?;
        }
        if !self.exclude.is_empty() {
            let rules: Vec<HashMap<&str, &Value>> = self
                .exclude
                .iter()
                .map(|rule| rule.iter().map(|(k, v)| (k.as_str(), v)).collect())
                .collect();
            map.serialize_entry("exclude", &rules)?;
        }
        map.end()
    }
}

fn scalar(value: &serde_yaml::Value) -> Result<Value, String> {
    match value {
        serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_) | serde_yaml::Value::String(_) => {
            Ok(Value::from_yaml(value))
        }
        other => Err(format!("matrix values must be scalars, found {:?}", other)),
    }
}

// =============================================================================
// Cache and resources
// =============================================================================

/// Layered cache declaration for a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CacheSpec {
    /// Primary key template
    pub key: String,

    /// Ordered fallback prefixes
    #[serde(default)]
    pub restore_keys: Vec<String>,

    #[serde(default)]
    pub paths: Vec<String>,
}

/// A named lease scope backed by an external resource provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ResourceScopeSpec {
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Jobs that may share one active lease concurrently
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Opaque provider input
    #[serde(default)]
    pub spec: HashMap<String, Value>,

    #[serde(default)]
    pub acquire: Option<String>,

    #[serde(default)]
    pub release: Option<String>,
}

fn default_capacity() -> usize {
    1
}

impl ResourceScopeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Vec::new(),
            capacity: default_capacity(),
            spec: HashMap::new(),
            acquire: None,
            release: None,
        }
    }

    /// Whether this scope's labels cover every requested tag
    pub fn satisfies(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.labels.iter().any(|l| l == tag))
    }
}

// =============================================================================
// Order-preserving map
// =============================================================================

/// String-keyed map that keeps YAML declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
    /// Key -> position in `entries`
    index: HashMap<String, usize>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position on replace
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|&pos| &self.entries[pos].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut V)> {
        self.entries.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> FromIterator<(String, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping with string keys")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::new())
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                use serde::de::Error;

                let mut map = OrderedMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if map.contains_key(&key) {
                        return Err(A::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// =============================================================================
// Values
// =============================================================================

/// Dynamic value used by variables, matrix bindings and conditions
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn from_yaml(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_yaml::Value::String(s) => Value::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                Value::Array(seq.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let obj = map
                    .iter()
                    .filter_map(|(k, v)| {
                        k.as_str().map(|key| (key.to_string(), Value::from_yaml(v)))
                    })
                    .collect();
                Value::Object(obj)
            }
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Some(*n),
            Value::String(s) if s.trim().is_empty() => Some(0.0),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.to_json(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_yaml::Value::deserialize(deserializer)?;
        Ok(Value::from_yaml(&raw))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<HashMap<String, String>> for Value {
    fn from(map: HashMap<String, String>) -> Self {
        Value::Object(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
    }
}
