// Definition Module
// Pipeline definition data model and YAML loading

pub mod models;
pub mod parser;

pub use models::{
    CacheSpec, JobTemplate, MatrixDefinition, Needs, OrderedMap, PipelineDefinition,
    ResourceScopeSpec, StepDefinition, Value,
};
pub use parser::DefinitionParser;
