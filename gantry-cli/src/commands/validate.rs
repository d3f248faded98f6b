use crate::commands::{load_plan, report_error};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

/// Validate a pipeline definition without running it
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set a variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    output::status("Validating", &format!("{}", args.pipeline.display()));

    let (definition, plan) = match load_plan(&args.pipeline, &args.variables) {
        Ok(loaded) => loaded,
        Err(e) => return Ok(report_error(&e)),
    };

    let steps: usize = definition.jobs.values().map(|j| j.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps, {} resource scopes",
        definition.jobs.len(),
        steps,
        definition.resources.len()
    ));
    output::check("Conditions parse");
    output::check(&format!("Dependency graph is acyclic ({} job instances)", plan.len()));
    for template in plan.templates() {
        if let Some(scope) = template.scope {
            output::check(&format!(
                "Job '{}' bound to resource scope '{}'",
                template.name(),
                plan.scopes()[scope].name
            ));
        }
    }
    for gated in plan.gated() {
        output::info(&format!("Job '{}' is not instantiated with these variables", gated));
    }

    println!();
    output::success("Pipeline is valid");
    Ok(0)
}
