use crate::commands::{load_plan, report_error};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use serde_json::json;

use gantry_engine::ExecutionPlan;

/// Print the job instances of a pipeline grouped into dependency waves
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set a variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: PlanArgs) -> Result<i32> {
    let plan = match load_plan(&args.pipeline, &args.variables) {
        Ok((_, plan)) => plan,
        Err(e) => return Ok(report_error(&e)),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
        return Ok(0);
    }

    output::header(&format!("Plan for '{}' ({} job instances)", plan.name, plan.len()));
    for (depth, wave) in plan.levels().iter().enumerate() {
        println!();
        output::status(&format!("Wave {}", depth + 1), &format!("{} jobs", wave.len()));
        for &id in wave {
            let instance = plan.instance(id);
            let needs: Vec<String> = instance
                .needs
                .iter()
                .map(|up| plan.instance(*up).display_name())
                .collect();
            let mut line = format!("  {} {}", id, instance.display_name());
            if !needs.is_empty() {
                line.push_str(&format!("  needs: {}", needs.join(", ")));
            }
            if let Some(scope) = instance.scope {
                line.push_str(&format!("  lease: {}", plan.scopes()[scope].name));
            }
            println!("{}", line);
        }
    }
    for gated in plan.gated() {
        output::dim(&format!("  Job '{}' not instantiated (when gate closed)", gated));
    }
    Ok(0)
}

fn plan_json(plan: &ExecutionPlan) -> serde_json::Value {
    let waves: Vec<serde_json::Value> = plan
        .levels()
        .iter()
        .map(|wave| {
            serde_json::Value::Array(
                wave.iter()
                    .map(|&id| {
                        let instance = plan.instance(id);
                        json!({
                            "instanceId": id.index(),
                            "template": instance.template_name,
                            "label": instance.label,
                            "matrix": instance.matrix(),
                            "needs": instance.needs.iter().map(|n| n.index()).collect::<Vec<_>>(),
                            "scope": instance.scope.map(|s| plan.scopes()[s].name.clone()),
                        })
                    })
                    .collect(),
            )
        })
        .collect();
    json!({
        "pipeline": plan.name,
        "waves": waves,
        "gated": plan.gated(),
    })
}
