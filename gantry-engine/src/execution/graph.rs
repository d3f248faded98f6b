// Execution Plan
// Resolves templates into an acyclic arena of job instances

use crate::condition::{Condition, StatusSnapshot};
use crate::definition::{JobTemplate, PipelineDefinition, ResourceScopeSpec, Value};
use crate::error::PlanError;
use crate::execution::instance::{InstanceId, JobInstance, JobStatus};
use crate::execution::matrix::MatrixExpander;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A template after plan-time resolution
#[derive(Debug)]
pub struct PlannedTemplate {
    pub index: usize,
    pub definition: JobTemplate,
    pub condition: Condition,
    pub step_conditions: Vec<Condition>,
    /// Index into the plan's scopes
    pub scope: Option<usize>,
    /// Axis names in declaration order
    pub axes: Vec<String>,
    pub instances: Vec<InstanceId>,
}

impl PlannedTemplate {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// The DAG of job instances for one run
#[derive(Debug)]
pub struct ExecutionPlan {
    pub name: String,
    pub variables: HashMap<String, Value>,
    pub concurrency: Option<usize>,
    templates: Vec<Arc<PlannedTemplate>>,
    scopes: Vec<ResourceScopeSpec>,
    instances: Vec<JobInstance>,
    gated: Vec<String>,
}

impl ExecutionPlan {
    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    pub fn instance(&self, id: InstanceId) -> &JobInstance {
        &self.instances[id.0]
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> &mut JobInstance {
        &mut self.instances[id.0]
    }

    pub fn templates(&self) -> &[Arc<PlannedTemplate>] {
        &self.templates
    }

    pub fn template(&self, index: usize) -> &Arc<PlannedTemplate> {
        &self.templates[index]
    }

    pub fn template_by_name(&self, name: &str) -> Option<&Arc<PlannedTemplate>> {
        self.templates.iter().find(|t| t.name() == name)
    }

    pub fn scopes(&self) -> &[ResourceScopeSpec] {
        &self.scopes
    }

    /// Templates dropped by a false `when` gate
    pub fn gated(&self) -> &[String] {
        &self.gated
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Kahn order; among ready nodes the lowest id goes first
    pub fn topological_order(&self) -> Vec<InstanceId> {
        let mut in_degree: Vec<usize> = self.instances.iter().map(|i| i.needs.len()).collect();
        let mut queue: VecDeque<InstanceId> = self
            .instances
            .iter()
            .filter(|i| i.needs.is_empty())
            .map(|i| i.id)
            .collect();
        let mut order = Vec::with_capacity(self.instances.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &dependent in &self.instances[id.0].dependents {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// Groups of instances that may run concurrently, by dependency depth
    pub fn levels(&self) -> Vec<Vec<InstanceId>> {
        let mut depth = vec![0usize; self.instances.len()];
        for id in self.topological_order() {
            depth[id.0] = self.instances[id.0]
                .needs
                .iter()
                .map(|up| depth[up.0] + 1)
                .max()
                .unwrap_or(0);
        }
        let mut levels: Vec<Vec<InstanceId>> = Vec::new();
        for instance in &self.instances {
            let d = depth[instance.id.0];
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(instance.id);
        }
        levels
    }
}

pub struct PlanBuilder<'a> {
    definition: &'a PipelineDefinition,
    overrides: HashMap<String, Value>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(definition: &'a PipelineDefinition) -> Self {
        Self {
            definition,
            overrides: HashMap::new(),
        }
    }

    /// Variables that override those declared in the definition
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.overrides.extend(variables);
        self
    }

    pub fn build(self) -> Result<ExecutionPlan, PlanError> {
        let def = self.definition;
        let mut variables = def.variables.clone();
        variables.extend(self.overrides);

        for job in def.jobs.values() {
            for need in job.needs.names() {
                if !def.jobs.contains_key(need) {
                    return Err(PlanError::unknown_dependency(&job.name, need));
                }
            }
        }
        detect_template_cycle(def)?;

        let scopes: Vec<ResourceScopeSpec> = def.resources.values().cloned().collect();
        let gate_snapshot = StatusSnapshot::for_variables(variables.clone());

        let mut templates = Vec::new();
        let mut gated = Vec::new();
        let mut instances: Vec<JobInstance> = Vec::new();

        for job in def.jobs.values() {
            let condition = Condition::parse_or_default(job.condition.as_deref())
                .map_err(|e| PlanError::invalid_condition(&format!("job '{}' if", job.name), e))?;
            let step_conditions = job
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| {
                    Condition::parse_or_default(step.condition.as_deref()).map_err(|e| {
                        PlanError::invalid_condition(
                            &format!("step '{}' of job '{}' if", step.key(i), job.name),
                            e,
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let scope = bind_scope(job, &scopes)?;

            if let Some(when) = &job.when {
                let location = format!("job '{}' when", job.name);
                let gate = Condition::parse(when)
                    .map_err(|e| PlanError::invalid_condition(&location, e))?;
                let open = gate
                    .evaluate(&gate_snapshot)
                    .map_err(|e| PlanError::invalid_condition(&location, e))?;
                if !open {
                    tracing::debug!(job = %job.name, "when gate closed, template not instantiated");
                    gated.push(job.name.clone());
                    continue;
                }
            }

            let points = MatrixExpander::expand(&job.name, job.matrix.as_ref())?;
            let index = templates.len();
            let mut ids = Vec::with_capacity(points.len());
            for point in points {
                let id = InstanceId(instances.len());
                ids.push(id);
                instances.push(JobInstance {
                    id,
                    template: index,
                    template_name: job.name.clone(),
                    label: point.label,
                    bindings: point.bindings,
                    needs: Vec::new(),
                    dependents: Vec::new(),
                    scope,
                    status: JobStatus::Pending,
                    cause: None,
                    steps: Vec::new(),
                    outputs: HashMap::new(),
                    started_at: None,
                    finished_at: None,
                });
            }

            templates.push(PlannedTemplate {
                index,
                axes: job
                    .matrix
                    .as_ref()
                    .map(|m| m.axes.iter().map(|(a, _)| a.clone()).collect())
                    .unwrap_or_default(),
                definition: job.clone(),
                condition,
                step_conditions,
                scope,
                instances: ids,
            });
        }

        resolve_edges(&templates, &mut instances);
        verify_acyclic(&instances)?;

        for instance in &mut instances {
            instance.status = if instance.needs.is_empty() {
                JobStatus::Ready
            } else {
                JobStatus::Blocked
            };
        }

        Ok(ExecutionPlan {
            name: def.name.clone().unwrap_or_else(|| "pipeline".to_string()),
            variables,
            concurrency: def.concurrency,
            templates: templates.into_iter().map(Arc::new).collect(),
            scopes,
            instances,
            gated,
        })
    }
}

/// Explicit `lease:` wins; otherwise the first scope whose labels cover `requires`
fn bind_scope(job: &JobTemplate, scopes: &[ResourceScopeSpec]) -> Result<Option<usize>, PlanError> {
    if let Some(name) = &job.lease {
        let index = scopes
            .iter()
            .position(|s| &s.name == name)
            .ok_or_else(|| PlanError::unknown_resource(&job.name, name))?;
        if !scopes[index].satisfies(&job.requires) {
            return Err(PlanError::unsatisfied_requirement(&job.name, &job.requires));
        }
        return Ok(Some(index));
    }
    if job.requires.is_empty() {
        return Ok(None);
    }
    scopes
        .iter()
        .position(|s| s.satisfies(&job.requires))
        .map(Some)
        .ok_or_else(|| PlanError::unsatisfied_requirement(&job.name, &job.requires))
}

/// Needs on matrixed templates match on shared axes; without shared axes, or
/// when no upstream point agrees, the dependent joins on every upstream instance
fn resolve_edges(templates: &[PlannedTemplate], instances: &mut [JobInstance]) {
    let by_name: HashMap<&str, &PlannedTemplate> =
        templates.iter().map(|t| (t.name(), t)).collect();

    let mut edges: Vec<(InstanceId, InstanceId)> = Vec::new();
    for template in templates {
        for need in template.definition.needs.names() {
            let Some(upstream) = by_name.get(need) else {
                tracing::debug!(job = %template.name(), need, "dependency gated out, edge dropped");
                continue;
            };
            let shared: Vec<&String> = template
                .axes
                .iter()
                .filter(|axis| upstream.axes.contains(axis))
                .collect();

            for &down in &template.instances {
                let mut matched: Vec<InstanceId> = if shared.is_empty() {
                    Vec::new()
                } else {
                    upstream
                        .instances
                        .iter()
                        .copied()
                        .filter(|&up| {
                            shared.iter().all(|axis| {
                                let a = instances[down.0].binding(axis).map(Value::as_string);
                                let b = instances[up.0].binding(axis).map(Value::as_string);
                                a == b
                            })
                        })
                        .collect()
                };
                if matched.is_empty() {
                    matched = upstream.instances.clone();
                }
                edges.extend(matched.into_iter().map(|up| (up, down)));
            }
        }
    }

    for (up, down) in edges {
        if !instances[down.0].needs.contains(&up) {
            instances[down.0].needs.push(up);
            instances[up.0].dependents.push(down);
        }
    }
    for instance in instances.iter_mut() {
        instance.needs.sort();
        instance.dependents.sort();
    }
}

fn verify_acyclic(instances: &[JobInstance]) -> Result<(), PlanError> {
    let mut in_degree: Vec<usize> = instances.iter().map(|i| i.needs.len()).collect();
    let mut queue: VecDeque<usize> = (0..instances.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for dependent in &instances[i].dependents {
            in_degree[dependent.0] -= 1;
            if in_degree[dependent.0] == 0 {
                queue.push_back(dependent.0);
            }
        }
    }
    if visited == instances.len() {
        return Ok(());
    }
    let stuck: Vec<String> = instances
        .iter()
        .filter(|i| in_degree[i.id.0] > 0)
        .map(JobInstance::display_name)
        .collect();
    Err(PlanError::cyclic(&stuck))
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn detect_template_cycle(def: &PipelineDefinition) -> Result<(), PlanError> {
    let names: Vec<&str> = def.jobs.keys().map(String::as_str).collect();
    let edges: Vec<Vec<usize>> = def
        .jobs
        .values()
        .map(|job| {
            job.needs
                .names()
                .into_iter()
                .filter_map(|n| def.jobs.position(n))
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; names.len()];
    let mut stack = Vec::new();
    for start in 0..names.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, &edges, &mut marks, &mut stack) {
                let path: Vec<String> = cycle.into_iter().map(|i| names[i].to_string()).collect();
                return Err(PlanError::cyclic(&path));
            }
        }
    }
    Ok(())
}

/// DFS; returns the cycle as a path whose first and last entries coincide
fn visit(
    node: usize,
    edges: &[Vec<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::InProgress;
    stack.push(node);
    for &next in &edges[node] {
        match marks[next] {
            Mark::InProgress => {
                let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, edges, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }
    stack.pop();
    marks[node] = Mark::Done;
    None
}
