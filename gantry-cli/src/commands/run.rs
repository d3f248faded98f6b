use crate::commands::{load_plan, report_error, CONFIGURATION_EXIT};
use crate::output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use gantry_engine::cache::CacheBackend;
use gantry_engine::{
    progress_channel, ActionRegistry, CacheBackendKind, CacheResolver, CancellationSignal, CommandProvider,
    EngineConfig, EngineResult, FileSystemCache, JsonArchiver, JsonLinesSink, MemoryCache, Orchestrator,
};

/// Plan and run a pipeline definition
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set a variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Maximum number of jobs running at once (overrides the pipeline's concurrency)
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Engine config file (default: gantry.yml in the working directory)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Append JSON-lines job records to this file
    #[arg(long, value_name = "FILE")]
    pub records: Option<PathBuf>,

    /// Cache root for the filesystem backend
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Keep the cache in memory for this run only
    #[arg(long)]
    pub memory_cache: bool,
}

impl RunArgs {
    /// Defaults, config file and environment, then flags
    fn engine_config(&self, working_dir: &Path) -> EngineResult<EngineConfig> {
        let mut config = EngineConfig::load(self.config.as_deref(), working_dir)?;
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if self.memory_cache {
            config.cache_backend = CacheBackendKind::Memory;
        }
        if let Some(path) = &self.records {
            config.records_path = Some(path.clone());
        }
        Ok(config)
    }
}

fn cache_backend(config: &EngineConfig) -> Arc<dyn CacheBackend> {
    match config.cache_backend {
        CacheBackendKind::Filesystem => Arc::new(FileSystemCache::new(config.cache_dir.clone())),
        CacheBackendKind::Memory => Arc::new(MemoryCache::new()),
    }
}

pub async fn execute(args: RunArgs) -> Result<i32> {
    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    if args.max_parallel == Some(0) {
        output::error("--max-parallel must be at least 1");
        return Ok(CONFIGURATION_EXIT);
    }

    let config = match args.engine_config(&working_dir) {
        Ok(config) => config,
        Err(e) => return Ok(report_error(&e)),
    };

    output::status("Planning", &format!("{}", args.pipeline.display()));
    let plan = match load_plan(&args.pipeline, &args.variables) {
        Ok((_, plan)) => plan,
        Err(e) => return Ok(report_error(&e)),
    };
    output::info(&format!(
        "Pipeline '{}': {} templates, {} job instances, {} resource scopes",
        plan.name,
        plan.templates().len(),
        plan.len(),
        plan.scopes().len()
    ));
    for gated in plan.gated() {
        output::dim(&format!("  Job '{}' not instantiated (when gate closed)", gated));
    }

    let backend = cache_backend(&config);
    let cache = Arc::new(CacheResolver::new(backend, Arc::new(JsonArchiver::new())));
    let provider = Arc::new(CommandProvider::new(
        config.default_shell.clone(),
        working_dir.clone(),
        plan.scopes(),
    ));
    let actions = Arc::new(ActionRegistry::new(config.default_shell.clone()));

    let cancel = CancellationSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run");
            trigger.cancel();
        }
    });

    let (tx, rx) = progress_channel();
    let mut orchestrator = Orchestrator::new(plan, actions, provider)
        .with_cache(cache)
        .with_config(config.clone())
        .with_working_dir(working_dir)
        .with_progress(tx)
        .with_cancellation(cancel);
    if let Some(limit) = args.max_parallel {
        orchestrator = orchestrator.with_max_parallel(limit);
    }
    if let Some(path) = &config.records_path {
        match JsonLinesSink::append(path) {
            Ok(sink) => orchestrator = orchestrator.with_sink(Arc::new(sink)),
            Err(e) => {
                output::error(&format!("cannot open records file {}: {}", path.display(), e));
                return Ok(CONFIGURATION_EXIT);
            }
        }
    }
    tracing::debug!(limit = orchestrator.concurrency_limit(), "starting run");

    // The channel closes when the orchestrator drops its sender at the end of the run
    let (report, ()) = tokio::join!(orchestrator.run(), output::render_events(rx));

    output::report(&report);
    Ok(report.exit_code())
}
