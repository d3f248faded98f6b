mod commands;
mod logging;
mod output;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::Result;

use commands::plan::PlanArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// Run declarative job graphs locally
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about)]
struct Cli {
    /// Increase diagnostic logging (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit diagnostic logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan and run a pipeline
    Run(RunArgs),

    /// Parse and plan a pipeline without running it
    Validate(ValidateArgs),

    /// Print the job instances of a pipeline by dependency wave
    Plan(PlanArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json);

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args)?,
        Command::Plan(args) => commands::plan::execute(args)?,
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "gantry",
            "-vv",
            "run",
            "ci.yml",
            "--var",
            "branch=main",
            "--max-parallel",
            "3",
            "--memory-cache",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.variables, vec!["branch=main".to_string()]);
                assert_eq!(args.max_parallel, Some(3));
                assert!(args.memory_cache);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
