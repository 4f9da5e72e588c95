//! Infra Synth
//!
//! Declares the base, ETL and (optional) sandbox stacks from environment
//! configuration and writes their CloudFormation templates plus a manifest.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use domain_stacks::etl::LAUNCHER_SCRIPT;
use domain_stacks::{InfraConfig, build_app};
use eyre::{Result, WrapErr};
use infra_construct::CloudAssembly;
use tracing::info;

#[derive(Parser)]
#[command(name = "infra-synth")]
#[command(about = "Synthesize the infrastructure stacks to CloudFormation templates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write templates and manifest.json
    Synth {
        /// Only write these stacks (repeatable). Defaults to all.
        #[arg(short, long = "stack")]
        stacks: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,
    },

    /// Print stacks in deployment order with their dependencies
    List,

    /// Print every export name and the stack producing it
    Exports,

    /// Synthesize in memory and run every check without writing anything
    Validate,

    /// Print the Glue launcher script that runs the chinook-etl binary
    Launcher,
}

fn assemble(config: &InfraConfig) -> Result<CloudAssembly> {
    let app = build_app(config).wrap_err("Failed to declare stacks")?;
    let assembly = app.synth().wrap_err("Synthesis failed")?;
    Ok(assembly)
}

fn load() -> Result<CloudAssembly> {
    let config = InfraConfig::from_env().wrap_err("Invalid infrastructure configuration")?;
    assemble(&config)
}

fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth { stacks, out } => {
            let assembly = load()?;
            let written = assembly.write_to(&out, &stacks)?;
            info!(
                out = %out.display(),
                files = written.len(),
                "Synthesized {} stack(s)",
                if stacks.is_empty() { assembly.stacks.len() } else { stacks.len() }
            );
            for path in written {
                println!("{}", path.display());
            }
        }

        Commands::List => {
            let assembly = load()?;
            for name in &assembly.order {
                let stack = assembly.stack(name)?;
                if stack.dependencies.is_empty() {
                    println!("{}", name);
                } else {
                    let deps: Vec<&str> = stack.dependencies.iter().map(String::as_str).collect();
                    println!("{} (depends on {})", name, deps.join(", "));
                }
            }
        }

        Commands::Exports => {
            let assembly = load()?;
            for (export, stack) in &assembly.exports {
                println!("{}\t{}", export, stack);
            }
        }

        Commands::Validate => {
            let assembly = load()?;
            info!(
                stacks = assembly.stacks.len(),
                exports = assembly.exports.len(),
                "Validation passed"
            );
            println!("ok: {}", assembly.order.join(" -> "));
        }

        Commands::Launcher => {
            print!("{}", LAUNCHER_SCRIPT);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_repeated_stacks() {
        let cli = Cli::try_parse_from([
            "infra-synth",
            "synth",
            "--stack",
            "MyBaseStack",
            "--stack",
            "MyETLBasicStack",
            "--out",
            "build/cdk.out",
        ])
        .unwrap();
        match cli.command {
            Commands::Synth { stacks, out } => {
                assert_eq!(stacks, vec!["MyBaseStack", "MyETLBasicStack"]);
                assert_eq!(out, PathBuf::from("build/cdk.out"));
            }
            _ => panic!("expected synth"),
        }
    }

    #[test]
    fn test_cli_parses_launcher() {
        let cli = Cli::try_parse_from(["infra-synth", "launcher"]).unwrap();
        assert!(matches!(cli.command, Commands::Launcher));
        assert!(LAUNCHER_SCRIPT.starts_with("\"\"\"Glue Python shell"));
    }

    #[test]
    fn test_default_assembly() {
        let assembly = assemble(&InfraConfig::default()).unwrap();
        assert_eq!(assembly.order, vec!["MyBaseStack", "MyETLBasicStack"]);
    }
}
