//! rstchart-cli - Command-line interface for rstchart
//!
//! Validates and inspects statechart models, replays scripts against them
//! and hosts an interactive REPL.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::Session;
use rstchart_core::{Checkpoint, InterpreterOptions, Model, DEFAULT_MAX_MICROSTEPS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstchart-cli")]
#[command(about = "Command-line interface for the rstchart statechart engine")]
#[command(version)]
struct Cli {
    /// Maximum microsteps per macrostep
    #[arg(long, env = "RSTCHART_MAX_MICROSTEPS", default_value_t = DEFAULT_MAX_MICROSTEPS)]
    max_microsteps: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a model loads
    Validate {
        /// Model file (YAML, or JSON with a .json extension)
        model: PathBuf,
    },

    /// Show the states, transitions and events of a model
    Inspect {
        /// Model file
        model: PathBuf,
    },

    /// Run a script of commands against a model
    Run {
        /// Model file
        model: PathBuf,

        /// Script file, one command per line ('-' for stdin)
        #[arg(short, long)]
        script: PathBuf,

        /// Print the story of the run when done
        #[arg(long)]
        story: bool,

        /// Write the final checkpoint to this file
        #[arg(short, long)]
        checkpoint: Option<PathBuf>,

        /// Start from a checkpoint file instead of the initial configuration
        #[arg(short, long)]
        resume: Option<PathBuf>,
    },

    /// Start interactive REPL
    Repl {
        /// Model file
        model: PathBuf,

        /// Start from a checkpoint file
        #[arg(short, long)]
        resume: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = InterpreterOptions {
        max_microsteps: cli.max_microsteps,
    };

    if let Err(e) = dispatch(cli.command, options) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

fn dispatch(command: Commands, options: InterpreterOptions) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Validate { model } => {
            let model = Model::from_file(&model)?;
            println!("{}", commands::validate(&model));
        }

        Commands::Inspect { model } => {
            let model = Model::from_file(&model)?;
            print!("{}", commands::inspect(&model));
        }

        Commands::Run {
            model,
            script,
            story,
            checkpoint,
            resume,
        } => {
            let mut session = open_session(&model, resume.as_deref(), options)?;
            let text = if script == Path::new("-") {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&script)?
            };

            let mut failures = 0;
            for (number, line) in text.lines().enumerate() {
                match session.execute(line) {
                    Ok(Some(output)) if !output.is_empty() => println!("{}", output),
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("script line {} failed: {}", number + 1, e);
                        failures += 1;
                        eprintln!("{} {}: {}", "Error at line".red(), number + 1, e);
                    }
                }
            }

            if story {
                println!("\n{}\n{}", "Story:".bold(), session.story());
            }
            if let Some(path) = checkpoint {
                let json = session.interpreter().checkpoint().to_json()?;
                std::fs::write(&path, json)?;
                eprintln!("{} {}", "Checkpoint written to".dimmed(), path.display());
            }
            if failures > 0 {
                return Err(format!("{} command(s) failed", failures).into());
            }
        }

        Commands::Repl { model, resume } => {
            let session = open_session(&model, resume.as_deref(), options)?;
            repl::run(session)?;
        }
    }

    Ok(())
}

fn open_session(
    model: &Path,
    resume: Option<&Path>,
    options: InterpreterOptions,
) -> Result<Session, Box<dyn std::error::Error>> {
    let model = Arc::new(Model::from_file(model)?);
    match resume {
        Some(path) => {
            let checkpoint = Checkpoint::from_json(&std::fs::read_to_string(path)?)?;
            Session::resume(model, &checkpoint, options)
        }
        None => Session::new(model, options),
    }
}
