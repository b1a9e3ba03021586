//! scriptgrade
//!
//! Runs student plotting scripts, shows what they print and plot, and
//! records grades in the submission files. Serves the same operations over
//! MCP with `serve --stdio`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scriptgrade::config::Config;
use scriptgrade::engine::{Engine, ExecutionResult, SubprocessRunner};
use scriptgrade::grading;
use scriptgrade::mcp;
use scriptgrade::render::render_plain;
use scriptgrade::submissions::{self, SubmissionIndex};

#[derive(Parser, Debug)]
#[command(name = "scriptgrade")]
#[command(about = "Run student plotting scripts, capture their output and record grades")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the grading tools over MCP
    Serve {
        /// Run in stdio mode (for MCP clients)
        #[arg(long)]
        stdio: bool,
    },

    /// Run one script and print its captured output
    Run {
        /// Script to run
        path: PathBuf,

        /// Print the full result as JSON (images base64-encoded)
        #[arg(long)]
        json: bool,

        /// Write captured plots as PNG files into this directory
        #[arg(long)]
        save_plots: Option<PathBuf>,
    },

    /// List students and exercises of the course
    List,

    /// Record points and comments in a submission
    Grade {
        /// Student id as shown by `list`
        student: String,

        /// Exercise number
        exercise: u32,

        /// Points to award (0-99)
        #[arg(long)]
        points: u32,

        /// Feedback; use newlines for several comments
        #[arg(long, default_value = "")]
        comments: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    info!(
        interpreter = %config.interpreter.program,
        timeout = ?config.interpreter.timeout(),
        course = %config.course.root.display(),
        "Loaded configuration"
    );
    if config.interpreter.timeout().is_none() {
        info!("No run timeout configured; a script that never terminates blocks its run");
    }

    let engine = Engine::with_max_concurrent(
        SubprocessRunner::new(config.interpreter.clone()),
        config.max_concurrent_runs,
    );

    match args.command {
        Command::Serve { stdio } => {
            if !stdio {
                anyhow::bail!("Only --stdio mode is currently supported");
            }
            mcp::serve_stdio(config, engine).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            path,
            json,
            save_plots,
        } => {
            let result = engine.run(&path).await;
            print_result(&result, json, save_plots.as_deref())?;
            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::List => {
            list(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Grade {
            student,
            exercise,
            points,
            comments,
        } => {
            let index = SubmissionIndex::scan(&config.course.submissions_dir())?;
            anyhow::ensure!(index.contains(&student), "Unknown student: '{student}'");
            let path = index.script_path(&student, exercise);

            grading::grade_file(&path, points, &comments)
                .await
                .with_context(|| format!("Failed to grade {}", path.display()))?;
            println!(
                "Recorded {points} points for {} exercise {exercise}",
                submissions::label(&student)
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_result(result: &ExecutionResult, json: bool, save_plots: Option<&Path>) -> Result<()> {
    let saved = match save_plots {
        Some(dir) => save_images(result, dir)?,
        None => Vec::new(),
    };

    if json {
        let text = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
        println!("{text}");
        return Ok(());
    }

    print!(
        "{}",
        render_plain(result, |idx, _| saved
            .get(idx - 1)
            .map(|p| p.display().to_string()))
    );
    if !result.stderr.trim().is_empty() {
        warn!(stderr = %result.stderr.trim(), "Script wrote to stderr");
    }
    Ok(())
}

fn save_images(result: &ExecutionResult, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    result
        .images()
        .enumerate()
        .map(|(idx, image)| {
            let path = dir.join(format!("plot-{}.png", idx + 1));
            std::fs::write(&path, image.bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}

fn list(config: &Config) -> Result<()> {
    let index = SubmissionIndex::scan(&config.course.submissions_dir())?;

    println!("Exercises: {}", index.exercise_count());
    for student in index.students() {
        println!("{student}\t{}", submissions::label(student));
    }

    match submissions::list_solutions(&config.course.solutions_dir()) {
        Ok(solutions) => {
            for (idx, path) in solutions.iter().enumerate() {
                println!("solution {}\t{}", idx + 1, path.display());
            }
        }
        Err(e) => warn!(error = %e, "No reference solutions"),
    }
    Ok(())
}
