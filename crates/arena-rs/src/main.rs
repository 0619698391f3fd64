//! Command-line front end for the arena engine.
//!
//! # Examples
//!
//! ```sh
//! # Run a competition to the end and print the final rankings
//! arena --config arena.json run spring.json
//!
//! # See how the protocol reads a model response
//! echo 'I will look at p1 {"action": "VIEW_PROBLEM", "parameters": {"problem_id": "p1"}}' \
//!   | arena parse
//!
//! # Judge one solution against a problem's hidden tests
//! arena judge --problem p1.json --language python3 solution.py
//! ```

use arena_rs::prelude::*;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Evaluation and token-economy engine for LLM programming contests.
#[derive(Parser)]
#[command(name = "arena")]
struct Cli {
    /// Engine configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a competition from a file and run every participant to the end
    Run {
        /// JSON file with `competition` and `participants`
        file: PathBuf,
    },
    /// Parse a model response (file or stdin) into an action
    Parse {
        /// Response file; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Judge a solution against a problem's test cases
    Judge {
        /// Solution source file
        source: PathBuf,

        /// Problem definition (JSON)
        #[arg(long)]
        problem: PathBuf,

        /// Language tag, e.g. python3, cpp17, java
        #[arg(long, default_value = "python3")]
        language: String,
    },
}

/// Contents of the file passed to `arena run`.
#[derive(Deserialize)]
struct RunFile {
    competition: NewCompetition,
    #[serde(default)]
    participants: Vec<NewParticipant>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(cli.log_level),
        )
        .init();

    let config = match &cli.config {
        Some(path) => ArenaConfig::load(path).unwrap_or_else(|e| fail(&e)),
        None => ArenaConfig::default(),
    };

    let result = match cli.command {
        Command::Run { file } => run(config, &file).await,
        Command::Parse { file } => parse(&config, file.as_deref()),
        Command::Judge {
            source,
            problem,
            language,
        } => judge(&config, &source, &problem, &language).await,
    };

    if let Err(e) = result {
        fail(&e);
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid {}: {e}", path.display()))
}

async fn run(config: ArenaConfig, file: &Path) -> Result<(), String> {
    let RunFile {
        competition,
        participants,
    } = read_json(file)?;
    if participants.is_empty() {
        return Err(format!("{} lists no participants", file.display()));
    }

    let arena = Arena::from_config(config, Arc::new(LoggingHandler))?;
    let comp = arena
        .create_competition(competition)
        .await
        .map_err(|e| e.to_string())?;
    for participant in participants {
        arena
            .add_participant(&comp.id, participant)
            .await
            .map_err(|e| e.to_string())?;
    }

    let rankings = arena
        .run_competition(&comp.id)
        .await
        .map_err(|e| e.to_string())?;

    println!("{}", comp.title);
    for entry in &rankings {
        let reason = entry
            .termination_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "running".into());
        println!(
            "{:>3}. {:<20} score {:>6}  final {:>9.2}  solved {}  tokens left {}  ({reason})",
            entry.rank,
            entry.name,
            entry.score,
            entry.final_score,
            entry.solved_problems.len(),
            entry.remaining_tokens,
        );
    }
    Ok(())
}

fn parse(config: &ArenaConfig, file: Option<&Path>) -> Result<(), String> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            buf
        }
    };

    let parser = ActionParser::from_rules(config.protocol.fallback_rules.clone())?;
    let outcome = parser.parse(&raw).map_err(|e| e.to_string())?;
    let kind = match &outcome {
        ParseOutcome::Action(_) => "action",
        ParseOutcome::Fallback { .. } => "fallback",
    };
    let out = serde_json::json!({
        "outcome": kind,
        "record": outcome.to_record().to_value(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?
    );
    Ok(())
}

async fn judge(
    config: &ArenaConfig,
    source: &Path,
    problem: &Path,
    language: &str,
) -> Result<(), String> {
    let code = std::fs::read_to_string(source)
        .map_err(|e| format!("failed to read {}: {e}", source.display()))?;
    let problem: Problem = read_json(problem)?;
    if problem.test_cases.is_empty() {
        return Err(format!("problem {} has no test cases", problem.id));
    }

    let judge = Judge::new(Arc::new(HttpSandbox::new(&config.judge)?));
    let submission = Submission::pending("local", "local", &problem.id, code, language);
    let judged = judge
        .evaluate(&submission, &problem, &config.competition.rules)
        .await;

    println!(
        "{}",
        serde_json::to_string_pretty(&judged).map_err(|e| e.to_string())?
    );
    Ok(())
}
