//! Pagemill CLI - Main entry point

use clap::Parser;
use pagemill_cli::commands::batch::BatchArgs;
use pagemill_cli::commands::run::RunArgs;
use pagemill_cli::{Cli, Commands, Config};
use pagemill_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use pagemill_queue::WorkerIdentity;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    // .env values must be visible to both clap and the config loader
    let _ = dotenvy::dotenv();

    // Parse command-line arguments
    let cli = Cli::parse();

    // Handle markdown help generation
    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    // Ensure a command is provided
    if cli.command.is_none() {
        eprintln!("Error: A subcommand is required");
        eprintln!();
        eprintln!("For more information, try '--help'.");
        process::exit(2);
    }

    // Workers keep stdout for event lines, so they log to stderr
    let identity = WorkerIdentity::from_env();
    let output = if identity.is_worker {
        LogOutput::Stderr
    } else {
        LogOutput::Console
    };
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    let log_config = LogConfig::builder()
        .level(level)
        .output(output)
        .log_file_prefix("pagemill")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging, so setup failures are not fatal
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        },
    };

    // Execute command
    let result = execute_command(&cli).await;

    // Handle result
    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        // process::exit skips destructors; flush file logs first
        drop(guard);
        process::exit(e.exit_code());
    }
}

/// Set the returned flag on Ctrl-C; pipelines stop at the next item
fn install_interrupt_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current item");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

/// Execute the CLI command
async fn execute_command(cli: &Cli) -> pagemill_cli::Result<()> {
    // Command is guaranteed to exist at this point (checked in main)
    let Some(ref command) = cli.command else {
        unreachable!("Command should have been validated in main");
    };

    let config = Config::load(cli.config.as_deref())?;

    match command {
        Commands::Scan {
            documents_dir,
            manifest,
            prefix,
            steps,
        } => {
            pagemill_cli::commands::scan::run(
                documents_dir.clone(),
                manifest.clone(),
                prefix.clone(),
                steps.clone(),
                &config,
            )
            .await
        },

        Commands::Enqueue { step, manifest } => {
            pagemill_cli::commands::enqueue::run(step.clone(), manifest.clone(), &config).await
        },

        Commands::Run {
            step,
            manifest,
            project,
            output,
            workers,
            processor,
            exec,
        } => {
            let args = RunArgs {
                step: step.clone(),
                manifest: manifest.clone(),
                project: project.clone(),
                output: output.clone(),
                workers: *workers,
                processor: *processor,
                exec: exec.clone(),
            };
            pagemill_cli::commands::run::run(args, &config, install_interrupt_handler()).await
        },

        Commands::Batch {
            stage,
            input_manifest,
            input_dir,
            output,
            base,
            batch_size,
            use_source,
            from_step,
            processor,
            exec,
        } => {
            let args = BatchArgs {
                stage: stage.clone(),
                input_manifest: input_manifest.clone(),
                input_dir: input_dir.clone(),
                output: output.clone(),
                base: base.clone(),
                batch_size: *batch_size,
                use_source: *use_source,
                from_step: from_step.clone(),
                processor: *processor,
                exec: exec.clone(),
            };
            pagemill_cli::commands::batch::run(args, &config, install_interrupt_handler()).await
        },

        Commands::Status {
            manifest,
            step,
            json,
        } => pagemill_cli::commands::status::run(manifest.clone(), step.clone(), *json, &config).await,

        Commands::Reset {
            step,
            manifest,
            processing,
        } => {
            pagemill_cli::commands::reset::run(step.clone(), manifest.clone(), *processing, &config)
                .await
        },
    }
}
