use std::path::PathBuf;

use clap::Parser;
use owo_colors::OwoColorize;

mod cli;

use cli::op::{Op, OpContext};
use cli::ops::Command;
use loft_daemon::process::init_logging;

#[derive(Parser, Debug)]
#[command(name = "loft", version, about = "Offload files to object storage and hydrate them on read")]
struct Cli {
    /// Directory holding the metadata store, saved config and caches
    #[arg(long, global = true, env = "LOFT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `loft_daemon=debug`
    #[arg(long, global = true, env = "LOFT_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let ctx = OpContext {
        config_dir: args.config_dir.clone(),
    };

    // Engine modes also log to <config_dir>/agent.log.
    let log_file = if args.command.runs_engine() {
        ctx.state().ok().map(|state| state.log_path)
    } else {
        None
    };
    let guard = init_logging(&args.log_level, log_file.as_deref());

    let code = match args.command.execute(&ctx).await {
        Ok(output) => {
            let text = output.to_string();
            if !text.is_empty() {
                println!("{text}");
            }
            0
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  {} {cause}", "caused by:".dimmed());
                source = cause.source();
            }
            1
        }
    };

    // Flush the file log before exiting.
    drop(guard);
    std::process::exit(code);
}
