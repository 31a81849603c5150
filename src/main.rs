mod cmd;

use clap::{Parser, Subcommand};
use llama_inference::ComponentConfig;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "llama-inference")]
#[command(version)]
#[command(about = "Greedy, streaming text generation over GGUF models", long_about = None)]
struct Cli {
    /// YAML file with component settings; LLAMA_* variables apply otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a response and stream it to stdout
    Generate {
        model: PathBuf,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
        #[arg(long)]
        context_size: Option<usize>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Hide control tokens in the output
        #[arg(long)]
        no_special: bool,
    },
    /// Show model metadata without loading weights
    Info { model: PathBuf },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ComponentConfig> {
    match path {
        Some(path) => ComponentConfig::from_yaml_file(path),
        None => Ok(ComponentConfig::from_env()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Generate {
            model,
            prompt,
            context_size,
            threads,
            max_tokens,
            no_special,
        } => match load_config(cli.config.as_ref()) {
            Ok(mut config) => {
                if let Some(n) = context_size {
                    config.context_size = n;
                }
                if let Some(n) = threads {
                    config.thread_count = n;
                }
                if let Some(n) = max_tokens {
                    config.max_tokens = n;
                }
                if no_special {
                    config.render_special_tokens = false;
                }
                cmd::generate(cmd::GenerateArgs {
                    model,
                    prompt: prompt.join(" "),
                    config,
                    verbose: cli.verbose,
                })
                .await
            }
            Err(e) => Err(e),
        },
        Commands::Info { model } => cmd::info(&model).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
