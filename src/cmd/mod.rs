use anyhow::{Context, Result};
use llama_inference::infra::read_meta;
use llama_inference::{CancelToken, ComponentConfig, InferenceComponent, LoggingHandler, StopReason};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

pub struct GenerateArgs {
    pub model: PathBuf,
    pub prompt: String,
    pub config: ComponentConfig,
    pub verbose: bool,
}

pub async fn generate(args: GenerateArgs) -> Result<()> {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let mut task = tokio::task::spawn_blocking(move || run_generation(args, cancel_tx));

    let cancel = cancel_rx.await.ok();
    tokio::select! {
        result = &mut task => result.context("generation task aborted")?,
        _ = tokio::signal::ctrl_c() => {
            if let Some(cancel) = cancel {
                eprintln!("\n^C, stopping");
                cancel.cancel();
            }
            task.await.context("generation task aborted")?
        }
    }
}

fn run_generation(args: GenerateArgs, cancel_tx: oneshot::Sender<CancelToken>) -> Result<()> {
    let mut component = InferenceComponent::with_gguf(args.config);
    if args.verbose {
        component.subscribe(LoggingHandler);
    }
    component.on_token_generated(|text| {
        print!("{text}");
        let _ = io::stdout().flush();
    });

    component
        .load_model_default(&args.model)
        .with_context(|| format!("loading {}", args.model.display()))?;
    component.generate_response(&args.prompt)?;
    if let Some(cancel) = component.cancel_token() {
        let _ = cancel_tx.send(cancel);
    }

    let outcome = component
        .wait_for_response()
        .context("generation ended without a result")?;
    println!();

    let response = outcome?;
    if let StopReason::DecodeFailed(reason) = &response.stop_reason {
        eprintln!("warning: output is incomplete: {reason}");
    }
    eprintln!(
        "{} prompt tokens in {:.2?}, {} generated in {:.2?} ({:.1} tok/s), stop: {:?}",
        response.prompt_tokens,
        response.prompt_eval_duration,
        response.generated_tokens,
        response.eval_duration,
        response.tokens_per_second(),
        response.stop_reason,
    );

    component.unload_model();
    Ok(())
}

pub async fn info(model: &Path) -> Result<()> {
    let meta = read_meta(model).with_context(|| format!("reading {}", model.display()))?;

    println!("  {:<16} {}", "name", if meta.name.is_empty() { "-" } else { &meta.name });
    println!("  {:<16} {}", "architecture", meta.architecture);
    println!("  {:<16} {}", "context length", meta.context_length);
    println!("  {:<16} {}", "vocabulary", meta.vocab_size);
    println!(
        "  {:<16} {}",
        "quantization",
        meta.quantization.as_deref().unwrap_or("-")
    );
    Ok(())
}
