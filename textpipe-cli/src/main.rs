//! # textpipe: linha de comando
//!
//! ```text
//! textpipe run --model modelos/bert-ner --type tokenClassification --input dados/ --output resultados/
//! ```
//!
//! - `--input`: arquivo `.jsonl` ou diretório (todos os `*.jsonl`, recursivamente).
//!   Sem `--input`, lê da entrada padrão (se for um terminal, não há nada a processar).
//! - `--output`: diretório onde cada escritor grava `result-<i>.jsonl`.
//!   Sem `--output`, os resultados vão para a saída padrão.
//!
//! Diagnósticos e logs vão sempre para a saída de erro.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::BufWriter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use textpipe_core::stream::Sink;
use textpipe_core::{
    InferenceEngine, InputSource, PipelineKind, Runtime, StreamConfig, StreamEngine, StreamSummary,
};

#[derive(Parser)]
#[command(name = "textpipe")]
#[command(about = "Roda pipelines neurais pré-treinados sobre registros JSONL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Executa um pipeline sobre um fluxo de registros {"input": ..., "output": ...}
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Diretório do modelo (um .onnx, tokenizer.json e, para classificação, config.json)
    #[arg(short = 'p', long, env = "TEXTPIPE_MODEL", value_name = "DIR")]
    model: PathBuf,

    /// featureExtraction, textClassification ou tokenClassification
    #[arg(short = 't', long = "type", env = "TEXTPIPE_TYPE", value_name = "TYPE")]
    kind: PipelineKind,

    /// Arquivo ou diretório de entrada (padrão: entrada padrão)
    #[arg(short = 'i', long, env = "TEXTPIPE_INPUT", value_name = "PATH")]
    input: Option<PathBuf>,

    /// Diretório de saída (padrão: saída padrão)
    #[arg(short = 'o', long, env = "TEXTPIPE_OUTPUT", value_name = "DIR")]
    output: Option<PathBuf>,

    /// Biblioteca compartilhada do ONNX Runtime
    #[arg(
        short = 's',
        long,
        alias = "onnxruntimeSharedLibrary",
        env = "TEXTPIPE_ONNXRUNTIME_SHARED_LIBRARY",
        value_name = "FILE"
    )]
    onnxruntime_shared_library: Option<PathBuf>,

    #[arg(short = 'b', long, alias = "batchSize", env = "TEXTPIPE_BATCH_SIZE", default_value_t = 20)]
    batch_size: usize,

    #[arg(long, env = "TEXTPIPE_PROCESS_WORKERS", default_value_t = 1)]
    process_workers: usize,

    /// Com --output, um arquivo result-<i>.jsonl por escritor
    #[arg(long, env = "TEXTPIPE_WRITE_WORKERS", default_value_t = 1)]
    write_workers: usize,
}

impl RunArgs {
    fn stream_config(&self) -> StreamConfig {
        let write_workers = if self.output.is_some() {
            self.write_workers
        } else {
            1
        };
        StreamConfig::default()
            .with_batch_size(self.batch_size)
            .with_process_workers(self.process_workers)
            .with_write_workers(write_workers)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.stream_config();
    config.validate()?;
    if args.output.is_none() && args.write_workers > 1 {
        warn!("sem --output há um único destino (saída padrão); usando 1 escritor");
    }

    let engine = create_engine(args.onnxruntime_shared_library.clone())?;
    info!(engine = engine.name(), kind = %args.kind, model = %args.model.display(), "iniciando");
    run_with_runtime(&args, config, Runtime::new(engine)).await
}

/// Daqui em diante o motor pertence ao runtime: qualquer saída passa por `destroy`.
async fn run_with_runtime(args: &RunArgs, config: StreamConfig, runtime: Runtime) -> Result<()> {
    let outcome = execute(args, config, &runtime).await;

    for stats in runtime.stats() {
        for line in stats.lines() {
            info!("{line}");
        }
    }
    let teardown = runtime.destroy();

    match (outcome, teardown) {
        (Ok(summary), Ok(())) => {
            info!(
                records = summary.records_read,
                results = summary.results_written,
                errors = summary.errors_reported,
                "concluído"
            );
            Ok(())
        }
        (Ok(_), Err(t)) => Err(anyhow::Error::new(t).context("falha ao liberar os recursos")),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(t)) => Err(e.context(format!("e a liberação dos recursos falhou: {t}"))),
    }
}

async fn execute(args: &RunArgs, config: StreamConfig, runtime: &Runtime) -> Result<StreamSummary> {
    let pipeline = runtime
        .new_pipeline(args.kind, &args.model, "textpipe")
        .with_context(|| format!("não foi possível criar o pipeline {}", args.kind))?;
    let sources = open_sources(args.input.as_deref()).await?;
    let sinks = open_sinks(args.output.as_deref(), config.write_workers).await?;

    StreamEngine::new(pipeline, config)
        .run(sources, sinks, Box::new(tokio::io::stderr()))
        .await
        .context("falha ao escrever os resultados")
}

async fn open_sources(input: Option<&Path>) -> Result<Vec<InputSource>> {
    let Some(path) = input else {
        return Ok(stdin_sources(std::io::stdin().is_terminal()));
    };

    let files = textpipe_core::fs::walk_files(path, "jsonl")
        .with_context(|| format!("entrada inválida: {}", path.display()))?;
    if files.is_empty() {
        warn!(input = %path.display(), "nenhum arquivo .jsonl encontrado");
    }
    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        sources.push(InputSource::open(&file).await?);
    }
    Ok(sources)
}

/// Um terminal na entrada padrão não é uma fonte: nada a processar.
fn stdin_sources(is_terminal: bool) -> Vec<InputSource> {
    if is_terminal {
        warn!("nenhuma entrada: use --input ou redirecione a entrada padrão");
        return Vec::new();
    }
    vec![InputSource::stdin()]
}

async fn open_sinks(output: Option<&Path>, writers: usize) -> Result<Vec<Sink>> {
    let Some(dir) = output else {
        let stdout: Sink = Box::new(tokio::io::stdout());
        return Ok(vec![stdout]);
    };
    let mut sinks: Vec<Sink> = Vec::with_capacity(writers);
    for i in 0..writers {
        let path = dir.join(format!("result-{i}.jsonl"));
        let file = textpipe_core::fs::new_writer(&path)
            .await
            .with_context(|| format!("não foi possível criar {}", path.display()))?;
        sinks.push(Box::new(BufWriter::new(file)));
    }
    Ok(sinks)
}

#[cfg(feature = "onnx")]
fn create_engine(shared_library: Option<PathBuf>) -> Result<Arc<dyn InferenceEngine>> {
    use textpipe_core::engine::onnx::OnnxEngine;

    let library = shared_library.or_else(default_shared_library);
    let engine = OnnxEngine::new(library.as_deref()).context("falha ao inicializar o ONNX Runtime")?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "onnx"))]
fn create_engine(_shared_library: Option<PathBuf>) -> Result<Arc<dyn InferenceEngine>> {
    anyhow::bail!("textpipe foi compilado sem motor de inferência: recompile com `--features onnx`")
}

/// `$HOME/lib/textpipe/onnxruntime.so`, se existir.
#[cfg(feature = "onnx")]
fn default_shared_library() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let path = PathBuf::from(home).join("lib/textpipe/onnxruntime.so");
    path.exists().then_some(path)
}
