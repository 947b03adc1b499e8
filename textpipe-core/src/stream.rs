//! # Execução em Streaming
//!
//! Três papéis, cada um em sua(s) própria(s) task(s), ligados por filas limitadas:
//!
//! ```text
//!             lotes                 resultados
//! [Leitor] ──────────► [Processadores] ──────────► [Escritores] ──► destinos (JSONL)
//!    │                       │           erros            │
//!    └───────────────────────┴──────────────────────────► └──────► diagnósticos
//! ```
//!
//! - **Leitor**: lê registros JSONL `{"input": ..., "output": ...}` de cada fonte, em ordem,
//!   agrupa em lotes de `batch_size` e envia o lote final parcial.
//! - **Processadores**: rodam o pipeline em cada lote (em `spawn_blocking`, a inferência é
//!   síncrona), preenchem `output` e serializam. Um lote que falha vira um item na fila de
//!   erros e é descartado.
//! - **Escritores**: esvaziam as duas filas ao mesmo tempo, sem prioridade entre elas, até
//!   que ambas estejam fechadas.
//!
//! O fechamento é em cascata: o leitor fecha a fila de lotes ao terminar; quando todos os
//! processadores saem, as filas de resultados e de erros se fecham; os escritores saem
//! quando as duas estiverem fechadas e vazias.
//!
//! Dentro de um lote a ordem é preservada. Entre lotes, só há garantia com um processador.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;

/// Destino assíncrono de linhas (arquivo, stdout, buffer de teste).
pub type Sink = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub batch_size: usize,
    pub process_workers: usize,
    pub write_workers: usize,
    /// Capacidade de cada fila (lotes, resultados e erros).
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            process_workers: 1,
            write_workers: 1,
            queue_capacity: 1000,
        }
    }
}

impl StreamConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_process_workers(mut self, workers: usize) -> Self {
        self.process_workers = workers;
        self
    }

    pub fn with_write_workers(mut self, workers: usize) -> Self {
        self.write_workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("process_workers", self.process_workers),
            ("write_workers", self.write_workers),
            ("queue_capacity", self.queue_capacity),
        ] {
            if value == 0 {
                violations.push(format!("{name} deve ser maior que zero"));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(violations))
        }
    }
}

/// Uma linha de entrada. Campos além de `input` e `output` são preservados na saída.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub input: String,
    #[serde(default)]
    pub output: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Uma fonte de registros com um nome para os diagnósticos.
pub struct InputSource {
    pub name: String,
    reader: Box<dyn AsyncRead + Unpin + Send>,
}

impl InputSource {
    pub fn new(name: impl Into<String>, reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        Self {
            name: name.into(),
            reader: Box::new(reader),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            PipelineError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", path.display()),
            ))
        })?;
        Ok(Self::new(path.display().to_string(), file))
    }

    pub fn stdin() -> Self {
        Self::new("<stdin>", tokio::io::stdin())
    }
}

/// Um lote que não gerou resultados. `inputs` vazio: falha da própria fonte.
#[derive(Debug)]
struct StreamFailure {
    inputs: Vec<String>,
    message: String,
}

impl StreamFailure {
    /// Uma linha de diagnóstico por entrada afetada (ou uma só, sem entradas).
    fn diagnostic_lines(&self) -> Vec<String> {
        let message = self.message.replace('\n', "; ");
        if self.inputs.is_empty() {
            return vec![format!("error: {message}")];
        }
        self.inputs
            .iter()
            .map(|input| format!("error: {message} [input: {input:?}]"))
            .collect()
    }
}

/// Contagens de uma execução completa.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    /// Registros aceitos pelo leitor (linhas em branco não contam).
    pub records_read: u64,
    pub results_written: u64,
    /// Linhas de diagnóstico escritas.
    pub errors_reported: u64,
}

pub struct StreamEngine {
    pipeline: Arc<dyn Pipeline>,
    config: StreamConfig,
}

impl StreamEngine {
    pub fn new(pipeline: Arc<dyn Pipeline>, config: StreamConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Roda até esgotar as fontes. `sinks` tem um destino por escritor.
    ///
    /// Falhas por lote não interrompem o fluxo (viram diagnósticos). O erro devolvido
    /// reúne apenas falhas de escrita e de fechamento dos destinos.
    pub async fn run(
        &self,
        sources: Vec<InputSource>,
        sinks: Vec<Sink>,
        diagnostics: Sink,
    ) -> Result<StreamSummary> {
        self.config.validate()?;
        if sinks.len() != self.config.write_workers {
            return Err(PipelineError::Config(vec![format!(
                "{} destinos para {} escritores",
                sinks.len(),
                self.config.write_workers
            )]));
        }

        let capacity = self.config.queue_capacity;
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<InputRecord>>(capacity);
        let (result_tx, result_rx) = mpsc::channel::<String>(capacity);
        let (error_tx, error_rx) = mpsc::channel::<StreamFailure>(capacity);

        let reader = tokio::spawn(read_sources(
            sources,
            self.config.batch_size,
            batch_tx,
            error_tx.clone(),
        ));

        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let processors: Vec<JoinHandle<()>> = (0..self.config.process_workers)
            .map(|id| {
                tokio::spawn(process_batches(
                    id,
                    self.pipeline.clone(),
                    batch_rx.clone(),
                    result_tx.clone(),
                    error_tx.clone(),
                ))
            })
            .collect();
        // as filas de saída fecham quando o último processador (e o leitor) soltar o seu lado
        drop(result_tx);
        drop(error_tx);

        let result_rx = Arc::new(Mutex::new(result_rx));
        let error_rx = Arc::new(Mutex::new(error_rx));
        let diagnostics = Arc::new(Mutex::new(diagnostics));
        let writers: Vec<JoinHandle<WriterReport>> = sinks
            .into_iter()
            .enumerate()
            .map(|(id, sink)| {
                tokio::spawn(write_results(
                    id,
                    sink,
                    result_rx.clone(),
                    error_rx.clone(),
                    diagnostics.clone(),
                ))
            })
            .collect();

        let mut errors = Vec::new();
        let mut summary = StreamSummary::default();

        match reader.await {
            Ok(read) => summary.records_read = read,
            Err(e) => errors.push(join_error("leitor", e)),
        }
        for handle in processors {
            if let Err(e) = handle.await {
                errors.push(join_error("processador", e));
            }
        }
        for handle in writers {
            match handle.await {
                Ok(report) => {
                    summary.results_written += report.results_written;
                    summary.errors_reported += report.errors_reported;
                    errors.extend(report.errors);
                }
                Err(e) => errors.push(join_error("escritor", e)),
            }
        }
        {
            let mut diagnostics = diagnostics.lock().await;
            if let Err(e) = diagnostics.flush().await {
                errors.push(PipelineError::Io(e));
            }
        }

        info!(
            records = summary.records_read,
            results = summary.results_written,
            errors = summary.errors_reported,
            "stream concluído"
        );
        match PipelineError::join(errors) {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

fn join_error(role: &str, err: tokio::task::JoinError) -> PipelineError {
    PipelineError::Io(std::io::Error::other(format!("task {role} terminou com falha: {err}")))
}

/// Lê todas as fontes em ordem. Devolve o número de registros aceitos.
async fn read_sources(
    sources: Vec<InputSource>,
    batch_size: usize,
    batches: mpsc::Sender<Vec<InputRecord>>,
    errors: mpsc::Sender<StreamFailure>,
) -> u64 {
    let mut accepted = 0u64;
    let mut batch = Vec::with_capacity(batch_size);

    'sources: for source in sources {
        let mut lines = BufReader::new(source.reader).lines();
        let mut line_number = 0usize;
        loop {
            line_number += 1;
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    let message = format!("{}:{line_number}: leitura falhou: {e}", source.name);
                    error!(source = %source.name, line = line_number, error = %e, "fonte abortada");
                    let _ = errors.send(StreamFailure { inputs: Vec::new(), message }).await;
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<InputRecord>(&line) {
                Ok(record) => record,
                Err(e) => {
                    let message = format!("{}:{line_number}: JSON inválido: {e}", source.name);
                    error!(source = %source.name, line = line_number, error = %e, "fonte abortada");
                    let _ = errors.send(StreamFailure { inputs: Vec::new(), message }).await;
                    break;
                }
            };
            accepted += 1;
            batch.push(record);
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                if batches.send(full).await.is_err() {
                    break 'sources;
                }
            }
        }
        debug!(source = %source.name, lines = line_number - 1, "fonte lida");
    }

    if !batch.is_empty() {
        let _ = batches.send(batch).await;
    }
    accepted
}

async fn recv_shared<T>(queue: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
    queue.lock().await.recv().await
}

async fn process_batches(
    worker: usize,
    pipeline: Arc<dyn Pipeline>,
    batches: Arc<Mutex<mpsc::Receiver<Vec<InputRecord>>>>,
    results: mpsc::Sender<String>,
    errors: mpsc::Sender<StreamFailure>,
) {
    while let Some(mut records) = recv_shared(&batches).await {
        let inputs: Vec<String> = records.iter().map(|r| r.input.clone()).collect();
        match run_batch(pipeline.clone(), inputs.clone(), &mut records).await {
            Ok(lines) => {
                for line in lines {
                    if results.send(line).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(worker, inputs = inputs.len(), error = %e, "lote descartado");
                let failure = StreamFailure {
                    inputs,
                    message: e.to_string(),
                };
                if errors.send(failure).await.is_err() {
                    return;
                }
            }
        }
    }
    debug!(worker, "processador encerrado");
}

/// Roda o pipeline e devolve uma linha JSON por registro, na ordem do lote.
async fn run_batch(
    pipeline: Arc<dyn Pipeline>,
    inputs: Vec<String>,
    records: &mut [InputRecord],
) -> Result<Vec<String>> {
    let output = tokio::task::spawn_blocking(move || pipeline.run(&inputs))
        .await
        .map_err(|e| join_error("pipeline", e))??;
    let values = output.into_values()?;
    if values.len() != records.len() {
        return Err(PipelineError::Shape(format!(
            "{} resultados para {} registros",
            values.len(),
            records.len()
        )));
    }
    records
        .iter_mut()
        .zip(values)
        .map(|(record, value)| {
            record.output = value;
            Ok(serde_json::to_string(&*record)?)
        })
        .collect()
}

struct WriterReport {
    results_written: u64,
    errors_reported: u64,
    errors: Vec<PipelineError>,
}

async fn write_results(
    worker: usize,
    mut sink: Sink,
    results: Arc<Mutex<mpsc::Receiver<String>>>,
    failures: Arc<Mutex<mpsc::Receiver<StreamFailure>>>,
    diagnostics: Arc<Mutex<Sink>>,
) -> WriterReport {
    let mut report = WriterReport {
        results_written: 0,
        errors_reported: 0,
        errors: Vec::new(),
    };
    let mut sink_failed = false;
    let mut results_open = true;
    let mut failures_open = true;

    loop {
        tokio::select! {
            line = recv_shared(&results), if results_open => match line {
                // depois da primeira falha só esvaziamos a fila
                Some(_) if sink_failed => {}
                Some(line) => match write_line(&mut sink, &line).await {
                    Ok(()) => report.results_written += 1,
                    Err(e) => {
                        error!(worker, error = %e, "falha ao escrever resultado");
                        report.errors.push(PipelineError::Io(e));
                        sink_failed = true;
                    }
                },
                None => results_open = false,
            },
            failure = recv_shared(&failures), if failures_open => match failure {
                Some(failure) => {
                    let mut diagnostics = diagnostics.lock().await;
                    for line in failure.diagnostic_lines() {
                        match write_line(&mut *diagnostics, &line).await {
                            Ok(()) => report.errors_reported += 1,
                            Err(e) => {
                                report.errors.push(PipelineError::Io(e));
                                break;
                            }
                        }
                    }
                }
                None => failures_open = false,
            },
            else => break,
        }
    }

    if let Err(e) = sink.flush().await {
        report.errors.push(PipelineError::Io(e));
    }
    if let Err(e) = sink.shutdown().await {
        report.errors.push(PipelineError::Io(e));
    }
    debug!(worker, written = report.results_written, "escritor encerrado");
    report
}

async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, line: &str) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer.write_all(&buf).await
}
