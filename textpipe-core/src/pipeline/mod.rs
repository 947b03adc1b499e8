//! # Contrato dos Pipelines
//!
//! Todo pipeline segue a mesma máquina de estados linear, por chamada:
//!
//! ```text
//! Criado → Validado → Pré-processado → Forward → Pós-processado → Destruído
//! ```
//!
//! - [`Pipeline::validate`]: checa a configuração e reporta **todas** as violações juntas.
//! - [`Pipeline::preprocess`]: tokeniza as strings e monta os tensores de entrada.
//! - [`Pipeline::forward`]: entrega os tensores ao motor de inferência.
//! - [`Pipeline::postprocess`]: redutor específico de cada tipo de pipeline.
//! - [`Pipeline::run`]: compõe as etapas sobre um [`PipelineBatch`] exclusivo da chamada.
//!
//! O estado comum (sessão, tokenizador, metadados, cronômetros) fica em [`BasePipeline`];
//! cada tipo de pipeline compõe essa base com seus campos próprios.

pub mod feature_extraction;
pub mod text_classification;
pub mod token_classification;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::PipelineBatch;
use crate::engine::{ModelSession, TensorInfo};
use crate::error::{PipelineError, Result};
use crate::tensor::build_input_tensors;
use crate::tokenizer::{Tokenizer, TokenizerOptions};

pub use feature_extraction::{FeatureExtractionConfig, FeatureExtractionOutput, FeatureExtractionPipeline};
pub use text_classification::{
    ClassificationOutput, ProblemType, ScoreFunction, TextClassificationConfig,
    TextClassificationOutput, TextClassificationPipeline,
};
pub use token_classification::{
    TokenClassificationConfig, TokenClassificationOutput, TokenClassificationPipeline,
};

/// Os tipos de pipeline suportados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineKind {
    FeatureExtraction,
    TextClassification,
    TokenClassification,
}

impl PipelineKind {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::FeatureExtraction => "featureExtraction",
            PipelineKind::TextClassification => "textClassification",
            PipelineKind::TokenClassification => "tokenClassification",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineKind {
    type Err = PipelineError;

    /// Aceita `tokenClassification`, `token-classification` e `token_classification`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "featureextraction" => Ok(PipelineKind::FeatureExtraction),
            "textclassification" => Ok(PipelineKind::TextClassification),
            "tokenclassification" => Ok(PipelineKind::TokenClassification),
            _ => Err(PipelineError::Config(vec![format!(
                "tipo de pipeline {s} não implementado"
            )])),
        }
    }
}

/// Cronômetro acumulado: número de chamadas e tempo total em nanossegundos.
///
/// Atualizado com incrementos atômicos, pois várias threads podem usar o mesmo pipeline.
#[derive(Debug, Default)]
pub struct Timings {
    num_calls: AtomicU64,
    total_ns: AtomicU64,
}

impl Timings {
    pub fn record(&self, elapsed: Duration) {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        self.total_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }

    pub fn average(&self) -> Duration {
        let calls = self.num_calls().max(1);
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed) / calls)
    }
}

/// Sessão de inferência + tokenizador de um modelo carregado.
///
/// Compartilhado por referência entre todos os pipelines e workers que o usam.
/// A destruição é explícita e acontece uma única vez, não importa quantos donos chamem.
pub struct ModelHandle {
    session: Arc<dyn ModelSession>,
    tokenizer: Arc<dyn Tokenizer>,
    destroyed: AtomicBool,
}

impl ModelHandle {
    pub fn new(session: Arc<dyn ModelSession>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            session,
            tokenizer,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &dyn ModelSession {
        self.session.as_ref()
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Libera tokenizador e sessão. Chamadas repetidas não fazem nada.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Err(e) = self.tokenizer.destroy() {
            errors.push(PipelineError::Tokenizer(e));
        }
        if let Err(e) = self.session.destroy() {
            errors.push(PipelineError::Inference(e));
        }
        match PipelineError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Estado comum a todos os tipos de pipeline.
pub struct BasePipeline {
    pub name: String,
    handle: Arc<ModelHandle>,
    pub inputs_meta: Vec<TensorInfo>,
    pub outputs_meta: Vec<TensorInfo>,
    pub tokenizer_options: TokenizerOptions,
    pub tokenizer_timings: Timings,
    pub inference_timings: Timings,
}

impl BasePipeline {
    /// Lê os metadados da sessão e deriva as opções do tokenizador das entradas do modelo.
    pub fn new(name: impl Into<String>, handle: Arc<ModelHandle>) -> Result<Self> {
        let inputs_meta = handle.session().inputs().to_vec();
        let outputs_meta = handle.session().outputs().to_vec();
        let tokenizer_options = TokenizerOptions::for_model_inputs(&inputs_meta)?;
        Ok(Self {
            name: name.into(),
            handle,
            inputs_meta,
            outputs_meta,
            tokenizer_options,
            tokenizer_timings: Timings::default(),
            inference_timings: Timings::default(),
        })
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.handle.tokenizer()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.handle.is_destroyed() {
            return Err(PipelineError::Destroyed(self.name.clone()));
        }
        Ok(())
    }

    /// Tokeniza todas as strings (reportando todas as falhas juntas) e monta os tensores.
    pub fn preprocess(&self, batch: &mut PipelineBatch, inputs: &[String]) -> Result<()> {
        self.ensure_alive()?;
        let start = Instant::now();
        let mut errors = Vec::new();
        batch.inputs = Vec::with_capacity(inputs.len());
        for text in inputs {
            match self.tokenizer().encode(text, &self.tokenizer_options) {
                Ok(tokenized) => batch.inputs.push(tokenized),
                Err(e) => errors.push(PipelineError::Tokenizer(e)),
            }
        }
        self.tokenizer_timings.record(start.elapsed());
        if let Some(err) = PipelineError::join(errors) {
            return Err(err);
        }

        batch.max_sequence_length = batch.inputs.iter().map(|i| i.len()).max().unwrap_or(0);
        batch.input_tensors =
            build_input_tensors(&batch.inputs, batch.max_sequence_length, &self.inputs_meta)?;
        Ok(())
    }

    /// Executa a sessão. Lotes vazios não chegam ao motor.
    pub fn forward(&self, batch: &mut PipelineBatch) -> Result<()> {
        self.ensure_alive()?;
        if batch.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let outputs = self
            .handle
            .session()
            .run(&batch.input_tensors)
            .map_err(PipelineError::Inference)?;
        let elapsed = start.elapsed();
        self.inference_timings.record(elapsed);
        debug!(
            pipeline = %self.name,
            inputs = batch.len(),
            seq = batch.max_sequence_length,
            elapsed_us = elapsed.as_micros() as u64,
            "forward concluído"
        );
        batch.output_tensors = outputs;
        Ok(())
    }

    /// Posição de uma saída do modelo pelo nome.
    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs_meta.iter().position(|o| o.name == name)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            name: self.name.clone(),
            tokenizer_calls: self.tokenizer_timings.num_calls(),
            tokenizer_total: self.tokenizer_timings.total(),
            tokenizer_average: self.tokenizer_timings.average(),
            inference_calls: self.inference_timings.num_calls(),
            inference_total: self.inference_timings.total(),
            inference_average: self.inference_timings.average(),
        }
    }

    pub fn destroy(&self) -> Result<()> {
        self.handle.destroy()
    }
}

/// Estatísticas acumuladas de um pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub name: String,
    pub tokenizer_calls: u64,
    pub tokenizer_total: Duration,
    pub tokenizer_average: Duration,
    pub inference_calls: u64,
    pub inference_total: Duration,
    pub inference_average: Duration,
}

impl PipelineStats {
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Estatísticas do pipeline: {}", self.name),
            format!(
                "Tokenizador: tempo total={:?}, execuções={}, tempo médio={:?}",
                self.tokenizer_total, self.tokenizer_calls, self.tokenizer_average
            ),
            format!(
                "Inferência: tempo total={:?}, execuções={}, tempo médio={:?}",
                self.inference_total, self.inference_calls, self.inference_average
            ),
        ]
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines().join("\n"))
    }
}

/// Saídas e dimensões que o pipeline consome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetadata {
    pub outputs_info: Vec<TensorInfo>,
}

/// Resultado de uma chamada `run`, um item por string de entrada.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineOutput {
    FeatureExtraction(FeatureExtractionOutput),
    TextClassification(TextClassificationOutput),
    TokenClassification(TokenClassificationOutput),
}

impl PipelineOutput {
    pub fn empty(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::FeatureExtraction => {
                PipelineOutput::FeatureExtraction(FeatureExtractionOutput::default())
            }
            PipelineKind::TextClassification => {
                PipelineOutput::TextClassification(TextClassificationOutput::default())
            }
            PipelineKind::TokenClassification => {
                PipelineOutput::TokenClassification(TokenClassificationOutput::default())
            }
        }
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            PipelineOutput::FeatureExtraction(_) => PipelineKind::FeatureExtraction,
            PipelineOutput::TextClassification(_) => PipelineKind::TextClassification,
            PipelineOutput::TokenClassification(_) => PipelineKind::TokenClassification,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PipelineOutput::FeatureExtraction(o) => o.embeddings.len(),
            PipelineOutput::TextClassification(o) => o.classifications.len(),
            PipelineOutput::TokenClassification(o) => o.entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Um valor JSON por entrada, na ordem do lote.
    pub fn into_values(self) -> Result<Vec<serde_json::Value>> {
        fn to_values<T: Serialize>(items: Vec<T>) -> Result<Vec<serde_json::Value>> {
            items
                .into_iter()
                .map(|item| serde_json::to_value(item).map_err(PipelineError::from))
                .collect()
        }
        match self {
            PipelineOutput::FeatureExtraction(o) => to_values(o.embeddings),
            PipelineOutput::TextClassification(o) => to_values(o.classifications),
            PipelineOutput::TokenClassification(o) => to_values(o.entities),
        }
    }
}

/// Interface comum dos três tipos de pipeline.
pub trait Pipeline: Send + Sync {
    fn base(&self) -> &BasePipeline;

    fn kind(&self) -> PipelineKind;

    fn validate(&self) -> Result<()>;

    fn postprocess(&self, batch: &PipelineBatch) -> Result<PipelineOutput>;

    fn metadata(&self) -> PipelineMetadata;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn preprocess(&self, batch: &mut PipelineBatch, inputs: &[String]) -> Result<()> {
        self.base().preprocess(batch, inputs)
    }

    fn forward(&self, batch: &mut PipelineBatch) -> Result<()> {
        self.base().forward(batch)
    }

    /// Compõe as etapas sobre um lote novo; o lote é liberado em qualquer saída.
    fn run(&self, inputs: &[String]) -> Result<PipelineOutput> {
        let mut batch = PipelineBatch::new();
        self.preprocess(&mut batch, inputs)?;
        self.forward(&mut batch)?;
        self.postprocess(&batch)
    }

    fn stats(&self) -> PipelineStats {
        self.base().stats()
    }

    fn destroy(&self) -> Result<()> {
        self.base().destroy()
    }
}

/// Violação comum: o modelo precisa declarar ao menos uma saída.
pub(crate) fn first_output(base: &BasePipeline, violations: &mut Vec<String>) -> Option<TensorInfo> {
    let output = base.outputs_meta.first().cloned();
    if output.is_none() {
        violations.push("o modelo não declara nenhuma saída".to_string());
    }
    output
}

pub(crate) fn violations_to_result(violations: Vec<String>) -> Result<()> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Config(violations))
    }
}
