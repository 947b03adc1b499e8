//! # Classificação de Tokens (NER)
//!
//! Pós-processamento por entrada, em paralelo (rayon):
//!
//! ```text
//! logits [seq × rótulos] ─softmax─► pré-entidades ─argmax─► entidades ─BIO─► grupos ─filtro─► saída
//! ```
//!
//! O tokenizador é sempre chamado pedindo offsets e máscara de tokens especiais,
//! pois a agregação precisa dos dois.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    first_output, violations_to_result, BasePipeline, ModelHandle, Pipeline, PipelineKind,
    PipelineMetadata, PipelineOutput,
};
use crate::aggregation::{aggregate, filter_entities, gather_pre_entities, AggregationStrategy};
use crate::batch::PipelineBatch;
use crate::error::{PipelineError, Result};
use crate::tagger::Entity;
use crate::tensor::{extract_logits, softmax};
use crate::tokenizer::TokenizedInput;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClassificationConfig {
    pub id2label: BTreeMap<usize, String>,
    pub aggregation: AggregationStrategy,
    pub ignore_labels: Vec<String>,
}

impl Default for TokenClassificationConfig {
    fn default() -> Self {
        Self {
            id2label: BTreeMap::new(),
            aggregation: AggregationStrategy::Simple,
            ignore_labels: vec!["O".to_string()],
        }
    }
}

impl TokenClassificationConfig {
    pub fn new(id2label: BTreeMap<usize, String>) -> Self {
        Self {
            id2label,
            ..Default::default()
        }
    }

    pub fn with_aggregation(mut self, strategy: AggregationStrategy) -> Self {
        self.aggregation = strategy;
        self
    }

    pub fn with_ignore_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ignore_labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClassificationOutput {
    /// Uma lista de entidades por entrada.
    pub entities: Vec<Vec<Entity>>,
}

pub struct TokenClassificationPipeline {
    base: BasePipeline,
    config: TokenClassificationConfig,
}

impl TokenClassificationPipeline {
    pub fn new(
        name: impl Into<String>,
        handle: Arc<ModelHandle>,
        config: TokenClassificationConfig,
    ) -> Result<Self> {
        let mut base = BasePipeline::new(name, handle)?;
        base.tokenizer_options = base
            .tokenizer_options
            .with_offsets()
            .with_special_tokens_mask();
        info!(
            pipeline = %base.name,
            labels = config.id2label.len(),
            aggregation = %config.aggregation,
            "pipeline de classificação de tokens criado"
        );
        Ok(Self { base, config })
    }

    pub fn config(&self) -> &TokenClassificationConfig {
        &self.config
    }

    fn entities_for(&self, input: &TokenizedInput, logits: &[Vec<f32>]) -> Result<Vec<Entity>> {
        let probabilities: Vec<Vec<f32>> = logits.iter().map(|l| softmax(l)).collect();
        let pre_entities = gather_pre_entities(input, &probabilities)?;
        let tokenizer = self.base.tokenizer();
        let entities = aggregate(
            input,
            &pre_entities,
            &self.config.id2label,
            self.config.aggregation,
            |ids| tokenizer.decode(ids, false).map_err(PipelineError::from),
        )?;
        Ok(filter_entities(entities, &self.config.ignore_labels))
    }
}

impl Pipeline for TokenClassificationPipeline {
    fn base(&self) -> &BasePipeline {
        &self.base
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::TokenClassification
    }

    fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        if let Some(output) = first_output(&self.base, &mut violations) {
            if output.rank() != 3 {
                violations.push(format!(
                    "a saída '{}' deve ter três dimensões (lote, sequência, logits), tem {}",
                    output.name,
                    output.rank()
                ));
            }
            if output.last_dimension().unwrap_or(0) <= 0 {
                violations.push("a dimensão dos logits não pode ser dinâmica".to_string());
            }
        }
        if self.config.id2label.is_empty() {
            violations.push("o mapa id2label está vazio".to_string());
        }
        violations_to_result(violations)
    }

    fn postprocess(&self, batch: &PipelineBatch) -> Result<PipelineOutput> {
        if batch.is_empty() {
            return Ok(PipelineOutput::empty(self.kind()));
        }
        let tensor = batch
            .output_tensors
            .first()
            .ok_or_else(|| PipelineError::Shape("o motor não devolveu nenhuma saída".into()))?;
        if tensor.shape.len() != 3 {
            return Err(PipelineError::Shape(format!(
                "logits de tokens devem ter posto 3, vieram {:?}",
                tensor.shape
            )));
        }
        let data = tensor
            .as_f32()
            .ok_or_else(|| PipelineError::Shape("logits devem ser float32".into()))?;
        let width = tensor.shape[2].max(0) as usize;
        let logits = extract_logits(data, batch.max_sequence_length, width, &batch.true_lengths())?;

        let entities = batch
            .inputs
            .par_iter()
            .zip(logits.par_iter())
            .map(|(input, token_logits)| self.entities_for(input, token_logits))
            .collect::<Result<Vec<_>>>()?;
        Ok(PipelineOutput::TokenClassification(TokenClassificationOutput { entities }))
    }

    fn metadata(&self) -> PipelineMetadata {
        PipelineMetadata {
            outputs_info: self.base.outputs_meta.iter().take(1).cloned().collect(),
        }
    }
}
