//! # Extração de Features (embeddings)
//!
//! Sem agregação: cada entrada vira um vetor.
//!
//! | Saída do modelo          | Tratamento                                   |
//! |--------------------------|----------------------------------------------|
//! | `[lote, seq, largura]`   | média dos vetores dos tokens reais (pooling) |
//! | `[lote, largura]`        | usado diretamente (modelo já agregou)        |
//!
//! Opcionalmente o vetor final é normalizado (norma L2 = 1).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    first_output, violations_to_result, BasePipeline, ModelHandle, Pipeline, PipelineKind,
    PipelineMetadata, PipelineOutput,
};
use crate::batch::PipelineBatch;
use crate::engine::TensorInfo;
use crate::error::{PipelineError, Result};
use crate::tensor::{extract_logits, extract_rows, l2_normalize, mean_pool};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtractionConfig {
    /// Saída do modelo a ler. `None` → primeira saída declarada.
    pub output_name: Option<String>,
    pub normalize: bool,
}

impl FeatureExtractionConfig {
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn with_normalization(mut self) -> Self {
        self.normalize = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtractionOutput {
    pub embeddings: Vec<Vec<f32>>,
}

pub struct FeatureExtractionPipeline {
    base: BasePipeline,
    config: FeatureExtractionConfig,
}

impl FeatureExtractionPipeline {
    pub fn new(
        name: impl Into<String>,
        handle: Arc<ModelHandle>,
        config: FeatureExtractionConfig,
    ) -> Result<Self> {
        let base = BasePipeline::new(name, handle)?;
        info!(pipeline = %base.name, output = ?config.output_name, "pipeline de features criado");
        Ok(Self { base, config })
    }

    pub fn config(&self) -> &FeatureExtractionConfig {
        &self.config
    }

    fn output_info(&self, violations: &mut Vec<String>) -> Option<TensorInfo> {
        match &self.config.output_name {
            Some(name) => {
                let found = self
                    .base
                    .output_index(name)
                    .map(|i| self.base.outputs_meta[i].clone());
                if found.is_none() {
                    violations.push(format!("o modelo não tem a saída '{name}'"));
                }
                found
            }
            None => first_output(&self.base, violations),
        }
    }
}

impl Pipeline for FeatureExtractionPipeline {
    fn base(&self) -> &BasePipeline {
        &self.base
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::FeatureExtraction
    }

    fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        if let Some(output) = self.output_info(&mut violations) {
            let rank = output.rank();
            if rank != 2 && rank != 3 {
                violations.push(format!(
                    "a saída '{}' deve ter posto 2 ou 3, tem {rank}",
                    output.name
                ));
            }
            if output.last_dimension().unwrap_or(0) <= 0 {
                violations.push(format!(
                    "a dimensão do embedding da saída '{}' não pode ser dinâmica",
                    output.name
                ));
            }
        }
        violations_to_result(violations)
    }

    fn postprocess(&self, batch: &PipelineBatch) -> Result<PipelineOutput> {
        if batch.is_empty() {
            return Ok(PipelineOutput::empty(self.kind()));
        }

        let tensor = match &self.config.output_name {
            Some(name) => batch.output_tensors.iter().find(|t| t.name == *name),
            None => batch.output_tensors.first(),
        }
        .ok_or_else(|| PipelineError::Shape("o motor não devolveu a saída esperada".into()))?;
        let data = tensor
            .as_f32()
            .ok_or_else(|| PipelineError::Shape(format!("a saída '{}' não é float32", tensor.name)))?;
        let width = tensor.shape.last().copied().unwrap_or(0).max(0) as usize;

        let mut embeddings = match tensor.shape.len() {
            3 => extract_logits(data, batch.max_sequence_length, width, &batch.true_lengths())?
                .iter()
                .map(|tokens| mean_pool(tokens, width))
                .collect::<Vec<_>>(),
            2 => extract_rows(data, batch.len(), width)?,
            rank => {
                return Err(PipelineError::Shape(format!(
                    "saída '{}' com posto {rank} não suportado",
                    tensor.name
                )))
            }
        };

        if self.config.normalize {
            embeddings.iter_mut().for_each(|e| l2_normalize(e));
        }
        Ok(PipelineOutput::FeatureExtraction(FeatureExtractionOutput { embeddings }))
    }

    fn metadata(&self) -> PipelineMetadata {
        let mut ignored = Vec::new();
        PipelineMetadata {
            outputs_info: self.output_info(&mut ignored).into_iter().collect(),
        }
    }
}
