//! # Classificação de Texto
//!
//! Um vetor de logits por entrada (`[lote, rótulos]`), transformado em scores e
//! mapeado pelo `id2label` do modelo.
//!
//! | Problema       | Resultado por entrada                              |
//! |----------------|----------------------------------------------------|
//! | `SingleLabel`  | o rótulo de maior score (argmax)                   |
//! | `MultiLabel`   | todos os rótulos com seus scores, na ordem do índice |

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    first_output, violations_to_result, BasePipeline, ModelHandle, Pipeline, PipelineKind,
    PipelineMetadata, PipelineOutput,
};
use crate::batch::PipelineBatch;
use crate::error::{PipelineError, Result};
use crate::tensor::{argmax, extract_rows, sigmoid, softmax};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreFunction {
    #[default]
    SoftMax,
    Sigmoid,
}

impl ScoreFunction {
    pub fn apply(&self, logits: &[f32]) -> Vec<f32> {
        match self {
            ScoreFunction::SoftMax => softmax(logits),
            ScoreFunction::Sigmoid => sigmoid(logits),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemType {
    #[default]
    SingleLabel,
    MultiLabel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextClassificationConfig {
    pub id2label: BTreeMap<usize, String>,
    pub score_function: ScoreFunction,
    pub problem_type: ProblemType,
}

impl TextClassificationConfig {
    pub fn new(id2label: BTreeMap<usize, String>) -> Self {
        Self {
            id2label,
            ..Default::default()
        }
    }

    pub fn with_score_function(mut self, score_function: ScoreFunction) -> Self {
        self.score_function = score_function;
        self
    }

    pub fn with_problem_type(mut self, problem_type: ProblemType) -> Self {
        self.problem_type = problem_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutput {
    pub label: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextClassificationOutput {
    /// Uma lista por entrada (com um único item em `SingleLabel`).
    pub classifications: Vec<Vec<ClassificationOutput>>,
}

pub struct TextClassificationPipeline {
    base: BasePipeline,
    config: TextClassificationConfig,
}

impl TextClassificationPipeline {
    pub fn new(
        name: impl Into<String>,
        handle: Arc<ModelHandle>,
        config: TextClassificationConfig,
    ) -> Result<Self> {
        let base = BasePipeline::new(name, handle)?;
        info!(
            pipeline = %base.name,
            labels = config.id2label.len(),
            problem = ?config.problem_type,
            "pipeline de classificação de texto criado"
        );
        Ok(Self { base, config })
    }

    pub fn config(&self) -> &TextClassificationConfig {
        &self.config
    }

    fn label(&self, index: usize) -> Result<&str> {
        self.config
            .id2label
            .get(&index)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::Aggregation(format!("índice de classe {index} sem rótulo")))
    }

    fn classify(&self, logits: &[f32]) -> Result<Vec<ClassificationOutput>> {
        let scores = self.config.score_function.apply(logits);
        match self.config.problem_type {
            ProblemType::SingleLabel => {
                let (index, score) = argmax(&scores)
                    .ok_or_else(|| PipelineError::Shape("vetor de logits vazio".into()))?;
                Ok(vec![ClassificationOutput {
                    label: self.label(index)?.to_string(),
                    score,
                }])
            }
            ProblemType::MultiLabel => scores
                .iter()
                .enumerate()
                .map(|(index, &score)| {
                    Ok(ClassificationOutput {
                        label: self.label(index)?.to_string(),
                        score,
                    })
                })
                .collect(),
        }
    }
}

impl Pipeline for TextClassificationPipeline {
    fn base(&self) -> &BasePipeline {
        &self.base
    }

    fn kind(&self) -> PipelineKind {
        PipelineKind::TextClassification
    }

    fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        if let Some(output) = first_output(&self.base, &mut violations) {
            if output.rank() != 2 {
                violations.push(format!(
                    "a saída '{}' deve ter duas dimensões (lote, logits), tem {}",
                    output.name,
                    output.rank()
                ));
            }
            let width = output.last_dimension().unwrap_or(0);
            if width <= 0 {
                violations.push("a dimensão dos logits não pode ser dinâmica".to_string());
            } else if !self.config.id2label.is_empty()
                && self.config.id2label.len() != width as usize
            {
                violations.push(format!(
                    "id2label tem {} rótulos, mas o modelo produz {width} logits",
                    self.config.id2label.len()
                ));
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
        if tensor.shape.len() != 2 {
            return Err(PipelineError::Shape(format!(
                "logits de classificação devem ter posto 2, vieram {:?}",
                tensor.shape
            )));
        }
        let data = tensor
            .as_f32()
            .ok_or_else(|| PipelineError::Shape("logits devem ser float32".into()))?;
        let width = tensor.shape[1].max(0) as usize;

        let classifications = extract_rows(data, batch.len(), width)?
            .iter()
            .map(|logits| self.classify(logits))
            .collect::<Result<Vec<_>>>()?;
        Ok(PipelineOutput::TextClassification(TextClassificationOutput { classifications }))
    }

    fn metadata(&self) -> PipelineMetadata {
        PipelineMetadata {
            outputs_info: self.base.outputs_meta.iter().take(1).cloned().collect(),
        }
    }
}
