//! # Lote de Trabalho por Chamada
//!
//! Um [`PipelineBatch`] nasce em cada `run()` e morre ao final dele, com sucesso ou erro.
//! Nunca é compartilhado entre chamadas: por isso `run()` concorrente no mesmo pipeline é seguro.
//!
//! Ciclo de vida: `preprocess` preenche `inputs` e `input_tensors` → `forward` preenche
//! `output_tensors` → `postprocess` só lê → drop libera tudo (inclusive buffers do motor).

use tracing::trace;

use crate::engine::Tensor;
use crate::tokenizer::TokenizedInput;

#[derive(Debug, Default)]
pub struct PipelineBatch {
    pub inputs: Vec<TokenizedInput>,
    /// Comprimento de sequência do lote (após padding): o maior entre as entradas.
    pub max_sequence_length: usize,
    pub input_tensors: Vec<Tensor>,
    pub output_tensors: Vec<Tensor>,
}

impl PipelineBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Comprimento real (sem padding) de cada entrada, na ordem do lote.
    pub fn true_lengths(&self) -> Vec<usize> {
        self.inputs.iter().map(TokenizedInput::len).collect()
    }
}

impl Drop for PipelineBatch {
    fn drop(&mut self) {
        trace!(
            inputs = self.inputs.len(),
            outputs = self.output_tensors.len(),
            "lote liberado"
        );
    }
}
