//! # textpipe-core: Execução em Lote de Pipelines Neurais
//!
//! Este crate roda modelos pré-treinados sobre lotes de texto e traduz entre três mundos:
//! strings, tensores numéricos e resultados estruturados (embeddings, rótulos, entidades).
//!
//! ## Arquitetura
//!
//! Cada chamada `run()` percorre o mesmo caminho linear:
//!
//! 1.  **Tokenização** ([`tokenizer`]): o texto vira ids de sub-palavras com offsets em bytes.
//! 2.  **Tensores** ([`tensor`]): os ids são completados com padding até o maior do lote.
//! 3.  **Inferência** ([`engine`]): o motor externo executa o grafo do modelo.
//! 4.  **Pós-processamento** ([`pipeline`]): o padding é descartado e cada tipo de pipeline
//!     reduz a saída ao seu formato:
//!     *   **Features**: um vetor por entrada.
//!     *   **Classificação de texto**: rótulo(s) e score(s) por entrada.
//!     *   **Classificação de tokens** ([`aggregation`], [`tagger`]): entidades agrupadas pelo esquema BIO.
//!
//! Em volta disso:
//!
//! - [`runtime`]: dono do motor e dos pipelines, com desligamento determinístico.
//! - [`stream`]: leitor → processadores → escritores, sobre filas limitadas (JSONL).
//! - [`model`] e [`fs`]: artefatos do modelo em disco.
//!
//! ## Exemplo de Uso
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use textpipe_core::{InferenceEngine, Pipeline, PipelineKind, Runtime};
//!
//! fn analisar(engine: Arc<dyn InferenceEngine>) -> textpipe_core::Result<()> {
//!     // 1. O runtime é dono do motor e de tudo que for criado a partir dele
//!     let runtime = Runtime::new(engine);
//!
//!     // 2. Lê model.onnx, tokenizer.json e config.json do diretório
//!     let ner = runtime.new_pipeline(PipelineKind::TokenClassification, "modelos/bert-ner", "ner")?;
//!
//!     // 3. Uma lista de entidades por entrada
//!     let output = ner.run(&["Ana Maria mora em Roma".to_string()])?;
//!     for entities in output.into_values()? {
//!         println!("{entities}");
//!     }
//!
//!     // 4. Libera pipelines e motor, juntando todas as falhas
//!     runtime.destroy()
//! }
//! ```

pub mod aggregation;
pub mod batch;
pub mod engine;
pub mod error;
pub mod fs;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod stream;
pub mod tagger;
pub mod tensor;
pub mod tokenizer;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregation::AggregationStrategy;
pub use engine::{InferenceEngine, ModelSession, Tensor, TensorInfo};
pub use error::{EngineError, PipelineError, Result, TokenizerError};
pub use pipeline::{Pipeline, PipelineKind, PipelineOutput, PipelineStats};
pub use runtime::Runtime;
pub use stream::{InputSource, StreamConfig, StreamEngine, StreamSummary};
pub use tagger::Entity;
pub use tokenizer::{HfTokenizer, TokenizedInput, Tokenizer, TokenizerOptions};
