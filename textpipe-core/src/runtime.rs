//! # Ciclo de Vida dos Recursos
//!
//! O [`Runtime`] é o dono do motor de inferência e de todos os pipelines criados a partir
//! dele. Cada pipeline recebe um [`ModelHandle`] próprio (sessão + tokenizador).
//!
//! Ordem de desligamento em [`Runtime::destroy`]:
//!
//! 1. cada pipeline libera seu tokenizador e sua sessão
//! 2. o motor é liberado
//!
//! Todas as falhas são coletadas e devolvidas juntas; nenhuma é descartada.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::engine::InferenceEngine;
use crate::error::{PipelineError, Result};
use crate::model::ModelArtifacts;
use crate::pipeline::{
    FeatureExtractionConfig, FeatureExtractionPipeline, ModelHandle, Pipeline, PipelineKind,
    PipelineStats, TextClassificationConfig, TextClassificationPipeline,
    TokenClassificationConfig, TokenClassificationPipeline,
};
use crate::tokenizer::{HfTokenizer, Tokenizer};

/// Constrói um tokenizador a partir do conteúdo de `tokenizer.json`.
pub type TokenizerFactory = Box<dyn Fn(&[u8]) -> Result<Arc<dyn Tokenizer>> + Send + Sync>;

fn hf_tokenizer(bytes: &[u8]) -> Result<Arc<dyn Tokenizer>> {
    Ok(Arc::new(HfTokenizer::from_bytes(bytes)?))
}

pub struct Runtime {
    engine: Arc<dyn InferenceEngine>,
    tokenizer_factory: TokenizerFactory,
    pipelines: Mutex<Vec<Arc<dyn Pipeline>>>,
    destroyed: AtomicBool,
}

impl Runtime {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            tokenizer_factory: Box::new(hf_tokenizer),
            pipelines: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_tokenizer_factory(mut self, factory: TokenizerFactory) -> Self {
        self.tokenizer_factory = factory;
        self
    }

    pub fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    fn load_handle(&self, artifacts: &ModelArtifacts) -> Result<Arc<ModelHandle>> {
        let tokenizer = (self.tokenizer_factory)(&artifacts.tokenizer_bytes)?;
        let session = match self.engine.load(&artifacts.model_bytes) {
            Ok(session) => session,
            Err(e) => {
                let load_error = PipelineError::Inference(e);
                let teardown = tokenizer.destroy().err().map(PipelineError::Tokenizer);
                return Err(PipelineError::join(std::iter::once(load_error).chain(teardown))
                    .unwrap_or_else(|| PipelineError::Model("falha ao carregar o modelo".into())));
            }
        };
        Ok(Arc::new(ModelHandle::new(session, tokenizer)))
    }

    /// Valida e registra. Se a validação falhar, os recursos do pipeline são liberados.
    fn register<P: Pipeline + 'static>(&self, pipeline: P) -> Result<Arc<P>> {
        if let Err(invalid) = pipeline.validate() {
            let teardown = pipeline.destroy().err();
            return Err(PipelineError::join(std::iter::once(invalid).chain(teardown))
                .unwrap_or_else(|| PipelineError::Config(Vec::new())));
        }
        let pipeline = Arc::new(pipeline);
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pipeline.clone());
        info!(pipeline = pipeline.name(), kind = %pipeline.kind(), "pipeline registrado");
        Ok(pipeline)
    }

    pub fn new_feature_extraction_pipeline(
        &self,
        model_dir: impl AsRef<Path>,
        name: &str,
        config: FeatureExtractionConfig,
    ) -> Result<Arc<FeatureExtractionPipeline>> {
        let artifacts = ModelArtifacts::load(model_dir, None)?;
        let handle = self.load_handle(&artifacts)?;
        let pipeline = FeatureExtractionPipeline::new(name, handle.clone(), config)
            .map_err(|e| with_teardown(e, &handle))?;
        self.register(pipeline)
    }

    /// Sem `id2label` na configuração, usa o do `config.json` do modelo.
    pub fn new_text_classification_pipeline(
        &self,
        model_dir: impl AsRef<Path>,
        name: &str,
        mut config: TextClassificationConfig,
    ) -> Result<Arc<TextClassificationPipeline>> {
        let artifacts = ModelArtifacts::load(model_dir, None)?;
        if config.id2label.is_empty() {
            config.id2label = artifacts.id2label();
        }
        let handle = self.load_handle(&artifacts)?;
        let pipeline = TextClassificationPipeline::new(name, handle.clone(), config)
            .map_err(|e| with_teardown(e, &handle))?;
        self.register(pipeline)
    }

    /// Sem `id2label` na configuração, usa o do `config.json` do modelo.
    pub fn new_token_classification_pipeline(
        &self,
        model_dir: impl AsRef<Path>,
        name: &str,
        mut config: TokenClassificationConfig,
    ) -> Result<Arc<TokenClassificationPipeline>> {
        let artifacts = ModelArtifacts::load(model_dir, None)?;
        if config.id2label.is_empty() {
            config.id2label = artifacts.id2label();
        }
        let handle = self.load_handle(&artifacts)?;
        let pipeline = TokenClassificationPipeline::new(name, handle.clone(), config)
            .map_err(|e| with_teardown(e, &handle))?;
        self.register(pipeline)
    }

    /// Cria um pipeline do tipo pedido com a configuração padrão.
    pub fn new_pipeline(
        &self,
        kind: PipelineKind,
        model_dir: impl AsRef<Path>,
        name: &str,
    ) -> Result<Arc<dyn Pipeline>> {
        let pipeline: Arc<dyn Pipeline> = match kind {
            PipelineKind::FeatureExtraction => {
                self.new_feature_extraction_pipeline(model_dir, name, Default::default())?
            }
            PipelineKind::TextClassification => {
                self.new_text_classification_pipeline(model_dir, name, Default::default())?
            }
            PipelineKind::TokenClassification => {
                self.new_token_classification_pipeline(model_dir, name, Default::default())?
            }
        };
        Ok(pipeline)
    }

    pub fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> Vec<PipelineStats> {
        self.pipelines().iter().map(|p| p.stats()).collect()
    }

    /// Libera todos os pipelines e depois o motor. Chamadas repetidas não fazem nada.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pipelines: Vec<_> = self
            .pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut errors = Vec::new();
        for pipeline in &pipelines {
            if let Err(e) = pipeline.destroy() {
                warn!(pipeline = pipeline.name(), error = %e, "falha ao liberar pipeline");
                errors.push(e);
            }
        }
        if let Err(e) = self.engine.destroy() {
            errors.push(PipelineError::Inference(e));
        }
        info!(pipelines = pipelines.len(), errors = errors.len(), "runtime liberado");
        match PipelineError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn with_teardown(err: PipelineError, handle: &ModelHandle) -> PipelineError {
    let teardown = handle.destroy().err();
    PipelineError::join(std::iter::once(err).chain(teardown))
        .unwrap_or_else(|| PipelineError::Model("falha ao criar o pipeline".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CONFIG_FILE, TOKENIZER_FILE};
    use crate::testing::{ScriptedEngine, ScriptedSession, WordPieceTokenizer};
    use tempfile::TempDir;

    const NER_CONFIG: &str = r#"{"id2label": {"0": "O", "1": "B-PER", "2": "I-PER"}}"#;

    fn model_dir(config: Option<&str>) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"grafo").unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), b"{}").unwrap();
        if let Some(json) = config {
            std::fs::write(dir.path().join(CONFIG_FILE), json).unwrap();
        }
        dir
    }

    fn runtime(engine: Arc<ScriptedEngine>, tokenizer: Arc<WordPieceTokenizer>) -> Runtime {
        Runtime::new(engine).with_tokenizer_factory(Box::new(
            move |_bytes: &[u8]| -> Result<Arc<dyn Tokenizer>> { Ok(tokenizer.clone()) },
        ))
    }

    #[test]
    fn test_token_pipeline_uses_labels_from_model_dir() {
        let tokenizer = Arc::new(WordPieceTokenizer::new());
        let session = ScriptedSession::token_logits(3).with_label(tokenizer.id_of("Ana"), 1);
        let engine = Arc::new(ScriptedEngine::new(Arc::new(session)));
        let rt = runtime(engine.clone(), tokenizer);
        let dir = model_dir(Some(NER_CONFIG));

        let pipeline = rt
            .new_pipeline(PipelineKind::TokenClassification, dir.path(), "ner")
            .unwrap();
        let values = pipeline
            .run(&["Ana chegou".to_string()])
            .unwrap()
            .into_values()
            .unwrap();
        assert_eq!(values[0][0]["entity"], "PER");
        assert_eq!(rt.pipelines().len(), 1);
        assert_eq!(rt.stats()[0].inference_calls, 1);
        assert_eq!(engine.load_calls(), 1);
    }

    #[test]
    fn test_invalid_pipeline_is_torn_down_and_not_registered() {
        let session = Arc::new(ScriptedSession::token_logits(3));
        let engine = Arc::new(ScriptedEngine::new(session.clone()));
        let tokenizer = Arc::new(WordPieceTokenizer::new());
        let rt = runtime(engine, tokenizer.clone());
        let dir = model_dir(None);

        let err = rt
            .new_pipeline(PipelineKind::TokenClassification, dir.path(), "ner")
            .err()
            .unwrap();
        assert_eq!(err.violations().len(), 1);
        assert!(rt.pipelines().is_empty());
        assert_eq!(session.destroy_calls(), 1);
        assert_eq!(tokenizer.destroy_calls(), 1);
    }

    #[test]
    fn test_engine_load_failure_is_inference_error() {
        let engine = Arc::new(
            ScriptedEngine::new(Arc::new(ScriptedSession::hidden_states(4))).failing_load(),
        );
        let rt = runtime(engine, Arc::new(WordPieceTokenizer::new()));
        let dir = model_dir(None);
        let err = rt
            .new_pipeline(PipelineKind::FeatureExtraction, dir.path(), "f")
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn test_destroy_releases_everything_once() {
        let session = Arc::new(ScriptedSession::hidden_states(4));
        let engine = Arc::new(ScriptedEngine::new(session.clone()));
        let tokenizer = Arc::new(WordPieceTokenizer::new());
        let rt = runtime(engine.clone(), tokenizer.clone());
        let dir = model_dir(None);
        rt.new_feature_extraction_pipeline(dir.path(), "f", Default::default())
            .unwrap();

        rt.destroy().unwrap();
        rt.destroy().unwrap();
        assert_eq!(session.destroy_calls(), 1);
        assert_eq!(tokenizer.destroy_calls(), 1);
        assert_eq!(engine.destroy_calls(), 1);
        assert!(rt.pipelines().is_empty());
    }

    #[test]
    fn test_destroy_joins_teardown_errors() {
        let session = Arc::new(ScriptedSession::hidden_states(4).failing_destroy());
        let engine = Arc::new(ScriptedEngine::new(session));
        let tokenizer = Arc::new(WordPieceTokenizer::new().failing_destroy());
        let rt = runtime(engine, tokenizer);
        let dir = model_dir(None);
        rt.new_feature_extraction_pipeline(dir.path(), "f", Default::default())
            .unwrap();

        match rt.destroy().unwrap_err() {
            PipelineError::Multiple(errors) => assert_eq!(errors.len(), 2),
            other => panic!("esperava Multiple, veio {other:?}"),
        }
    }
}
