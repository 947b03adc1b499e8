//! # Artefatos do Modelo
//!
//! Um diretório de modelo contém:
//!
//! | Arquivo          | Obrigatório                  | Conteúdo                        |
//! |------------------|------------------------------|---------------------------------|
//! | `*.onnx`         | sim (exatamente um)          | grafo do modelo                 |
//! | `tokenizer.json` | sim                          | tokenizador HuggingFace         |
//! | `config.json`    | só para classificação        | `id2label` (índice → rótulo)    |
//!
//! Com um nome de arquivo explícito, a regra de "exatamente um `.onnx`" não se aplica.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::fs;

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const CONFIG_FILE: &str = "config.json";

/// Parte do `config.json` que interessa aos pipelines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub id2label: BTreeMap<usize, String>,
}

impl ModelConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bytes de todos os artefatos, prontos para o motor e o tokenizador.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub dir: PathBuf,
    pub onnx_path: PathBuf,
    pub model_bytes: Vec<u8>,
    pub tokenizer_bytes: Vec<u8>,
    /// `None` quando o diretório não tem `config.json`.
    pub config: Option<ModelConfig>,
}

impl ModelArtifacts {
    pub fn load(dir: impl AsRef<Path>, onnx_filename: Option<&str>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(PipelineError::Model(format!(
                "{} não é um diretório de modelo",
                dir.display()
            )));
        }
        let onnx_path = match onnx_filename {
            Some(name) => dir.join(name),
            None => find_onnx_file(dir)?,
        };
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        if !fs::exists(&tokenizer_path) {
            return Err(PipelineError::Model(format!(
                "{} não contém {TOKENIZER_FILE}",
                dir.display()
            )));
        }
        let config_path = dir.join(CONFIG_FILE);
        let config = if fs::exists(&config_path) {
            Some(ModelConfig::from_json(&fs::read_bytes(&config_path)?)?)
        } else {
            None
        };

        let artifacts = Self {
            dir: dir.to_path_buf(),
            model_bytes: fs::read_bytes(&onnx_path)?,
            tokenizer_bytes: fs::read_bytes(&tokenizer_path)?,
            onnx_path,
            config,
        };
        debug!(
            model = %artifacts.onnx_path.display(),
            bytes = artifacts.model_bytes.len(),
            labels = artifacts.id2label().len(),
            "artefatos do modelo lidos"
        );
        Ok(artifacts)
    }

    /// Mapa de rótulos do `config.json`, vazio se não houver.
    pub fn id2label(&self) -> BTreeMap<usize, String> {
        self.config
            .as_ref()
            .map(|c| c.id2label.clone())
            .unwrap_or_default()
    }
}

/// O único arquivo `.onnx` no nível de topo de `dir`.
pub fn find_onnx_file(dir: &Path) -> Result<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "onnx"))
        .collect();
    found.sort();
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(PipelineError::Model(format!(
            "nenhum arquivo .onnx em {}",
            dir.display()
        ))),
        n => Err(PipelineError::Model(format!(
            "{n} arquivos .onnx em {}: indique qual usar",
            dir.display()
        ))),
    }
}
