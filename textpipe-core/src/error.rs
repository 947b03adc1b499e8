//! # Taxonomia de Erros
//!
//! | Variante         | Origem                                   | Alcance                      |
//! |------------------|------------------------------------------|------------------------------|
//! | `Config`         | construção / `validate()`                | fatal para criar o pipeline  |
//! | `Shape`          | tensores com formato incompatível        | fatal para aquela chamada    |
//! | `Inference`      | falha do motor de inferência (verbatim)  | fatal para aquela chamada    |
//! | `Aggregation`    | índice de label sem mapeamento           | fatal para aquela chamada    |
//! | `Io` / `Json`    | linha malformada, arquivo ilegível       | fatal para a linha/arquivo   |
//! | `Destroyed`      | uso de um pipeline já liberado           | fatal para aquela chamada    |
//!
//! `Multiple` é a junção de vários erros (ver [`PipelineError::join`]): é assim que
//! `run()` e o desligamento devolvem *todas* as falhas de uma vez.

use thiserror::Error;

/// Falha reportada pelo motor de inferência externo.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Falha reportada pelo tokenizador externo.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct TokenizerError {
    pub message: String,
}

impl TokenizerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuração inválida. Carrega **todas** as violações encontradas.
    #[error("configuração inválida: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("formato de tensor incompatível: {0}")]
    Shape(String),

    /// Erro do motor de inferência, repassado sem alteração.
    #[error("falha na inferência: {0}")]
    Inference(#[source] EngineError),

    #[error("falha na agregação: {0}")]
    Aggregation(String),

    #[error("não implementado: {0}")]
    NotImplemented(String),

    #[error("falha no tokenizador: {0}")]
    Tokenizer(#[from] TokenizerError),

    /// Artefatos do modelo ausentes ou ambíguos.
    #[error("modelo inválido: {0}")]
    Model(String),

    #[error("erro de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    /// Sessão e tokenizador já foram liberados.
    #[error("pipeline {0} já foi liberado")]
    Destroyed(String),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<PipelineError>),
}

fn join_messages(errors: &[PipelineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Junta uma lista de erros em um só.
    ///
    /// - nenhum erro → `None`
    /// - um erro → o próprio erro
    /// - vários → `Multiple`, achatando junções aninhadas
    pub fn join(errors: impl IntoIterator<Item = PipelineError>) -> Option<PipelineError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                PipelineError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(PipelineError::Multiple(flat)),
        }
    }

    /// Violações de configuração (vazio se não for `Config`).
    pub fn violations(&self) -> &[String] {
        match self {
            PipelineError::Config(v) => v,
            _ => &[],
        }
    }
}
