//! # Motor de Inferência (fronteira)
//!
//! O motor numérico que executa o grafo do modelo é externo. Aqui ficam:
//! - a descrição das entradas/saídas declaradas pelo modelo ([`TensorInfo`]);
//! - o tensor trocado com o motor ([`Tensor`]), sempre *row-major* e plano;
//! - os traits [`InferenceEngine`] (carrega modelos) e [`ModelSession`] (executa).
//!
//! Com a feature `onnx`, o módulo [`onnx`] fornece uma implementação sobre o ONNX Runtime.

#[cfg(feature = "onnx")]
pub mod onnx;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Valor usado pelo motor para uma dimensão dinâmica.
pub const DYNAMIC_DIMENSION: i64 = -1;

/// Nome e dimensões de uma entrada ou saída do modelo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dimensions: Vec<i64>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dimensions: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dimensions,
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Última dimensão (largura do vetor por posição), se houver.
    pub fn last_dimension(&self) -> Option<i64> {
        self.dimensions.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int64(Vec<i64>),
    Float32(Vec<f32>),
}

/// Tensor plano com forma explícita.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl Tensor {
    pub fn int64(name: impl Into<String>, shape: Vec<i64>, data: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
            data: TensorData::Int64(data),
        }
    }

    pub fn float32(name: impl Into<String>, shape: Vec<i64>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data: TensorData::Float32(data),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::Float32(d) => Some(d),
            TensorData::Int64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Int64(d) => Some(d),
            TensorData::Float32(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            TensorData::Int64(d) => d.len(),
            TensorData::Float32(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Um modelo carregado e pronto para inferência.
///
/// `run` pode ser chamado concorrentemente por vários pipelines/workers;
/// a implementação precisa ser segura para isso (ou o chamador limita a 1 worker).
pub trait ModelSession: Send + Sync {
    fn inputs(&self) -> &[TensorInfo];

    fn outputs(&self) -> &[TensorInfo];

    /// Executa o grafo. Devolve as saídas na ordem de [`ModelSession::outputs`].
    fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError>;

    /// Libera a sessão. O dono garante chamada única.
    fn destroy(&self) -> Result<(), EngineError>;
}

pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, model: &[u8]) -> Result<Arc<dyn ModelSession>, EngineError>;

    /// Libera o ambiente do motor, depois que todas as sessões foram destruídas.
    fn destroy(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
