//! Backend ONNX Runtime (crate `ort`, biblioteca carregada dinamicamente).

use std::borrow::Cow;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::{Tensor as OrtTensor, ValueType};
use tracing::info;

use super::{InferenceEngine, ModelSession, Tensor, TensorData, TensorInfo};
use crate::error::EngineError;

fn engine_error(err: ort::Error) -> EngineError {
    EngineError::new(err.to_string())
}

pub struct OnnxEngine {
    intra_threads: usize,
}

impl OnnxEngine {
    /// Inicializa o ambiente do ONNX Runtime.
    ///
    /// Sem caminho explícito, o carregador usa a busca padrão do sistema.
    pub fn new(shared_library: Option<&Path>) -> Result<Self, EngineError> {
        let builder = match shared_library {
            Some(path) => ort::init_from(path.to_string_lossy().to_string()),
            None => ort::init(),
        };
        builder.with_name("textpipe").commit().map_err(engine_error)?;
        if let Some(path) = shared_library {
            info!("ONNX Runtime carregado de {}", path.display());
        }
        Ok(Self { intra_threads: 1 })
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads.max(1);
        self
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn load(&self, model: &[u8]) -> Result<Arc<dyn ModelSession>, EngineError> {
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(self.intra_threads))
            .and_then(|b| b.commit_from_memory(model))
            .map_err(engine_error)?;

        let inputs = session
            .inputs
            .iter()
            .map(|i| TensorInfo::new(i.name.clone(), dimensions_of(&i.input_type)))
            .collect();
        let outputs = session
            .outputs
            .iter()
            .map(|o| TensorInfo::new(o.name.clone(), dimensions_of(&o.output_type)))
            .collect();

        Ok(Arc::new(OnnxSession {
            session: RwLock::new(Some(session)),
            inputs,
            outputs,
        }))
    }
}

fn dimensions_of(value_type: &ValueType) -> Vec<i64> {
    match value_type {
        ValueType::Tensor { dimensions, .. } => dimensions.clone(),
        _ => Vec::new(),
    }
}

/// `None` depois de `destroy`: a sessão nativa já foi liberada.
struct OnnxSession {
    session: RwLock<Option<Session>>,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
}

impl ModelSession for OnnxSession {
    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError> {
        let mut values: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for tensor in inputs {
            let value: SessionInputValue<'_> = match &tensor.data {
                TensorData::Int64(data) => OrtTensor::from_array((tensor.shape.clone(), data.clone()))
                    .map_err(engine_error)?
                    .into(),
                TensorData::Float32(data) => OrtTensor::from_array((tensor.shape.clone(), data.clone()))
                    .map_err(engine_error)?
                    .into(),
            };
            values.push((Cow::Owned(tensor.name.clone()), value));
        }

        let guard = self.session.read().unwrap_or_else(PoisonError::into_inner);
        let session = guard
            .as_ref()
            .ok_or_else(|| EngineError::new("sessão ONNX já liberada"))?;
        let outputs = session
            .run(SessionInputs::from(values))
            .map_err(engine_error)?;

        let mut result = Vec::with_capacity(self.outputs.len());
        for info in &self.outputs {
            let (shape, data) = outputs[info.name.as_str()]
                .try_extract_raw_tensor::<f32>()
                .map_err(engine_error)?;
            result.push(Tensor::float32(info.name.clone(), shape, data.to_vec()));
        }
        Ok(result)
    }

    fn destroy(&self) -> Result<(), EngineError> {
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if session.is_some() {
            info!("sessão ONNX liberada");
        }
        Ok(())
    }
}
