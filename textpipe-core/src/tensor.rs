//! # Adaptador de Tensores
//!
//! Faz a ponte entre entradas tokenizadas e o layout numérico do motor de inferência.
//!
//! ## Assimetria entrada/saída
//!
//! - **Entrada**: tensores uniformes `[lote, seq_max]`, completados com zeros (padding).
//! - **Saída**: um buffer plano `[lote × seq_max × largura]`. Na volta, as posições de
//!   padding são **descartadas** (não apenas mascaradas): cada entrada recebe exatamente
//!   um vetor por token real, e os comprimentos ficam irregulares.
//!
//! Esta assimetria garante que o resultado de uma entrada não depende das outras do lote.
//!
//! O módulo também concentra as funções numéricas usadas no pós-processamento
//! (softmax, sigmoid, argmax, média, normalização L2).

use crate::engine::{Tensor, TensorInfo, DYNAMIC_DIMENSION};
use crate::error::{PipelineError, Result};
use crate::tokenizer::{TokenizedInput, ATTENTION_MASK, INPUT_IDS, TOKEN_TYPE_IDS};

/// Monta os tensores de entrada do modelo, um por entrada declarada em `specs`.
///
/// Falha com `Shape` quando:
/// - a tokenização produziu saída vazia;
/// - alguma entrada declarada não tem posto 2;
/// - uma dimensão fixa não bate com o tamanho do lote ou da sequência;
/// - o tokenizador não devolveu a sequência que a entrada exige.
pub fn build_input_tensors(
    inputs: &[TokenizedInput],
    max_sequence_length: usize,
    specs: &[TensorInfo],
) -> Result<Vec<Tensor>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    if max_sequence_length == 0 {
        return Err(PipelineError::Shape(
            "a tokenização não produziu nenhum token".to_string(),
        ));
    }

    let batch_size = inputs.len();
    let shape = vec![batch_size as i64, max_sequence_length as i64];
    let mut tensors = Vec::with_capacity(specs.len());

    for spec in specs {
        check_dimensions(spec, batch_size, max_sequence_length)?;

        let mut data = Vec::with_capacity(batch_size * max_sequence_length);
        for input in inputs {
            let column: &[u32] = match spec.name.as_str() {
                INPUT_IDS => &input.token_ids,
                TOKEN_TYPE_IDS => &input.type_ids,
                ATTENTION_MASK => &input.attention_mask,
                other => {
                    return Err(PipelineError::Shape(format!(
                        "entrada do modelo não suportada: {other}"
                    )))
                }
            };
            if column.len() != input.len() {
                return Err(PipelineError::Shape(format!(
                    "entrada '{}' com {} valores para {} tokens",
                    spec.name,
                    column.len(),
                    input.len()
                )));
            }
            data.extend(column.iter().map(|&v| v as i64));
            data.resize(data.len() + (max_sequence_length - column.len()), 0);
        }
        tensors.push(Tensor::int64(spec.name.clone(), shape.clone(), data));
    }

    Ok(tensors)
}

fn check_dimensions(spec: &TensorInfo, batch_size: usize, sequence_length: usize) -> Result<()> {
    if spec.rank() != 2 {
        return Err(PipelineError::Shape(format!(
            "entrada '{}' deve ter duas dimensões (lote, sequência), tem {:?}",
            spec.name, spec.dimensions
        )));
    }
    let expected = [batch_size as i64, sequence_length as i64];
    for (axis, (&declared, actual)) in spec.dimensions.iter().zip(expected).enumerate() {
        if declared != DYNAMIC_DIMENSION && declared != actual {
            return Err(PipelineError::Shape(format!(
                "entrada '{}': dimensão {axis} fixa em {declared}, mas o lote exige {actual}",
                spec.name
            )));
        }
    }
    Ok(())
}

/// Reconstitui um buffer `[lote × seq_max × largura]` em vetores por token.
///
/// `true_lengths[i]` é o número de tokens reais da entrada `i`; posições além dele são
/// padding e ficam de fora do resultado.
pub fn extract_logits(
    data: &[f32],
    max_sequence_length: usize,
    width: usize,
    true_lengths: &[usize],
) -> Result<Vec<Vec<Vec<f32>>>> {
    let batch_size = true_lengths.len();
    let expected = batch_size * max_sequence_length * width;
    if data.len() != expected {
        return Err(PipelineError::Shape(format!(
            "saída com {} valores, esperado {batch_size} × {max_sequence_length} × {width} = {expected}",
            data.len()
        )));
    }
    if width == 0 {
        return Ok(vec![Vec::new(); batch_size]);
    }

    let stride = max_sequence_length * width;
    true_lengths
        .iter()
        .enumerate()
        .map(|(i, &length)| {
            if length > max_sequence_length {
                return Err(PipelineError::Shape(format!(
                    "entrada {i} tem {length} tokens, acima do comprimento do lote ({max_sequence_length})"
                )));
            }
            let row = &data[i * stride..i * stride + length * width];
            Ok(row.chunks_exact(width).map(<[f32]>::to_vec).collect())
        })
        .collect()
}

/// Divide um buffer `[lote × largura]` em um vetor por entrada.
pub fn extract_rows(data: &[f32], batch_size: usize, width: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != batch_size * width {
        return Err(PipelineError::Shape(format!(
            "saída com {} valores, esperado {batch_size} × {width}",
            data.len()
        )));
    }
    if width == 0 {
        return Ok(vec![Vec::new(); batch_size]);
    }
    Ok(data.chunks_exact(width).map(<[f32]>::to_vec).collect())
}

/// Converte scores brutos em distribuição de probabilidade (estável numericamente).
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return vec![];
    }
    let max_score = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|&s| (s - max_score).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return vec![1.0 / scores.len() as f32; scores.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

pub fn sigmoid(scores: &[f32]) -> Vec<f32> {
    scores.iter().map(|&s| 1.0 / (1.0 + (-s).exp())).collect()
}

/// Índice e valor do maior score. Em empate, vence o primeiro.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
}

pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Média elemento a elemento de vetores de mesma largura.
pub fn mean_pool(vectors: &[Vec<f32>], width: usize) -> Vec<f32> {
    let mut pooled = vec![0.0; width];
    if vectors.is_empty() {
        return pooled;
    }
    for vector in vectors {
        for (acc, v) in pooled.iter_mut().zip(vector) {
            *acc += v;
        }
    }
    let n = vectors.len() as f32;
    pooled.iter_mut().for_each(|v| *v /= n);
    pooled
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}
