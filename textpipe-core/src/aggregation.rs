//! # Motor de Agregação (classificação de tokens)
//!
//! Transforma os scores por token de uma entrada em entidades legíveis.
//!
//! 1. **Pré-entidades**: um [`PreEntity`] por token real. Tokens especiais nunca viram
//!    entidade. A palavra é o recorte de bytes do texto original nos offsets do token;
//!    o token é sub-palavra quando seu texto tem comprimento diferente desse recorte.
//! 2. **Rótulo por token**: argmax dos scores, mapeado pelo `id2label`.
//! 3. **Estratégia**: `NONE` para aqui; `SIMPLE` agrupa via BIO ([`group_entities`]).
//! 4. **Filtro**: descarta tags ignoradas (padrão `O`) e tags vazias.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::tagger::{group_entities, Entity, PreEntity};
use crate::tensor::argmax;
use crate::tokenizer::TokenizedInput;

/// Política para transformar rótulos por token em entidades.
///
/// Apenas `None` e `Simple` estão implementadas; as demais existem para que
/// configurações vindas de fora sejam reconhecidas e rejeitadas explicitamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationStrategy {
    /// Uma entidade por token.
    None,
    /// Agrupamento BIO de tokens adjacentes.
    #[default]
    Simple,
    First,
    Average,
    Max,
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationStrategy::None => "NONE",
            AggregationStrategy::Simple => "SIMPLE",
            AggregationStrategy::First => "FIRST",
            AggregationStrategy::Average => "AVERAGE",
            AggregationStrategy::Max => "MAX",
        };
        f.write_str(name)
    }
}

impl FromStr for AggregationStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(AggregationStrategy::None),
            "SIMPLE" => Ok(AggregationStrategy::Simple),
            "FIRST" => Ok(AggregationStrategy::First),
            "AVERAGE" => Ok(AggregationStrategy::Average),
            "MAX" => Ok(AggregationStrategy::Max),
            other => Err(PipelineError::Config(vec![format!(
                "estratégia de agregação desconhecida: {other}"
            )])),
        }
    }
}

/// Coleta as pré-entidades de uma entrada a partir dos scores de cada token real.
///
/// `token_scores` tem um vetor por token da entrada (já sem padding).
pub fn gather_pre_entities(
    input: &TokenizedInput,
    token_scores: &[Vec<f32>],
) -> Result<Vec<PreEntity>> {
    if token_scores.len() != input.len() {
        return Err(PipelineError::Shape(format!(
            "{} vetores de score para {} tokens",
            token_scores.len(),
            input.len()
        )));
    }
    if !input.is_empty()
        && (input.offsets.len() != input.len() || input.special_tokens_mask.len() != input.len())
    {
        return Err(PipelineError::Shape(
            "offsets e máscara de tokens especiais são obrigatórios".to_string(),
        ));
    }

    let mut pre_entities = Vec::new();
    for (j, scores) in token_scores.iter().enumerate() {
        if input.is_special(j) {
            continue;
        }
        let (start, end) = input.offsets[j];
        let word = input.raw.get(start..end).ok_or_else(|| {
            PipelineError::Shape(format!(
                "offset ({start}, {end}) fora do texto de {} bytes",
                input.raw.len()
            ))
        })?;
        let token = &input.tokens[j];
        pre_entities.push(PreEntity {
            word: word.to_string(),
            token_id: input.token_ids[j],
            scores: scores.clone(),
            start,
            end,
            index: j,
            is_subword: token.len() != word.len(),
        });
    }
    Ok(pre_entities)
}

/// Escolhe o rótulo de cada pré-entidade e aplica a estratégia.
pub fn aggregate<F>(
    input: &TokenizedInput,
    pre_entities: &[PreEntity],
    id2label: &BTreeMap<usize, String>,
    strategy: AggregationStrategy,
    decode: F,
) -> Result<Vec<Entity>>
where
    F: Fn(&[u32]) -> Result<String>,
{
    match strategy {
        AggregationStrategy::None | AggregationStrategy::Simple => {}
        other => {
            return Err(PipelineError::NotImplemented(format!(
                "estratégia de agregação {other}: apenas SIMPLE e NONE estão implementadas"
            )))
        }
    }

    let entities = pre_entities
        .iter()
        .map(|pre| {
            let (label_index, score) = argmax(&pre.scores).ok_or_else(|| {
                PipelineError::Aggregation(format!("token {} sem scores", pre.index))
            })?;
            let label = id2label.get(&label_index).ok_or_else(|| {
                PipelineError::Aggregation(format!(
                    "não foi possível determinar o tipo da entidade para a entrada {:?}, índice previsto {label_index}",
                    input.raw
                ))
            })?;
            Ok(Entity {
                entity: label.clone(),
                score,
                scores: (strategy == AggregationStrategy::None).then(|| pre.scores.clone()),
                index: pre.index,
                word: pre.word.clone(),
                token_id: pre.token_id,
                start: pre.start,
                end: pre.end,
                is_subword: pre.is_subword,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if strategy == AggregationStrategy::None {
        return Ok(entities);
    }
    group_entities(&entities, decode)
}

/// Descarta entidades com tag ignorada ou vazia.
pub fn filter_entities(entities: Vec<Entity>, ignore_labels: &[String]) -> Vec<Entity> {
    entities
        .into_iter()
        .filter(|e| !e.entity.is_empty() && !ignore_labels.iter().any(|l| *l == e.entity))
        .collect()
}
