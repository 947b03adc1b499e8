//! # Esquema BIO e Entidades
//!
//! Os rótulos vêm do `id2label` do modelo, então não há um conjunto fixo de categorias:
//! qualquer string é aceita e interpretada pelo prefixo.
//!
//! ## Esquema BIO
//!
//! - `B-TAG`: Begin, primeiro token de uma entidade
//! - `I-TAG`: Inside, tokens subsequentes da mesma entidade
//! - sem prefixo (ex: `O`, `PER`): tratado como `I` com o rótulo inteiro como tag
//!
//! ## Agrupamento
//!
//! | Rótulos                           | Grupos                 |
//! |-----------------------------------|------------------------|
//! | `B-PER I-PER O B-LOC`             | `PER` · `O` · `LOC`    |
//! | `B-PER B-PER`                     | `PER` · `PER`          |
//! | `I-ORG I-ORG I-LOC`               | `ORG` · `LOC`          |

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::mean;

/// Uma entidade (ou um token, sem agregação) reconhecida no texto.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Rótulo completo (`B-PER`) ou, após agrupamento, apenas a tag (`PER`).
    pub entity: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<Vec<f32>>,
    /// Índice do (primeiro) token na sequência original, sem padding.
    pub index: usize,
    pub word: String,
    pub token_id: u32,
    /// Posição de byte inicial no texto original
    pub start: usize,
    /// Posição de byte final no texto original (exclusiva)
    pub end: usize,
    pub is_subword: bool,
}

/// Token real anotado com seu vetor de scores, antes da escolha do rótulo.
#[derive(Debug, Clone, PartialEq)]
pub struct PreEntity {
    pub word: String,
    pub token_id: u32,
    pub scores: Vec<f32>,
    pub start: usize,
    pub end: usize,
    pub index: usize,
    pub is_subword: bool,
}

/// Prefixo BIO de um rótulo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioPrefix {
    Begin,
    Inside,
}

/// Separa prefixo e tag (`"B-PER"` → `(Begin, "PER")`, `"O"` → `(Inside, "O")`).
pub fn parse_label(label: &str) -> (BioPrefix, &str) {
    if let Some(tag) = label.strip_prefix("B-") {
        (BioPrefix::Begin, tag)
    } else if let Some(tag) = label.strip_prefix("I-") {
        (BioPrefix::Inside, tag)
    } else {
        (BioPrefix::Inside, label)
    }
}

/// Tipo de uma entidade agrupada: tudo depois do primeiro `-`, ou o rótulo inteiro.
pub fn group_type(label: &str) -> &str {
    match label.split_once('-') {
        Some((_, rest)) => rest,
        None => label,
    }
}

/// Agrupa entidades adjacentes com a mesma tag.
///
/// Um novo grupo começa quando a tag muda **ou** quando a entidade tem prefixo `B`.
/// Cada grupo vira uma única entidade:
/// - tag do primeiro membro;
/// - score médio;
/// - palavra decodificada pelo tokenizador a partir dos ids dos membros;
/// - span do início do primeiro ao fim do último.
pub fn group_entities<F>(entities: &[Entity], decode: F) -> Result<Vec<Entity>>
where
    F: Fn(&[u32]) -> Result<String>,
{
    let mut groups = Vec::new();
    let mut current: Vec<&Entity> = Vec::new();

    for entity in entities {
        if let Some(last) = current.last() {
            let (prefix, tag) = parse_label(&entity.entity);
            let (_, last_tag) = parse_label(&last.entity);
            if tag != last_tag || prefix == BioPrefix::Begin {
                groups.push(merge_group(&current, &decode)?);
                current.clear();
            }
        }
        current.push(entity);
    }

    if !current.is_empty() {
        groups.push(merge_group(&current, &decode)?);
    }
    Ok(groups)
}

fn merge_group<F>(members: &[&Entity], decode: &F) -> Result<Entity>
where
    F: Fn(&[u32]) -> Result<String>,
{
    let first = members[0];
    let last = members[members.len() - 1];
    let scores: Vec<f32> = members.iter().map(|e| e.score).collect();
    let ids: Vec<u32> = members.iter().map(|e| e.token_id).collect();

    Ok(Entity {
        entity: group_type(&first.entity).to_string(),
        score: mean(&scores),
        scores: None,
        index: first.index,
        word: decode(&ids)?,
        token_id: first.token_id,
        start: first.start,
        end: last.end,
        is_subword: false,
    })
}
