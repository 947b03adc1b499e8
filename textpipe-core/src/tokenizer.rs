//! # Tokenização em Sub-palavras
//!
//! O tokenizador é um colaborador externo: este módulo define apenas a fronteira
//! ([`Tokenizer`]) e a forma dos dados que atravessam essa fronteira ([`TokenizedInput`]).
//!
//! Cada token preserva sua posição original no texto (offsets em **bytes**), o que permite
//! recuperar a palavra exata de uma entidade sem depender da decodificação do vocabulário.
//!
//! ## Sequências paralelas
//!
//! | Campo                 | Sempre presente | Usado por                          |
//! |-----------------------|-----------------|------------------------------------|
//! | `tokens`              | sim             | heurística de sub-palavra          |
//! | `token_ids`           | sim             | tensor `input_ids`                 |
//! | `type_ids`            | se pedido       | tensor `token_type_ids`            |
//! | `attention_mask`      | se pedido       | tensor `attention_mask`            |
//! | `offsets`             | se pedido       | spans das entidades                |
//! | `special_tokens_mask` | se pedido       | descarte de `[CLS]`, `[SEP]`, ...  |
//!
//! Quando presentes, todas têm o mesmo comprimento de `token_ids`.
//!
//! O backend concreto ([`HfTokenizer`]) usa o crate `tokenizers` e lê um `tokenizer.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::TensorInfo;
use crate::error::{PipelineError, Result, TokenizerError};

/// Nome da entrada do modelo com os ids dos tokens.
pub const INPUT_IDS: &str = "input_ids";
/// Nome da entrada do modelo com os ids de segmento.
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";
/// Nome da entrada do modelo com a máscara de atenção.
pub const ATTENTION_MASK: &str = "attention_mask";

/// Uma string de entrada já tokenizada.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenizedInput {
    /// Texto original.
    pub raw: String,
    /// Tokens como o tokenizador os vê (ex: "Wolf", "##gang").
    pub tokens: Vec<String>,
    pub token_ids: Vec<u32>,
    pub type_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Pares (início, fim) de bytes em `raw`, fim exclusivo.
    pub offsets: Vec<(usize, usize)>,
    /// 1 para tokens especiais, 0 para tokens reais.
    pub special_tokens_mask: Vec<u32>,
}

impl TokenizedInput {
    /// Número de tokens reais (sem padding).
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn is_special(&self, index: usize) -> bool {
        self.special_tokens_mask
            .get(index)
            .map(|m| *m > 0)
            .unwrap_or(false)
    }

    /// Verifica os invariantes das sequências paralelas e dos offsets.
    ///
    /// - sequências presentes têm o comprimento de `token_ids`
    /// - offsets são intervalos válidos de bytes de `raw`
    /// - entre tokens reais, o início dos offsets nunca decresce
    pub fn is_consistent(&self) -> bool {
        let n = self.token_ids.len();
        let parallel = |len: usize, optional: bool| len == n || (optional && len == 0);
        if !parallel(self.tokens.len(), false)
            || !parallel(self.type_ids.len(), true)
            || !parallel(self.attention_mask.len(), true)
            || !parallel(self.offsets.len(), true)
            || !parallel(self.special_tokens_mask.len(), true)
        {
            return false;
        }

        let mut last_start = 0;
        for (i, &(start, end)) in self.offsets.iter().enumerate() {
            if start > end || self.raw.get(start..end).is_none() {
                return false;
            }
            if self.is_special(i) {
                continue;
            }
            if start < last_start {
                return false;
            }
            last_start = start;
        }
        true
    }
}

/// Opções de tokenização, fixas por instância de pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerOptions {
    pub add_special_tokens: bool,
    pub return_type_ids: bool,
    pub return_attention_mask: bool,
    pub return_offsets: bool,
    pub return_special_tokens_mask: bool,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self {
            add_special_tokens: true,
            return_type_ids: false,
            return_attention_mask: false,
            return_offsets: false,
            return_special_tokens_mask: false,
        }
    }
}

impl TokenizerOptions {
    /// Deriva as opções a partir das entradas declaradas pelo modelo.
    ///
    /// Entradas desconhecidas são todas reportadas de uma vez como `Config`.
    pub fn for_model_inputs(inputs: &[TensorInfo]) -> Result<Self> {
        let mut options = Self::default();
        let mut violations = Vec::new();
        for input in inputs {
            match input.name.as_str() {
                INPUT_IDS => {}
                TOKEN_TYPE_IDS => options.return_type_ids = true,
                ATTENTION_MASK => options.return_attention_mask = true,
                other => violations.push(format!("entrada do modelo não suportada: {other}")),
            }
        }
        if violations.is_empty() {
            Ok(options)
        } else {
            Err(PipelineError::Config(violations))
        }
    }

    pub fn with_offsets(mut self) -> Self {
        self.return_offsets = true;
        self
    }

    pub fn with_special_tokens_mask(mut self) -> Self {
        self.return_special_tokens_mask = true;
        self
    }
}

/// Fronteira com o tokenizador externo.
pub trait Tokenizer: Send + Sync {
    fn encode(
        &self,
        text: &str,
        options: &TokenizerOptions,
    ) -> std::result::Result<TokenizedInput, TokenizerError>;

    /// Decodifica ids de volta para texto.
    fn decode(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> std::result::Result<String, TokenizerError>;

    /// Libera recursos do tokenizador. Chamado exatamente uma vez pelo dono.
    fn destroy(&self) -> std::result::Result<(), TokenizerError> {
        Ok(())
    }
}

/// Tokenizador HuggingFace (`tokenizer.json`).
///
/// O padding configurado no arquivo é desligado: quem completa as sequências
/// até o tamanho do lote é o adaptador de tensores.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, TokenizerError> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            TokenizerError::new(format!("não foi possível ler {}: {e}", path.display()))
        })?;
        Ok(Self::wrap(inner))
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, TokenizerError> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| TokenizerError::new(format!("tokenizer.json inválido: {e}")))?;
        Ok(Self::wrap(inner))
    }

    fn wrap(mut inner: tokenizers::Tokenizer) -> Self {
        inner.with_padding(None);
        Self { inner }
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(
        &self,
        text: &str,
        options: &TokenizerOptions,
    ) -> std::result::Result<TokenizedInput, TokenizerError> {
        let encoding = self
            .inner
            .encode(text, options.add_special_tokens)
            .map_err(|e| TokenizerError::new(e.to_string()))?;

        let mut input = TokenizedInput {
            raw: text.to_string(),
            tokens: encoding.get_tokens().to_vec(),
            token_ids: encoding.get_ids().to_vec(),
            ..Default::default()
        };
        if options.return_type_ids {
            input.type_ids = encoding.get_type_ids().to_vec();
        }
        if options.return_attention_mask {
            input.attention_mask = encoding.get_attention_mask().to_vec();
        }
        if options.return_offsets {
            input.offsets = encoding.get_offsets().to_vec();
        }
        if options.return_special_tokens_mask {
            input.special_tokens_mask = encoding.get_special_tokens_mask().to_vec();
        }
        Ok(input)
    }

    fn decode(
        &self,
        ids: &[u32],
        skip_special_tokens: bool,
    ) -> std::result::Result<String, TokenizerError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| TokenizerError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WordPieceTokenizer;

    #[test]
    fn test_options_from_model_inputs() {
        let inputs = vec![
            TensorInfo::new(INPUT_IDS, vec![-1, -1]),
            TensorInfo::new(ATTENTION_MASK, vec![-1, -1]),
        ];
        let options = TokenizerOptions::for_model_inputs(&inputs).unwrap();
        assert!(options.return_attention_mask);
        assert!(!options.return_type_ids);
        assert!(options.add_special_tokens);
    }

    #[test]
    fn test_options_report_every_unknown_input() {
        let inputs = vec![
            TensorInfo::new(INPUT_IDS, vec![-1, -1]),
            TensorInfo::new("pixel_values", vec![-1, 3]),
            TensorInfo::new("position_ids", vec![-1, -1]),
        ];
        let err = TokenizerOptions::for_model_inputs(&inputs).unwrap_err();
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_parallel_sequences_have_equal_length() {
        let tokenizer = WordPieceTokenizer::new();
        let options = TokenizerOptions::default()
            .with_offsets()
            .with_special_tokens_mask();
        for text in ["", "Lula", "Meu nome é Wolfgang e moro em Berlim."] {
            let input = tokenizer.encode(text, &options).unwrap();
            assert_eq!(input.tokens.len(), input.token_ids.len());
            assert_eq!(input.offsets.len(), input.token_ids.len());
            assert_eq!(input.special_tokens_mask.len(), input.token_ids.len());
            assert!(input.is_consistent(), "inconsistente para {text:?}");
        }
    }

    #[test]
    fn test_inconsistent_offsets_are_detected() {
        let input = TokenizedInput {
            raw: "abc".into(),
            tokens: vec!["abc".into()],
            token_ids: vec![7],
            offsets: vec![(0, 10)],
            ..Default::default()
        };
        assert!(!input.is_consistent());
    }

    #[test]
    fn test_offsets_inside_multibyte_char_are_invalid() {
        let input = TokenizedInput {
            raw: "São".into(),
            tokens: vec!["S".into()],
            token_ids: vec![7],
            offsets: vec![(0, 2)],
            ..Default::default()
        };
        assert!(!input.is_consistent());
    }

    /// `tokenizer.json` mínimo: WordLevel, pré-tokenização por espaço, `[CLS] $A [SEP]`
    /// e padding fixo em 8 (que o wrapper precisa desligar).
    const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": {
            "strategy": {"Fixed": 8},
            "direction": "Right",
            "pad_to_multiple_of": null,
            "pad_id": 0,
            "pad_type_id": 0,
            "pad_token": "[PAD]"
        },
        "added_tokens": [
            {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "[CLS]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 3, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": {"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]},
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3, "São": 4, "Paulo": 5, "é": 6},
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn test_hf_tokenizer_byte_offsets_and_special_mask() {
        let tokenizer = HfTokenizer::from_bytes(WORD_LEVEL_JSON.as_bytes()).unwrap();
        let options = TokenizerOptions::default()
            .with_offsets()
            .with_special_tokens_mask();
        let input = tokenizer.encode("São Paulo é", &options).unwrap();

        // sem padding: [CLS] + 3 palavras + [SEP]
        assert_eq!(input.token_ids, vec![2, 4, 5, 6, 3]);
        assert_eq!(input.tokens[1], "São");
        assert_eq!(input.special_tokens_mask, vec![1, 0, 0, 0, 1]);
        assert_eq!(&input.offsets[1..4], &[(0, 4), (5, 10), (11, 13)]);
        assert!(input.is_consistent());
        assert!(input.type_ids.is_empty());
        assert!(input.attention_mask.is_empty());
    }

    #[test]
    fn test_hf_tokenizer_fields_follow_options() {
        let tokenizer = HfTokenizer::from_bytes(WORD_LEVEL_JSON.as_bytes()).unwrap();
        let options = TokenizerOptions {
            add_special_tokens: false,
            return_type_ids: true,
            return_attention_mask: true,
            ..Default::default()
        };
        let input = tokenizer.encode("Paulo Paulo", &options).unwrap();
        assert_eq!(input.token_ids, vec![5, 5]);
        assert_eq!(input.type_ids, vec![0, 0]);
        assert_eq!(input.attention_mask, vec![1, 1]);
        assert!(input.offsets.is_empty());
        assert!(input.special_tokens_mask.is_empty());
    }

    #[test]
    fn test_hf_tokenizer_decode() {
        let tokenizer = HfTokenizer::from_bytes(WORD_LEVEL_JSON.as_bytes()).unwrap();
        assert_eq!(tokenizer.decode(&[4, 5], false).unwrap(), "São Paulo");
        assert_eq!(tokenizer.decode(&[2, 4, 5, 6, 3], true).unwrap(), "São Paulo é");
    }

    #[test]
    fn test_hf_tokenizer_rejects_invalid_json() {
        assert!(HfTokenizer::from_bytes(b"{ nada }").is_err());
    }
}
