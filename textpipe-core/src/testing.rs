//! Dublês de teste: tokenizador WordPiece simplificado, sessão de inferência roteirizada
//! e um buffer assíncrono compartilhado para capturar a saída do streaming.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use crate::engine::{InferenceEngine, ModelSession, Tensor, TensorInfo};
use crate::error::{EngineError, TokenizerError};
use crate::tokenizer::{Tokenizer, TokenizedInput, TokenizerOptions, ATTENTION_MASK, INPUT_IDS};

pub const CLS_ID: u32 = 101;
pub const SEP_ID: u32 = 102;

/// Palavras com mais caracteres que isto viram `cabeça` + `##resto`.
const MAX_WORD_CHARS: usize = 6;
const HEAD_CHARS: usize = 4;

#[derive(Default)]
struct Vocab {
    ids: HashMap<String, u32>,
    tokens: HashMap<u32, String>,
}

impl Vocab {
    fn with_specials() -> Self {
        let mut vocab = Vocab::default();
        vocab.insert_fixed("[CLS]", CLS_ID);
        vocab.insert_fixed("[SEP]", SEP_ID);
        vocab
    }

    fn insert_fixed(&mut self, token: &str, id: u32) {
        self.ids.insert(token.to_string(), id);
        self.tokens.insert(id, token.to_string());
    }

    fn id_of(&mut self, token: &str) -> u32 {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        let id = 1000 + self.ids.len() as u32;
        self.insert_fixed(token, id);
        id
    }
}

/// Tokenizador de espaço em branco com sub-palavras no estilo WordPiece.
///
/// Os ids são atribuídos na primeira vez que um token aparece, então o mesmo
/// texto sempre recebe os mesmos ids dentro de uma instância.
pub struct WordPieceTokenizer {
    vocab: Mutex<Vocab>,
    reject: Option<String>,
    fail_destroy: bool,
    destroy_calls: AtomicUsize,
}

impl WordPieceTokenizer {
    pub fn new() -> Self {
        Self {
            vocab: Mutex::new(Vocab::with_specials()),
            reject: None,
            fail_destroy: false,
            destroy_calls: AtomicUsize::new(0),
        }
    }

    /// Falha ao tokenizar qualquer texto que contenha `needle`.
    pub fn rejecting(mut self, needle: &str) -> Self {
        self.reject = Some(needle.to_string());
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// Id do token (ex: `"Ana"`, `"##gang"`), registrando-o se for novo.
    pub fn id_of(&self, token: &str) -> u32 {
        self.vocab.lock().unwrap().id_of(token)
    }

    fn pieces(text: &str) -> Vec<(String, usize, usize)> {
        let mut pieces = Vec::new();
        let mut word_start = None;
        let bounds = text
            .char_indices()
            .map(|(i, c)| (i, Some(c)))
            .chain(std::iter::once((text.len(), None)));
        for (i, c) in bounds {
            match (c.map(char::is_whitespace).unwrap_or(true), word_start) {
                (true, Some(start)) => {
                    Self::split_word(&text[start..i], start, &mut pieces);
                    word_start = None;
                }
                (false, None) => word_start = Some(i),
                _ => {}
            }
        }
        pieces
    }

    fn split_word(word: &str, offset: usize, pieces: &mut Vec<(String, usize, usize)>) {
        if word.chars().count() <= MAX_WORD_CHARS {
            pieces.push((word.to_string(), offset, offset + word.len()));
            return;
        }
        let cut = word
            .char_indices()
            .nth(HEAD_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(word.len());
        pieces.push((word[..cut].to_string(), offset, offset + cut));
        pieces.push((format!("##{}", &word[cut..]), offset + cut, offset + word.len()));
    }
}

impl Tokenizer for WordPieceTokenizer {
    fn encode(
        &self,
        text: &str,
        options: &TokenizerOptions,
    ) -> Result<TokenizedInput, TokenizerError> {
        if let Some(needle) = &self.reject {
            if text.contains(needle.as_str()) {
                return Err(TokenizerError::new(format!("texto recusado: {text:?}")));
            }
        }

        let mut entries: Vec<(String, u32, (usize, usize), u32)> = Vec::new();
        {
            let mut vocab = self.vocab.lock().unwrap();
            if options.add_special_tokens {
                entries.push(("[CLS]".into(), CLS_ID, (0, 0), 1));
            }
            for (token, start, end) in Self::pieces(text) {
                let id = vocab.id_of(&token);
                entries.push((token, id, (start, end), 0));
            }
            if options.add_special_tokens {
                entries.push(("[SEP]".into(), SEP_ID, (0, 0), 1));
            }
        }

        let n = entries.len();
        let mut input = TokenizedInput {
            raw: text.to_string(),
            ..Default::default()
        };
        for (token, id, offsets, special) in entries {
            input.tokens.push(token);
            input.token_ids.push(id);
            if options.return_offsets {
                input.offsets.push(offsets);
            }
            if options.return_special_tokens_mask {
                input.special_tokens_mask.push(special);
            }
        }
        if options.return_type_ids {
            input.type_ids = vec![0; n];
        }
        if options.return_attention_mask {
            input.attention_mask = vec![1; n];
        }
        Ok(input)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        let vocab = self.vocab.lock().unwrap();
        let mut text = String::new();
        for id in ids {
            if skip_special_tokens && (*id == CLS_ID || *id == SEP_ID) {
                continue;
            }
            let token = vocab
                .tokens
                .get(id)
                .ok_or_else(|| TokenizerError::new(format!("id desconhecido: {id}")))?;
            match token.strip_prefix("##") {
                Some(rest) => text.push_str(rest),
                None => {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(token);
                }
            }
        }
        Ok(text)
    }

    fn destroy(&self) -> Result<(), TokenizerError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(TokenizerError::new("tokenizador já liberado"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Output {
    /// `[lote, seq, rótulos]`: um vetor de logits por token.
    TokenLogits(usize),
    /// `[lote, rótulos]`: um vetor de logits por entrada.
    SequenceLogits(usize),
    /// `[lote, seq, largura]`: estados ocultos por token.
    HiddenStates(usize),
    /// `[lote, largura]`: vetor já agregado pelo modelo.
    Pooled(usize),
}

/// Valor escrito nas posições de padding, para os testes provarem que foram descartadas.
pub const PADDING_MARKER: f32 = 1000.0;

/// Sessão de inferência determinística: a saída de cada token depende só do id dele.
pub struct ScriptedSession {
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
    output: Output,
    labels: HashMap<i64, usize>,
    fail_on: Option<i64>,
    fail_always: Option<String>,
    fail_destroy: bool,
    run_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl ScriptedSession {
    fn with_output(output: Output, outputs: Vec<TensorInfo>) -> Self {
        Self {
            inputs: vec![
                TensorInfo::new(INPUT_IDS, vec![-1, -1]),
                TensorInfo::new(ATTENTION_MASK, vec![-1, -1]),
            ],
            outputs,
            output,
            labels: HashMap::new(),
            fail_on: None,
            fail_always: None,
            fail_destroy: false,
            run_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    pub fn token_logits(num_labels: usize) -> Self {
        Self::with_output(
            Output::TokenLogits(num_labels),
            vec![TensorInfo::new("logits", vec![-1, -1, num_labels as i64])],
        )
    }

    pub fn sequence_logits(num_labels: usize) -> Self {
        Self::with_output(
            Output::SequenceLogits(num_labels),
            vec![TensorInfo::new("logits", vec![-1, num_labels as i64])],
        )
    }

    pub fn hidden_states(width: usize) -> Self {
        Self::with_output(
            Output::HiddenStates(width),
            vec![TensorInfo::new("last_hidden_state", vec![-1, -1, width as i64])],
        )
    }

    pub fn pooled(width: usize) -> Self {
        Self::with_output(
            Output::Pooled(width),
            vec![TensorInfo::new("sentence_embedding", vec![-1, width as i64])],
        )
    }

    /// O token `token_id` passa a ter `label` como rótulo mais provável.
    /// Nas saídas por entrada, qualquer token marcado decide o rótulo da entrada.
    pub fn with_label(mut self, token_id: u32, label: usize) -> Self {
        self.labels.insert(token_id as i64, label);
        self
    }

    /// Falha em qualquer lote que contenha `token_id`.
    pub fn failing_on(mut self, token_id: u32) -> Self {
        self.fail_on = Some(token_id as i64);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail_always = Some(message.to_string());
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<TensorInfo>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn one_hot(&self, id: i64, width: usize) -> Vec<f32> {
        let hot = self.labels.get(&id).copied().unwrap_or(0);
        (0..width).map(|j| if j == hot { 4.0 } else { 0.0 }).collect()
    }

    fn hidden(id: i64, width: usize) -> Vec<f32> {
        (0..width).map(|j| id as f32 / 100.0 + j as f32).collect()
    }
}

impl ModelSession for ScriptedSession {
    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_always {
            return Err(EngineError::new(message.clone()));
        }
        let ids_tensor = inputs
            .iter()
            .find(|t| t.name == INPUT_IDS)
            .ok_or_else(|| EngineError::new("input_ids ausente"))?;
        let ids = ids_tensor
            .as_i64()
            .ok_or_else(|| EngineError::new("input_ids deve ser int64"))?;
        let (batch, seq) = (ids_tensor.shape[0] as usize, ids_tensor.shape[1] as usize);
        if let Some(bad) = self.fail_on {
            if ids.contains(&bad) {
                return Err(EngineError::new(format!("token {bad} envenenado")));
            }
        }
        let rows: Vec<&[i64]> = ids.chunks(seq.max(1)).collect();
        let name = self.outputs.first().map(|o| o.name.clone()).unwrap_or_default();

        let tensor = match self.output {
            Output::TokenLogits(width) | Output::HiddenStates(width) => {
                let mut data = Vec::with_capacity(batch * seq * width);
                for &id in ids {
                    if id == 0 {
                        data.extend(std::iter::repeat(PADDING_MARKER).take(width));
                    } else if let Output::TokenLogits(_) = self.output {
                        data.extend(self.one_hot(id, width));
                    } else {
                        data.extend(Self::hidden(id, width));
                    }
                }
                Tensor::float32(name, vec![batch as i64, seq as i64, width as i64], data)
            }
            Output::SequenceLogits(width) => {
                let mut data = Vec::with_capacity(batch * width);
                for row in &rows {
                    let marked = row.iter().copied().find(|id| self.labels.contains_key(id));
                    data.extend(self.one_hot(marked.unwrap_or(-1), width));
                }
                Tensor::float32(name, vec![batch as i64, width as i64], data)
            }
            Output::Pooled(width) => {
                let mut data = Vec::with_capacity(batch * width);
                for row in &rows {
                    let sum: i64 = row.iter().sum();
                    data.extend(Self::hidden(sum, width));
                }
                Tensor::float32(name, vec![batch as i64, width as i64], data)
            }
        };
        Ok(vec![tensor])
    }

    fn destroy(&self) -> Result<(), EngineError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(EngineError::new("sessão já liberada"));
        }
        Ok(())
    }
}

/// Motor que entrega sempre a mesma sessão roteirizada.
pub struct ScriptedEngine {
    session: Arc<ScriptedSession>,
    fail_load: bool,
    load_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(session: Arc<ScriptedSession>) -> Self {
        Self {
            session,
            fail_load: false,
            load_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "roteirizado"
    }

    fn load(&self, _model: &[u8]) -> Result<Arc<dyn ModelSession>, EngineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(EngineError::new("modelo corrompido"));
        }
        Ok(self.session.clone())
    }

    fn destroy(&self) -> Result<(), EngineError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Destino assíncrono em memória, clonável para inspeção depois da escrita.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.bytes.lock().unwrap().clone()).unwrap()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bytes.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Destino que recusa toda escrita.
pub struct BrokenSink;

impl AsyncWrite for BrokenSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "destino fechado")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
