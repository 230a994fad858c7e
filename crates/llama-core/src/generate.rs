//! Token generation loop on top of a context and a sampler chain.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::sampler::SamplerChain;
use crate::token::token_to_piece_bytes;

/// Parameters for a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Pre-tokenized prompt, appended to whatever the context already holds.
    pub prompt: Vec<i32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Generation ends once the produced text contains one of these.
    #[serde(default)]
    pub stop_words: Vec<String>,
}

fn default_max_tokens() -> u32 {
    256
}

impl GenerateRequest {
    pub fn new(prompt: Vec<i32>, max_tokens: u32) -> Self {
        Self {
            prompt,
            max_tokens,
            stop_words: Vec::new(),
        }
    }
}

/// Result of a finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens: Vec<i32>,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Events emitted by [`generate_blocking`].
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    /// A new run of complete UTF-8 text.
    Token(String),
    Done {
        finish_reason: FinishReason,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-generation token.
    Stop,
    /// Reached `max_tokens` or filled the context.
    Length,
    /// Matched a stop word.
    StopWord(String),
    /// The consumer asked to stop.
    Cancelled,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Generate to completion and return the whole text.
pub fn generate(
    ctx: &mut LlamaContext,
    sampler: &mut SamplerChain,
    request: &GenerateRequest,
) -> Result<Generation> {
    generate_streaming(ctx, sampler, request, |_| ControlFlow::Continue(()))
}

/// Generate, handing each run of complete UTF-8 text to `on_text`.
///
/// Returning `ControlFlow::Break` from `on_text` ends generation with
/// [`FinishReason::Cancelled`].  Every produced token is accepted into the
/// chain exactly once; the end-of-generation token is neither accepted nor
/// recorded.
pub fn generate_streaming<F>(
    ctx: &mut LlamaContext,
    sampler: &mut SamplerChain,
    request: &GenerateRequest,
    mut on_text: F,
) -> Result<Generation>
where
    F: FnMut(&str) -> ControlFlow<()>,
{
    decode_prompt(ctx, &request.prompt)?;

    let prompt_tokens = request.prompt.len() as u32;
    let mut utf8 = Utf8Buffer::default();
    let mut scanner = StopScanner::new(&request.stop_words);
    let mut tokens = Vec::new();

    let finish_reason = loop {
        if tokens.len() as u32 >= request.max_tokens {
            break FinishReason::Length;
        }

        let token = sampler.sample(ctx, -1)?;
        if ctx.model().is_eog(token) {
            break FinishReason::Stop;
        }
        sampler.accept(token)?;
        tokens.push(token);

        let bytes = token_to_piece_bytes(ctx.model(), token)?;
        let piece = utf8.push(&bytes);
        match scanner.push(&piece) {
            Scan::Stopped { emit, word } => {
                if !emit.is_empty() {
                    let _ = on_text(&emit);
                }
                break FinishReason::StopWord(word);
            }
            Scan::Emit(emit) if !emit.is_empty() => {
                if on_text(&emit).is_break() {
                    debug!("Generation cancelled by consumer");
                    break FinishReason::Cancelled;
                }
            }
            Scan::Emit(_) => {}
        }

        if ctx.n_past() as u32 >= ctx.n_ctx() {
            break FinishReason::Length;
        }
        ctx.decode(&[token])?;
    };

    if matches!(finish_reason, FinishReason::Stop | FinishReason::Length) {
        // A stop word can still complete inside the flushed tail.
        let tail = utf8.finish();
        let emit = match scanner.push(&tail) {
            Scan::Stopped { emit, .. } => emit,
            Scan::Emit(mut emit) => {
                emit.push_str(&scanner.flush());
                emit
            }
        };
        if !emit.is_empty() {
            let _ = on_text(&emit);
        }
    }
    let text = scanner.into_text();

    let completion_tokens = tokens.len() as u32;
    debug!(
        prompt_tokens,
        completion_tokens,
        finish_reason = %finish_reason,
        "Generation finished"
    );
    Ok(Generation {
        text,
        tokens,
        finish_reason,
        prompt_tokens,
        completion_tokens,
    })
}

/// Run generation on the current thread, reporting over `tx`.
///
/// Meant for `tokio::task::spawn_blocking`.  Dropping the receiver cancels
/// generation.
pub fn generate_blocking(
    ctx: &mut LlamaContext,
    sampler: &mut SamplerChain,
    request: &GenerateRequest,
    tx: mpsc::Sender<GenerateEvent>,
) {
    let result = generate_streaming(ctx, sampler, request, |piece| {
        if tx.blocking_send(GenerateEvent::Token(piece.to_owned())).is_err() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    let event = match result {
        Ok(done) => GenerateEvent::Done {
            finish_reason: done.finish_reason,
            prompt_tokens: done.prompt_tokens,
            completion_tokens: done.completion_tokens,
        },
        Err(e) => GenerateEvent::Error(e.to_string()),
    };
    let _ = tx.blocking_send(event);
}

/// Decode the prompt in chunks of at most `n_batch` tokens.
fn decode_prompt(ctx: &mut LlamaContext, prompt: &[i32]) -> Result<()> {
    if prompt.is_empty() {
        return Err(LlamaError::InvalidArgument("prompt is empty".into()));
    }
    let n_past = ctx.n_past().max(0) as usize;
    let n_ctx = ctx.n_ctx() as usize;
    if n_past + prompt.len() > n_ctx {
        return Err(LlamaError::decode(
            1,
            format!(
                "prompt of {} tokens does not fit: {n_past} cached, n_ctx {n_ctx}",
                prompt.len()
            ),
        ));
    }

    // Each chunk is atomic on its own; a later failure also drops the
    // chunks that already landed.
    let start = ctx.n_past();
    let n_batch = (ctx.n_batch() as usize).max(1);
    for (i, chunk) in prompt.chunks(n_batch).enumerate() {
        if let Err(e) = ctx.decode(chunk) {
            if i > 0 {
                let restored = ctx.truncate_from(start);
                warn!(chunk = i, start, restored, "Prompt decode failed, cache rolled back");
            }
            return Err(e);
        }
    }
    Ok(())
}

//  Stop words

/// Outcome of feeding one piece of text to a [`StopScanner`].
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Text that can no longer be part of a stop word.
    Emit(String),
    /// A stop word matched; `emit` is the text that preceded it.
    Stopped { emit: String, word: String },
}

/// Tracks generated text and decides how much of it is safe to stream.
///
/// A trailing run that is a proper prefix of some stop word is held back
/// until the next piece shows whether the stop word completes.  The text
/// returned by [`StopScanner::into_text`] is exactly what was emitted.
struct StopScanner<'a> {
    stops: &'a [String],
    text: String,
    emitted: usize,
}

impl<'a> StopScanner<'a> {
    fn new(stops: &'a [String]) -> Self {
        Self {
            stops,
            text: String::new(),
            emitted: 0,
        }
    }

    fn push(&mut self, piece: &str) -> Scan {
        self.text.push_str(piece);

        // Held-back text is the only place a match can begin before the
        // newest piece, so searching from `emitted` is enough.
        if let Some((at, word)) = find_stop(&self.text, self.emitted, self.stops) {
            let emit = self.text[self.emitted..at].to_owned();
            self.text.truncate(at);
            self.emitted = at;
            return Scan::Stopped {
                emit,
                word: word.to_owned(),
            };
        }

        let safe_end = self.text.len() - self.held_len();
        let emit = self.text[self.emitted..safe_end].to_owned();
        self.emitted = safe_end;
        Scan::Emit(emit)
    }

    /// Length of the longest unemitted suffix that could still grow into a
    /// stop word.
    fn held_len(&self) -> usize {
        let bytes = self.text.as_bytes();
        (self.emitted..bytes.len())
            .filter(|&i| self.text.is_char_boundary(i))
            .find(|&i| {
                let tail = &bytes[i..];
                self.stops
                    .iter()
                    .any(|s| s.len() > tail.len() && s.as_bytes().starts_with(tail))
            })
            .map_or(0, |i| bytes.len() - i)
    }

    /// Release the held-back text; no stop word can complete any more.
    fn flush(&mut self) -> String {
        let rest = self.text[self.emitted..].to_owned();
        self.emitted = self.text.len();
        rest
    }

    fn into_text(mut self) -> String {
        self.text.truncate(self.emitted);
        self.text
    }
}

/// Earliest stop word occurrence starting at or after byte `from`.
fn find_stop<'a>(text: &str, from: usize, stops: &'a [String]) -> Option<(usize, &'a str)> {
    let mut from = from.min(text.len());
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text[from..].find(s.as_str()).map(|i| (from + i, s.as_str())))
        .min_by_key(|&(at, _)| at)
}

//  Utf8Buffer

/// Joins token pieces into complete UTF-8 text.
///
/// A multi-byte character can be split across tokens; incomplete trailing
/// bytes are held back until the rest arrives.  Bytes that can never form
/// a character become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    /// Add `bytes` and return every character completed so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left, replacing an incomplete sequence.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
