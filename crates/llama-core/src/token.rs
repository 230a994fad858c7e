//! Tokenization / detokenization.

use std::ffi::c_char;

use crate::error::{LlamaError, Result};
use crate::model::{LlamaModel, check_token_range};

/// Extra token slots on top of one-per-byte for the first tokenize attempt
/// (room for BOS/EOS and other specials).
const TOKENIZE_SLACK: usize = 16;

/// Per-token render buffer; longer pieces fall back to an exact heap buffer.
const PIECE_BUF_LEN: usize = 256;

/// Initial detokenize capacity per token.
const BYTES_PER_TOKEN_GUESS: usize = 16;

/// Tokenize `text` with the model's vocabulary.
///
/// Special-token markup inside `text` (e.g. `<|eot_id|>`) is parsed.
/// `add_special` prepends BOS (and appends EOS where the vocabulary asks
/// for it).
pub fn tokenize(model: &LlamaModel, text: &str, add_special: bool) -> Result<Vec<i32>> {
    let text_len = i32::try_from(text.len()).map_err(|_| {
        LlamaError::InvalidArgument(format!("text of {} bytes is too long", text.len()))
    })?;
    let vocab = model.vocab();

    let run = |buf: &mut [i32]| unsafe {
        llama_sys::llama_tokenize(
            vocab,
            text.as_ptr() as *const c_char,
            text_len,
            buf.as_mut_ptr(),
            buf.len().min(i32::MAX as usize) as i32,
            add_special,
            true,
        )
    };

    let mut tokens = vec![0i32; text.len() + TOKENIZE_SLACK];
    let mut n = run(tokens.as_mut_slice());

    // A negative count is the capacity llama.cpp actually needs.
    if n < 0 && n != i32::MIN {
        tokens.resize(n.unsigned_abs() as usize, 0);
        n = run(tokens.as_mut_slice());
    }

    if n < 0 {
        return Err(LlamaError::TokenizationFailed(format!(
            "llama_tokenize returned {n} after resizing"
        )));
    }

    tokens.truncate(n as usize);
    Ok(tokens)
}

/// Render `tokens` back into text.
///
/// A leading BOS is dropped, so `detokenize(tokenize(text, true))` gives
/// back `text`.  Other special tokens are rendered; byte sequences that are
/// not valid UTF-8 are replaced with U+FFFD.
pub fn detokenize(model: &LlamaModel, tokens: &[i32]) -> Result<String> {
    let n_vocab = model.n_vocab();
    for &token in tokens {
        check_token_range(token, n_vocab)?;
    }
    let tokens = strip_leading(tokens, model.token_bos());

    let mut out: Vec<u8> = Vec::with_capacity(tokens.len() * BYTES_PER_TOKEN_GUESS);
    let mut piece = [0u8; PIECE_BUF_LEN];
    for &token in tokens {
        let n = render_piece(model, token, &mut piece);
        if n >= 0 {
            append_doubling(&mut out, &piece[..n as usize]);
        } else {
            let big = render_piece_exact(model, token, n)?;
            append_doubling(&mut out, &big);
        }
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Raw bytes of a single token's piece.
///
/// A piece can be an incomplete UTF-8 sequence, so callers streaming text
/// should buffer bytes rather than convert piece by piece.
pub fn token_to_piece_bytes(model: &LlamaModel, token: i32) -> Result<Vec<u8>> {
    check_token_range(token, model.n_vocab())?;
    let mut piece = [0u8; PIECE_BUF_LEN];
    let n = render_piece(model, token, &mut piece);
    if n >= 0 {
        Ok(piece[..n as usize].to_vec())
    } else {
        render_piece_exact(model, token, n)
    }
}

/// Convert a single token id to its text piece (lossy).
pub fn token_to_piece(model: &LlamaModel, token: i32) -> Result<String> {
    let bytes = token_to_piece_bytes(model, token)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn strip_leading(tokens: &[i32], bos: i32) -> &[i32] {
    match tokens.split_first() {
        Some((&first, rest)) if first == bos => rest,
        _ => tokens,
    }
}

fn render_piece(model: &LlamaModel, token: i32, buf: &mut [u8]) -> i32 {
    unsafe {
        llama_sys::llama_token_to_piece(
            model.vocab(),
            token,
            buf.as_mut_ptr() as *mut c_char,
            buf.len() as i32,
            0,    // lstrip
            true, // special
        )
    }
}

/// Second attempt after `render_piece` reported it needs `-needed` bytes.
fn render_piece_exact(model: &LlamaModel, token: i32, needed: i32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; needed.unsigned_abs() as usize];
    let n = render_piece(model, token, &mut buf);
    if n < 0 {
        return Err(LlamaError::TokenizationFailed(format!(
            "token {token} needs {} bytes after resizing",
            n.unsigned_abs()
        )));
    }
    buf.truncate(n as usize);
    Ok(buf)
}

/// Append with explicit capacity doubling so long outputs reallocate
/// O(log n) times.
fn append_doubling(out: &mut Vec<u8>, bytes: &[u8]) {
    let needed = out.len() + bytes.len();
    if needed > out.capacity() {
        let mut cap = out.capacity().max(BYTES_PER_TOKEN_GUESS);
        while cap < needed {
            cap *= 2;
        }
        out.reserve_exact(cap - out.len());
    }
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_doubles_capacity() {
        let mut out: Vec<u8> = Vec::with_capacity(16);
        append_doubling(&mut out, &[b'a'; 16]);
        assert!(out.capacity() >= 16);

        append_doubling(&mut out, b"b");
        assert!(out.capacity() >= 32);
        assert_eq!(out.len(), 17);

        append_doubling(&mut out, &[b'c'; 100]);
        assert!(out.capacity() >= 117);
        assert_eq!(&out[..17], b"aaaaaaaaaaaaaaaab");
    }

    #[test]
    fn only_a_leading_bos_is_stripped() {
        assert_eq!(strip_leading(&[1, 15043, 1], 1), &[15043, 1]);
        assert_eq!(strip_leading(&[15043, 1], 1), &[15043, 1]);
        assert_eq!(strip_leading(&[1], 1), &[] as &[i32]);
        assert_eq!(strip_leading(&[], 1), &[] as &[i32]);
        // Vocabularies without BOS report -1, which never matches.
        assert_eq!(strip_leading(&[5, 6], -1), &[5, 6]);
    }

    #[test]
    fn append_from_empty_vec() {
        let mut out = Vec::new();
        append_doubling(&mut out, "héllo".as_bytes());
        assert_eq!(String::from_utf8(out).unwrap(), "héllo");
    }
}
