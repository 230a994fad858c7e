//! Borrowed `llama_batch` view over caller-owned tokens.

use std::marker::PhantomData;

/// A single-sequence batch that points straight into a token slice.
///
/// Built with `llama_batch_get_one`: no allocation, positions are assigned
/// by llama.cpp from the end of sequence 0, and only the last token
/// requests logits.  The view borrows `tokens`, so it cannot outlive the
/// decode call it is built for.
pub struct LlamaBatch<'a> {
    inner: llama_sys::llama_batch,
    _tokens: PhantomData<&'a [i32]>,
}

impl<'a> LlamaBatch<'a> {
    pub fn from_tokens(tokens: &'a [i32]) -> Self {
        // llama_batch_get_one takes a mutable pointer but never writes
        // through it.
        let inner = unsafe {
            llama_sys::llama_batch_get_one(tokens.as_ptr() as *mut i32, tokens.len() as i32)
        };
        Self {
            inner,
            _tokens: PhantomData,
        }
    }

    /// Return the raw batch struct (passed by value; `Copy` in C).
    pub(crate) fn raw(&self) -> llama_sys::llama_batch {
        self.inner
    }

    pub fn n_tokens(&self) -> i32 {
        self.inner.n_tokens
    }
}
