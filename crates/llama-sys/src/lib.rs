//! Raw FFI bindings to the llama.cpp C API, generated by bindgen at
//! build time.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// Entry points of `shim/common_shim.cpp`.
#[cfg(feature = "llguidance")]
unsafe extern "C" {
    /// `llama_sampler_init_llg` from `common/sampling.h`; returns null when
    /// the grammar does not compile.
    pub fn llama_shim_sampler_init_llg(
        vocab: *const llama_vocab,
        grammar_kind: *const std::ffi::c_char,
        grammar_data: *const std::ffi::c_char,
    ) -> *mut llama_sampler;

    pub fn llama_shim_common_log_pause();

    pub fn llama_shim_common_log_resume();
}
