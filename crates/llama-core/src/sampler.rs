//! Sampler chain construction and token sampling.

use std::ffi::CString;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::model::{LlamaModel, check_token_range};

/// RAII wrapper around a `llama_sampler` chain.
///
/// The chain owns every stage added to it; freeing the chain frees them.
pub struct SamplerChain {
    ptr: *mut llama_sys::llama_sampler,
    /// Vocabulary size of the model the chain was built for.
    n_vocab: i32,
}

unsafe impl Send for SamplerChain {}

impl SamplerChain {
    /// Build the chain described by `config` for `model`'s vocabulary.
    ///
    /// Fails without leaking anything if any stage (typically the grammar)
    /// cannot be constructed.
    pub fn from_config(model: &LlamaModel, config: &SamplerConfig) -> Result<Self> {
        config.validate()?;

        let params = llama_sys::llama_sampler_chain_params { no_perf: true };
        let ptr = unsafe { llama_sys::llama_sampler_chain_init(params) };
        if ptr.is_null() {
            return Err(LlamaError::AllocationFailed(
                "llama_sampler_chain_init returned null".into(),
            ));
        }
        let mut chain = Self {
            ptr,
            n_vocab: model.n_vocab(),
        };

        let stages = config.stages();
        for stage in &stages {
            chain.add_stage(model, stage)?;
        }

        debug!(?stages, "Sampler chain built");
        Ok(chain)
    }

    fn add_stage(&mut self, model: &LlamaModel, stage: &SamplerStage) -> Result<()> {
        let raw = unsafe {
            match stage {
                SamplerStage::Grammar(grammar) => init_grammar(model, grammar)?,
                SamplerStage::TopK(k) => llama_sys::llama_sampler_init_top_k(*k),
                SamplerStage::TopP { p, min_keep } => {
                    llama_sys::llama_sampler_init_top_p(*p, *min_keep)
                }
                SamplerStage::Temperature(t) => llama_sys::llama_sampler_init_temp(*t),
                SamplerStage::Dist { seed } => llama_sys::llama_sampler_init_dist(*seed),
                SamplerStage::Greedy => llama_sys::llama_sampler_init_greedy(),
            }
        };
        if raw.is_null() {
            return Err(LlamaError::AllocationFailed(format!(
                "could not allocate {stage} stage"
            )));
        }
        unsafe { llama_sys::llama_sampler_chain_add(self.ptr, raw) }
        Ok(())
    }

    /// Number of stages in the chain.
    pub fn n_stages(&self) -> i32 {
        unsafe { llama_sys::llama_sampler_chain_n(self.ptr) }
    }

    //  Sampling

    /// Select a token from the logits of output `idx` (negative counts from
    /// the end).
    ///
    /// The chain is applied but the result is not accepted: stateful stages
    /// only advance through [`SamplerChain::accept`].  With a greedy chain,
    /// repeated calls over the same logits return the same token.
    pub fn sample(&mut self, ctx: &LlamaContext, idx: i32) -> Result<i32> {
        if ctx.model().n_vocab() != self.n_vocab {
            return Err(LlamaError::InvalidArgument(
                "sampler and context were built for different vocabularies".into(),
            ));
        }
        let logits = ctx.logits_ith(idx).ok_or_else(|| {
            LlamaError::InvalidArgument(format!(
                "no logits at output index {idx} (decode a batch first)"
            ))
        })?;

        let mut candidates: Vec<llama_sys::llama_token_data> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| llama_sys::llama_token_data {
                id: id as i32,
                logit,
                p: 0.0,
            })
            .collect();
        let mut cur_p = llama_sys::llama_token_data_array {
            data: candidates.as_mut_ptr(),
            size: candidates.len(),
            selected: -1,
            sorted: false,
        };

        unsafe { llama_sys::llama_sampler_apply(self.ptr, &mut cur_p) };

        let selected = usize::try_from(cur_p.selected)
            .ok()
            .filter(|&i| i < cur_p.size)
            .ok_or_else(|| {
                LlamaError::SamplerError("the chain did not select a token".into())
            })?;
        Ok(unsafe { (*cur_p.data.add(selected)).id })
    }

    /// Feed a produced token back into the stateful stages (grammar
    /// progress, penalties).  Call once per generated token.
    pub fn accept(&mut self, token: i32) -> Result<()> {
        check_token_range(token, self.n_vocab)?;
        unsafe { llama_sys::llama_sampler_accept(self.ptr, token) }
        Ok(())
    }
}

impl Drop for SamplerChain {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing sampler chain");
            unsafe { llama_sys::llama_sampler_free(self.ptr) }
            self.ptr = std::ptr::null_mut();
        }
    }
}

fn init_grammar(
    model: &LlamaModel,
    grammar: &Grammar,
) -> Result<*mut llama_sys::llama_sampler> {
    let text = CString::new(grammar.text.as_str()).map_err(|_| {
        LlamaError::InvalidArgument("grammar text contains a null byte".into())
    })?;

    let raw = match grammar.format {
        GrammarFormat::Gbnf => unsafe {
            llama_sys::llama_sampler_init_grammar(model.vocab(), text.as_ptr(), c"root".as_ptr())
        },
        GrammarFormat::Json | GrammarFormat::Lark => init_llg(model, grammar.format, &text)?,
    };

    if raw.is_null() {
        return Err(LlamaError::GrammarFailed(format!(
            "{} grammar did not compile against this vocabulary",
            grammar.format
        )));
    }
    Ok(raw)
}

#[cfg(feature = "llguidance")]
fn init_llg(
    model: &LlamaModel,
    format: GrammarFormat,
    text: &std::ffi::CStr,
) -> Result<*mut llama_sys::llama_sampler> {
    let kind = match format {
        GrammarFormat::Json => c"json",
        GrammarFormat::Lark => c"lark",
        GrammarFormat::Gbnf => {
            return Err(LlamaError::InvalidArgument(
                "gbnf grammars are not handled by llguidance".into(),
            ));
        }
    };
    Ok(unsafe { llama_sys::llama_shim_sampler_init_llg(model.vocab(), kind.as_ptr(), text.as_ptr()) })
}

#[cfg(not(feature = "llguidance"))]
fn init_llg(
    _model: &LlamaModel,
    format: GrammarFormat,
    _text: &std::ffi::CStr,
) -> Result<*mut llama_sys::llama_sampler> {
    Err(LlamaError::GrammarFailed(format!(
        "{format} grammars need llama-core built with the `llguidance` feature"
    )))
}

//  Stage plan

/// One link of a sampler chain, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    /// Masks every token the grammar does not allow next.
    Grammar(Grammar),
    TopK(i32),
    TopP { p: f32, min_keep: usize },
    Temperature(f32),
    /// Stochastic draw from the remaining distribution.
    Dist { seed: u32 },
    /// Highest-logit token among the survivors.
    Greedy,
}

impl fmt::Display for SamplerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grammar(g) => write!(f, "grammar({})", g.format),
            Self::TopK(k) => write!(f, "top_k({k})"),
            Self::TopP { p, .. } => write!(f, "top_p({p})"),
            Self::Temperature(t) => write!(f, "temp({t})"),
            Self::Dist { seed } => write!(f, "dist(seed={seed})"),
            Self::Greedy => write!(f, "greedy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrammarFormat {
    /// JSON schema (llguidance).
    Json,
    /// Lark grammar (llguidance).
    Lark,
    /// llama.cpp GBNF with a `root` rule.
    Gbnf,
}

impl fmt::Display for GrammarFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Lark => write!(f, "lark"),
            Self::Gbnf => write!(f, "gbnf"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grammar {
    pub format: GrammarFormat,
    pub text: String,
}

impl Grammar {
    pub fn new(format: GrammarFormat, text: impl Into<String>) -> Self {
        Self {
            format,
            text: text.into(),
        }
    }
}

//  SamplerConfig

/// User-facing sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// `<= 0` selects greedy decoding.
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub seed: u32,
    #[serde(default)]
    pub grammar: Option<Grammar>,
}

fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: default_top_k(),
            top_p: default_top_p(),
            seed: 0,
            grammar: None,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.temperature.is_nan() {
            return Err(LlamaError::InvalidArgument("temperature is NaN".into()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(LlamaError::InvalidArgument(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k < 0 {
            return Err(LlamaError::InvalidArgument(format!(
                "top_k must be >= 0, got {}",
                self.top_k
            )));
        }
        if let Some(g) = &self.grammar
            && g.text.trim().is_empty()
        {
            return Err(LlamaError::InvalidArgument(format!(
                "{} grammar text is empty",
                g.format
            )));
        }
        Ok(())
    }

    /// Ordered stage plan.
    ///
    /// The grammar, when present, always comes first so no selection stage
    /// ever sees a token the grammar forbids.
    pub fn stages(&self) -> Vec<SamplerStage> {
        let mut stages = Vec::with_capacity(5);
        if let Some(grammar) = &self.grammar {
            stages.push(SamplerStage::Grammar(grammar.clone()));
        }
        if self.temperature > 0.0 {
            stages.push(SamplerStage::TopK(self.top_k));
            stages.push(SamplerStage::TopP {
                p: self.top_p,
                min_keep: 1,
            });
            stages.push(SamplerStage::Temperature(self.temperature));
            stages.push(SamplerStage::Dist { seed: self.seed });
        } else {
            stages.push(SamplerStage::Greedy);
        }
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yes_no() -> Grammar {
        Grammar::new(GrammarFormat::Lark, "start: \"yes\" | \"no\"")
    }

    #[test]
    fn default_is_greedy() {
        let cfg = SamplerConfig::default();
        assert_eq!(cfg.stages(), vec![SamplerStage::Greedy]);
    }

    #[test]
    fn negative_temperature_is_greedy() {
        let cfg = SamplerConfig {
            temperature: -1.0,
            ..Default::default()
        };
        assert_eq!(cfg.stages(), vec![SamplerStage::Greedy]);
    }

    #[test]
    fn positive_temperature_builds_stochastic_tail() {
        let cfg = SamplerConfig {
            temperature: 0.7,
            top_k: 20,
            top_p: 0.9,
            seed: 7,
            grammar: None,
        };
        assert_eq!(
            cfg.stages(),
            vec![
                SamplerStage::TopK(20),
                SamplerStage::TopP {
                    p: 0.9,
                    min_keep: 1
                },
                SamplerStage::Temperature(0.7),
                SamplerStage::Dist { seed: 7 },
            ]
        );
    }

    #[test]
    fn grammar_always_leads() {
        for temperature in [0.0, 0.8] {
            let cfg = SamplerConfig {
                temperature,
                grammar: Some(yes_no()),
                ..Default::default()
            };
            let stages = cfg.stages();
            assert_eq!(stages[0], SamplerStage::Grammar(yes_no()));
            assert!(
                stages[1..]
                    .iter()
                    .all(|s| !matches!(s, SamplerStage::Grammar(_)))
            );
            let last = stages.last().unwrap();
            if temperature > 0.0 {
                assert_eq!(stages.len(), 5);
                assert!(matches!(last, SamplerStage::Dist { .. }));
            } else {
                assert_eq!(stages.len(), 2);
                assert_eq!(*last, SamplerStage::Greedy);
            }
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad = [
            SamplerConfig {
                temperature: f32::NAN,
                ..Default::default()
            },
            SamplerConfig {
                top_p: 1.5,
                ..Default::default()
            },
            SamplerConfig {
                top_k: -3,
                ..Default::default()
            },
            SamplerConfig {
                grammar: Some(Grammar::new(GrammarFormat::Json, "   ")),
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.validate(), Err(LlamaError::InvalidArgument(_))),
                "{cfg:?} should be rejected"
            );
        }
        assert!(SamplerConfig::default().validate().is_ok());
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: SamplerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, SamplerConfig::default());

        let cfg: SamplerConfig = serde_json::from_str(
            r#"{"temperature":0.5,"grammar":{"format":"gbnf","text":"root ::= \"a\""}}"#,
        )
        .unwrap();
        assert_eq!(cfg.top_k, 40);
        assert_eq!(cfg.grammar.unwrap().format, GrammarFormat::Gbnf);
    }

    #[test]
    fn stage_display_is_compact() {
        assert_eq!(SamplerStage::Greedy.to_string(), "greedy");
        assert_eq!(SamplerStage::Grammar(yes_no()).to_string(), "grammar(lark)");
        assert_eq!(SamplerStage::Dist { seed: 3 }.to_string(), "dist(seed=3)");
    }
}
