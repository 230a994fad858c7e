//! Chat-template formatting.
//!
//! Templates go through `llama_chat_apply_template`, which recognises the
//! common template families (ChatML, Llama 2/3, Gemma, Phi, ...) from the
//! Jinja source stored in `tokenizer.chat_template`, or by short name.

use std::ffi::{CString, c_char};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LlamaError, Result};
use crate::model::LlamaModel;

/// Template used when a model has none or llama.cpp cannot interpret it.
pub const FALLBACK_TEMPLATE: &str = "chatml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Format `messages` with `template` (Jinja source or a short name such as
/// `"chatml"`; `None` means ChatML).
///
/// `add_assistant` opens an assistant turn at the end for generation.
pub fn apply_template(
    template: Option<&str>,
    messages: &[ChatMessage],
    add_assistant: bool,
) -> Result<String> {
    let c_tmpl = CString::new(template.unwrap_or(FALLBACK_TEMPLATE))
        .map_err(|_| LlamaError::InvalidArgument("chat template contains NUL".into()))?;

    // The CStrings back the raw pointers in `c_msgs` until the calls return.
    let owned = messages
        .iter()
        .map(|m| Ok((to_cstring(&m.role, "role")?, to_cstring(&m.content, "content")?)))
        .collect::<Result<Vec<_>>>()?;
    let c_msgs: Vec<llama_sys::llama_chat_message> = owned
        .iter()
        .map(|(role, content)| llama_sys::llama_chat_message {
            role: role.as_ptr(),
            content: content.as_ptr(),
        })
        .collect();

    let run = |buf: &mut [u8]| unsafe {
        llama_sys::llama_chat_apply_template(
            c_tmpl.as_ptr(),
            c_msgs.as_ptr(),
            c_msgs.len(),
            add_assistant,
            buf.as_mut_ptr() as *mut c_char,
            buf.len().min(i32::MAX as usize) as i32,
        )
    };

    // The return value is the full length even when `buf` was too small.
    let guess: usize = messages.iter().map(|m| m.role.len() + m.content.len()).sum();
    let mut buf = vec![0u8; guess + 16 * messages.len() + 32];
    let mut n = run(&mut buf);
    if n > 0 && n as usize > buf.len() {
        buf.resize(n as usize, 0);
        n = run(&mut buf);
    }
    if n < 0 {
        return Err(LlamaError::InvalidArgument(format!(
            "unsupported chat template {:?}",
            template_label(template)
        )));
    }

    buf.truncate(n as usize);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Format `messages` with the model's own `tokenizer.chat_template`,
/// falling back to ChatML when the model has none or it is not supported.
pub fn apply_model_template(
    model: &LlamaModel,
    messages: &[ChatMessage],
    add_assistant: bool,
) -> Result<String> {
    let Some(template) = model.chat_template() else {
        return apply_template(None, messages, add_assistant);
    };
    match apply_template(Some(&template), messages, add_assistant) {
        Err(LlamaError::InvalidArgument(reason)) if reason.starts_with("unsupported") => {
            warn!("Model chat template not recognised, using {FALLBACK_TEMPLATE}");
            apply_template(None, messages, add_assistant)
        }
        other => other,
    }
}

fn to_cstring(s: &str, what: &str) -> Result<CString> {
    CString::new(s)
        .map_err(|_| LlamaError::InvalidArgument(format!("chat message {what} contains NUL")))
}

fn template_label(template: Option<&str>) -> String {
    let t = template.unwrap_or(FALLBACK_TEMPLATE);
    match t.char_indices().nth(40) {
        Some((cut, _)) => format!("{}…", &t[..cut]),
        None => t.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatml_by_default() {
        let msgs = [ChatMessage::system("Be brief."), ChatMessage::user("hi")];
        let prompt = apply_template(None, &msgs, true).unwrap();
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nhi<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn assistant_turn_is_optional() {
        let msgs = [ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let prompt = apply_template(Some("chatml"), &msgs, false).unwrap();
        assert!(prompt.ends_with("<|im_start|>assistant\nhello<|im_end|>\n"));
    }

    #[test]
    fn long_conversations_grow_the_buffer() {
        let long = "word ".repeat(2000);
        let msgs = vec![ChatMessage::user(long.clone()); 3];
        let prompt = apply_template(None, &msgs, true).unwrap();
        assert_eq!(prompt.matches(long.as_str()).count(), 3);
    }

    #[test]
    fn unknown_template_is_rejected() {
        let err = apply_template(Some("not-a-template"), &[ChatMessage::user("x")], true)
            .unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(ref m) if m.contains("not-a-template")));
    }

    #[test]
    fn nul_in_message_is_rejected() {
        let err = apply_template(None, &[ChatMessage::user("a\0b")], true).unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
    }

    #[test]
    fn messages_deserialize_from_host_objects() {
        let msgs: Vec<ChatMessage> =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        assert_eq!(msgs, [ChatMessage::user("hi")]);
    }
}
