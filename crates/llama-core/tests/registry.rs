//! Handle lifecycle through the registry, against a real model file.

mod common;

use llama_core::{
    ChatMessage, ContextHandle, ContextOptions, LiveCounts, LlamaError, ModelHandle, ModelOptions,
    ResourceRegistry, SamplerOptions,
};

fn load(reg: &ResourceRegistry) -> Option<ModelHandle> {
    let path = common::model_path(common::GENERATION_MODEL_VAR)?;
    llama_core::set_quiet(true);
    let opts = ModelOptions {
        gpu_layers: Some(0),
    };
    Some(reg.load_model(path, &opts).expect("model"))
}

fn small_context() -> ContextOptions {
    ContextOptions {
        context_size: Some(512),
        ..Default::default()
    }
}

#[test]
fn double_free_is_a_no_op() {
    let reg = ResourceRegistry::new();
    let Some(model) = load(&reg) else {
        return;
    };
    let ctx = reg.create_context(model, &small_context()).unwrap();
    let sampler = reg.create_sampler(model, &SamplerOptions::default()).unwrap();
    assert_eq!(
        reg.live_counts(),
        LiveCounts {
            models: 1,
            contexts: 1,
            samplers: 1
        }
    );

    reg.free_sampler(sampler).unwrap();
    reg.free_sampler(sampler).unwrap();
    reg.free_context(ctx).unwrap();
    reg.free_context(ctx).unwrap();
    reg.free_model(model).unwrap();
    reg.free_model(model).unwrap();
    assert_eq!(reg.live_counts(), LiveCounts::default());

    assert!(matches!(
        reg.decode(ctx, &[1]),
        Err(LlamaError::InvalidHandle(_))
    ));
}

#[test]
fn context_after_model_free_fails_fast() {
    let reg = ResourceRegistry::new();
    let Some(model) = load(&reg) else {
        return;
    };
    let live = reg.create_context(model, &small_context()).unwrap();
    reg.free_model(model).unwrap();

    match reg.create_context(model, &small_context()) {
        Err(LlamaError::InvalidHandle(msg)) => assert!(msg.contains("freed"), "{msg}"),
        other => panic!("expected InvalidHandle, got {other:?}"),
    }
    assert!(reg.create_sampler(model, &SamplerOptions::default()).is_err());

    // Contexts created earlier keep their model alive.
    assert!(reg.get_context_size(live).unwrap() > 0);
}

#[test]
fn raw_handles_are_kind_checked() {
    let reg = ResourceRegistry::new();
    let Some(model) = load(&reg) else {
        return;
    };
    let raw = model.raw();
    assert!(matches!(
        ContextHandle::try_from(raw),
        Err(LlamaError::InvalidHandle(_))
    ));
    assert_eq!(ModelHandle::try_from(raw).unwrap(), model);
}

#[test]
fn handles_do_not_cross_registries() {
    let home = ResourceRegistry::new();
    let Some(model) = load(&home) else {
        return;
    };
    let other = ResourceRegistry::new();

    // Same raw value, different registry.
    let raw = model.raw();
    let smuggled = ModelHandle::try_from(raw).unwrap();
    match other.tokenize(smuggled, "hi", true) {
        Err(LlamaError::InvalidHandle(msg)) => assert!(msg.contains("belongs to registry"), "{msg}"),
        res => panic!("expected InvalidHandle, got {res:?}"),
    }
    assert!(other.free_model(smuggled).is_err());
    assert!(!home.tokenize(model, "hi", true).unwrap().is_empty());
}

#[test]
fn chat_prompt_from_the_model_template() {
    let reg = ResourceRegistry::new();
    let Some(model) = load(&reg) else {
        return;
    };
    let messages = [
        ChatMessage::system("You answer in one word."),
        ChatMessage::user("Capital of France?"),
    ];
    let prompt = reg.apply_chat_template(model, &messages, true).unwrap();
    assert!(prompt.contains("Capital of France?"), "{prompt}");
    assert!(prompt.len() > "Capital of France?".len());

    let without = reg.apply_chat_template(model, &messages, false).unwrap();
    assert!(prompt.starts_with(&without) && prompt.len() > without.len());

    let tokens = reg.tokenize(model, &prompt, true).unwrap();
    assert!(!tokens.is_empty());
}

#[test]
fn decode_sample_accept_through_handles() {
    let reg = ResourceRegistry::new();
    let Some(model) = load(&reg) else {
        return;
    };
    let ctx = reg.create_context(model, &small_context()).unwrap();
    let sampler = reg
        .create_sampler(
            model,
            &SamplerOptions {
                temp: Some(0.0),
                ..Default::default()
            },
        )
        .unwrap();

    let tokens = reg.tokenize(model, "Hello", true).unwrap();
    reg.decode(ctx, &tokens).unwrap();
    let token = reg.sample(ctx, sampler, -1).unwrap();
    assert_eq!(reg.sample(ctx, sampler, -1).unwrap(), token);
    reg.accept_token(sampler, token).unwrap();
    assert!(reg.is_eog_token(model, token).is_ok());

    assert!(reg.get_embedding_dimension(model).unwrap() > 0);
    assert!(reg.get_training_context_size(model).unwrap() > 0);
    assert!(reg.get_context_size(ctx).unwrap() >= 512);
    assert!(matches!(
        reg.get_embeddings(ctx, -1),
        Err(LlamaError::EmbeddingsUnavailable(_))
    ));

    reg.clear_memory(ctx).unwrap();
    reg.decode(ctx, &tokens).unwrap();
    assert_eq!(reg.sample(ctx, sampler, -1).unwrap(), token);

    let meta = reg.get_model_meta(model, "general.architecture").unwrap();
    assert!(meta.is_some_and(|arch| !arch.is_empty()));
    assert_eq!(reg.get_model_meta(model, "no.such.key").unwrap(), None);
}

#[test]
fn drop_reclaims_live_handles() {
    let reg = ResourceRegistry::new();
    let Some(model) = load(&reg) else {
        return;
    };
    reg.create_context(model, &small_context()).unwrap();
    reg.create_sampler(model, &SamplerOptions::default()).unwrap();
    // Nothing freed explicitly; dropping the registry must release it all.
    drop(reg);
}
