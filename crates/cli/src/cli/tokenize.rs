use llama_core::{ModelOptions, ResourceRegistry};

use crate::cli::{Settings, TokenizeArgs};

/// Goes through the handle registry, the same path a scripting host takes.
pub async fn execute(settings: Settings, args: TokenizeArgs) -> anyhow::Result<()> {
    llama_core::LlamaBackend::init_with_log_level(settings.log_level);

    let registry = ResourceRegistry::new();
    let opts = ModelOptions {
        gpu_layers: Some(settings.n_gpu_layers),
    };
    let model = registry.load_model(crate::ollama::resolve_model(&args.model)?, &opts)?;

    let tokens = registry.tokenize(model, &args.text, !args.no_bos)?;
    println!("{} token(s)", tokens.len());
    for &token in &tokens {
        let piece = registry.token_to_piece(model, token)?;
        let eog = if registry.is_eog_token(model, token)? { "  (eog)" } else { "" };
        println!("{token:>8}  {piece:?}{eog}");
    }

    let round_trip = registry.detokenize(model, &tokens)?;
    println!("\nround trip: {round_trip:?}");

    registry.free_model(model)?;
    Ok(())
}
