use std::io::{self, Write};
use std::path::Path;

use anyhow::Context as _;
use llama_core::{
    ChatMessage, ContextParams, GenerateEvent, GenerateRequest, Grammar, GrammarFormat,
    LlamaContext, SamplerChain, SamplerConfig,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::{GenerateArgs, Settings};

pub async fn execute(settings: Settings, args: GenerateArgs) -> anyhow::Result<()> {
    let model = settings.load_model(&args.model)?;

    let config = SamplerConfig {
        temperature: args.temp,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
        grammar: grammar_from_args(&args)?,
    };
    let sampler = SamplerChain::from_config(&model, &config)?;

    let ctx_params = ContextParams {
        n_ctx: settings.ctx_size,
        ..Default::default()
    };
    let ctx = LlamaContext::new(model.clone(), &ctx_params)?;

    let prompt = match chat_messages(&args) {
        Some(messages) => llama_core::apply_model_template(&model, &messages, true)?,
        None => args.prompt.clone(),
    };
    let request = GenerateRequest {
        prompt: model.tokenize(&prompt, true)?,
        max_tokens: args.max_tokens,
        stop_words: args.stop_words.clone(),
    };
    info!(
        prompt_tokens = request.prompt.len(),
        stages = config.stages().len(),
        "Generating…"
    );

    let (tx, mut rx) = mpsc::channel(64);

    // The context and sampler move into the blocking task and are freed
    // there when generation ends.
    let worker = tokio::task::spawn_blocking(move || {
        let (mut ctx, mut sampler) = (ctx, sampler);
        llama_core::generate_blocking(&mut ctx, &mut sampler, &request, tx);
    });

    let mut stdout = io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            GenerateEvent::Token(piece) => {
                print!("{piece}");
                stdout.flush()?;
            }
            GenerateEvent::Done {
                finish_reason,
                prompt_tokens,
                completion_tokens,
            } => {
                println!();
                eprintln!(
                    "  [{finish_reason} | prompt: {prompt_tokens} tok, gen: {completion_tokens} tok]"
                );
                break;
            }
            GenerateEvent::Error(e) => {
                println!();
                anyhow::bail!("generation failed: {e}");
            }
        }
    }

    worker.await?;
    Ok(())
}

/// The conversation for `--chat`, or `None` to use the prompt verbatim.
fn chat_messages(args: &GenerateArgs) -> Option<Vec<ChatMessage>> {
    if !args.chat {
        return None;
    }
    let system = args.system.as_deref().map(ChatMessage::system);
    Some(system.into_iter().chain([ChatMessage::user(args.prompt.as_str())]).collect())
}

fn grammar_from_args(args: &GenerateArgs) -> anyhow::Result<Option<Grammar>> {
    let source = [
        (GrammarFormat::Json, &args.json),
        (GrammarFormat::Lark, &args.lark),
        (GrammarFormat::Gbnf, &args.gbnf),
    ]
    .into_iter()
    .find_map(|(format, path)| path.as_deref().map(|p| (format, p)));

    source
        .map(|(format, path)| read_grammar(format, path))
        .transpose()
}

fn read_grammar(format: GrammarFormat, path: &Path) -> anyhow::Result<Grammar> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {format} grammar from {}", path.display()))?;
    Ok(Grammar::new(format, text))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn parse(extra: &[&str]) -> GenerateArgs {
        let mut argv = vec!["llama-bind", "generate", "m.gguf", "hi"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Generate(args) => args,
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn no_grammar_flag_means_no_grammar() {
        assert!(grammar_from_args(&parse(&[])).unwrap().is_none());
    }

    #[test]
    fn grammar_file_is_read_with_its_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yn.gbnf");
        std::fs::write(&path, r#"root ::= "yes" | "no""#).unwrap();

        let args = parse(&["--gbnf", path.to_str().unwrap()]);
        let grammar = grammar_from_args(&args).unwrap().unwrap();
        assert_eq!(grammar.format, GrammarFormat::Gbnf);
        assert!(grammar.text.contains("yes"));
    }

    #[test]
    fn unreadable_grammar_file_is_reported() {
        let args = parse(&["--lark", "/nonexistent/grammar.lark"]);
        let err = grammar_from_args(&args).unwrap_err();
        assert!(err.to_string().contains("lark grammar"));
    }

    #[test]
    fn plain_prompt_is_not_templated() {
        assert!(chat_messages(&parse(&[])).is_none());
    }

    #[test]
    fn chat_wraps_the_prompt_as_a_user_turn() {
        let messages = chat_messages(&parse(&["--chat"])).unwrap();
        assert_eq!(messages, [ChatMessage::user("hi")]);

        let messages = chat_messages(&parse(&["--chat", "--system", "Be brief."])).unwrap();
        assert_eq!(messages, [ChatMessage::system("Be brief."), ChatMessage::user("hi")]);
    }

    #[test]
    fn system_requires_chat() {
        let argv = ["llama-bind", "generate", "m.gguf", "hi", "--system", "x"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
