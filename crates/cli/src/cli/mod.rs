pub mod config_cmd;
pub mod embed;
pub mod generate;
pub mod meta;
pub mod models;
pub mod tokenize;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use llama_core::{LlamaBackend, LlamaModel, LogLevel, ModelParams};
use tracing::{debug, info};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "llama-bind",
    version,
    about = "Run llama.cpp models from the command line"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Per-invocation overrides of the saved configuration.
#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// GPU layers (-1 = all, 0 = CPU only).
    #[arg(long, global = true, env = "LLAMA_N_GPU_LAYERS", allow_hyphen_values = true)]
    pub n_gpu_layers: Option<i32>,

    /// Context size (0 = model default).
    #[arg(long, global = true)]
    pub ctx_size: Option<u32>,

    /// llama.cpp diagnostics: silent, errors or all.
    #[arg(long, global = true, env = "LLAMA_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate text from a prompt, optionally grammar-constrained.
    Generate(GenerateArgs),

    /// Compute embeddings and their pairwise similarity.
    Embed(EmbedArgs),

    /// Show how a text tokenizes.
    Tokenize(TokenizeArgs),

    /// Print GGUF metadata without loading the model.
    Meta(MetaArgs),

    /// Models pulled with Ollama.
    Models(ModelsArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
#[command(group(clap::ArgGroup::new("grammar").args(["json", "lark", "gbnf"])))]
pub struct GenerateArgs {
    /// Path to a GGUF model file, or an Ollama model name.
    pub model: PathBuf,

    /// Prompt text. Special-token markup is honoured.
    pub prompt: String,

    /// Send the prompt as a user turn through the model's chat template.
    #[arg(long)]
    pub chat: bool,

    /// System message for `--chat`.
    #[arg(long, requires = "chat")]
    pub system: Option<String>,

    /// Maximum tokens to generate.
    #[arg(short = 'n', long, default_value_t = 256)]
    pub max_tokens: u32,

    /// Temperature (0 = greedy).
    #[arg(long, default_value_t = 0.0)]
    pub temp: f32,

    #[arg(long, default_value_t = 40)]
    pub top_k: i32,

    #[arg(long, default_value_t = 0.95)]
    pub top_p: f32,

    #[arg(long, default_value_t = 0)]
    pub seed: u32,

    /// Constrain output to this JSON schema file.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Constrain output to this Lark grammar file.
    #[arg(long)]
    pub lark: Option<PathBuf>,

    /// Constrain output to this GBNF grammar file.
    #[arg(long)]
    pub gbnf: Option<PathBuf>,

    /// Stop when the output contains this string (repeatable).
    #[arg(long = "stop")]
    pub stop_words: Vec<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct EmbedArgs {
    /// Path to a GGUF embedding model, or an Ollama model name.
    pub model: PathBuf,

    /// Texts to embed.
    #[arg(required = true)]
    pub texts: Vec<String>,

    /// Pooling type as in llama.h (-1 = model default, 0 none, 1 mean,
    /// 2 cls, 3 last, 4 rank).
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub pooling: i32,

    /// Scale each vector to unit length before printing.
    #[arg(long)]
    pub normalize: bool,

    /// Print full vectors as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct TokenizeArgs {
    pub model: PathBuf,

    pub text: String,

    /// Do not prepend BOS.
    #[arg(long)]
    pub no_bos: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct MetaArgs {
    /// Path to the GGUF file, or an Ollama model name.
    pub path: PathBuf,

    /// Print only this key.
    pub key: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub action: ModelsAction,
}

#[derive(Debug, Subcommand)]
pub enum ModelsAction {
    /// List pulled models and their weight sizes.
    List,
    /// Print the GGUF blob an Ollama model name refers to.
    Resolve { name: String },
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
}

//  Settings shared by the model-loading commands

/// Saved configuration with command-line overrides applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub n_gpu_layers: i32,
    pub ctx_size: u32,
    pub log_level: LogLevel,
}

impl Settings {
    pub fn resolve(global: &GlobalArgs, cfg: &AppConfig) -> Self {
        Self {
            n_gpu_layers: global.n_gpu_layers.unwrap_or(cfg.default_n_gpu_layers),
            ctx_size: global.ctx_size.unwrap_or(cfg.default_ctx_size),
            log_level: global.log_level.unwrap_or(cfg.log_level),
        }
    }

    /// Initialise the backend at the configured log level and load `path`.
    pub fn load_model(&self, path: &Path) -> anyhow::Result<Arc<LlamaModel>> {
        let backend = LlamaBackend::init_with_log_level(self.log_level);
        debug!(system = %backend.system_info(), "Backend features");
        let params = ModelParams {
            n_gpu_layers: self.n_gpu_layers,
            ..Default::default()
        };
        let path = crate::ollama::resolve_model(path)?;
        let model = LlamaModel::load_from_file(&path, &params)?;
        info!(desc = %model.desc(), name = ?model.name(), "Model ready");
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_saved_config() {
        let cfg = AppConfig::default();
        let cli = Cli::parse_from([
            "llama-bind",
            "--n-gpu-layers",
            "0",
            "--log-level",
            "all",
            "tokenize",
            "m.gguf",
            "hi",
        ]);
        let s = Settings::resolve(&cli.global, &cfg);
        assert_eq!(s.n_gpu_layers, 0);
        assert_eq!(s.ctx_size, cfg.default_ctx_size);
        assert_eq!(s.log_level, LogLevel::All);
    }

    #[test]
    fn grammar_flags_are_exclusive() {
        let res = Cli::try_parse_from([
            "llama-bind", "generate", "m.gguf", "hi", "--json", "a.json", "--lark", "b.lark",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn generate_defaults() {
        let cli = Cli::parse_from(["llama-bind", "generate", "m.gguf", "Hello"]);
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.max_tokens, 256);
        assert_eq!(args.temp, 0.0);
        assert!(args.stop_words.is_empty());
    }

    #[test]
    fn embed_needs_text() {
        assert!(Cli::try_parse_from(["llama-bind", "embed", "m.gguf"]).is_err());
        let cli = Cli::parse_from(["llama-bind", "embed", "m.gguf", "a", "b", "--pooling", "-1"]);
        let Commands::Embed(args) = cli.command else {
            panic!("expected embed");
        };
        assert_eq!(args.texts, vec!["a", "b"]);
        assert_eq!(args.pooling, -1);
    }
}
