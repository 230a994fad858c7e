use crate::cli::{ModelsAction, ModelsArgs};
use crate::ollama::{self, ModelName};

pub async fn execute(args: ModelsArgs) -> anyhow::Result<()> {
    let Some(root) = ollama::models_root() else {
        anyhow::bail!("cannot locate the Ollama models directory; set OLLAMA_MODELS");
    };

    match args.action {
        ModelsAction::List => {
            let models = ollama::list_in(&root)?;
            if models.is_empty() {
                println!("No Ollama models found in {}", root.display());
                return Ok(());
            }

            println!("{:<40} {:<10}", "Name", "Size");
            println!("{}", "-".repeat(52));
            for (name, size) in &models {
                println!("{:<40} {:<10}", name.to_string(), human_size(*size));
            }
            println!("\n{} model(s) found.", models.len());
        }
        ModelsAction::Resolve { name } => {
            let Some(parsed) = ModelName::parse(&name) else {
                anyhow::bail!("{name:?} is not an Ollama model name");
            };
            println!("{}", ollama::resolve_in(&root, &parsed)?.display());
        }
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}
