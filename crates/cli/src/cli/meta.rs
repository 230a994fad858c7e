use crate::cli::MetaArgs;

pub async fn execute(args: MetaArgs) -> anyhow::Result<()> {
    let path = crate::ollama::resolve_model(&args.path)?;
    if let Some(key) = &args.key {
        match gguf_parser::read_gguf_meta(&path, key)? {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("{key} not found in {}", path.display()),
        }
        return Ok(());
    }

    let (header, kvs) = gguf_parser::read_metadata(&path)?;
    println!(
        "GGUF v{} | {} tensors | {} metadata keys",
        header.version, header.tensor_count, header.metadata_kv_count
    );
    let width = kvs.iter().map(|kv| kv.key.len()).max().unwrap_or(0);
    for kv in &kvs {
        println!("{:<width$}  {}", kv.key, one_line(&kv.value.to_string()));
    }
    Ok(())
}

/// Long multi-line values (chat templates) are shown as a single line.
fn one_line(s: &str) -> String {
    const MAX: usize = 120;
    let flat: String = s.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    if flat.chars().count() > MAX {
        let cut: String = flat.chars().take(MAX).collect();
        format!("{cut}…")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_and_truncates() {
        assert_eq!(one_line("a\nb"), "a b");
        let long = "x".repeat(200);
        let shown = one_line(&long);
        assert_eq!(shown.chars().count(), 121);
        assert!(shown.ends_with('…'));
    }
}
