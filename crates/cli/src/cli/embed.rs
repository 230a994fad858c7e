use llama_core::embedding::{cosine_similarity, normalize};
use llama_core::{ContextParams, LlamaContext, PoolingType};
use tracing::debug;

use crate::cli::{EmbedArgs, Settings};

/// Leading components shown per vector in summary mode.
const PREVIEW: usize = 6;

pub async fn execute(settings: Settings, args: EmbedArgs) -> anyhow::Result<()> {
    let model = settings.load_model(&args.model)?;

    let ctx_params = ContextParams {
        n_ctx: settings.ctx_size,
        embeddings: true,
        pooling: PoolingType::from_raw(args.pooling)?,
        ..Default::default()
    };
    let texts = args.texts.clone();
    let normalize_output = args.normalize;

    let vectors = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Vec<f32>>> {
        let mut ctx = LlamaContext::new(model.clone(), &ctx_params)?;
        debug!(pooling = ?ctx.pooling_type(), "Embedding context ready");

        let mut out = Vec::with_capacity(texts.len());
        for text in &texts {
            ctx.clear_memory();
            let tokens = model.tokenize(text, true)?;
            ctx.decode(&tokens)?;
            let mut v = ctx.embeddings(-1)?;
            if normalize_output {
                normalize(&mut v);
            }
            out.push(v);
        }
        Ok(out)
    })
    .await??;

    if args.json {
        println!("{}", serde_json::to_string(&vectors)?);
        return Ok(());
    }

    for (text, v) in args.texts.iter().zip(&vectors) {
        println!("{} [dim {}] {}", preview(v), v.len(), text);
    }

    if vectors.len() > 1 {
        println!();
        for matrix_row in similarity_matrix(&vectors)? {
            let cells: Vec<String> = matrix_row.iter().map(|s| format!("{s:>7.4}")).collect();
            println!("{}", cells.join(" "));
        }
    }
    Ok(())
}

fn preview(v: &[f32]) -> String {
    let head: Vec<String> = v.iter().take(PREVIEW).map(|x| format!("{x:.4}")).collect();
    if v.len() > PREVIEW {
        format!("[{}, …]", head.join(", "))
    } else {
        format!("[{}]", head.join(", "))
    }
}

fn similarity_matrix(vectors: &[Vec<f32>]) -> anyhow::Result<Vec<Vec<f32>>> {
    vectors
        .iter()
        .map(|a| {
            vectors
                .iter()
                .map(|b| cosine_similarity(a, b).map_err(anyhow::Error::from))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_vectors() {
        assert_eq!(preview(&[1.0, 2.0]), "[1.0000, 2.0000]");
        let long = vec![0.5; 10];
        assert!(preview(&long).ends_with(", …]"));
    }

    #[test]
    fn matrix_diagonal_is_one() {
        let m = similarity_matrix(&[vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap();
        assert!((m[0][0] - 1.0).abs() < 1e-6);
        assert!((m[1][1] - 1.0).abs() < 1e-6);
        assert!(m[0][1].abs() < 1e-6);
    }
}
