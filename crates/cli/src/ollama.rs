//! Resolve Ollama model names (`qwen3:0.6b`) to the GGUF blob Ollama keeps
//! under `~/.ollama/models`, so pulled models can be used without copying.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use serde::Deserialize;
use tracing::debug;

const REGISTRY_HOST: &str = "registry.ollama.ai";
const DEFAULT_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Deserialize)]
struct Manifest {
    layers: Vec<Layer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Layer {
    media_type: String,
    digest: String,
    #[serde(default)]
    size: u64,
}

impl Manifest {
    /// The weights layer (`application/vnd.ollama.image.model`).
    fn model_layer(&self) -> Option<&Layer> {
        self.layers.iter().find(|l| l.media_type.ends_with(".model"))
    }
}

/// `$OLLAMA_MODELS`, else `~/.ollama/models`.
pub fn models_root() -> Option<PathBuf> {
    std::env::var_os("OLLAMA_MODELS")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".ollama").join("models")))
}

/// `[namespace/]family[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModelName {
    namespace: String,
    family: String,
    tag: String,
}

impl ModelName {
    /// `None` for anything that looks like a file path instead.
    pub fn parse(name: &str) -> Option<Self> {
        if name.ends_with(".gguf") || name.contains('\\') {
            return None;
        }
        let (repo, tag) = name.rsplit_once(':').unwrap_or((name, DEFAULT_TAG));
        let (namespace, family) = repo.split_once('/').unwrap_or((DEFAULT_NAMESPACE, repo));

        let part = |s: &str| !s.is_empty() && s != "." && s != ".." && !s.contains('/');
        if !(part(namespace) && part(family) && part(tag)) {
            return None;
        }
        Some(Self {
            namespace: namespace.to_owned(),
            family: family.to_owned(),
            tag: tag.to_owned(),
        })
    }

    fn manifest_path(&self, root: &Path) -> PathBuf {
        root.join("manifests")
            .join(REGISTRY_HOST)
            .join(&self.namespace)
            .join(&self.family)
            .join(&self.tag)
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != DEFAULT_NAMESPACE {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{}:{}", self.family, self.tag)
    }
}

/// An existing path is returned as is; otherwise `model` is looked up as an
/// Ollama model name.
pub fn resolve_model(model: &Path) -> anyhow::Result<PathBuf> {
    if model.exists() {
        return Ok(model.to_path_buf());
    }
    let name = model.to_str().and_then(ModelName::parse);
    match (name, models_root()) {
        (Some(name), Some(root)) => resolve_in(&root, &name),
        _ => bail!("model file {} does not exist", model.display()),
    }
}

pub fn resolve_in(root: &Path, name: &ModelName) -> anyhow::Result<PathBuf> {
    let manifest_path = name.manifest_path(root);
    let manifest = read_manifest(&manifest_path).with_context(|| {
        format!("{name} is neither a file nor a pulled Ollama model (try `ollama pull {name}`)")
    })?;
    let layer = manifest
        .model_layer()
        .with_context(|| format!("Ollama model {name} has no weights layer"))?;

    let blob = blob_path(root, &layer.digest)?;
    if !blob.is_file() {
        bail!("weights blob {} for {name} is missing", blob.display());
    }
    debug!(%name, blob = %blob.display(), "Resolved Ollama model");
    Ok(blob)
}

/// Every pulled model under `root` with the size of its weights.
pub fn list_in(root: &Path) -> anyhow::Result<Vec<(ModelName, u64)>> {
    let registry = root.join("manifests").join(REGISTRY_HOST);
    if !registry.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for namespace in subdirs(&registry)? {
        for family in subdirs(&registry.join(&namespace))? {
            let family_dir = registry.join(&namespace).join(&family);
            for entry in fs::read_dir(&family_dir)?.flatten() {
                let tag = entry.file_name().to_string_lossy().into_owned();
                let Ok(manifest) = read_manifest(&entry.path()) else {
                    debug!(path = %entry.path().display(), "Skipping unreadable manifest");
                    continue;
                };
                if let Some(layer) = manifest.model_layer() {
                    let name = ModelName {
                        namespace: namespace.clone(),
                        family: family.clone(),
                        tag,
                    };
                    found.push((name, layer.size));
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

fn read_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).with_context(|| format!("malformed manifest {}", path.display()))
}

/// `sha256:abcd…` lives at `blobs/sha256-abcd…`.
fn blob_path(root: &Path, digest: &str) -> anyhow::Result<PathBuf> {
    let Some((algo, hex)) = digest.split_once(':') else {
        bail!("malformed layer digest {digest:?}");
    };
    let well_formed = !hex.is_empty()
        && hex.chars().all(|c| c.is_ascii_hexdigit())
        && algo.chars().all(|c| c.is_ascii_alphanumeric());
    if !well_formed {
        bail!("malformed layer digest {digest:?}");
    }
    Ok(root.join("blobs").join(format!("{algo}-{hex}")))
}

fn subdirs(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut out: Vec<String> = fs::read_dir(dir)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0123abcd";

    fn pull(root: &Path, repo: &[&str], tag: &str, with_blob: bool) {
        let mut dir = root.join("manifests").join(REGISTRY_HOST);
        for part in repo {
            dir = dir.join(part);
        }
        fs::create_dir_all(&dir).unwrap();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "layers": [
                { "mediaType": "application/vnd.ollama.image.template", "digest": "sha256:ffff", "size": 10 },
                { "mediaType": "application/vnd.ollama.image.model", "digest": DIGEST, "size": 4096 }
            ]
        });
        fs::write(dir.join(tag), manifest.to_string()).unwrap();
        if with_blob {
            fs::create_dir_all(root.join("blobs")).unwrap();
            fs::write(root.join("blobs").join("sha256-0123abcd"), b"GGUF").unwrap();
        }
    }

    #[test]
    fn names_parse_with_defaults() {
        let n = ModelName::parse("qwen3").unwrap();
        assert_eq!(n.to_string(), "qwen3:latest");
        let n = ModelName::parse("qwen3:0.6b").unwrap();
        assert_eq!((n.family.as_str(), n.tag.as_str()), ("qwen3", "0.6b"));
        let n = ModelName::parse("someone/custom:q4").unwrap();
        assert_eq!(n.namespace, "someone");
        assert_eq!(n.to_string(), "someone/custom:q4");
    }

    #[test]
    fn paths_are_not_names() {
        assert!(ModelName::parse("models/llama.gguf").is_none());
        assert!(ModelName::parse("a/b/c").is_none());
        assert!(ModelName::parse("../x").is_none());
        assert!(ModelName::parse("").is_none());
        assert!(ModelName::parse("qwen3:").is_none());
    }

    #[test]
    fn resolves_to_the_weights_blob() {
        let root = tempfile::tempdir().unwrap();
        pull(root.path(), &["library", "qwen3"], "0.6b", true);

        let name = ModelName::parse("qwen3:0.6b").unwrap();
        let blob = resolve_in(root.path(), &name).unwrap();
        assert_eq!(blob, root.path().join("blobs").join("sha256-0123abcd"));
    }

    #[test]
    fn missing_model_or_blob_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve_in(root.path(), &ModelName::parse("nope").unwrap()).unwrap_err();
        assert!(err.to_string().contains("ollama pull nope:latest"), "{err}");

        pull(root.path(), &["library", "qwen3"], "latest", false);
        let err = resolve_in(root.path(), &ModelName::parse("qwen3").unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn digests_cannot_escape_the_blob_dir() {
        let root = Path::new("/models");
        assert!(blob_path(root, "sha256:../../etc").is_err());
        assert!(blob_path(root, "nocolon").is_err());
        assert_eq!(
            blob_path(root, "sha256:00ff").unwrap(),
            Path::new("/models/blobs/sha256-00ff")
        );
    }

    #[test]
    fn lists_pulled_models() {
        let root = tempfile::tempdir().unwrap();
        assert!(list_in(root.path()).unwrap().is_empty());

        pull(root.path(), &["library", "qwen3"], "0.6b", true);
        pull(root.path(), &["someone", "custom"], "q4", true);
        let listed: Vec<String> = list_in(root.path())
            .unwrap()
            .into_iter()
            .map(|(name, size)| format!("{name} {size}"))
            .collect();
        assert_eq!(listed, ["qwen3:0.6b 4096", "someone/custom:q4 4096"]);
    }

    #[test]
    fn existing_paths_win() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(resolve_model(file.path()).unwrap(), file.path());
    }
}
