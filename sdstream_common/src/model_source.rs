use std::{
    fmt::{Debug, Display},
    path::PathBuf,
};

use crate::{get_token, TokenSource};
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};

/// Source from which to load model weights. This is easiest to create with the various constructor functions.
#[derive(Debug, Clone)]
pub enum ModelSource {
    ModelId(String),
    LocalDir(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::LocalDir(dir) => write!(f, "local directory: {}", dir.display()),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        Self::ModelId(model_id.to_string())
    }

    /// Load the model from a directory laid out like a diffusers repository
    /// (`unet/`, `vae/`, `text_encoder/`, ...).
    pub fn local_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self::LocalDir(dir.into())
    }
}

/// Resolves component files of a [`ModelSource`] to paths on the local filesystem,
/// downloading them first for hub sources.
pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
}

impl FileLoader {
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: &TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        match source {
            ModelSource::ModelId(model_id) => {
                let api = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(get_token(token)?)
                    .build()?;
                let revision = revision.unwrap_or("main".to_string());
                let repo = api.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision,
                ));

                Ok(Self::Api(Box::new(repo)))
            }
            ModelSource::LocalDir(dir) => {
                if !dir.is_dir() {
                    anyhow::bail!("`{}` is not a directory", dir.display());
                }
                Ok(Self::Local(dir.clone()))
            }
        }
    }

    /// Resolve a file, e.g. `unet/diffusion_pytorch_model.safetensors`.
    pub fn read_file(&self, name: &str) -> anyhow::Result<PathBuf> {
        match self {
            Self::Api(api) => api
                .get(name)
                .map_err(|e| anyhow::Error::msg(format!("failed to fetch `{name}`: {e}"))),
            Self::Local(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    anyhow::bail!("expected file `{}` to exist", path.display());
                }
                Ok(path)
            }
        }
    }
}

impl Debug for FileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api(_) => write!(f, "hub api"),
            Self::Local(dir) => write!(f, "local: {}", dir.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn local_loader_resolves_existing_files_only() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("sdstream-loader-{}", std::process::id()));
        fs::create_dir_all(dir.join("vae"))?;
        fs::write(dir.join("vae/config.json"), "{}")?;

        let source = ModelSource::local_dir(&dir);
        let loader = FileLoader::from_model_source(&source, true, &TokenSource::None, None)?;
        let config = loader.read_file("vae/config.json")?;
        assert_eq!(config, dir.join("vae/config.json"));
        assert!(loader.read_file("unet/config.json").is_err());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn local_loader_requires_a_directory() {
        let source = ModelSource::local_dir("/definitely/not/a/model/dir");
        assert!(FileLoader::from_model_source(&source, true, &TokenSource::None, None).is_err());
    }
}
