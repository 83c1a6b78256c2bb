use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use crate::{get_token, TokenSource};
use hf_hub::{
    api::{
        sync::{ApiBuilder, ApiRepo},
        Progress,
    },
    Cache, Repo, RepoType,
};
use tracing::debug;

/// Byte-level download callback: `(filename, bytes_downloaded, bytes_total, bytes_per_second)`.
pub type DownloadCallback<'a> = dyn FnMut(&str, u64, u64, f64) + 'a;

/// Source from which to load a sub-model. This is easiest to create with the various constructor functions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    /// A Hugging Face model ID or a local diffusers-layout directory.
    ModelId(String),
    /// A single local checkpoint file (`.safetensors` or `.gguf`).
    SingleFile(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::SingleFile(path) => write!(f, "single file: {}", path.display()),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID or a local path.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        Self::ModelId(model_id.to_string())
    }

    /// Load the model from one checkpoint file.
    pub fn single_file<P: AsRef<Path>>(path: P) -> Self {
        Self::SingleFile(path.as_ref().to_path_buf())
    }

    pub fn is_gguf(&self) -> bool {
        match self {
            Self::SingleFile(p) => is_gguf_path(p),
            Self::ModelId(_) => false,
        }
    }
}

/// True when the path carries a `.gguf` extension (case-insensitive).
pub fn is_gguf_path<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
}

/// True when the path names one weights file rather than a model directory.
pub fn is_single_file_path<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().extension().is_some_and(|ext| {
        ext.eq_ignore_ascii_case("safetensors") || ext.eq_ignore_ascii_case("gguf")
    })
}

/// Hub access settings shared by every sub-model of one pipeline.
#[derive(Clone, Debug, Default)]
pub struct HubOptions {
    pub token: Option<TokenSource>,
    pub revision: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub silent: bool,
}

/// Files making up one sub-model, resolved to local paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentFiles {
    pub config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

pub enum FileLoader {
    Api {
        repo: Box<ApiRepo>,
        cache: Box<hf_hub::CacheRepo>,
    },
    Local(PathBuf),
    SingleFile(PathBuf),
}

impl FileLoader {
    pub fn from_model_source(source: &ModelSource, options: &HubOptions) -> anyhow::Result<Self> {
        match source {
            ModelSource::SingleFile(path) => {
                if !path.is_file() {
                    anyhow::bail!("checkpoint file `{}` does not exist", path.display());
                }
                Ok(Self::SingleFile(path.clone()))
            }
            ModelSource::ModelId(model_id) if Path::new(model_id).is_dir() => {
                Ok(Self::Local(PathBuf::from(model_id)))
            }
            ModelSource::ModelId(model_id) => {
                let token = match &options.token {
                    Some(source) => get_token(source)?,
                    None => None,
                };
                let mut api_builder = ApiBuilder::new()
                    .with_progress(false)
                    .with_token(token);
                if let Some(cache_dir) = &options.cache_dir {
                    api_builder = api_builder.with_cache_dir(cache_dir.clone());
                }
                let api = api_builder.build()?;
                let revision = options.revision.clone().unwrap_or("main".to_string());
                let repo = Repo::with_revision(model_id.clone(), RepoType::Model, revision);
                let cache = match &options.cache_dir {
                    Some(dir) => Cache::new(dir.clone()),
                    None => Cache::default(),
                }
                .repo(repo.clone());

                Ok(Self::Api {
                    repo: Box::new(api.repo(repo)),
                    cache: Box::new(cache),
                })
            }
        }
    }

    pub fn list_files(&self) -> anyhow::Result<Vec<String>> {
        match self {
            Self::Api { repo, .. } => repo
                .info()
                .map(|repo| {
                    repo.siblings
                        .iter()
                        .map(|x| x.rfilename.clone())
                        .collect::<Vec<String>>()
                })
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::Local(root) => {
                let mut files = Vec::new();
                collect_local_files(root, root, &mut files)?;
                files.sort();
                Ok(files)
            }
            Self::SingleFile(path) => Ok(vec![path.display().to_string()]),
        }
    }

    /// Read a file, reporting byte progress through `progress`.
    ///
    /// Files already present locally (or in the hub cache) are reported as complete immediately.
    pub fn read_file(
        &self,
        name: &str,
        progress: &mut DownloadCallback<'_>,
    ) -> anyhow::Result<PathBuf> {
        match self {
            Self::Api { repo, cache } => {
                if let Some(path) = cache.get(name) {
                    debug!("`{name}` found in hub cache");
                    report_complete(name, &path, progress);
                    return Ok(path);
                }
                repo.download_with_progress(name, ByteProgress::new(name, progress))
                    .map_err(|e| anyhow::Error::msg(e.to_string()))
            }
            Self::Local(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    anyhow::bail!("file `{}` does not exist", path.display());
                }
                report_complete(name, &path, progress);
                Ok(path)
            }
            Self::SingleFile(path) => {
                report_complete(name, path, progress);
                Ok(path.clone())
            }
        }
    }

    /// Resolve the config and weight files of the sub-model stored under `subfolder`.
    ///
    /// When `variant` is set, weight files tagged with it (`model.fp16.safetensors`) are preferred;
    /// untagged weights are used if no tagged ones exist.
    pub fn resolve_component(
        &self,
        subfolder: Option<&str>,
        variant: Option<&str>,
        progress: &mut DownloadCallback<'_>,
    ) -> anyhow::Result<ComponentFiles> {
        if let Self::SingleFile(path) = self {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(ComponentFiles {
                config: None,
                weights: vec![self.read_file(&name, progress)?],
            });
        }

        let dir = subfolder.map(|s| format!("{s}/")).unwrap_or_default();
        let files = self
            .list_files()?
            .into_iter()
            .filter(|file| file.starts_with(&dir))
            .filter(|file| !file.ends_with('/'))
            .collect::<Vec<_>>();

        let weights = select_weight_files(&files, &dir, variant);
        if weights.is_empty() {
            anyhow::bail!("no weight files found under `{dir}`");
        }

        let config_name = format!("{dir}config.json");
        let config = if files.contains(&config_name) {
            Some(self.read_file(&config_name, progress)?)
        } else {
            None
        };

        let mut paths = Vec::new();
        for file in weights {
            paths.push(self.read_file(&file, progress)?);
        }

        Ok(ComponentFiles {
            config,
            weights: paths,
        })
    }
}

fn select_weight_files(files: &[String], dir: &str, variant: Option<&str>) -> Vec<String> {
    let is_weights = |file: &&String| {
        let rest = &file[dir.len()..];
        !rest.contains('/') && is_single_file_path(rest)
    };
    let candidates = files.iter().filter(is_weights).cloned().collect::<Vec<_>>();

    if let Some(variant) = variant {
        let tag = format!(".{variant}.");
        let tagged = candidates
            .iter()
            .filter(|file| file.contains(&tag))
            .cloned()
            .collect::<Vec<_>>();
        if !tagged.is_empty() {
            return tagged;
        }
    }
    candidates
}

fn collect_local_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_local_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

fn report_complete(name: &str, path: &Path, progress: &mut DownloadCallback<'_>) {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    progress(name, size, size, 0.0);
}

/// Adapts hf-hub's download progress hooks onto a [`DownloadCallback`].
struct ByteProgress<'a, 'b> {
    filename: String,
    total: u64,
    downloaded: u64,
    started: Instant,
    callback: &'a mut DownloadCallback<'b>,
}

impl<'a, 'b> ByteProgress<'a, 'b> {
    fn new(filename: &str, callback: &'a mut DownloadCallback<'b>) -> Self {
        Self {
            filename: filename.to_string(),
            total: 0,
            downloaded: 0,
            started: Instant::now(),
            callback,
        }
    }

    fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.downloaded as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Progress for ByteProgress<'_, '_> {
    fn init(&mut self, size: usize, _filename: &str) {
        self.total = size as u64;
        self.downloaded = 0;
        self.started = Instant::now();
        (self.callback)(&self.filename, 0, self.total, 0.0);
    }

    fn update(&mut self, size: usize) {
        self.downloaded += size as u64;
        if self.total > 0 {
            self.downloaded = self.downloaded.min(self.total);
        }
        let rate = self.rate();
        (self.callback)(&self.filename, self.downloaded, self.total, rate);
    }

    fn finish(&mut self) {
        self.downloaded = self.total;
        let rate = self.rate();
        (self.callback)(&self.filename, self.total, self.total, rate);
    }
}
