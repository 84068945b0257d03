//! Batch driver: turns command-line targets into items, probes the network,
//! walks the batch through the orchestrator and folds everything into a
//! process exit code.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, ACCEPTED_FORMATS, DERIVED_INFIX};
use crate::error::{HtrError, Result};
use crate::models::Item;
use crate::normalize::canonical_format;
use crate::orchestrator::Manager;

/// Process exit codes, from best to worst. A batch reports the worst code
/// any of its items produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitCode {
    Success = 0,
    UserInterrupt = 1,
    BadArg = 2,
    NoNetwork = 3,
    FileError = 4,
    ServerError = 5,
    Exception = 6,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_error(error: &HtrError) -> Self {
        match error {
            HtrError::Cancelled => ExitCode::UserInterrupt,
            HtrError::Network(_) => ExitCode::NoNetwork,
            HtrError::Io(_) | HtrError::Image(_) | HtrError::CorruptedContent(_) => {
                ExitCode::FileError
            }
            HtrError::Auth(_) | HtrError::RateLimit { .. } | HtrError::Service(_) => {
                ExitCode::ServerError
            }
            HtrError::Json(_) | HtrError::UrlParse(_) | HtrError::Internal(_) => {
                ExitCode::Exception
            }
        }
    }
}

pub struct Runner {
    config: Config,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Merge positional targets with the optional `@file` style list, one
    /// target per line, blank lines and `#` comments skipped.
    pub fn gather_targets(
        &self,
        targets: &[String],
        from_file: Option<&Path>,
    ) -> Result<Vec<String>> {
        let mut gathered: Vec<String> = targets.to_vec();
        if let Some(path) = from_file {
            let contents = fs::read_to_string(path)?;
            gathered.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }
        if gathered.is_empty() {
            return Err(HtrError::Internal("No targets given".to_string()));
        }
        Ok(gathered)
    }

    /// Resolve each target into a local [`Item`]: files checked against the
    /// accepted formats, directories walked recursively, URLs downloaded.
    pub async fn resolve_targets(&self, targets: &[String]) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut url_index = 0usize;
        for target in targets {
            if let Some(url) = parse_url(target) {
                url_index += 1;
                match self.download(&url, url_index).await {
                    Ok(item) => items.push(item),
                    Err(e) => warn!("Skipping {target}: {e}"),
                }
            } else {
                let path = PathBuf::from(target);
                if path.is_dir() {
                    let mut found = Vec::new();
                    collect_image_files(&path, &mut found)?;
                    for file in prefer_png_siblings(found) {
                        items.push(item_from_file(&file)?);
                    }
                } else if path.is_file() {
                    items.push(item_from_file(&path)?);
                } else {
                    warn!("Skipping {target}: not a file, directory or URL");
                }
            }
        }
        if items.is_empty() {
            return Err(HtrError::Internal(
                "No usable images among the given targets".to_string(),
            ));
        }
        Ok(items)
    }

    /// Cheap reachability probe before any real work starts.
    pub async fn network_available(&self) -> bool {
        let Ok(client) = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
        else {
            return false;
        };
        client
            .head("https://www.google.com")
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().is_redirection())
            .unwrap_or(false)
    }

    /// Fetch a URL target into the output directory as
    /// `<base_name>-<n>.<ext>`, recording the source URL in a matching
    /// `.url` file.
    async fn download(&self, url: &Url, index: usize) -> Result<Item> {
        info!("Downloading {url}");
        let response = reqwest::get(url.clone()).await?;
        if !response.status().is_success() {
            return Err(HtrError::Service(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !content_type.starts_with("image/") {
                return Err(HtrError::CorruptedContent(format!(
                    "{url} is {content_type}, not an image"
                )));
            }
        }
        let bytes = response.bytes().await?;

        let kind = infer::get(&bytes).ok_or_else(|| {
            HtrError::CorruptedContent(format!("Cannot determine the format of {url}"))
        })?;
        let extension = kind.extension();
        if !ACCEPTED_FORMATS.contains(&extension) {
            return Err(HtrError::CorruptedContent(format!(
                "{url} is {extension}, which is not an accepted image format"
            )));
        }

        let dest_dir = self
            .config
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dest_dir)?;
        let base = format!("{}-{index}", self.config.base_name);
        let file = dest_dir.join(format!("{base}.{extension}"));
        fs::write(&file, &bytes)?;
        fs::write(dest_dir.join(format!("{base}.url")), format!("{url}\n"))?;
        debug!("Saved {url} as {}", file.display());

        Ok(Item {
            source: url.to_string(),
            file,
            format: canonical_format(extension),
        })
    }

    /// Run the whole batch, one item at a time, checking for interruption
    /// at item boundaries. Returns the worst exit code observed.
    pub async fn run(&self, manager: &Manager, items: &[Item]) -> ExitCode {
        let mut worst = ExitCode::Success;
        for item in items {
            if self.cancel.is_cancelled() {
                info!("Interrupted; stopping before {}", item.source);
                return ExitCode::UserInterrupt;
            }
            let dest_dir = match self.dest_dir_for(item) {
                Ok(dir) => dir,
                Err(e) => {
                    error!("Cannot prepare output directory for {}: {e}", item.source);
                    worst = worst.max(ExitCode::FileError);
                    continue;
                }
            };
            match manager.process_item(item, &dest_dir).await {
                Ok(outcomes) => {
                    for outcome in &outcomes {
                        if let Some(error) = &outcome.error {
                            worst = worst.max(ExitCode::from_error(error));
                        }
                    }
                }
                Err(HtrError::Cancelled) => return ExitCode::UserInterrupt,
                Err(e) => {
                    error!("Failed to process {}: {e}", item.source);
                    worst = worst.max(ExitCode::from_error(&e));
                }
            }
        }
        worst
    }

    fn dest_dir_for(&self, item: &Item) -> Result<PathBuf> {
        let dir = match &self.config.output_dir {
            Some(dir) => dir.clone(),
            None => item
                .file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn parse_url(target: &str) -> Option<Url> {
    let url = Url::parse(target).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn item_from_file(path: &Path) -> Result<Item> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !ACCEPTED_FORMATS.contains(&extension.as_str()) {
        return Err(HtrError::CorruptedContent(format!(
            "{} is not in an accepted image format",
            path.display()
        )));
    }
    Ok(Item {
        source: path.display().to_string(),
        file: path.to_path_buf(),
        format: canonical_format(&extension),
    })
}

fn collect_image_files(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_image_files(&path, found)?;
        } else if is_accepted_image(&path) {
            found.push(path);
        }
    }
    Ok(())
}

fn is_accepted_image(path: &Path) -> bool {
    let Some(extension) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
        return false;
    };
    if !ACCEPTED_FORMATS.contains(&extension.as_str()) {
        return false;
    }
    // Leave this tool's own derived artifacts out of new batches.
    path.file_stem()
        .map(|s| !s.to_string_lossy().contains(DERIVED_INFIX))
        .unwrap_or(false)
}

/// When the same page exists in several formats, keep only the PNG since it
/// needs no conversion. Output is sorted for a deterministic batch order.
fn prefer_png_siblings(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut groups: BTreeMap<(PathBuf, String), Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        let parent = file.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        groups.entry((parent, stem)).or_default().push(file);
    }
    groups
        .into_values()
        .filter_map(|mut group| {
            group.sort();
            group
                .iter()
                .find(|f| {
                    f.extension()
                        .map(|e| e.to_string_lossy().to_lowercase() == "png")
                        .unwrap_or(false)
                })
                .cloned()
                .or_else(|| group.into_iter().next())
        })
        .collect()
}
