// Remote hub access for the download child: manifest sizing, snapshot
// download with per-file progress callbacks, and install-name candidates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hf_hub::api::sync::ApiBuilder;
use hf_hub::api::Progress;
use serde::Deserialize;

use super::progress::ProgressAggregator;

const HUB_ENDPOINT: &str = "https://huggingface.co";

/// On-disk names a repo may already be installed under. Some hubs
/// substitute `___` for dots in directory names.
pub fn candidate_model_names(repo_id: &str) -> Vec<String> {
    let name = repo_id.split('/').next_back().unwrap_or("").trim();
    if name.is_empty() {
        return Vec::new();
    }
    let mut names = vec![name.to_string()];
    let replaced = name.replace('.', "___");
    if replaced != name {
        names.push(replaced);
    }
    names
}

/// The already-installed directory name, if any candidate exists.
pub fn find_existing_model(models_root: &Path, repo_id: &str) -> Option<String> {
    candidate_model_names(repo_id)
        .into_iter()
        .find(|name| models_root.join(name).exists())
}

#[derive(Deserialize)]
struct RepoManifest {
    #[serde(default)]
    siblings: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Query the hub for the repo's file manifest and sum the byte sizes of
/// everything not already in the local hub cache. Failures here are
/// non-fatal: the caller falls back to per-file deltas only.
pub fn compute_download_plan(repo_id: &str, cache_dir: &Path) -> Result<(u64, u64), String> {
    let url = format!("{HUB_ENDPOINT}/api/models/{repo_id}?blobs=true");
    let manifest: RepoManifest = ureq::get(&url)
        .timeout(std::time::Duration::from_secs(20))
        .call()
        .map_err(|e| format!("Manifest query failed: {e}"))?
        .into_json()
        .map_err(|e| format!("Manifest parse failed: {e}"))?;

    let snapshots_root = repo_cache_dir(cache_dir, repo_id).join("snapshots");

    let mut total_bytes = 0u64;
    let mut total_files = 0u64;
    for entry in manifest.siblings {
        if cached_copy_exists(&snapshots_root, &entry.rfilename) {
            continue;
        }
        total_bytes += entry.size.unwrap_or(0);
        total_files += 1;
    }
    Ok((total_bytes, total_files))
}

fn cached_copy_exists(snapshots_root: &Path, rfilename: &str) -> bool {
    let Ok(revisions) = std::fs::read_dir(snapshots_root) else {
        return false;
    };
    revisions
        .flatten()
        .any(|rev| rev.path().join(rfilename).exists())
}

/// The hub cache directory for one repo (`models--org--name`).
pub fn repo_cache_dir(cache_dir: &Path, repo_id: &str) -> PathBuf {
    cache_dir.join(format!("models--{}", repo_id.replace('/', "--")))
}

/// Adapter from the hub SDK's per-file progress callbacks onto the
/// shared aggregator: init → register_file, update → byte delta,
/// finish → end.
struct FileProgress {
    aggregator: Arc<ProgressAggregator>,
    filename: String,
}

impl Progress for FileProgress {
    fn init(&mut self, size: usize, filename: &str) {
        self.filename = filename.to_string();
        self.aggregator.register_file(filename, size as u64);
    }

    fn update(&mut self, size: usize) {
        self.aggregator.update(&self.filename, size as u64);
    }

    fn finish(&mut self) {
        self.aggregator.end(&self.filename);
    }
}

/// Download every file of the repo's main revision into the hub cache,
/// reporting per-file progress into the aggregator. Returns the snapshot
/// directory holding the complete revision.
pub fn snapshot_download(
    repo_id: &str,
    cache_dir: &Path,
    aggregator: &Arc<ProgressAggregator>,
) -> Result<PathBuf, String> {
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(false)
        .build()
        .map_err(|e| format!("Hub API init failed: {e}"))?;
    let repo = api.model(repo_id.to_string());

    let info = repo
        .info()
        .map_err(|e| format!("Repo info failed: {e}"))?;

    let mut last: Option<PathBuf> = None;
    for sibling in &info.siblings {
        let progress = FileProgress {
            aggregator: aggregator.clone(),
            filename: sibling.rfilename.clone(),
        };
        let path = repo
            .download_with_progress(&sibling.rfilename, progress)
            .map_err(|e| format!("Download failed for {}: {e}", sibling.rfilename))?;
        last = Some(path);
    }

    // Files land under <cache>/models--org--name/snapshots/<rev>/...
    let snapshot = last
        .as_deref()
        .and_then(|p| snapshot_root(p))
        .unwrap_or_else(|| {
            repo_cache_dir(cache_dir, repo_id)
                .join("snapshots")
                .join(info.sha.clone())
        });
    Ok(snapshot)
}

/// Walk up from a downloaded file to the revision directory directly
/// under `snapshots/`.
fn snapshot_root(file: &Path) -> Option<PathBuf> {
    let mut cur = file.parent()?;
    loop {
        let parent = cur.parent()?;
        if parent.file_name().and_then(|n| n.to_str()) == Some("snapshots") {
            return Some(cur.to_path_buf());
        }
        cur = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_names_with_dot_substitution() {
        assert_eq!(
            candidate_model_names("OpenVINO/Phi-3.5-mini-instruct-int4-cw-ov"),
            vec![
                "Phi-3.5-mini-instruct-int4-cw-ov".to_string(),
                "Phi-3___5-mini-instruct-int4-cw-ov".to_string(),
            ]
        );
        assert_eq!(
            candidate_model_names("OpenVINO/Qwen3-8B-int4-cw-ov"),
            vec!["Qwen3-8B-int4-cw-ov".to_string()]
        );
        assert!(candidate_model_names("").is_empty());
    }

    #[test]
    fn test_find_existing_model_checks_both_names() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(
            find_existing_model(root.path(), "org/My-Model-v1.5"),
            None
        );

        std::fs::create_dir_all(root.path().join("My-Model-v1___5")).unwrap();
        assert_eq!(
            find_existing_model(root.path(), "org/My-Model-v1.5"),
            Some("My-Model-v1___5".to_string())
        );
    }

    #[test]
    fn test_repo_cache_dir_layout() {
        assert_eq!(
            repo_cache_dir(Path::new("/cache"), "OpenVINO/Qwen3-8B-int4-cw-ov"),
            PathBuf::from("/cache/models--OpenVINO--Qwen3-8B-int4-cw-ov")
        );
    }

    #[test]
    fn test_snapshot_root_walks_to_revision_dir() {
        let file = Path::new("/c/models--o--m/snapshots/abc123/sub/weights.bin");
        assert_eq!(
            snapshot_root(file),
            Some(PathBuf::from("/c/models--o--m/snapshots/abc123"))
        );
        assert_eq!(snapshot_root(Path::new("/tmp/plain.bin")), None);
    }
}
