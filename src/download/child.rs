//! Download child-process entry point.
//!
//! Runs as `idle-npu-host --download <repo_id> <cache_dir> <models_root>`
//! and emits typed JSON-line events on stdout: progress, log, error,
//! finished. The supervisor appends the terminal done event after the
//! process exits, so the protocol stays crash-safe.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::hub;
use super::progress::ProgressAggregator;

lazy_static::lazy_static! {
    static ref PRINT_LOCK: Mutex<()> = Mutex::new(());
}

fn emit(event: serde_json::Value) {
    let _guard = PRINT_LOCK.lock().unwrap();
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{event}");
    let _ = stdout.flush();
}

fn emit_log(message: &str) {
    emit(json!({"type": "log", "message": message}));
}

fn emit_error(message: &str) {
    emit(json!({"type": "error", "message": message}));
}

/// Run one download to completion. Always returns normally; failures are
/// reported as error events.
pub fn run_download(repo_id: &str, cache_dir: &Path, models_root: &Path) {
    if let Some(existing) = hub::find_existing_model(models_root, repo_id) {
        emit_error(&format!("Model exists: {existing}"));
        return;
    }

    emit_log("Starting download process...");
    emit_log(&format!("Target model: {repo_id}"));

    let _ = std::fs::create_dir_all(cache_dir);
    let _ = std::fs::create_dir_all(models_root);

    // Plan failure is non-fatal: progress then derives from per-file
    // callbacks alone
    let (total_bytes, total_files) =
        hub::compute_download_plan(repo_id, cache_dir).unwrap_or((0, 0));

    let aggregator = Arc::new(ProgressAggregator::new(
        Box::new(|file, percent| {
            emit(json!({"type": "progress", "file": file, "percent": percent}));
        }),
        total_bytes,
        total_files,
    ));

    let snapshot = match hub::snapshot_download(repo_id, cache_dir, &aggregator) {
        Ok(path) => path,
        Err(e) => {
            emit_error(&e);
            return;
        }
    };

    emit_log("Download complete, arranging files...");

    let model_name = hub::candidate_model_names(repo_id)
        .into_iter()
        .next()
        .unwrap_or_else(|| "model".to_string());
    let final_path = models_root.join(&model_name);

    if final_path.exists() {
        emit_log(&format!("Overwriting {model_name}"));
        if let Err(e) = std::fs::remove_dir_all(&final_path) {
            emit_error(&format!("Could not replace existing model: {e}"));
            return;
        }
    }

    if let Err(e) = install_snapshot(&snapshot, &final_path) {
        emit_error(&format!("Install failed: {e}"));
        return;
    }

    // Drop the scratch copy; the installed tree is now authoritative
    let _ = std::fs::remove_dir_all(hub::repo_cache_dir(cache_dir, repo_id));

    emit(json!({"type": "finished", "path": final_path.to_string_lossy()}));
}

/// Materialize the snapshot into the models root. The hub cache uses a
/// symlink farm into its blob store, so files are copied resolved rather
/// than renamed.
fn install_snapshot(snapshot: &Path, target: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(snapshot) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(snapshot)
            .map_err(std::io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_snapshot_copies_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("tokenizer")).unwrap();
        std::fs::write(src.path().join("openvino_model.xml"), b"ir").unwrap();
        std::fs::write(src.path().join("tokenizer/tokenizer.json"), b"{}").unwrap();

        let dst_root = tempfile::tempdir().unwrap();
        let target = dst_root.path().join("qwen3-8b-int4-cw-ov");
        install_snapshot(src.path(), &target).unwrap();

        assert_eq!(std::fs::read(target.join("openvino_model.xml")).unwrap(), b"ir");
        assert_eq!(
            std::fs::read(target.join("tokenizer/tokenizer.json")).unwrap(),
            b"{}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_install_snapshot_resolves_symlinks() {
        let blobs = tempfile::tempdir().unwrap();
        std::fs::write(blobs.path().join("blob1"), b"weights").unwrap();

        let src = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            blobs.path().join("blob1"),
            src.path().join("model.safetensors"),
        )
        .unwrap();

        let dst_root = tempfile::tempdir().unwrap();
        let target = dst_root.path().join("m");
        install_snapshot(src.path(), &target).unwrap();

        let installed = target.join("model.safetensors");
        assert!(!installed.is_symlink());
        assert_eq!(std::fs::read(installed).unwrap(), b"weights");
    }
}
