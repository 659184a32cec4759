//! Consumer side of the done-marker handoff.
//!
//! The producer commits `<prefix>.done` by writing `<prefix>.done.tmp`
//! and renaming it. This module waits for the committed marker (a
//! tmp-only sighting counts as absent) and, when the marker never
//! lands, recovers prefixed output files into a recovery directory
//! along with a diagnostic dump of every candidate considered.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use renderq_core::error::CoreError;
use renderq_core::marker::{classify, MarkerState, MARKER_SUFFIX, MARKER_TMP_SUFFIX};

/// How often the output directory is re-checked while waiting.
pub const MARKER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

const RECOVERY_DUMP_SUFFIX: &str = ".recovery.json";

/// Result of waiting for a committed marker.
#[derive(Debug, Clone, Copy)]
pub struct MarkerWait {
    pub detected: bool,
    pub waited: std::time::Duration,
}

/// Poll for `<prefix>.done` until it commits, the timeout lapses, or
/// the attempt is cancelled. A tmp marker that never gets renamed is
/// treated the same as no marker at all.
pub async fn wait_for_marker(
    output_dir: &Path,
    prefix: &str,
    timeout: std::time::Duration,
    cancel: &CancellationToken,
) -> MarkerWait {
    let start = tokio::time::Instant::now();
    let deadline = start + timeout;

    loop {
        match classify(output_dir, prefix) {
            MarkerState::Committed => {
                return MarkerWait {
                    detected: true,
                    waited: start.elapsed(),
                }
            }
            MarkerState::TmpWritten => {
                tracing::trace!(prefix, "Marker tmp present but not yet committed");
            }
            MarkerState::Absent => {}
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let step = MARKER_POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(step) => {}
        }
    }

    MarkerWait {
        detected: false,
        waited: start.elapsed(),
    }
}

/// One file considered by the forced-copy scan.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub file_name: String,
    pub size_bytes: u64,
    /// Modification time as seconds since the epoch, when readable.
    pub modified_epoch_secs: Option<u64>,
    pub accepted: bool,
    pub reason: String,
}

/// Diagnostic dump written next to the recovered files.
#[derive(Debug, Serialize)]
struct RecoveryDump<'a> {
    prefix: &'a str,
    scanned_dir: String,
    candidates: &'a [CandidateRecord],
    copied: Vec<String>,
}

/// What the forced-copy fallback recovered.
#[derive(Debug)]
pub struct ForcedCopyOutcome {
    /// Recovered files, newest first.
    pub copied: Vec<PathBuf>,
    pub dump_path: PathBuf,
}

/// Scan `output_dir` for files matching `prefix`, copy the matches
/// into `recovery_dir`, and write `<prefix>.recovery.json` describing
/// every candidate and why it was accepted or rejected. The dump is
/// written even when nothing qualifies; `Ok(None)` means no output
/// could be recovered.
pub fn forced_copy(
    output_dir: &Path,
    prefix: &str,
    recovery_dir: &Path,
) -> Result<Option<ForcedCopyOutcome>, CoreError> {
    let mut candidates = scan_candidates(output_dir, prefix)?;
    // Newest first; ties break on name so the ordering is stable.
    candidates.sort_by(|a, b| {
        b.modified_epoch_secs
            .cmp(&a.modified_epoch_secs)
            .then_with(|| b.file_name.cmp(&a.file_name))
    });

    std::fs::create_dir_all(recovery_dir)?;

    let mut copied = Vec::new();
    for candidate in candidates.iter().filter(|c| c.accepted) {
        let from = output_dir.join(&candidate.file_name);
        let to = recovery_dir.join(&candidate.file_name);
        std::fs::copy(&from, &to)?;
        copied.push(to);
    }

    let dump_path = recovery_dir.join(format!("{prefix}{RECOVERY_DUMP_SUFFIX}"));
    let dump = RecoveryDump {
        prefix,
        scanned_dir: output_dir.display().to_string(),
        candidates: &candidates,
        copied: copied
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    };
    let json = serde_json::to_vec_pretty(&dump)
        .map_err(|e| CoreError::Internal(format!("serialize recovery dump: {e}")))?;
    std::fs::write(&dump_path, json)?;

    if copied.is_empty() {
        Ok(None)
    } else {
        Ok(Some(ForcedCopyOutcome { copied, dump_path }))
    }
}

fn scan_candidates(output_dir: &Path, prefix: &str) -> Result<Vec<CandidateRecord>, CoreError> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }

        let metadata = entry.metadata()?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        let (accepted, reason) = if name.ends_with(MARKER_SUFFIX) || name.ends_with(MARKER_TMP_SUFFIX)
        {
            (false, "completion marker, not job output".to_string())
        } else if name.ends_with(RECOVERY_DUMP_SUFFIX) {
            (false, "recovery dump from an earlier scan".to_string())
        } else if !metadata.is_file() {
            (false, "not a regular file".to_string())
        } else {
            (true, format!("regular file matching prefix {prefix:?}"))
        };

        candidates.push(CandidateRecord {
            file_name: name,
            size_bytes: metadata.len(),
            modified_epoch_secs: modified,
            accepted,
            reason,
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_core::marker::write_done_marker;

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_no_marker_appears() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let wait = wait_for_marker(
            dir.path(),
            "job-a",
            std::time::Duration::from_secs(2),
            &cancel,
        )
        .await;
        assert!(!wait.detected);
        assert!(wait.waited >= std::time::Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sees_a_marker_committed_mid_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let cancel = CancellationToken::new();

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                write_done_marker(&path, "job-b", Some(48)).unwrap();
            }
        });

        let wait = wait_for_marker(&path, "job-b", std::time::Duration::from_secs(10), &cancel).await;
        writer.await.unwrap();
        assert!(wait.detected);
        assert!(wait.waited < std::time::Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn tmp_only_marker_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job-c.done.tmp"), b"{}").unwrap();
        let cancel = CancellationToken::new();
        let wait = wait_for_marker(
            dir.path(),
            "job-c",
            std::time::Duration::from_secs(1),
            &cancel,
        )
        .await;
        assert!(!wait.detected);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let wait = wait_for_marker(
            dir.path(),
            "job-d",
            std::time::Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert!(!wait.detected);
        assert!(wait.waited < std::time::Duration::from_secs(60));
    }

    #[test]
    fn forced_copy_recovers_prefixed_output_and_writes_the_dump() {
        let out = tempfile::tempdir().unwrap();
        let recovery = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("job-e_00001.mp4"), b"video").unwrap();
        std::fs::write(out.path().join("job-e.done.tmp"), b"{}").unwrap();
        std::fs::write(out.path().join("other_00001.mp4"), b"video").unwrap();

        let outcome = forced_copy(out.path(), "job-e", recovery.path())
            .unwrap()
            .expect("one file should be recovered");
        assert_eq!(outcome.copied.len(), 1);
        assert!(recovery.path().join("job-e_00001.mp4").exists());

        let dump: serde_json::Value =
            serde_json::from_slice(&std::fs::read(outcome.dump_path).unwrap()).unwrap();
        let candidates = dump["candidates"].as_array().unwrap();
        // The tmp marker is listed but rejected; the unrelated file is
        // not a candidate at all.
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates.iter().filter(|c| c["accepted"] == true).count(),
            1
        );
    }

    #[test]
    fn forced_copy_with_no_candidates_still_dumps() {
        let out = tempfile::tempdir().unwrap();
        let recovery = tempfile::tempdir().unwrap();
        let outcome = forced_copy(out.path(), "job-f", recovery.path()).unwrap();
        assert!(outcome.is_none());
        assert!(recovery.path().join("job-f.recovery.json").exists());
    }

    #[test]
    fn forced_copy_orders_recovered_files_newest_first() {
        let out = tempfile::tempdir().unwrap();
        let recovery = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("job-g_00001.mp4"), b"a").unwrap();
        std::fs::write(out.path().join("job-g_00002.mp4"), b"b").unwrap();

        let outcome = forced_copy(out.path(), "job-g", recovery.path())
            .unwrap()
            .unwrap();
        assert_eq!(outcome.copied.len(), 2);
        // Same mtime second resolves to the lexicographically later name.
        assert!(outcome.copied[0].ends_with("job-g_00002.mp4"));
    }
}
