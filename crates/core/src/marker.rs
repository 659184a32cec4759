//! Done-marker protocol: an atomic cross-process completion signal.
//!
//! The producer (the render backend, via a workflow script node or an
//! operator helper) writes `<prefix>.done.tmp` and then atomically
//! renames it to `<prefix>.done`. The consumer only ever accepts the
//! final path: a lone `.tmp` sighting means "not yet done". This module
//! holds the naming rules, the state classification, and the producer
//! write used by tests and by hosts whose backend lacks the script node.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Suffix of a committed marker file.
pub const MARKER_SUFFIX: &str = ".done";

/// Suffix of an in-progress (not yet committed) marker file.
pub const MARKER_TMP_SUFFIX: &str = ".done.tmp";

/// Observed lifecycle state of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Absent,
    /// The temp file exists but the rename has not happened. Treated
    /// as absent for timeout purposes.
    TmpWritten,
    Committed,
}

/// JSON payload of a committed marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerPayload {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "FrameCount", skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u32>,
}

/// Canonical marker path for a job prefix.
pub fn marker_path(output_dir: &Path, prefix: &str) -> PathBuf {
    output_dir.join(format!("{prefix}{MARKER_SUFFIX}"))
}

/// Temporary marker path for a job prefix.
pub fn tmp_marker_path(output_dir: &Path, prefix: &str) -> PathBuf {
    output_dir.join(format!("{prefix}{MARKER_TMP_SUFFIX}"))
}

/// Classify the marker state for a job prefix.
///
/// Only an existing final path counts as [`MarkerState::Committed`];
/// the temp path alone is reported as [`MarkerState::TmpWritten`] so
/// callers can log the distinction, but consumers must treat it the
/// same as absent.
pub fn classify(output_dir: &Path, prefix: &str) -> MarkerState {
    if marker_path(output_dir, prefix).is_file() {
        MarkerState::Committed
    } else if tmp_marker_path(output_dir, prefix).is_file() {
        MarkerState::TmpWritten
    } else {
        MarkerState::Absent
    }
}

/// Producer-side marker write: temp file, then atomic rename.
///
/// `std::fs::rename` replaces the destination atomically when both
/// paths are on the same filesystem, which holds here because both
/// live in `output_dir`. There is deliberately no direct-write
/// fallback: a consumer must never observe a half-written final path.
pub fn write_done_marker(
    output_dir: &Path,
    prefix: &str,
    frame_count: Option<u32>,
) -> Result<PathBuf, CoreError> {
    std::fs::create_dir_all(output_dir)?;
    let tmp = tmp_marker_path(output_dir, prefix);
    let committed = marker_path(output_dir, prefix);

    let payload = MarkerPayload {
        timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        frame_count,
    };
    let json = serde_json::to_string(&payload)
        .map_err(|e| CoreError::Internal(format!("serialize marker payload: {e}")))?;

    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &committed)?;
    Ok(committed)
}

/// Read and parse a committed marker's payload.
pub fn read_marker(output_dir: &Path, prefix: &str) -> Result<MarkerPayload, CoreError> {
    let raw = std::fs::read_to_string(marker_path(output_dir, prefix))?;
    serde_json::from_str(&raw)
        .map_err(|e| CoreError::Internal(format!("parse marker payload: {e}")))
}
