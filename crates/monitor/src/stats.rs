//! Parser for the render server's `/system_stats` payload.
//!
//! The endpoint reports per-device VRAM in bytes:
//! `{"devices": [{"vram_total": N, "vram_free": N, ...}], ...}`.
//! Parsing is a pure function so it can be tested without a server.

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Extract `(total_mb, used_mb)` from a `/system_stats` response.
///
/// Uses the first device entry; the orchestrator targets a
/// single-GPU backend. Returns `None` when the expected fields are
/// missing or malformed.
pub fn parse_system_stats(body: &serde_json::Value) -> Option<(i64, i64)> {
    let device = body.get("devices")?.as_array()?.first()?;
    let vram_total = device.get("vram_total")?.as_u64()?;
    let vram_free = device.get("vram_free")?.as_u64()?;

    let total_mb = (vram_total / BYTES_PER_MB) as i64;
    let free_mb = (vram_free.min(vram_total) / BYTES_PER_MB) as i64;
    Some((total_mb, total_mb - free_mb))
}
