//! `nvidia-smi` fallback for GPU memory figures.
//!
//! Used when the render server's stats endpoint is unreachable (for
//! example while the server is mid-restart but the GPU itself is
//! fine). Invokes
//! `nvidia-smi --query-gpu=memory.total,memory.used --format=csv,noheader,nounits`
//! and parses the first line, which reports MiB values.

use tokio::process::Command;

/// Run `nvidia-smi` and return `(total_mb, used_mb)` for GPU 0.
///
/// Errors are returned as human-readable strings destined for
/// telemetry fallback notes.
pub async fn query() -> Result<(i64, i64), String> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
        .map_err(|e| format!("failed to launch nvidia-smi: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "nvidia-smi exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_csv(&stdout).ok_or_else(|| format!("unparseable nvidia-smi output: {}", stdout.trim()))
}

/// Parse the first CSV line of the memory query output.
pub fn parse_csv(stdout: &str) -> Option<(i64, i64)> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split(',').map(str::trim);
    let total_mb: i64 = fields.next()?.parse().ok()?;
    let used_mb: i64 = fields.next()?.parse().ok()?;
    Some((total_mb, used_mb))
}
