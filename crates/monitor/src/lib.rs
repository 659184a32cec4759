//! VRAM headroom monitoring for admission control.
//!
//! [`ResourceMonitor`] answers one question: how much GPU memory is
//! free right now? The primary source is the render server's
//! `/system_stats` endpoint; when that fails the monitor shells out to
//! `nvidia-smi` and parses its CSV output; when both fail the reading
//! is marked unavailable. Every degraded reading carries notes that
//! end up in attempt telemetry as `fallback_notes`.

pub mod nvidia_smi;
pub mod stats;

use std::sync::Mutex;

use renderq_core::telemetry::ResourceSource;

/// One observation of GPU memory state.
#[derive(Debug, Clone)]
pub struct ResourceReading {
    /// VRAM currently in use, megabytes.
    pub used_mb: Option<i64>,
    /// Total VRAM, megabytes.
    pub total_mb: Option<i64>,
    pub source: ResourceSource,
    /// Why the reading is degraded, when it is.
    pub notes: Vec<String>,
}

impl ResourceReading {
    /// Free VRAM in megabytes, when the reading is numeric.
    pub fn headroom_mb(&self) -> Option<u64> {
        match (self.used_mb, self.total_mb) {
            (Some(used), Some(total)) => Some((total - used).max(0) as u64),
            _ => None,
        }
    }

    fn unavailable(notes: Vec<String>) -> Self {
        Self {
            used_mb: None,
            total_mb: None,
            source: ResourceSource::Unavailable,
            notes,
        }
    }
}

/// Queries GPU memory state, preferring the server's own stats.
pub struct ResourceMonitor {
    client: reqwest::Client,
    api_url: String,
    /// Most recent reading, shared read-only with callers that do not
    /// want to trigger a fresh query.
    last: Mutex<Option<ResourceReading>>,
}

impl ResourceMonitor {
    /// Create a monitor for a render server.
    ///
    /// * `api_url` - HTTP base URL of the server exposing
    ///   `/system_stats`, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            last: Mutex::new(None),
        }
    }

    /// Take a fresh reading: primary endpoint, then `nvidia-smi`,
    /// then unavailable. Never errors; degradation is encoded in the
    /// reading itself.
    pub async fn snapshot(&self) -> ResourceReading {
        let reading = self.snapshot_inner().await;
        if let Ok(mut last) = self.last.lock() {
            *last = Some(reading.clone());
        }
        reading
    }

    /// Most recent reading, if any snapshot has been taken.
    pub fn last_reading(&self) -> Option<ResourceReading> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    async fn snapshot_inner(&self) -> ResourceReading {
        let primary_note = match self.query_primary().await {
            Ok(reading) => return reading,
            Err(note) => note,
        };
        tracing::warn!(note = %primary_note, "Primary resource stats unavailable, trying nvidia-smi");

        match nvidia_smi::query().await {
            Ok((total_mb, used_mb)) => ResourceReading {
                used_mb: Some(used_mb),
                total_mb: Some(total_mb),
                source: ResourceSource::Fallback,
                notes: vec![format!("resource stats via nvidia-smi: {primary_note}")],
            },
            Err(fallback_note) => {
                tracing::warn!(note = %fallback_note, "nvidia-smi fallback failed, headroom unknown");
                ResourceReading::unavailable(vec![
                    format!("primary resource stats failed: {primary_note}"),
                    format!("nvidia-smi fallback failed: {fallback_note}"),
                ])
            }
        }
    }

    /// Query `/system_stats` and extract VRAM figures.
    async fn query_primary(&self) -> Result<ResourceReading, String> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let (total_mb, used_mb) =
            stats::parse_system_stats(&body).ok_or_else(|| "no VRAM figures in response".to_string())?;

        Ok(ResourceReading {
            used_mb: Some(used_mb),
            total_mb: Some(total_mb),
            source: ResourceSource::Primary,
            notes: Vec::new(),
        })
    }
}
