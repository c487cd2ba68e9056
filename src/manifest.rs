//! Sidecar manifest describing one acquisition session.
//!
//! When enabled in [`crate::config::AcquisitionSettings`], `start` drops a
//! small JSON document next to each stream's output so a directory of
//! artifacts stays self-describing: which host produced it, when, with
//! what software, and from which devices.

use crate::error::AcqResult;
use crate::properties::Properties;
use crate::storage::raw::{ensure_parent, uri_to_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One configured stream as recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub stream_id: usize,
    pub camera: String,
    pub storage: String,
    pub uri: String,
    /// Absent for unbounded streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_count: Option<u64>,
}

/// Session header written as `<uri>.acquire.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionManifest {
    pub session: Uuid,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub software_version: String,
    pub streams: Vec<StreamEntry>,
}

impl AcquisitionManifest {
    /// Describe the configured streams of `properties` as a fresh session.
    pub fn describe(properties: &Properties) -> Self {
        let streams = properties
            .video
            .iter()
            .enumerate()
            .filter(|(_, stream)| stream.is_configured())
            .map(|(stream_id, stream)| StreamEntry {
                stream_id,
                camera: stream.camera.identifier.name.clone(),
                storage: stream.storage.identifier.name.clone(),
                uri: stream.storage.settings.uri.clone(),
                max_frame_count: (stream.max_frame_count != u64::MAX)
                    .then_some(stream.max_frame_count),
            })
            .collect();
        Self {
            session: Uuid::new_v4(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: Utc::now(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            streams,
        }
    }

    /// Write this manifest next to `uri`; returns the path written. The
    /// stream's own sink may not have created the output directory yet, so
    /// this does.
    pub fn write_beside(&self, uri: &str) -> AcqResult<PathBuf> {
        let mut path = uri_to_path(uri).into_os_string();
        path.push(".acquire.json");
        let path = PathBuf::from(path);
        ensure_parent(&path)?;
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}
