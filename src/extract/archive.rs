use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::engine::types::Entity;
use crate::error::Result;

/// Write a raw extracted batch to `<dir>/<store>/<entity>_<timestamp>.json`.
///
/// The file is written to a temporary name first and renamed into place.
pub async fn write_batch(
    dir: &Path,
    store: &str,
    entity: Entity,
    records: &[Value],
) -> Result<PathBuf> {
    let now = Utc::now();
    let store_dir = dir.join(store);
    tokio::fs::create_dir_all(&store_dir).await?;

    let path = store_dir.join(format!("{}_{}.json", entity, now.format("%Y%m%d_%H%M%S")));
    let tmp_path = path.with_extension("json.tmp");

    let document = serde_json::json!({
        "metadata": {
            "extracted_at": now.to_rfc3339(),
            "count": records.len(),
        },
        "data": records,
    });
    let data = serde_json::to_string_pretty(&document)?;
    tokio::fs::write(&tmp_path, &data).await?;
    tokio::fs::rename(&tmp_path, &path).await?;

    info!(store = %store, entity = %entity, path = %path.display(), "Archived raw batch");
    Ok(path)
}
