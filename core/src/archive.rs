//! Month-stamped JSON archive helper backing the Repository port's
//! `cleanup` routine (§6). Grounded on
//! `original_source/.../backend/database/repositories.py::archive_logs`:
//! one file per calendar month, idempotent append, JSON array of row
//! objects. The actual storage engine (§1 Non-goals: no persistence
//! engine) is out of scope — this is the pure archive-format logic any
//! `Repository` impl can call from its `cleanup`.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// Appends `rows` to `<archive_dir>/<prefix>_YYYYMM.json`, grouped by the
/// calendar month of `timestamp_of`, creating the file if absent and
/// merging into the existing JSON array otherwise.
pub fn archive_rows<T, F>(
    archive_dir: &Path,
    prefix: &str,
    rows: &[T],
    timestamp_of: F,
) -> Result<Vec<std::path::PathBuf>>
where
    T: Serialize,
    F: Fn(&T) -> DateTime<Utc>,
{
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(archive_dir)?;

    let mut by_month: std::collections::BTreeMap<String, Vec<&T>> = std::collections::BTreeMap::new();
    for row in rows {
        let month = timestamp_of(row).format("%Y%m").to_string();
        by_month.entry(month).or_default().push(row);
    }

    let mut written = Vec::new();
    for (month, month_rows) in by_month {
        let path = archive_dir.join(format!("{prefix}_{month}.json"));
        let mut existing: Vec<serde_json::Value> = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };
        for row in month_rows {
            existing.push(serde_json::to_value(row)?);
        }
        let serialized = serde_json::to_string_pretty(&existing)?;
        fs::write(&path, serialized)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;
    use tempfile_like::TempDir;

    #[derive(Serialize, Deserialize, Clone)]
    struct Row {
        id: u32,
        created_at: String,
    }

    /// Minimal drop-cleaning temp dir, avoiding a dependency on the
    /// `tempfile` crate for a single test module.
    mod tempfile_like {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new(label: &str) -> Self {
                let dir = std::env::temp_dir().join(format!("labcell-archive-test-{label}-{}", std::process::id()));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }
            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn append_then_reload_then_append_yields_flat_array_with_all_rows() {
        let dir = TempDir::new("append");
        let ts = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();

        let first_batch = vec![Row { id: 1, created_at: ts.to_rfc3339() }];
        archive_rows(dir.path(), "processlog", &first_batch, |_| ts).unwrap();

        let second_batch = vec![Row { id: 2, created_at: ts.to_rfc3339() }];
        archive_rows(dir.path(), "processlog", &second_batch, |_| ts).unwrap();

        let path = dir.path().join("processlog_202601.json");
        let raw = fs::read_to_string(path).unwrap();
        let rows: Vec<Row> = serde_json::from_str(&raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[1].id, 2);
    }

    #[test]
    fn rows_split_across_months_produce_one_file_each() {
        let dir = TempDir::new("split");
        let jan = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let rows = vec![
            Row { id: 1, created_at: jan.to_rfc3339() },
            Row { id: 2, created_at: feb.to_rfc3339() },
        ];
        let written = archive_rows(dir.path(), "processlog", &rows, |r| {
            if r.id == 1 { jan } else { feb }
        })
        .unwrap();
        assert_eq!(written.len(), 2);
    }
}
