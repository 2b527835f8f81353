//! Table collaborator: writes parsed rows into named lake tables
//!
//! A table is a set of parts, one per batch. Replacing drops every existing
//! part; appending adds the batch's part, overwriting an earlier write of the
//! same batch so a redelivered job does not duplicate its rows.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WriteMode;
use crate::format::RowSet;
use crate::{is_valid_table_name, Error, Result};

#[async_trait]
pub trait TableWriter: Send + Sync {
    /// Returns the number of rows written.
    async fn write_table(
        &self,
        table: &str,
        batch_id: Uuid,
        rows: &RowSet,
        mode: WriteMode,
    ) -> Result<u64>;

    /// All parts concatenated, or `None` when the table does not exist.
    async fn read_table(&self, table: &str) -> Result<Option<RowSet>>;
}

fn check_table_name(table: &str) -> Result<()> {
    if is_valid_table_name(table) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid table name: {table:?}")))
    }
}

/// Tables stored as directories of CSV parts under a lake root.
#[derive(Debug, Clone)]
pub struct FsTableWriter {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FsTableWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn part_name(batch_id: Uuid) -> String {
        format!("part-{batch_id}.csv")
    }

    fn write_part(path: &Path, rows: &RowSet) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(|e| Error::table(e.to_string()))?;
        writer
            .write_record(&rows.columns)
            .map_err(|e| Error::table(e.to_string()))?;
        for row in &rows.rows {
            writer.write_record(row).map_err(|e| Error::table(e.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Moves `staging` into place as `table_dir`. The live table goes through
    /// `trash` and is put back if the swap fails.
    fn swap_in(staging: &Path, table_dir: &Path, trash: &Path) -> Result<()> {
        if !table_dir.exists() {
            std::fs::rename(staging, table_dir)?;
            return Ok(());
        }

        std::fs::rename(table_dir, trash)?;
        if let Err(err) = std::fs::rename(staging, table_dir) {
            if let Err(restore_err) = std::fs::rename(trash, table_dir) {
                error!(
                    table = %table_dir.display(),
                    trash = %trash.display(),
                    error = %restore_err,
                    "Failed to restore table after a failed replace"
                );
            }
            return Err(err.into());
        }

        if let Err(err) = std::fs::remove_dir_all(trash) {
            warn!(trash = %trash.display(), error = %err, "Failed to remove replaced table");
        }
        Ok(())
    }

    fn write_blocking(
        root: &Path,
        table: &str,
        batch_id: Uuid,
        rows: &RowSet,
        mode: WriteMode,
    ) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let table_dir = root.join(table);
        let part = Self::part_name(batch_id);

        match mode {
            WriteMode::CreateOrReplace => {
                let staging = root.join(format!(".staging-{table}-{}", Uuid::new_v4()));
                std::fs::create_dir(&staging)?;
                if let Err(err) = Self::write_part(&staging.join(&part), rows) {
                    let _ = std::fs::remove_dir_all(&staging);
                    return Err(err);
                }

                let trash = root.join(format!(".trash-{table}-{}", Uuid::new_v4()));
                if let Err(err) = Self::swap_in(&staging, &table_dir, &trash) {
                    let _ = std::fs::remove_dir_all(&staging);
                    return Err(err);
                }
            }
            WriteMode::Append => {
                std::fs::create_dir_all(&table_dir)?;
                let pending = table_dir.join(format!(".{part}.tmp"));
                if let Err(err) = Self::write_part(&pending, rows) {
                    let _ = std::fs::remove_file(&pending);
                    return Err(err);
                }
                std::fs::rename(&pending, table_dir.join(&part))?;
            }
        }

        Ok(())
    }

    fn read_blocking(root: &Path, table: &str) -> Result<Option<RowSet>> {
        let table_dir = root.join(table);
        if !table_dir.is_dir() {
            return Ok(None);
        }

        let mut parts: Vec<PathBuf> = std::fs::read_dir(&table_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("part-") && n.ends_with(".csv"))
            })
            .collect();
        parts.sort();

        let mut table_rows = RowSet::default();
        for part in parts {
            let mut reader = csv::Reader::from_path(&part).map_err(|e| Error::table(e.to_string()))?;
            if table_rows.columns.is_empty() {
                table_rows.columns = reader
                    .headers()
                    .map_err(|e| Error::table(e.to_string()))?
                    .iter()
                    .map(str::to_string)
                    .collect();
            }
            for record in reader.records() {
                let record = record.map_err(|e| Error::table(e.to_string()))?;
                table_rows.rows.push(record.iter().map(str::to_string).collect());
            }
        }

        Ok(Some(table_rows))
    }
}

#[async_trait]
impl TableWriter for FsTableWriter {
    async fn write_table(
        &self,
        table: &str,
        batch_id: Uuid,
        rows: &RowSet,
        mode: WriteMode,
    ) -> Result<u64> {
        check_table_name(table)?;

        let root = self.root.clone();
        let lock = self.lock.clone();
        let table_name = table.to_string();
        let rows_to_write = rows.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            Self::write_blocking(&root, &table_name, batch_id, &rows_to_write, mode)
        })
        .await
        .map_err(|e| Error::Internal(format!("table writer task failed: {e}")))??;

        info!(table, batch = %batch_id, rows = rows.len(), mode = ?mode, "Wrote table");
        Ok(rows.len() as u64)
    }

    async fn read_table(&self, table: &str) -> Result<Option<RowSet>> {
        check_table_name(table)?;

        let root = self.root.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || Self::read_blocking(&root, &table))
            .await
            .map_err(|e| Error::Internal(format!("table reader task failed: {e}")))?
    }
}

#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: Mutex<HashMap<String, Vec<(Uuid, RowSet)>>>,
}

#[async_trait]
impl TableWriter for MemoryTables {
    async fn write_table(
        &self,
        table: &str,
        batch_id: Uuid,
        rows: &RowSet,
        mode: WriteMode,
    ) -> Result<u64> {
        check_table_name(table)?;

        let mut tables = self.tables.lock();
        let parts = tables.entry(table.to_string()).or_default();
        match mode {
            WriteMode::CreateOrReplace => *parts = vec![(batch_id, rows.clone())],
            WriteMode::Append => match parts.iter_mut().find(|(id, _)| *id == batch_id) {
                Some((_, existing)) => *existing = rows.clone(),
                None => parts.push((batch_id, rows.clone())),
            },
        }
        Ok(rows.len() as u64)
    }

    async fn read_table(&self, table: &str) -> Result<Option<RowSet>> {
        Ok(self.tables.lock().get(table).map(|parts| {
            let mut merged = RowSet::default();
            for (_, part) in parts {
                if merged.columns.is_empty() {
                    merged.columns = part.columns.clone();
                }
                merged.rows.extend(part.rows.iter().cloned());
            }
            merged
        }))
    }
}
