//! Append-only report file.

use anyhow::Context;
use report_apis::{ReportRecord, RunMetadata};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

/// Newline-delimited JSON report. The metadata line is written when the
/// log is created, so it always comes first; every record is written and
/// flushed as a whole while holding the lock.
pub struct ReportLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReportLog {
    /// Creates the report at `path`. An existing report is only replaced
    /// when `overwrite` is set.
    pub async fn create(
        path: &Path,
        meta: &RunMetadata,
        overwrite: bool,
    ) -> anyhow::Result<ReportLog> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options
            .open(path)
            .await
            .with_context(|| format!("failed to create report {}", path.display()))?;
        write_line(&mut file, meta)
            .await
            .context("failed to write run metadata")?;
        tracing::info!(report = %path.display(), "report created");
        Ok(ReportLog {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &ReportRecord) -> anyhow::Result<()> {
        let mut file = self.file.lock().await;
        write_line(&mut file, record)
            .await
            .with_context(|| format!("failed to append record for {}", record.sample))
    }

    /// Flushes and syncs the report to disk.
    pub async fn close(self) -> anyhow::Result<()> {
        let mut file = self.file.into_inner();
        file.flush().await.context("failed to flush report")?;
        file.sync_all().await.context("failed to sync report")?;
        Ok(())
    }
}

async fn write_line(file: &mut File, value: &impl serde::Serialize) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(value).context("failed to serialize")?;
    if line.contains('\n') {
        anyhow::bail!("bug: serialized report line is not oneline");
    }
    line.push('\n');
    file.write_all(line.as_bytes())
        .await
        .context("failed to write report line")?;
    file.flush().await.context("failed to flush report")?;
    Ok(())
}
