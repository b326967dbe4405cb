//! History export: one zip per terminated task.
//!
//! The archive bundles the task's aggregated log, `result.json`,
//! `all_predictions.json`, and every screenshot recorded during the task. It
//! is handed to the panel as bytes for the panel to trigger a download.

use std::io::{Cursor, Write};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use wayfinder_core_types::TaskId;

use crate::errors::AgentError;
use crate::guard::TaskCounters;
use crate::records::{ActionRecord, PredictionRecord};
use crate::stores::{format_timestamp, LogStore, ScreenshotStore};

/// Everything the exporter needs about a finished task, handed off by value
/// at termination.
#[derive(Debug)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub spec: String,
    pub start_url: Option<String>,
    pub counters: TaskCounters,
    pub termination_reason: String,
    pub actions: Vec<ActionRecord>,
    pub predictions: Vec<PredictionRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultJson<'a> {
    task_spec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_url: &'a Option<String>,
    counters: &'a TaskCounters,
    termination_reason: &'a str,
    actions: &'a [ActionRecord],
}

pub struct HistoryExporter {
    logs: Arc<LogStore>,
    screenshots: Arc<ScreenshotStore>,
    /// Version string embedded in the log header, e.g. `0.1.0 (2026-08-01)`.
    build_tag: String,
}

impl HistoryExporter {
    pub fn new(logs: Arc<LogStore>, screenshots: Arc<ScreenshotStore>, build_tag: String) -> Self {
        Self {
            logs,
            screenshots,
            build_tag,
        }
    }

    /// Assemble the archive for a finished task. Returns the zip bytes and a
    /// suggested file name.
    pub fn export_task(&self, summary: &TaskSummary) -> Result<(Vec<u8>, String), AgentError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        self.write_log_file(&mut writer, options, Some(&summary.task_id))?;

        let result = ResultJson {
            task_spec: &summary.spec,
            start_url: &summary.start_url,
            counters: &summary.counters,
            termination_reason: &summary.termination_reason,
            actions: &summary.actions,
        };
        write_entry(
            &mut writer,
            options,
            "result.json",
            serde_json::to_string_pretty(&result)
                .map_err(|err| AgentError::internal(format!("result.json failed: {err}")))?
                .as_bytes(),
        )?;

        write_entry(
            &mut writer,
            options,
            "all_predictions.json",
            serde_json::to_string_pretty(&summary.predictions)
                .map_err(|err| AgentError::internal(format!("predictions failed: {err}")))?
                .as_bytes(),
        )?;

        for record in self.screenshots.snapshot_for(&summary.task_id) {
            let bytes = match BASE64.decode(record.base64_png.as_bytes()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "skipping undecodable screenshot in export");
                    continue;
                }
            };
            write_entry(
                &mut writer,
                options,
                &format!("screenshots/{}", record.file_name()),
                &bytes,
            )?;
        }

        let bytes = finish(writer)?;
        let file_name = format!(
            "wayfinder-task-{}-{}.zip",
            short_id(&summary.task_id),
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        Ok((bytes, file_name))
    }

    /// Archive of log records carrying no task id (controller-level logs
    /// written between tasks).
    pub fn export_unaffiliated(&self) -> Result<(Vec<u8>, String), AgentError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.write_log_file(&mut writer, options, None)?;
        let bytes = finish(writer)?;
        let file_name = format!(
            "wayfinder-logs-{}.zip",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        Ok((bytes, file_name))
    }

    fn write_log_file(
        &self,
        writer: &mut ZipWriter<Cursor<Vec<u8>>>,
        options: SimpleFileOptions,
        task_id: Option<&TaskId>,
    ) -> Result<(), AgentError> {
        let mut content = format!(
            "Wayfinder {}\nExported at {}\n\n",
            self.build_tag,
            format_timestamp(&Utc::now())
        );
        for record in self.logs.snapshot_for(task_id) {
            content.push_str(&record.format_line());
            content.push('\n');
        }
        write_entry(writer, options, "agent.log", content.as_bytes())
    }
}

fn write_entry(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    name: &str,
    bytes: &[u8],
) -> Result<(), AgentError> {
    writer
        .start_file(name, options)
        .and_then(|_| writer.write_all(bytes).map_err(Into::into))
        .map_err(|err| AgentError::internal(format!("zip entry '{name}' failed: {err}")))
}

fn finish(writer: ZipWriter<Cursor<Vec<u8>>>) -> Result<Vec<u8>, AgentError> {
    writer
        .finish()
        .map(|cursor| cursor.into_inner())
        .map_err(|err| AgentError::internal(format!("zip finalize failed: {err}")))
}

fn short_id(task_id: &TaskId) -> String {
    task_id.0.chars().take(8).collect()
}
