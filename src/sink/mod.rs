//! External record store.
//!
//! The store is a row-addressable sheet: rows are found by record id in the
//! first column, new records are appended, existing ones updated cell by
//! cell. Row and column indices are 1-based, like a spreadsheet.

#[cfg(feature = "sink-sheets")]
pub mod sheets;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};

use crate::error::PipelineError;
use crate::smoothing::SmoothedEstimate;

#[cfg(feature = "sink-sheets")]
pub use sheets::{SheetsConfig, SheetsSink};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Row-addressable key/value sink.
pub trait RecordSink: Send {
    /// Sink identifier.
    fn name(&self) -> &'static str;

    /// Row index of the record whose first column equals `record_id`.
    fn find_row(&mut self, record_id: &str) -> Result<Option<usize>>;

    fn append_row(&mut self, fields: &[String]) -> Result<()>;

    fn update_cell(&mut self, row: usize, column: usize, value: &str) -> Result<()>;
}

/// Where occupancy lands in a record row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SheetLayout {
    pub record_id: String,
    pub site_label: String,
    pub free_column: usize,
    pub total_column: usize,
    pub label_column: usize,
    pub timestamp_column: usize,
}

impl SheetLayout {
    pub fn new(record_id: impl Into<String>, site_label: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            site_label: site_label.into(),
            free_column: 4,
            total_column: 5,
            label_column: 6,
            timestamp_column: 8,
        }
    }

    /// Fields for a freshly appended record.
    fn new_row(&self, estimate: &SmoothedEstimate, timestamp: &str) -> Vec<String> {
        let width = self
            .free_column
            .max(self.total_column)
            .max(self.label_column)
            .max(self.timestamp_column);
        let mut row = vec![String::new(); width];
        row[0] = self.record_id.clone();
        row[self.free_column - 1] = estimate.free_count.to_string();
        row[self.total_column - 1] = estimate.total_slots().to_string();
        row[self.label_column - 1] = self.site_label.clone();
        row[self.timestamp_column - 1] = timestamp.to_string();
        row
    }
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self::new("5", "")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishAction {
    Appended,
    Updated { row: usize },
}

/// Write one estimate to the sink.
///
/// A failed timestamp update after the counts were written is logged and
/// does not fail the publish.
pub fn publish_occupancy(
    sink: &mut dyn RecordSink,
    layout: &SheetLayout,
    estimate: &SmoothedEstimate,
    at: DateTime<Local>,
) -> Result<PublishAction, PipelineError> {
    let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
    let name = sink.name();
    let sink_err = |e: anyhow::Error| PipelineError::SinkWrite(format!("{}: {:#}", name, e));

    let row = sink.find_row(&layout.record_id).map_err(sink_err)?;
    let Some(row) = row else {
        sink.append_row(&layout.new_row(estimate, &timestamp))
            .map_err(sink_err)?;
        log::info!(
            "{}: appended record id={} free={} total={}",
            name,
            layout.record_id,
            estimate.free_count,
            estimate.total_slots()
        );
        return Ok(PublishAction::Appended);
    };

    sink.update_cell(row, layout.free_column, &estimate.free_count.to_string())
        .map_err(sink_err)?;
    sink.update_cell(row, layout.total_column, &estimate.total_slots().to_string())
        .map_err(sink_err)?;
    if let Err(e) = sink.update_cell(row, layout.timestamp_column, &timestamp) {
        log::warn!(
            "{}: counts written but timestamp update failed for row {}: {:#}",
            name,
            row,
            e
        );
    }
    log::info!(
        "{}: updated row {} id={} free={} total={}",
        name,
        row,
        layout.record_id,
        estimate.free_count,
        estimate.total_slots()
    );
    Ok(PublishAction::Updated { row })
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<Vec<String>>,
    appends: usize,
    updates: usize,
    fail_next_writes: usize,
    fail_column: Option<usize>,
}

impl MemoryState {
    fn check_failure(&mut self, column: Option<usize>) -> Result<()> {
        if column.is_some() && column == self.fail_column {
            return Err(anyhow!("injected failure on column {:?}", column));
        }
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(anyhow!("injected write failure"));
        }
        Ok(())
    }
}

/// In-memory sink. Clones share the same rows, so a test or the demo can
/// keep a handle while the pipeline owns another.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing rows (e.g. a header row).
    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        let sink = Self::default();
        if let Ok(mut state) = sink.state.lock() {
            state.rows = rows;
        }
        sink
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .map(|state| state.rows.clone())
            .unwrap_or_default()
    }

    /// Successful appends and cell updates so far.
    pub fn write_counts(&self) -> (usize, usize) {
        self.state
            .lock()
            .map(|state| (state.appends, state.updates))
            .unwrap_or_default()
    }

    /// Fail the next `n` appends/updates.
    pub fn fail_next_writes(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_writes = n;
        }
    }

    /// Fail every update of one column.
    pub fn fail_column(&self, column: Option<usize>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_column = column;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))
    }
}

impl RecordSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn find_row(&mut self, record_id: &str) -> Result<Option<usize>> {
        let state = self.lock()?;
        Ok(state
            .rows
            .iter()
            .position(|row| row.first().map(|id| id.trim()) == Some(record_id.trim()))
            .map(|i| i + 1))
    }

    fn append_row(&mut self, fields: &[String]) -> Result<()> {
        let mut state = self.lock()?;
        state.check_failure(None)?;
        state.rows.push(fields.to_vec());
        state.appends += 1;
        Ok(())
    }

    fn update_cell(&mut self, row: usize, column: usize, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.check_failure(Some(column))?;
        if column == 0 {
            return Err(anyhow!("columns are 1-based"));
        }
        let cells = row
            .checked_sub(1)
            .and_then(|i| state.rows.get_mut(i))
            .ok_or_else(|| anyhow!("row {} does not exist", row))?;
        if cells.len() < column {
            cells.resize(column, String::new());
        }
        cells[column - 1] = value.to_string();
        state.updates += 1;
        Ok(())
    }
}
