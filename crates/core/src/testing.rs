//! Scripted in-memory upstream for tests
//!
//! [`ScriptedSpreadsheetApi`] models each sheet as a grid of cells addressed
//! in A1 notation and understands the handful of `sheets_data` actions the
//! gateway itself relies on (reads, writes used for compensation, append,
//! clear). Writes overlay cells, reads trim trailing empty rows and cells,
//! and appends land below the last non-empty row of the range, the way
//! Google Sheets behaves. Every other action succeeds with a small
//! acknowledgement.
//!
//! Failures, latency and call counts are scriptable per `tool.action` name;
//! [`READ_STATE`] names the `read_state` entry point. A call takes effect
//! when it arrives and its response is delayed by the scripted latency, so
//! a slow read returns the values it saw before the delay.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sheetgate_domain::{Operation, StateTarget};

use crate::upstream::{SpreadsheetApi, UpstreamError};

/// Script key for [`SpreadsheetApi::read_state`]
pub const READ_STATE: &str = "read_state";

const OPEN: u32 = u32::MAX;

#[derive(Debug, Clone)]
enum Failure {
    Times(u32, UpstreamError),
    Always(UpstreamError),
}

/// Rectangle of cells; rows and columns are 0-based and inclusive
#[derive(Debug, Clone, PartialEq, Eq)]
struct GridRange {
    /// Sheet prefix as written, including the `!`; empty for the first sheet
    prefix: String,
    sheet: String,
    top: u32,
    left: u32,
    bottom: u32,
    right: u32,
}

impl GridRange {
    fn parse(range: &str) -> Option<Self> {
        let (prefix, sheet, reference) = match range.rsplit_once('!') {
            Some((sheet, reference)) => {
                let name = sheet.trim_matches('\'').to_string();
                (format!("{sheet}!"), name, reference)
            }
            None => (String::new(), String::new(), range),
        };
        let (start, end) = match reference.split_once(':') {
            Some((start, end)) => (parse_cell(start)?, Some(parse_cell(end)?)),
            None => (parse_cell(reference)?, None),
        };

        let (left, top) = (start.0.unwrap_or(0), start.1.unwrap_or(0));
        let (right, bottom) = match end {
            Some((col, row)) => (col.unwrap_or(OPEN), row.unwrap_or(OPEN)),
            None => (start.0.unwrap_or(OPEN), start.1.unwrap_or(OPEN)),
        };
        Some(Self {
            prefix,
            sheet,
            top: top.min(bottom),
            left: left.min(right),
            bottom: top.max(bottom),
            right: left.max(right),
        })
    }

    fn contains(&self, row: u32, col: u32) -> bool {
        (self.top..=self.bottom).contains(&row) && (self.left..=self.right).contains(&col)
    }

    fn height(&self) -> u64 {
        u64::from(self.bottom - self.top) + 1
    }

    fn width(&self) -> u64 {
        u64::from(self.right - self.left) + 1
    }

    fn a1(&self, top: u32, left: u32, bottom: u32, right: u32) -> String {
        format!("{}{}:{}", self.prefix, cell_name(top, left), cell_name(bottom, right))
    }
}

/// `B3` -> `(Some(1), Some(2))`; either half may be missing (`B`, `3`)
fn parse_cell(cell: &str) -> Option<(Option<u32>, Option<u32>)> {
    let cell = cell.trim().replace('$', "");
    let split = cell.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(cell.len());
    let (letters, digits) = cell.split_at(split);
    if letters.is_empty() && digits.is_empty() {
        return None;
    }

    let col = if letters.is_empty() {
        None
    } else {
        let mut index: u32 = 0;
        for c in letters.bytes() {
            let digit = u32::from(c.to_ascii_uppercase() - b'A') + 1;
            index = index.checked_mul(26)?.checked_add(digit)?;
        }
        Some(index - 1)
    };
    let row = if digits.is_empty() {
        None
    } else {
        Some(digits.parse::<u32>().ok()?.checked_sub(1)?)
    };
    Some((col, row))
}

fn cell_name(row: u32, col: u32) -> String {
    let mut letters = Vec::new();
    let mut n = col + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + u8::try_from(rem).unwrap_or(0)));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect::<String>() + &(row + 1).to_string()
}

fn is_blank(value: &Value) -> bool {
    value.as_str().is_some_and(str::is_empty)
}

type Grid = BTreeMap<(u32, u32), Value>;

/// In-memory mock for `SpreadsheetApi`.
#[derive(Default)]
pub struct ScriptedSpreadsheetApi {
    grids: Mutex<HashMap<(String, String), Grid>>,
    failures: Mutex<HashMap<String, VecDeque<Failure>>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    resets: AtomicU32,
}

impl ScriptedSpreadsheetApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a range with values
    ///
    /// # Panics
    /// If `range` is not A1 notation or the values do not fit.
    #[must_use]
    pub fn with_range(self, spreadsheet_id: &str, range: &str, values: Value) -> Self {
        self.set_range(spreadsheet_id, range, values);
        self
    }

    /// Overlay `values` onto the cells of `range`
    ///
    /// # Panics
    /// If `range` is not A1 notation or the values do not fit.
    pub fn set_range(&self, spreadsheet_id: &str, range: &str, values: Value) {
        if let Err(err) = self.write_cells(spreadsheet_id, range, &values) {
            panic!("cannot seed {spreadsheet_id} {range}: {err}");
        }
    }

    /// Current values of a range, trimmed like a Sheets read; empty ranges
    /// read as `[]`
    ///
    /// # Panics
    /// If `range` is not A1 notation.
    pub fn range_values(&self, spreadsheet_id: &str, range: &str) -> Value {
        match self.read_cells(spreadsheet_id, range) {
            Ok(values) => values,
            Err(err) => panic!("cannot read {spreadsheet_id} {range}: {err}"),
        }
    }

    /// Fail the next call to `name` once
    pub fn fail_next(&self, name: &str, error: UpstreamError) {
        self.fail_times(name, 1, error);
    }

    /// Fail the next `times` calls to `name`
    pub fn fail_times(&self, name: &str, times: u32, error: UpstreamError) {
        self.failures
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(Failure::Times(times, error));
    }

    /// Fail every call to `name` until [`clear_failures`](Self::clear_failures)
    pub fn fail_always(&self, name: &str, error: UpstreamError) {
        self.failures.lock().entry(name.to_string()).or_default().push_back(Failure::Always(error));
    }

    pub fn clear_failures(&self, name: &str) {
        self.failures.lock().remove(name);
    }

    /// Delay the response of every call to `name` by `delay`
    pub fn set_latency(&self, name: &str, delay: Duration) {
        self.latency.lock().insert(name.to_string(), delay);
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.as_str() == name).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every call in dispatch order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Record the call, apply it unless a failure is scripted, then wait
    /// out the latency
    async fn serve<F>(&self, name: &str, apply: F) -> Result<Value, UpstreamError>
    where
        F: FnOnce() -> Result<Value, UpstreamError>,
    {
        self.calls.lock().push(name.to_string());
        let result = match self.scripted_failure(name) {
            Some(error) => Err(error),
            None => apply(),
        };
        let delay = self.latency.lock().get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn scripted_failure(&self, name: &str) -> Option<UpstreamError> {
        let mut failures = self.failures.lock();
        let queue = failures.get_mut(name)?;
        let (error, exhausted) = match queue.front_mut()? {
            Failure::Always(error) => (error.clone(), false),
            Failure::Times(remaining, error) => {
                *remaining = remaining.saturating_sub(1);
                (error.clone(), *remaining == 0)
            }
        };
        if exhausted {
            queue.pop_front();
        }
        Some(error)
    }

    fn grid_range(range: &str) -> Result<GridRange, UpstreamError> {
        GridRange::parse(range)
            .ok_or_else(|| {
                UpstreamError::from_status(400, format!("Unable to parse range: {range}"))
            })
    }

    fn rows(values: &Value) -> Result<Vec<Vec<Value>>, UpstreamError> {
        let invalid = || UpstreamError::from_status(400, "values must be an array of rows");
        values
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(|row| row.as_array().cloned().ok_or_else(invalid))
            .collect()
    }

    fn read_cells(&self, spreadsheet_id: &str, range: &str) -> Result<Value, UpstreamError> {
        let grid_range = Self::grid_range(range)?;
        let grids = self.grids.lock();
        let Some(grid) = grids.get(&(spreadsheet_id.to_string(), grid_range.sheet.clone())) else {
            return Ok(json!([]));
        };

        let mut rows: BTreeMap<u32, BTreeMap<u32, Value>> = BTreeMap::new();
        for ((row, col), value) in grid {
            if grid_range.contains(*row, *col) {
                rows.entry(*row).or_default().insert(*col, value.clone());
            }
        }
        let Some(last_row) = rows.keys().next_back().copied() else {
            return Ok(json!([]));
        };

        let values: Vec<Value> = (grid_range.top..=last_row)
            .map(|row| {
                let cells = rows.get(&row);
                let last_col = cells.and_then(|cells| cells.keys().next_back().copied());
                let line: Vec<Value> = match (cells, last_col) {
                    (Some(cells), Some(last_col)) => (grid_range.left..=last_col)
                        .map(|col| cells.get(&col).cloned().unwrap_or_else(|| json!("")))
                        .collect(),
                    _ => Vec::new(),
                };
                Value::Array(line)
            })
            .collect();
        Ok(Value::Array(values))
    }

    /// Overlay `values` from the top-left of `range`; `null` leaves a cell
    /// unchanged and `""` clears it
    fn write_cells(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: &Value,
    ) -> Result<usize, UpstreamError> {
        let grid_range = Self::grid_range(range)?;
        let rows = Self::rows(values)?;
        let widest = rows.iter().map(Vec::len).max().unwrap_or(0);
        let fits =
            |count: usize, limit: u64| u64::try_from(count).is_ok_and(|count| count <= limit);
        if !fits(rows.len(), grid_range.height()) || !fits(widest, grid_range.width()) {
            return Err(UpstreamError::from_status(
                400,
                format!("Requested writing within range [{range}], but tried writing past it"),
            ));
        }

        let mut grids = self.grids.lock();
        let grid = grids.entry((spreadsheet_id.to_string(), grid_range.sheet.clone())).or_default();
        for (r, row) in (grid_range.top..).zip(&rows) {
            for (c, value) in (grid_range.left..).zip(row) {
                if value.is_null() {
                    continue;
                }
                if is_blank(value) {
                    grid.remove(&(r, c));
                } else {
                    grid.insert((r, c), value.clone());
                }
            }
        }
        Ok(rows.len())
    }

    fn clear_cells(&self, spreadsheet_id: &str, range: &str) -> Result<(), UpstreamError> {
        let grid_range = Self::grid_range(range)?;
        let key = (spreadsheet_id.to_string(), grid_range.sheet.clone());
        if let Some(grid) = self.grids.lock().get_mut(&key) {
            grid.retain(|(row, col), _| !grid_range.contains(*row, *col));
        }
        Ok(())
    }

    /// Write below the last non-empty row in the range's columns; returns
    /// the range that now holds the new rows
    fn append_cells(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: &Value,
    ) -> Result<Value, UpstreamError> {
        let grid_range = Self::grid_range(range)?;
        let rows = Self::rows(values)?;
        let widest = u32::try_from(rows.iter().map(Vec::len).max().unwrap_or(0).max(1))
            .map_err(|_| UpstreamError::from_status(400, "too many columns"))?;
        let height = u32::try_from(rows.len().max(1))
            .map_err(|_| UpstreamError::from_status(400, "too many rows"))?;

        let start = {
            let grids = self.grids.lock();
            grids
                .get(&(spreadsheet_id.to_string(), grid_range.sheet.clone()))
                .and_then(|grid| {
                    grid.keys()
                        .filter(|(row, col)| {
                            *row >= grid_range.top
                                && (grid_range.left..=grid_range.right).contains(col)
                        })
                        .map(|(row, _)| *row)
                        .max()
                })
                .map_or(grid_range.top, |last| last + 1)
        };
        let updated = grid_range.a1(
            start,
            grid_range.left,
            start + height - 1,
            grid_range.left + widest - 1,
        );
        self.write_cells(spreadsheet_id, &updated, values)?;
        Ok(json!({
            "tableRange": range,
            "updates": { "updatedRange": updated, "updatedRows": rows.len() }
        }))
    }

    fn target(operation: &Operation) -> Result<(String, String), UpstreamError> {
        match (operation.spreadsheet_id(), operation.range()) {
            (Some(spreadsheet_id), Some(range)) => {
                Ok((spreadsheet_id.to_string(), range.to_string()))
            }
            _ => Err(UpstreamError::from_status(400, "spreadsheetId and range are required")),
        }
    }

    fn apply(&self, operation: &Operation) -> Result<Value, UpstreamError> {
        let values = || operation.parameters().get("values").cloned().unwrap_or_else(|| json!([]));
        match (operation.tool(), operation.action()) {
            ("sheets_data", "read") => {
                let (spreadsheet_id, range) = Self::target(operation)?;
                let values = self.read_cells(&spreadsheet_id, &range)?;
                Ok(json!({ "range": range, "values": values }))
            }
            ("sheets_data", "write") => {
                let (spreadsheet_id, range) = Self::target(operation)?;
                let rows = self.write_cells(&spreadsheet_id, &range, &values())?;
                Ok(json!({ "updatedRange": range, "updatedRows": rows }))
            }
            ("sheets_data", "append") => {
                let (spreadsheet_id, range) = Self::target(operation)?;
                self.append_cells(&spreadsheet_id, &range, &values())
            }
            ("sheets_data", "clear") => {
                let (spreadsheet_id, range) = Self::target(operation)?;
                self.clear_cells(&spreadsheet_id, &range)?;
                Ok(json!({ "clearedRange": range }))
            }
            (tool, action) => Ok(json!({ "ok": true, "tool": tool, "action": action })),
        }
    }
}

#[async_trait]
impl SpreadsheetApi for ScriptedSpreadsheetApi {
    async fn call(&self, operation: &Operation) -> Result<Value, UpstreamError> {
        self.serve(&operation.qualified_name(), || self.apply(operation)).await
    }

    async fn read_state(&self, target: &StateTarget) -> Result<Value, UpstreamError> {
        self.serve(READ_STATE, || self.read_cells(&target.spreadsheet_id, &target.range)).await
    }

    async fn reset_connection(&self, _pool: &str) -> Result<(), UpstreamError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
