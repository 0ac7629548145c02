//! Column tables built from `tracing` events.
//!
//! Every info-level event becomes one row of the table named after its
//! target. A column appears the first time its field is seen; rows recorded
//! before that, or events that omit the field, read as null.
//!
//! ```ignore
//! // simulation code
//! tracing::info!(target: "auction_iter", slot, iteration, price, demand, supply);
//!
//! // test code
//! let mut run = instrument::RunRecorder::start("runs", "heuristic_10_slots");
//! market.run()?;
//! let frames = run.frames()?;
//! let iterations = &frames["auction_iter"];
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use polars::prelude::*;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Record};
use tracing::{Event, Id, Metadata, Subscriber};

// === COLUMNS ===

/// One column of nullable values. The first value recorded fixes the type.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    U64(Vec<Option<u64>>),
    I64(Vec<Option<i64>>),
    F64(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Str(Vec<Option<String>>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::U64(v) => v.len(),
            Values::I64(v) => v.len(),
            Values::F64(v) => v.len(),
            Values::Bool(v) => v.len(),
            Values::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_null(&mut self) {
        match self {
            Values::U64(v) => v.push(None),
            Values::I64(v) => v.push(None),
            Values::F64(v) => v.push(None),
            Values::Bool(v) => v.push(None),
            Values::Str(v) => v.push(None),
        }
    }

    pub fn as_f64(&self) -> Option<&[Option<f64>]> {
        match self {
            Values::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<&[Option<u64>]> {
        match self {
            Values::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[Option<String>]> {
        match self {
            Values::Str(v) => Some(v),
            _ => None,
        }
    }
}

// === TABLES ===

/// Columns in first-seen order, all of length `rows` between events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<(String, Values)>,
    rows: usize,
}

impl Table {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn column(&self, name: &str) -> Option<&Values> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Column for `name` in the row being written, created null-filled if new.
    fn cell(&mut self, name: &str, empty: fn(usize) -> Values) -> &mut Values {
        let index = match self.columns.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.columns.push((name.to_string(), empty(self.rows)));
                self.columns.len() - 1
            }
        };
        &mut self.columns[index].1
    }

    /// Null-fill every column that got no value, then count the row.
    fn close_row(&mut self) {
        self.rows += 1;
        for (_, values) in &mut self.columns {
            while values.len() < self.rows {
                values.push_null();
            }
        }
    }

    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                let name = PlSmallStr::from(name.as_str());
                match values {
                    Values::U64(v) => Column::new(name, v),
                    Values::I64(v) => Column::new(name, v),
                    Values::F64(v) => Column::new(name, v),
                    Values::Bool(v) => Column::new(name, v),
                    Values::Str(v) => Column::new(name, v),
                }
            })
            .collect();
        DataFrame::new(columns)
    }
}

/// Tables keyed by event target.
pub type Tables = BTreeMap<String, Table>;

thread_local! {
    static TABLES: RefCell<Tables> = RefCell::default();
}

/// Remove and return everything recorded on this thread.
pub fn take() -> Tables {
    TABLES.with(|t| std::mem::take(&mut *t.borrow_mut()))
}

/// Drop everything recorded on this thread.
pub fn reset() {
    TABLES.with(|t| t.borrow_mut().clear());
}

pub fn to_dataframes(tables: &Tables) -> PolarsResult<BTreeMap<String, DataFrame>> {
    tables
        .iter()
        .map(|(name, table)| -> PolarsResult<_> { Ok((name.clone(), table.to_dataframe()?)) })
        .collect()
}

// === SUBSCRIBER ===

struct RowVisitor<'a> {
    table: &'a mut Table,
}

/// Append `value` to the current row; a value whose type disagrees with the
/// column's first type leaves the cell null.
macro_rules! record_as {
    ($self:ident, $field:ident, $variant:ident, $value:expr) => {{
        let column = $self
            .table
            .cell($field.name(), |rows| Values::$variant(vec![None; rows]));
        if let Values::$variant(v) = column {
            v.push(Some($value));
        }
    }};
}

impl Visit for RowVisitor<'_> {
    fn record_u64(&mut self, field: &Field, value: u64) {
        record_as!(self, field, U64, value)
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        record_as!(self, field, I64, value)
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        record_as!(self, field, F64, value)
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        record_as!(self, field, Bool, value)
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        record_as!(self, field, Str, value.to_string())
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        record_as!(self, field, Str, format!("{value:?}"))
    }
}

/// Collects info-level events into this thread's tables. Spans are ignored.
pub struct TableSubscriber;

impl Subscriber for TableSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.is_event() && *metadata.level() <= tracing::Level::INFO
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        TABLES.with(|t| {
            let mut tables = t.borrow_mut();
            let table = tables
                .entry(event.metadata().target().to_string())
                .or_default();
            event.record(&mut RowVisitor { table: &mut *table });
            table.close_row();
        });
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

/// Install `TableSubscriber` process-wide. Later calls are no-ops.
pub fn install() {
    let _ = tracing::subscriber::set_global_default(TableSubscriber);
}

// === PARQUET ===

fn io_error(error: std::io::Error) -> PolarsError {
    PolarsError::IO {
        error: error.into(),
        msg: None,
    }
}

/// Write each frame to `{dir}/{name}.parquet`, creating `dir` if needed.
pub fn write_parquet(frames: &mut BTreeMap<String, DataFrame>, dir: &Path) -> PolarsResult<()> {
    std::fs::create_dir_all(dir).map_err(io_error)?;
    for (name, frame) in frames.iter_mut() {
        let file = std::fs::File::create(dir.join(format!("{name}.parquet"))).map_err(io_error)?;
        ParquetWriter::new(file).finish(frame)?;
    }
    Ok(())
}

/// Scope guard for one recorded run.
///
/// Starting clears this thread's tables and installs the subscriber. On drop
/// every table is written to `{parent}/{name}-{unix seconds}/` followed by an
/// empty `_ready` marker, so readers never see a half-written run.
pub struct RunRecorder {
    dir: PathBuf,
    frames: Option<BTreeMap<String, DataFrame>>,
}

impl RunRecorder {
    pub fn start(parent: impl Into<PathBuf>, name: &str) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        reset();
        install();
        Self {
            dir: parent.into().join(format!("{name}-{stamp}")),
            frames: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Frames recorded so far. The first call takes this thread's tables;
    /// later calls return the same frames.
    pub fn frames(&mut self) -> PolarsResult<&BTreeMap<String, DataFrame>> {
        if self.frames.is_none() {
            self.frames = Some(to_dataframes(&take())?);
        }
        Ok(self.frames.get_or_insert_with(BTreeMap::new))
    }

    fn flush(&mut self) -> PolarsResult<usize> {
        let mut frames = match self.frames.take() {
            Some(frames) => frames,
            None => to_dataframes(&take())?,
        };
        if frames.is_empty() {
            return Ok(0);
        }
        write_parquet(&mut frames, &self.dir)?;
        std::fs::File::create(self.dir.join("_ready")).map_err(io_error)?;
        Ok(frames.len())
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        match self.flush() {
            Ok(0) => {}
            Ok(n) => eprintln!("RunRecorder: wrote {n} tables to {}", self.dir.display()),
            Err(e) => eprintln!("RunRecorder({}): {e}", self.dir.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::subscriber::with_default;

    #[test]
    fn rows_stay_aligned_when_fields_come_and_go() {
        reset();
        with_default(TableSubscriber, || {
            tracing::info!(target: "trade", slot = 0u64, amount = 3.5f64);
            tracing::info!(target: "trade", slot = 1u64, role = "seller");
            tracing::info!(target: "trade", slot = 2u64, amount = -1.0f64);
        });

        let tables = take();
        let trade = &tables["trade"];
        assert_eq!(trade.rows(), 3);
        assert_eq!(trade.column_names().collect::<Vec<_>>(), vec!["slot", "amount", "role"]);
        assert_eq!(
            trade.column("slot").and_then(Values::as_u64),
            Some(&[Some(0), Some(1), Some(2)][..])
        );
        assert_eq!(
            trade.column("amount").and_then(Values::as_f64),
            Some(&[Some(3.5), None, Some(-1.0)][..])
        );
        assert_eq!(
            trade.column("role").and_then(Values::as_str),
            Some(&[None, Some("seller".to_string()), None][..])
        );
    }

    #[test]
    fn targets_map_to_separate_tables() {
        reset();
        with_default(TableSubscriber, || {
            tracing::info!(target: "slot", slot = 0u64);
            tracing::info!(target: "auction_iter", iteration = 1u64);
            tracing::info!(target: "auction_iter", iteration = 2u64);
            tracing::debug!(target: "auction_iter", iteration = 3u64);
        });

        let tables = take();
        assert_eq!(tables["slot"].rows(), 1);
        assert_eq!(tables["auction_iter"].rows(), 2);
        assert!(take().is_empty(), "take drains the thread's tables");
    }

    #[test]
    fn display_values_are_recorded_as_strings() {
        reset();
        let role = "buyer";
        with_default(TableSubscriber, || {
            tracing::info!(target: "roles", role = %role, flag = true);
        });
        let tables = take();
        let roles = &tables["roles"];
        assert_eq!(
            roles.column("role").and_then(Values::as_str),
            Some(&[Some("buyer".to_string())][..])
        );
        assert_eq!(roles.column("flag"), Some(&Values::Bool(vec![Some(true)])));
    }

    #[test]
    fn tables_convert_to_dataframes_with_nulls() {
        reset();
        with_default(TableSubscriber, || {
            tracing::info!(target: "t", x = 1.0f64);
            tracing::info!(target: "t", y = 2i64);
        });
        let frames = to_dataframes(&take()).unwrap();
        let df = &frames["t"];
        assert_eq!(df.height(), 2);
        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, ["x", "y"]);
        assert_eq!(df.column("x").unwrap().null_count(), 1);
        assert_eq!(df.column("y").unwrap().null_count(), 1);
    }

    #[test]
    fn recorder_writes_parquet_and_ready_marker() {
        let parent = std::env::temp_dir().join(format!("instrument-test-{}", std::process::id()));
        let dir = {
            let run = RunRecorder::start(&parent, "write test");
            with_default(TableSubscriber, || {
                tracing::info!(target: "slot", slot = 0u64, welfare = 1.5f64);
            });
            run.dir().to_path_buf()
        };

        assert!(dir.join("slot.parquet").exists());
        assert!(dir.join("_ready").exists());
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("write_test-"));
        let _ = std::fs::remove_dir_all(&parent);
    }
}
