//! Durable table store: one Parquet file per dataset.
//!
//! Layout under the store root:
//!
//! - `<identity>.parquet`: data plus [`TableMeta`] embedded in the key-value metadata
//! - `<identity>.profile.json`: optional profile side tables
//!
//! Raw header names never reach the file schema. Columns are positional (`_rowid`, `c0`, `c1`,
//! ...) and the names live in the embedded metadata, so data and metadata are replaced together
//! by a single rename.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parquet::column::writer::ColumnWriter;
use parquet::data_type::ByteArray;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::FileReader;
use parquet::file::serialized_reader::SerializedFileReader;
use parquet::file::writer::SerializedFileWriter;
use parquet::record::reader::RowIter;
use parquet::record::{Field as ParquetField, Row};
use parquet::schema::parser::parse_message_type;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Error, Result, StorageError};
use crate::ingestion::{ParsedTable, SourceKind};
use crate::types::{ColumnType, Field, Schema, Table, Value};

/// Key under which [`TableMeta`] is embedded in the Parquet footer.
pub const META_KEY: &str = "tabular.meta";

const DATA_EXT: &str = "parquet";
const ROW_GROUP_SIZE: usize = 64 * 1024;
const MAX_IDENTITY_LEN: usize = 128;
/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Everything persisted about a dataset besides its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub identity: String,
    pub source_kind: SourceKind,
    pub encoding: Option<String>,
    pub delimiter: Option<char>,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    /// Raw header names and inferred types, in column order.
    pub schema: Schema,
}

impl TableMeta {
    /// Metadata for a freshly parsed table, stamped now.
    pub fn for_parsed(identity: impl Into<String>, parsed: &ParsedTable) -> Self {
        Self {
            identity: identity.into(),
            source_kind: parsed.source_kind,
            encoding: parsed.encoding.clone(),
            delimiter: parsed.delimiter,
            created_at: Utc::now(),
            row_count: parsed.table.row_count(),
            schema: parsed.table.schema.clone(),
        }
    }
}

/// A persisted row: 1-based `rowid` plus values in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub rowid: i64,
    pub values: Vec<Value>,
}

/// Directory-backed store of immutable Parquet tables.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the data file for `identity`.
    pub fn data_path(&self, identity: &str) -> Result<PathBuf> {
        check_identity(identity)?;
        Ok(self.root.join(format!("{identity}.{DATA_EXT}")))
    }

    fn sidecar_path(&self, identity: &str, name: &str) -> Result<PathBuf> {
        check_identity(identity)?;
        Ok(self.root.join(format!("{identity}.{name}.json")))
    }

    /// Returns `true` when a data file exists for `identity`.
    pub fn exists(&self, identity: &str) -> bool {
        self.data_path(identity).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Time since the data file for `identity` was last replaced; `None` if it does not exist.
    pub fn age(&self, identity: &str) -> Result<Option<Duration>> {
        let path = self.data_path(identity)?;
        match fs::metadata(&path) {
            Ok(m) => {
                let modified = m.modified()?;
                Ok(Some(
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or_default(),
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `table`, atomically replacing any previous version.
    ///
    /// Rows are written to a temporary file in the store directory which is renamed over the
    /// final path once complete. On failure the temporary file is removed and the previous
    /// version, if any, is untouched.
    pub fn write(&self, table: &Table, meta: &TableMeta) -> Result<()> {
        let path = self.data_path(&meta.identity)?;
        if table.column_count() != meta.schema.len() {
            return Err(corrupt(&meta.identity, "schema does not match table width"));
        }

        let schema = Arc::new(parse_message_type(&message_type(&table.schema))?);
        let meta_json = serde_json::to_string(meta).map_err(StorageError::from)?;
        let props = Arc::new(
            WriterProperties::builder()
                .set_key_value_metadata(Some(vec![KeyValue::new(META_KEY.to_string(), meta_json)]))
                .build(),
        );

        let tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".parquet.tmp")
            .tempfile_in(&self.root)?;
        let mut writer = SerializedFileWriter::new(tmp.as_file().try_clone()?, schema, props)?;

        for (group_idx, chunk) in table.rows.chunks(ROW_GROUP_SIZE).enumerate() {
            let first_rowid = (group_idx * ROW_GROUP_SIZE) as i64 + 1;
            let mut rg = writer.next_row_group()?;
            let mut col_idx = 0usize;
            while let Some(mut col) = rg.next_column()? {
                if col_idx == 0 {
                    let rowids: Vec<i64> = (0..chunk.len() as i64).map(|i| first_rowid + i).collect();
                    match col.untyped() {
                        ColumnWriter::Int64ColumnWriter(w) => {
                            w.write_batch(&rowids, None, None)?;
                        }
                        _ => return Err(corrupt(&meta.identity, "unexpected rowid column type")),
                    }
                } else {
                    let field = &table.schema.fields[col_idx - 1];
                    write_column(col.untyped(), field, chunk, col_idx - 1)
                        .map_err(|message| corrupt(&meta.identity, &message))??;
                }
                col.close()?;
                col_idx += 1;
            }
            rg.close()?;
        }
        writer.close()?;

        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        tracing::debug!(
            target: "storage",
            identity = %meta.identity,
            rows = table.row_count(),
            columns = table.column_count(),
            "table persisted"
        );
        Ok(())
    }

    /// Open a read handle on the current version of `identity`.
    ///
    /// The handle keeps the file open, so a later replace does not affect scans through it.
    pub fn read(&self, identity: &str) -> Result<TableHandle> {
        let path = self.data_path(identity)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(identity.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let reader = SerializedFileReader::new(file.try_clone()?)?;
        let file_meta = reader.metadata().file_metadata();
        let raw_meta = file_meta
            .key_value_metadata()
            .and_then(|kvs| kvs.iter().find(|kv| kv.key == META_KEY))
            .and_then(|kv| kv.value.clone())
            .ok_or_else(|| corrupt(identity, "missing embedded metadata"))?;
        let meta: TableMeta = serde_json::from_str(&raw_meta).map_err(StorageError::from)?;

        let leaf_columns = file_meta.schema_descr().num_columns();
        if leaf_columns != meta.schema.len() + 1 {
            return Err(corrupt(
                identity,
                &format!(
                    "file has {leaf_columns} columns, metadata declares {}",
                    meta.schema.len()
                ),
            ));
        }

        Ok(TableHandle { meta, file })
    }

    /// Delete the data file and side tables of `identity`. Missing files are not an error.
    pub fn remove(&self, identity: &str) -> Result<()> {
        let data = self.data_path(identity)?;
        for path in [data, self.sidecar_path(identity, "profile")?] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(target: "storage", %identity, "dataset removed");
        Ok(())
    }

    /// Identities of all persisted datasets, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                Error::from(e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if check_identity(stem).is_ok() {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Atomically write a JSON side table for `identity`.
    pub fn write_sidecar<T: Serialize>(&self, identity: &str, name: &str, value: &T) -> Result<()> {
        let path = self.sidecar_path(identity, name)?;
        write_json_atomic(&self.root, &path, value)
    }

    /// Read a JSON side table; `None` when it was never written.
    pub fn read_sidecar<T: DeserializeOwned>(&self, identity: &str, name: &str) -> Result<Option<T>> {
        let path = self.sidecar_path(identity, name)?;
        read_json(&path)
    }
}

/// An open, immutable version of a dataset.
#[derive(Debug)]
pub struct TableHandle {
    meta: TableMeta,
    file: File,
}

impl TableHandle {
    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn schema(&self) -> &Schema {
        &self.meta.schema
    }

    pub fn row_count(&self) -> usize {
        self.meta.row_count
    }

    /// Iterate rows in `rowid` order.
    pub fn scan(&self) -> Result<RowScan> {
        let reader = SerializedFileReader::new(self.file.try_clone()?)?;
        Ok(RowScan {
            rows: reader.into_iter(),
            types: self
                .meta
                .schema
                .fields
                .iter()
                .map(|f| f.column_type)
                .collect(),
            identity: self.meta.identity.clone(),
        })
    }

    /// Read every row into memory.
    pub fn load(&self) -> Result<Table> {
        let rows = self
            .scan()?
            .map(|r| r.map(|row| row.values))
            .collect::<Result<Vec<_>>>()?;
        Ok(Table::new(self.meta.schema.clone(), rows))
    }
}

/// Lazy row iterator over a [`TableHandle`].
pub struct RowScan {
    rows: RowIter<'static>,
    types: Vec<ColumnType>,
    identity: String,
}

impl std::fmt::Debug for RowScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowScan")
            .field("identity", &self.identity)
            .field("columns", &self.types.len())
            .finish()
    }
}

impl Iterator for RowScan {
    type Item = Result<StoredRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.rows.next()? {
            Ok(row) => row,
            Err(e) => return Some(Err(e.into())),
        };
        Some(decode_row(&row, &self.types).map_err(|message| corrupt(&self.identity, &message)))
    }
}

fn decode_row(row: &Row, types: &[ColumnType]) -> std::result::Result<StoredRow, String> {
    let mut cols = row.get_column_iter();
    let rowid = match cols.next() {
        Some((_, ParquetField::Long(id))) => *id,
        other => return Err(format!("bad rowid field: {other:?}")),
    };
    let mut values = Vec::with_capacity(types.len());
    for (column_type, (name, field)) in types.iter().zip(cols) {
        values.push(decode_field(*column_type, field).ok_or_else(|| {
            format!("column {name}: {field:?} does not fit {column_type}")
        })?);
    }
    if values.len() != types.len() {
        return Err(format!("row {rowid} has {} values", values.len()));
    }
    Ok(StoredRow { rowid, values })
}

fn decode_field(column_type: ColumnType, field: &ParquetField) -> Option<Value> {
    match (column_type, field) {
        (_, ParquetField::Null) => Some(Value::Null),
        (ColumnType::Boolean, ParquetField::Bool(b)) => Some(Value::Bool(*b)),
        (
            ColumnType::Identifier | ColumnType::Time | ColumnType::Text,
            ParquetField::Str(s),
        ) => Some(Value::Text(s.clone())),
        (ColumnType::Number | ColumnType::Duration, ParquetField::Double(n)) => {
            Some(Value::Number(*n))
        }
        (ColumnType::Date, ParquetField::Date(days)) => {
            NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE).map(Value::Date)
        }
        (ColumnType::DateTime, ParquetField::TimestampMillis(ms)) => {
            DateTime::from_timestamp_millis(*ms).map(|dt| Value::DateTime(dt.naive_utc()))
        }
        _ => None,
    }
}

/// Parquet schema for a table: required `_rowid` then one optional column per field.
fn message_type(schema: &Schema) -> String {
    let mut out = String::from("message tabular {\n  REQUIRED INT64 _rowid;\n");
    for (idx, field) in schema.fields.iter().enumerate() {
        out.push_str(&format!("  OPTIONAL {} c{idx}{};\n", physical_type(field.column_type), annotation(field.column_type)));
    }
    out.push('}');
    out
}

fn physical_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Identifier | ColumnType::Time | ColumnType::Text => "BINARY",
        ColumnType::Number | ColumnType::Duration => "DOUBLE",
        ColumnType::Date => "INT32",
        ColumnType::DateTime => "INT64",
    }
}

fn annotation(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Identifier | ColumnType::Time | ColumnType::Text => " (UTF8)",
        ColumnType::Date => " (DATE)",
        ColumnType::DateTime => " (TIMESTAMP_MILLIS)",
        ColumnType::Boolean | ColumnType::Number | ColumnType::Duration => "",
    }
}

/// Non-null values of one column plus definition levels (1 = present, 0 = null).
fn levels<T>(
    rows: &[Vec<Value>],
    idx: usize,
    field: &Field,
    extract: impl Fn(&Value) -> Option<T>,
) -> std::result::Result<(Vec<T>, Vec<i16>), String> {
    let mut values = Vec::with_capacity(rows.len());
    let mut defs = Vec::with_capacity(rows.len());
    for row in rows {
        match row.get(idx).unwrap_or(&Value::Null) {
            Value::Null => defs.push(0),
            v => {
                let x = extract(v).ok_or_else(|| {
                    format!("value {v:?} in column '{}' is not {}", field.name, field.column_type)
                })?;
                values.push(x);
                defs.push(1);
            }
        }
    }
    Ok((values, defs))
}

/// Write one column chunk. The outer `Result` carries layout mismatches, the inner one writer
/// errors.
fn write_column(
    writer: &mut ColumnWriter<'_>,
    field: &Field,
    rows: &[Vec<Value>],
    idx: usize,
) -> std::result::Result<Result<()>, String> {
    let written = match (field.column_type, writer) {
        (ColumnType::Boolean, ColumnWriter::BoolColumnWriter(w)) => {
            let (vals, defs) = levels(rows, idx, field, |v| match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            })?;
            w.write_batch(&vals, Some(&defs), None)
        }
        (
            ColumnType::Identifier | ColumnType::Time | ColumnType::Text,
            ColumnWriter::ByteArrayColumnWriter(w),
        ) => {
            let (vals, defs) = levels(rows, idx, field, |v| match v {
                Value::Text(s) => Some(ByteArray::from(s.as_str())),
                _ => None,
            })?;
            w.write_batch(&vals, Some(&defs), None)
        }
        (ColumnType::Number | ColumnType::Duration, ColumnWriter::DoubleColumnWriter(w)) => {
            let (vals, defs) = levels(rows, idx, field, |v| match v {
                Value::Number(n) => Some(*n),
                _ => None,
            })?;
            w.write_batch(&vals, Some(&defs), None)
        }
        (ColumnType::Date, ColumnWriter::Int32ColumnWriter(w)) => {
            let (vals, defs) = levels(rows, idx, field, |v| match v {
                Value::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                _ => None,
            })?;
            w.write_batch(&vals, Some(&defs), None)
        }
        (ColumnType::DateTime, ColumnWriter::Int64ColumnWriter(w)) => {
            let (vals, defs) = levels(rows, idx, field, |v| match v {
                Value::DateTime(dt) => Some(dt.and_utc().timestamp_millis()),
                _ => None,
            })?;
            w.write_batch(&vals, Some(&defs), None)
        }
        (column_type, _) => {
            return Err(format!("no writer for column '{}' of type {column_type}", field.name));
        }
    };
    Ok(written.map(|_| ()).map_err(Error::from))
}

fn corrupt(identity: &str, message: &str) -> Error {
    Error::Storage(StorageError::Corrupt {
        identity: identity.to_string(),
        message: message.to_string(),
    })
}

/// Identities are hex digests; anything else could escape the store root.
fn check_identity(identity: &str) -> Result<()> {
    if identity.is_empty()
        || identity.len() > MAX_IDENTITY_LEN
        || !identity.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(Error::NotFound(identity.to_string()));
    }
    Ok(())
}

/// Serialize `value` to a temp file in `dir` and rename it over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<()> {
    let tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".json.tmp")
        .tempfile_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file());
        serde_json::to_writer(&mut w, value).map_err(StorageError::from)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(
            serde_json::from_slice(&bytes).map_err(StorageError::from)?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> (Table, TableMeta) {
        let schema = Schema::new(vec![
            Field::new("flag", ColumnType::Boolean),
            Field::new("name", ColumnType::Text),
            Field::new("amount", ColumnType::Number),
            Field::new("day", ColumnType::Date),
            Field::new("at", ColumnType::DateTime),
        ]);
        let day = NaiveDate::from_ymd_opt(2020, 2, 29).unwrap();
        let rows = vec![
            vec![
                Value::Bool(true),
                Value::Text("Ada".into()),
                Value::Number(1.5),
                Value::Date(day),
                Value::DateTime(day.and_hms_opt(13, 45, 0).unwrap()),
            ],
            vec![Value::Null, Value::Null, Value::Null, Value::Null, Value::Null],
        ];
        let table = Table::new(schema.clone(), rows);
        let meta = TableMeta {
            identity: "abc123".into(),
            source_kind: SourceKind::Csv,
            encoding: Some("UTF-8".into()),
            delimiter: Some(';'),
            created_at: Utc::now(),
            row_count: 2,
            schema,
        };
        (table, meta)
    }

    #[test]
    fn write_then_read_preserves_types_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        let (table, meta) = sample();
        store.write(&table, &meta).unwrap();

        let handle = store.read("abc123").unwrap();
        assert_eq!(handle.meta(), &meta);
        let rows: Vec<StoredRow> = handle.scan().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rowid, 1);
        assert_eq!(rows[1].rowid, 2);
        assert_eq!(rows[0].values, table.rows[0]);
        assert_eq!(rows[1].values, table.rows[1]);
    }

    #[test]
    fn open_handle_survives_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        let (table, meta) = sample();
        store.write(&table, &meta).unwrap();
        let handle = store.read("abc123").unwrap();

        let replacement = Table::new(meta.schema.clone(), vec![table.rows[1].clone()]);
        let new_meta = TableMeta {
            row_count: 1,
            ..meta.clone()
        };
        store.write(&replacement, &new_meta).unwrap();

        assert_eq!(handle.scan().unwrap().count(), 2);
        assert_eq!(store.read("abc123").unwrap().scan().unwrap().count(), 1);
    }

    #[test]
    fn unsafe_identities_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        assert!(matches!(store.read("../etc/passwd"), Err(Error::NotFound(_))));
        assert!(matches!(store.read("deadbeef"), Err(Error::NotFound(_))));
        assert!(!store.exists("a/b"));
    }

    #[test]
    fn list_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path()).unwrap();
        let (table, meta) = sample();
        store.write(&table, &meta).unwrap();
        store
            .write_sidecar("abc123", "profile", &serde_json::json!({"ok": true}))
            .unwrap();
        assert_eq!(store.list().unwrap(), vec!["abc123".to_string()]);

        store.remove("abc123").unwrap();
        assert!(store.list().unwrap().is_empty());
        let sidecar: Option<serde_json::Value> = store.read_sidecar("abc123", "profile").unwrap();
        assert!(sidecar.is_none());
    }
}
