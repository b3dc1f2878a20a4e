//! Changeset engine for diffable database files
//!
//! A changeset is a row-level diff between two SQLite / GeoPackage files.
//! Rows are matched by primary key; tables without one are ignored, as are
//! SQLite internal tables and spatial index tables (`rtree_*`).
//!
//! Changeset file layout:
//!
//! ```text
//! magic    4 bytes  "GSCS"
//! version  4 bytes  u32 LE
//! body     zstd(bincode(Changeset))
//! ```

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use zstd::stream::{decode_all as zstd_decode, encode_all as zstd_encode};

use crate::model::VersionName;

/// Changeset file magic
pub const CHANGESET_MAGIC: &[u8; 4] = b"GSCS";

/// Changeset format version
pub const CHANGESET_VERSION: u32 = 1;

const ZSTD_LEVEL: i32 = 3;

/// Errors raised by a [`ChangesetEngine`]
#[derive(Debug, thiserror::Error)]
pub enum ChangesetError {
    #[error("Failed to compute changeset: {0}")]
    Compute(String),

    #[error("Failed to apply changeset: {0}")]
    Apply(String),

    #[error("Changeset conflict: {0}")]
    Conflict(String),

    #[error("Changeset I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChangesetResult<T> = std::result::Result<T, ChangesetError>;

/// Diff engine for a versioned file format.
///
/// All calls block; run them on a blocking thread.
pub trait ChangesetEngine: Send + Sync + std::fmt::Debug {
    /// Write the changeset turning `base` into `target` to `out`.
    fn diff(&self, base: &Path, target: &Path, out: &Path) -> ChangesetResult<()>;

    /// Apply a changeset to `base` in place. On error `base` is unchanged.
    fn apply(&self, base: &Path, changeset: &Path) -> ChangesetResult<()>;

    /// Per-table operation counts.
    fn summarize(&self, changeset: &Path) -> ChangesetResult<ChangesetSummary>;

    /// Row-level changes in application order.
    fn list_changes(&self, changeset: &Path) -> ChangesetResult<Vec<RowChange>>;
}

/// One database cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for CellValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(f) => CellValue::Real(f),
            ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => CellValue::Blob(b.to_vec()),
        }
    }
}

impl From<&CellValue> for Value {
    fn from(v: &CellValue) -> Self {
        match v {
            CellValue::Null => Value::Null,
            CellValue::Integer(i) => Value::Integer(*i),
            CellValue::Real(f) => Value::Real(*f),
            CellValue::Text(t) => Value::Text(t.clone()),
            CellValue::Blob(b) => Value::Blob(b.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
}

/// Value of one column before and after a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<CellValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<CellValue>,
}

/// A row-level change as presented to clients.
///
/// Updates list primary key columns plus the columns that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub operation: RowOperation,
    pub changes: Vec<ColumnChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub table: String,
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
}

/// Per-table operation counts of a changeset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetSummary {
    pub tables: Vec<TableSummary>,
}

impl ChangesetSummary {
    pub fn table(&self, name: &str) -> Option<&TableSummary> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn total(&self) -> u64 {
        self.tables.iter().map(|t| t.insert + t.update + t.delete).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RowDelta {
    Insert(Vec<CellValue>),
    Update { old: Vec<CellValue>, new: Vec<CellValue> },
    Delete(Vec<CellValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableChangeset {
    name: String,
    columns: Vec<String>,
    /// Indexes into `columns`, in key order
    primary_key: Vec<usize>,
    rows: Vec<RowDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Changeset {
    tables: Vec<TableChangeset>,
}

#[derive(Debug, Clone, PartialEq)]
struct TableSchema {
    columns: Vec<String>,
    primary_key: Vec<usize>,
}

/// Row-level changeset engine for SQLite and GeoPackage files
#[derive(Debug, Default, Clone)]
pub struct SqliteChangesetEngine;

impl SqliteChangesetEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ChangesetEngine for SqliteChangesetEngine {
    fn diff(&self, base: &Path, target: &Path, out: &Path) -> ChangesetResult<()> {
        let base_conn = open_read_only(base)?;
        let target_conn = open_read_only(target)?;

        let base_schema = read_schema(&base_conn).map_err(compute)?;
        let target_schema = read_schema(&target_conn).map_err(compute)?;
        if base_schema.keys().ne(target_schema.keys()) {
            return Err(ChangesetError::Compute(
                "Table sets differ between base and target".to_string(),
            ));
        }

        let mut changeset = Changeset::default();
        for (table, schema) in &base_schema {
            if target_schema.get(table) != Some(schema) {
                return Err(ChangesetError::Compute(format!(
                    "Schema of table '{}' differs",
                    table
                )));
            }
            if schema.primary_key.is_empty() {
                tracing::debug!("Skipping table {} without primary key", table);
                continue;
            }
            let old_rows = read_rows(&base_conn, table, schema).map_err(compute)?;
            let new_rows = read_rows(&target_conn, table, schema).map_err(compute)?;
            let rows = diff_rows(old_rows, new_rows);
            if !rows.is_empty() {
                changeset.tables.push(TableChangeset {
                    name: table.clone(),
                    columns: schema.columns.clone(),
                    primary_key: schema.primary_key.clone(),
                    rows,
                });
            }
        }

        write_changeset(out, &changeset)
    }

    fn apply(&self, base: &Path, changeset: &Path) -> ChangesetResult<()> {
        let changeset = read_changeset(changeset)?;
        if !base.exists() {
            return Err(ChangesetError::Apply(format!(
                "Base file {} does not exist",
                base.display()
            )));
        }
        let mut conn = Connection::open_with_flags(base, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(apply_err)?;
        let schema = read_schema(&conn).map_err(apply_err)?;
        let tx = conn.transaction().map_err(apply_err)?;
        for table in &changeset.tables {
            let current = schema.get(&table.name).ok_or_else(|| {
                ChangesetError::Conflict(format!("Table '{}' missing in base", table.name))
            })?;
            if current.columns != table.columns {
                return Err(ChangesetError::Conflict(format!(
                    "Columns of table '{}' differ from changeset",
                    table.name
                )));
            }
            for row in &table.rows {
                apply_row(&tx, table, row)?;
            }
        }
        tx.commit().map_err(apply_err)?;
        Ok(())
    }

    fn summarize(&self, changeset: &Path) -> ChangesetResult<ChangesetSummary> {
        let changeset = read_changeset(changeset)?;
        let tables = changeset
            .tables
            .iter()
            .map(|t| {
                let mut summary = TableSummary {
                    table: t.name.clone(),
                    ..Default::default()
                };
                for row in &t.rows {
                    match row {
                        RowDelta::Insert(_) => summary.insert += 1,
                        RowDelta::Update { .. } => summary.update += 1,
                        RowDelta::Delete(_) => summary.delete += 1,
                    }
                }
                summary
            })
            .collect();
        Ok(ChangesetSummary { tables })
    }

    fn list_changes(&self, changeset: &Path) -> ChangesetResult<Vec<RowChange>> {
        let changeset = read_changeset(changeset)?;
        let mut out = Vec::new();
        for table in &changeset.tables {
            for row in &table.rows {
                out.push(describe_row(table, row));
            }
        }
        Ok(out)
    }
}

fn compute(e: rusqlite::Error) -> ChangesetError {
    ChangesetError::Compute(e.to_string())
}

fn apply_err(e: rusqlite::Error) -> ChangesetError {
    ChangesetError::Apply(e.to_string())
}

fn open_read_only(path: &Path) -> ChangesetResult<Connection> {
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| ChangesetError::Compute(format!("{}: {}", path.display(), e)))
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn is_internal_table(name: &str, sql: &str) -> bool {
    name.starts_with("sqlite_")
        || name.starts_with("rtree_")
        || sql.trim_start().to_uppercase().starts_with("CREATE VIRTUAL TABLE")
}

fn read_schema(conn: &Connection) -> rusqlite::Result<BTreeMap<String, TableSchema>> {
    let mut stmt =
        conn.prepare("SELECT name, COALESCE(sql, '') FROM sqlite_master WHERE type = 'table'")?;
    let tables = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut schema = BTreeMap::new();
    for (name, sql) in tables {
        if is_internal_table(&name, &sql) {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote(&name)))?;
        let cols = info
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut keyed: Vec<(i64, usize)> = cols
            .iter()
            .enumerate()
            .filter(|(_, (_, pk))| *pk > 0)
            .map(|(i, (_, pk))| (*pk, i))
            .collect();
        keyed.sort();
        schema.insert(
            name,
            TableSchema {
                columns: cols.into_iter().map(|(c, _)| c).collect(),
                primary_key: keyed.into_iter().map(|(_, i)| i).collect(),
            },
        );
    }
    Ok(schema)
}

/// Rows keyed by the bincode encoding of their primary key.
fn read_rows(
    conn: &Connection,
    table: &str,
    schema: &TableSchema,
) -> rusqlite::Result<BTreeMap<Vec<u8>, Vec<CellValue>>> {
    let cols = schema
        .columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!("SELECT {} FROM {}", cols, quote(table)))?;
    let width = schema.columns.len();
    let mut rows = stmt.query([])?;
    let mut out = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(CellValue::from(row.get_ref(i)?));
        }
        out.insert(row_key(&values, &schema.primary_key), values);
    }
    Ok(out)
}

fn row_key(values: &[CellValue], primary_key: &[usize]) -> Vec<u8> {
    let key: Vec<&CellValue> = primary_key.iter().map(|&i| &values[i]).collect();
    bincode::serialize(&key).unwrap_or_default()
}

fn diff_rows(
    mut old: BTreeMap<Vec<u8>, Vec<CellValue>>,
    new: BTreeMap<Vec<u8>, Vec<CellValue>>,
) -> Vec<RowDelta> {
    let mut deltas = Vec::new();
    for (key, new_values) in new {
        match old.remove(&key) {
            None => deltas.push(RowDelta::Insert(new_values)),
            Some(old_values) if old_values != new_values => deltas.push(RowDelta::Update {
                old: old_values,
                new: new_values,
            }),
            Some(_) => {}
        }
    }
    deltas.extend(old.into_values().map(RowDelta::Delete));
    deltas
}

fn key_clause(table: &TableChangeset, first_param: usize) -> String {
    table
        .primary_key
        .iter()
        .enumerate()
        .map(|(n, &i)| format!("{} IS ?{}", quote(&table.columns[i]), first_param + n))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn key_params(table: &TableChangeset, values: &[CellValue]) -> Vec<Value> {
    table
        .primary_key
        .iter()
        .map(|&i| Value::from(&values[i]))
        .collect()
}

fn fetch_row(
    conn: &Connection,
    table: &TableChangeset,
    key_values: &[CellValue],
) -> ChangesetResult<Option<Vec<CellValue>>> {
    let cols = table
        .columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        cols,
        quote(&table.name),
        key_clause(table, 1)
    );
    let mut stmt = conn.prepare(&sql).map_err(apply_err)?;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(key_params(table, key_values)))
        .map_err(apply_err)?;
    match rows.next().map_err(apply_err)? {
        Some(row) => {
            let mut values = Vec::with_capacity(table.columns.len());
            for i in 0..table.columns.len() {
                values.push(CellValue::from(row.get_ref(i).map_err(apply_err)?));
            }
            Ok(Some(values))
        }
        None => Ok(None),
    }
}

fn apply_row(conn: &Connection, table: &TableChangeset, row: &RowDelta) -> ChangesetResult<()> {
    let name = quote(&table.name);
    match row {
        RowDelta::Insert(values) => {
            if fetch_row(conn, table, values)?.is_some() {
                return Err(ChangesetError::Conflict(format!(
                    "Row inserted into '{}' already exists",
                    table.name
                )));
            }
            let cols = table
                .columns
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=values.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute(
                &format!("INSERT INTO {} ({}) VALUES ({})", name, cols, placeholders),
                rusqlite::params_from_iter(values.iter().map(Value::from)),
            )
            .map_err(apply_err)?;
        }
        RowDelta::Update { old, new } => {
            if fetch_row(conn, table, old)?.as_ref() != Some(old) {
                return Err(ChangesetError::Conflict(format!(
                    "Row updated in '{}' does not match the expected old values",
                    table.name
                )));
            }
            let assignments = table
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                name,
                assignments,
                key_clause(table, new.len() + 1)
            );
            let mut params: Vec<Value> = new.iter().map(Value::from).collect();
            params.extend(key_params(table, old));
            conn.execute(&sql, rusqlite::params_from_iter(params))
                .map_err(apply_err)?;
        }
        RowDelta::Delete(values) => {
            if fetch_row(conn, table, values)?.as_ref() != Some(values) {
                return Err(ChangesetError::Conflict(format!(
                    "Row deleted from '{}' does not match the expected values",
                    table.name
                )));
            }
            conn.execute(
                &format!("DELETE FROM {} WHERE {}", name, key_clause(table, 1)),
                rusqlite::params_from_iter(key_params(table, values)),
            )
            .map_err(apply_err)?;
        }
    }
    Ok(())
}

fn describe_row(table: &TableChangeset, row: &RowDelta) -> RowChange {
    let columns = &table.columns;
    let (operation, changes) = match row {
        RowDelta::Insert(values) => (
            RowOperation::Insert,
            columns
                .iter()
                .zip(values)
                .map(|(c, v)| ColumnChange {
                    column: c.clone(),
                    old: None,
                    new: Some(v.clone()),
                })
                .collect(),
        ),
        RowDelta::Delete(values) => (
            RowOperation::Delete,
            columns
                .iter()
                .zip(values)
                .map(|(c, v)| ColumnChange {
                    column: c.clone(),
                    old: Some(v.clone()),
                    new: None,
                })
                .collect(),
        ),
        RowDelta::Update { old, new } => (
            RowOperation::Update,
            columns
                .iter()
                .enumerate()
                .filter(|(i, _)| table.primary_key.contains(i) || old[*i] != new[*i])
                .map(|(i, c)| ColumnChange {
                    column: c.clone(),
                    old: Some(old[i].clone()),
                    new: Some(new[i].clone()),
                })
                .collect(),
        ),
    };
    RowChange {
        table: table.name.clone(),
        operation,
        changes,
    }
}

fn write_changeset(out: &Path, changeset: &Changeset) -> ChangesetResult<()> {
    let body = bincode::serialize(changeset)
        .map_err(|e| ChangesetError::Compute(format!("Failed to encode changeset: {}", e)))?;
    let compressed = zstd_encode(&body[..], ZSTD_LEVEL)?;
    let mut data = Vec::with_capacity(8 + compressed.len());
    data.extend_from_slice(CHANGESET_MAGIC);
    data.extend_from_slice(&CHANGESET_VERSION.to_le_bytes());
    data.extend_from_slice(&compressed);
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, data)?;
    Ok(())
}

fn read_changeset(path: &Path) -> ChangesetResult<Changeset> {
    let data = fs::read(path)?;
    if data.len() < 8 || &data[..4] != CHANGESET_MAGIC {
        return Err(ChangesetError::Apply(format!(
            "{} is not a changeset file",
            path.display()
        )));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&data[4..8]);
    let version = u32::from_le_bytes(version);
    if version != CHANGESET_VERSION {
        return Err(ChangesetError::Apply(format!(
            "Unsupported changeset version {}",
            version
        )));
    }
    let body = zstd_decode(&data[8..])?;
    bincode::deserialize(&body)
        .map_err(|e| ChangesetError::Apply(format!("Corrupted changeset body: {}", e)))
}

/// On-disk cache of derived changeset products.
///
/// Entries live under `<project>/cache/<version>/<sha256(path)>-<kind>.json`.
#[derive(Debug, Clone)]
pub struct ChangesetCache {
    root: PathBuf,
}

impl ChangesetCache {
    pub const SUMMARY: &'static str = "summary";
    pub const CHANGES: &'static str = "changes";

    /// Cache rooted at a project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: project_root.into().join("cache"),
        }
    }

    pub fn entry_path(&self, version: VersionName, path: &str, kind: &str) -> PathBuf {
        let key = hex::encode(Sha256::digest(path.as_bytes()));
        self.root
            .join(version.to_string())
            .join(format!("{}-{}.json", key, kind))
    }

    /// Cached value, if present and readable.
    pub fn load<T: DeserializeOwned>(&self, version: VersionName, path: &str, kind: &str) -> Option<T> {
        let file = self.entry_path(version, path, kind);
        let data = fs::read_to_string(&file).ok()?;
        match serde_json::from_str(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache entry {:?}: {}", file, e);
                None
            }
        }
    }

    pub fn store<T: Serialize>(
        &self,
        version: VersionName,
        path: &str,
        kind: &str,
        value: &T,
    ) -> std::io::Result<()> {
        let file = self.entry_path(version, path, kind);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = file.with_extension("tmp");
        let data = serde_json::to_string(value).map_err(std::io::Error::other)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_db(path: &Path, rows: &[(i64, &str, f64)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE points (fid INTEGER PRIMARY KEY, name TEXT, value REAL);
             CREATE TABLE notes (body TEXT);",
        )
        .unwrap();
        for (fid, name, value) in rows {
            conn.execute(
                "INSERT INTO points (fid, name, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![fid, name, value],
            )
            .unwrap();
        }
    }

    fn dump(path: &Path) -> Vec<(i64, String, f64)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT fid, name, value FROM points ORDER BY fid")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    fn fixture(tmp: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
        let base = tmp.path().join("base.gpkg");
        let target = tmp.path().join("target.gpkg");
        make_db(&base, &[(1, "a", 1.0), (2, "b", 2.0), (3, "c", 3.0)]);
        make_db(&target, &[(1, "a", 1.0), (2, "B", 2.5), (4, "d", 4.0)]);
        let diff = tmp.path().join("changes.diff");
        SqliteChangesetEngine::new()
            .diff(&base, &target, &diff)
            .unwrap();
        (base, target, diff)
    }

    #[test]
    fn test_diff_and_summarize() {
        let tmp = TempDir::new().unwrap();
        let (_, _, diff) = fixture(&tmp);
        let summary = SqliteChangesetEngine::new().summarize(&diff).unwrap();
        let points = summary.table("points").unwrap();
        assert_eq!((points.insert, points.update, points.delete), (1, 1, 1));
        assert!(summary.table("notes").is_none());
        assert_eq!(summary.total(), 3);

        let data = fs::read(&diff).unwrap();
        assert_eq!(&data[..4], CHANGESET_MAGIC);
    }

    #[test]
    fn test_apply_reproduces_target() {
        let tmp = TempDir::new().unwrap();
        let (base, target, diff) = fixture(&tmp);
        let engine = SqliteChangesetEngine::new();
        engine.apply(&base, &diff).unwrap();
        assert_eq!(dump(&base), dump(&target));
    }

    #[test]
    fn test_apply_conflict_leaves_base_unchanged() {
        let tmp = TempDir::new().unwrap();
        let (_, _, diff) = fixture(&tmp);
        let other = tmp.path().join("other.gpkg");
        // row 3 was already edited: delete of the old row must conflict
        make_db(&other, &[(1, "a", 1.0), (2, "b", 2.0), (3, "changed", 3.0)]);
        let before = dump(&other);

        let err = SqliteChangesetEngine::new().apply(&other, &diff).unwrap_err();
        assert!(matches!(err, ChangesetError::Conflict(_)));
        assert_eq!(dump(&other), before);
    }

    #[test]
    fn test_apply_twice_conflicts() {
        let tmp = TempDir::new().unwrap();
        let (base, _, diff) = fixture(&tmp);
        let engine = SqliteChangesetEngine::new();
        engine.apply(&base, &diff).unwrap();
        let err = engine.apply(&base, &diff).unwrap_err();
        assert!(matches!(err, ChangesetError::Conflict(_)));
    }

    #[test]
    fn test_list_changes() {
        let tmp = TempDir::new().unwrap();
        let (_, _, diff) = fixture(&tmp);
        let changes = SqliteChangesetEngine::new().list_changes(&diff).unwrap();
        assert_eq!(changes.len(), 3);

        let update = changes
            .iter()
            .find(|c| c.operation == RowOperation::Update)
            .unwrap();
        let columns: Vec<&str> = update.changes.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(columns, vec!["fid", "name", "value"]);
        assert_eq!(update.changes[1].new, Some(CellValue::Text("B".into())));

        let delete = changes
            .iter()
            .find(|c| c.operation == RowOperation::Delete)
            .unwrap();
        assert_eq!(delete.changes[0].old, Some(CellValue::Integer(3)));
    }

    #[test]
    fn test_diff_rejects_non_database() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base.gpkg");
        let bogus = tmp.path().join("bogus.gpkg");
        make_db(&base, &[]);
        fs::write(&bogus, b"this is definitely not an sqlite database file").unwrap();
        let err = SqliteChangesetEngine::new()
            .diff(&base, &bogus, &tmp.path().join("out.diff"))
            .unwrap_err();
        assert!(matches!(err, ChangesetError::Compute(_)));
    }

    #[test]
    fn test_diff_rejects_schema_change() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base.gpkg");
        let target = tmp.path().join("target.gpkg");
        make_db(&base, &[]);
        make_db(&target, &[]);
        Connection::open(&target)
            .unwrap()
            .execute_batch("ALTER TABLE points ADD COLUMN extra TEXT")
            .unwrap();
        let err = SqliteChangesetEngine::new()
            .diff(&base, &target, &tmp.path().join("out.diff"))
            .unwrap_err();
        assert!(matches!(err, ChangesetError::Compute(_)));
    }

    #[test]
    fn test_read_rejects_garbage_changeset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("garbage.diff");
        fs::write(&path, b"nope").unwrap();
        assert!(SqliteChangesetEngine::new().summarize(&path).is_err());
    }

    #[test]
    fn test_cache_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = ChangesetCache::new(tmp.path());
        let v = VersionName::new(2);
        assert!(cache.load::<ChangesetSummary>(v, "a.gpkg", ChangesetCache::SUMMARY).is_none());

        let summary = ChangesetSummary {
            tables: vec![TableSummary {
                table: "points".into(),
                insert: 1,
                update: 0,
                delete: 2,
            }],
        };
        cache
            .store(v, "a.gpkg", ChangesetCache::SUMMARY, &summary)
            .unwrap();
        let path = cache.entry_path(v, "a.gpkg", ChangesetCache::SUMMARY);
        assert!(path.starts_with(tmp.path().join("cache/v2")));
        assert!(path.to_string_lossy().ends_with("-summary.json"));
        assert_eq!(
            cache.load::<ChangesetSummary>(v, "a.gpkg", ChangesetCache::SUMMARY),
            Some(summary)
        );
    }
}
