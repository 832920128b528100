//! Per-object readers, key listing and the in-memory object store.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions, StringArray};
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use regex::Regex;

use crate::error::{ClusterError, Result};
use crate::s3_uri::{AuthContext, ClientAuth, CompressionMethod, S3Uri};

pub const PATH_COLUMN: &str = "_path";
pub const FILE_COLUMN: &str = "_file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualColumn {
    Path,
    File,
}

impl VirtualColumn {
    pub const ALL: [VirtualColumn; 2] = [VirtualColumn::Path, VirtualColumn::File];

    pub fn name(&self) -> &'static str {
        match self {
            VirtualColumn::Path => PATH_COLUMN,
            VirtualColumn::File => FILE_COLUMN,
        }
    }

    fn value(&self, uri: &S3Uri) -> String {
        match self {
            VirtualColumn::Path => uri.path(),
            VirtualColumn::File => uri.file_name().to_string(),
        }
    }
}

/// Supported text formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv { with_names: bool },
    Tsv { with_names: bool },
}

impl DataFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "csv" => Ok(DataFormat::Csv { with_names: false }),
            "csvwithnames" => Ok(DataFormat::Csv { with_names: true }),
            "tsv" | "tabseparated" => Ok(DataFormat::Tsv { with_names: false }),
            "tsvwithnames" | "tabseparatedwithnames" => Ok(DataFormat::Tsv { with_names: true }),
            _ => Err(ClusterError::Arguments(format!("unsupported format '{name}'"))),
        }
    }

    fn delimiter(&self) -> u8 {
        match self {
            DataFormat::Csv { .. } => b',',
            DataFormat::Tsv { .. } => b'\t',
        }
    }

    fn has_header(&self) -> bool {
        match self {
            DataFormat::Csv { with_names } | DataFormat::Tsv { with_names } => *with_names,
        }
    }
}

/// Parse a `"name Type, name Type"` structure into an Arrow schema.
///
/// Accepts ClickHouse (`Int64`, `Nullable(String)`) and SQL (`BIGINT`,
/// `VARCHAR`) type names. Every field is nullable.
pub fn parse_structure(structure: &str) -> Result<SchemaRef> {
    let mut fields = Vec::new();
    for column in split_top_level(structure) {
        let column = column.trim();
        if column.is_empty() {
            continue;
        }
        let (name, type_name) = column.split_once(char::is_whitespace).ok_or_else(|| {
            ClusterError::Arguments(format!("structure entry '{column}' has no type"))
        })?;
        let name = name.trim_matches(|c| c == '`' || c == '"');
        if name == PATH_COLUMN || name == FILE_COLUMN {
            return Err(ClusterError::Arguments(format!(
                "column name '{name}' is reserved for a virtual column"
            )));
        }
        fields.push(Field::new(name, parse_type(type_name.trim())?, true));
    }

    if fields.is_empty() {
        return Err(ClusterError::Arguments("structure declares no columns".to_string()));
    }
    Ok(Arc::new(Schema::new(fields)))
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_type(type_name: &str) -> Result<DataType> {
    if let Some(inner) = type_name
        .strip_prefix("Nullable(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return parse_type(inner.trim());
    }

    let data_type = match type_name.to_uppercase().as_str() {
        "INT8" | "TINYINT" => DataType::Int8,
        "INT16" | "SMALLINT" => DataType::Int16,
        "INT32" | "INT" | "INTEGER" => DataType::Int32,
        "INT64" | "BIGINT" => DataType::Int64,
        "UINT8" => DataType::UInt8,
        "UINT16" => DataType::UInt16,
        "UINT32" => DataType::UInt32,
        "UINT64" => DataType::UInt64,
        "FLOAT32" | "FLOAT" | "REAL" => DataType::Float32,
        "FLOAT64" | "DOUBLE" => DataType::Float64,
        "STRING" | "VARCHAR" | "TEXT" => DataType::Utf8,
        "BOOL" | "BOOLEAN" => DataType::Boolean,
        "DATE" | "DATE32" => DataType::Date32,
        "DATETIME" | "TIMESTAMP" => DataType::Timestamp(TimeUnit::Second, None),
        _ => {
            return Err(ClusterError::Arguments(format!(
                "unsupported column type '{type_name}'"
            )))
        }
    };
    Ok(data_type)
}

/// Immutable per-query description of what every per-object reader produces.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Columns declared by the structure argument.
    pub column_schema: SchemaRef,
    /// Indices into `column_schema` followed by the virtual columns.
    pub projection: Vec<usize>,
    pub output_schema: SchemaRef,
    pub format: DataFormat,
    pub compression_hint: String,
    pub batch_size: usize,
}

impl SourceDescriptor {
    pub fn new(
        column_schema: SchemaRef,
        projection: Option<&Vec<usize>>,
        format: DataFormat,
        compression_hint: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let table_schema = table_schema(&column_schema);
        let projection: Vec<usize> = match projection {
            Some(indices) => indices.clone(),
            None => (0..table_schema.fields().len()).collect(),
        };
        let output_schema = Arc::new(table_schema.project(&projection)?);

        Ok(Self {
            column_schema,
            projection,
            output_schema,
            format,
            compression_hint: compression_hint.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    /// Virtual columns the output requests.
    pub fn virtual_columns(&self) -> Vec<VirtualColumn> {
        let data_len = self.column_schema.fields().len();
        self.projection
            .iter()
            .filter_map(|&i| i.checked_sub(data_len))
            .filter_map(|v| VirtualColumn::ALL.get(v).copied())
            .collect()
    }

    /// Project a decoded batch onto the output schema, appending virtual
    /// column values derived from `uri`.
    pub fn project(&self, batch: &RecordBatch, uri: &S3Uri) -> Result<RecordBatch> {
        let rows = batch.num_rows();
        if self.projection.is_empty() {
            return Ok(RecordBatch::try_new_with_options(
                self.output_schema.clone(),
                vec![],
                &RecordBatchOptions::new().with_row_count(Some(rows)),
            )?);
        }

        let data_len = self.column_schema.fields().len();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.projection.len());
        for &i in &self.projection {
            if i < data_len {
                columns.push(batch.column(i).clone());
                continue;
            }
            let virtual_column = VirtualColumn::ALL.get(i - data_len).ok_or_else(|| {
                ClusterError::Arguments(format!("projection index {i} is out of range"))
            })?;
            let value = virtual_column.value(uri);
            columns.push(Arc::new(StringArray::from(vec![value.as_str(); rows])));
        }

        Ok(RecordBatch::try_new(self.output_schema.clone(), columns)?)
    }
}

/// The declared columns followed by `_path` and `_file`.
pub fn table_schema(column_schema: &SchemaRef) -> SchemaRef {
    let mut fields: Vec<Field> = column_schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    for v in VirtualColumn::ALL {
        fields.push(Field::new(v.name(), DataType::Utf8, false));
    }
    Arc::new(Schema::new(fields))
}

/// Decoder for one object, yielding batches in the declared column schema.
#[async_trait]
pub trait ObjectReader: Send {
    /// `Ok(None)` once the object is fully read.
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>>;
}

/// Builds a reader for one object from its client authorization.
#[async_trait]
pub trait ObjectReaderFactory: Send + Sync + fmt::Debug {
    async fn open(
        &self,
        auth: ClientAuth,
        descriptor: &SourceDescriptor,
    ) -> Result<Box<dyn ObjectReader>>;
}

/// Expands a (possibly globbed) URL into the keys one query scans.
#[async_trait]
pub trait KeyLister: Send + Sync + fmt::Debug {
    async fn list(&self, url: &str, auth: &AuthContext) -> Result<Vec<String>>;
}

/// Translate `*`, `?` and `{a,b}` globs into an anchored regex. Wildcards do
/// not cross `/`.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut in_alternatives = false;
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            '{' if !in_alternatives => {
                in_alternatives = true;
                pattern.push_str("(?:");
            }
            '}' if in_alternatives => {
                in_alternatives = false;
                pattern.push(')');
            }
            ',' if in_alternatives => pattern.push('|'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| ClusterError::Arguments(format!("invalid glob '{glob}': {e}")))
}

#[derive(Default)]
struct StoreInner {
    objects: RwLock<BTreeMap<(String, String), Arc<Vec<u8>>>>,
    opened: Mutex<Vec<String>>,
}

/// Object store held in memory, shared between clones.
///
/// Lists keys for the initiator and serves readers for workers. Only
/// uncompressed objects can be read.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .inner
            .objects
            .read()
            .map(|o| o.len())
            .unwrap_or_default();
        f.debug_struct("MemoryObjectStore").field("objects", &count).finish()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, uri: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let uri = S3Uri::parse(uri)?;
        self.inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((uri.bucket, uri.key), Arc::new(data.into()));
        Ok(())
    }

    /// Every key a reader was opened for, in opening order.
    pub fn opened_keys(&self) -> Vec<String> {
        self.inner
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn get(&self, uri: &S3Uri) -> Option<Arc<Vec<u8>>> {
        self.inner
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(uri.bucket.clone(), uri.key.clone()))
            .cloned()
    }
}

#[async_trait]
impl KeyLister for MemoryObjectStore {
    async fn list(&self, url: &str, _auth: &AuthContext) -> Result<Vec<String>> {
        let uri = S3Uri::parse(url)?;
        let matcher = glob_to_regex(&uri.key)?;
        let objects = self
            .inner
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        Ok(objects
            .keys()
            .filter(|(bucket, key)| *bucket == uri.bucket && matcher.is_match(key))
            .map(|(bucket, key)| format!("s3://{bucket}/{key}"))
            .collect())
    }
}

#[async_trait]
impl ObjectReaderFactory for MemoryObjectStore {
    async fn open(
        &self,
        auth: ClientAuth,
        descriptor: &SourceDescriptor,
    ) -> Result<Box<dyn ObjectReader>> {
        let key = auth.uri.to_string();
        let object_error = |message: String| ClusterError::Object {
            key: key.clone(),
            message,
        };

        let compression = CompressionMethod::choose(&auth.uri.key, &descriptor.compression_hint)?;
        if compression != CompressionMethod::None {
            return Err(object_error(format!(
                "{compression:?} compression is not supported by the in-memory store"
            )));
        }

        let data = self
            .get(&auth.uri)
            .ok_or_else(|| object_error("object does not exist".to_string()))?;

        let reader = ReaderBuilder::new(descriptor.column_schema.clone())
            .with_header(descriptor.format.has_header())
            .with_delimiter(descriptor.format.delimiter())
            .with_batch_size(descriptor.batch_size)
            .build(Cursor::new(data.as_ref().clone()))
            .map_err(|e| object_error(e.to_string()))?;

        self.inner
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());

        Ok(Box::new(CsvObjectReader { key, reader }))
    }
}

struct CsvObjectReader {
    key: String,
    reader: arrow::csv::Reader<Cursor<Vec<u8>>>,
}

#[async_trait]
impl ObjectReader for CsvObjectReader {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        self.reader
            .next()
            .transpose()
            .map_err(|e| ClusterError::Object {
                key: self.key.clone(),
                message: e.to_string(),
            })
    }
}
