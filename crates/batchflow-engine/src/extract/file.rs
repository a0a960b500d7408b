//! Delimited flat-file extraction

use async_trait::async_trait;
use batchflow_common::{Column, ColumnType, Schema, TabularBatch, Value};
use indexmap::IndexMap;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::Extractor;
use crate::error::{EtlError, EtlResult};
use crate::jobs::FileSourceParams;

/// Name of the lineage column added by `include_source_file`
pub const SOURCE_FILE_COLUMN: &str = "source_file";

/// Raw cells of one file, before typing
struct RawFile {
    label: String,
    headers: Vec<String>,
    records: Vec<Vec<String>>,
}

/// Reads one or more CSV files into a single batch
#[derive(Debug, Clone)]
pub struct FileExtractor {
    params: FileSourceParams,
}

impl FileExtractor {
    pub fn new(params: FileSourceParams) -> Self {
        Self { params }
    }

    fn delimiter(&self) -> EtlResult<u8> {
        u8::try_from(self.params.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| EtlError::config("delimiter must be a single ASCII character"))
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> EtlResult<RawFile> {
        let label = path.display().to_string();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter()?)
            .has_headers(self.params.has_headers)
            .from_reader(bytes);

        let location = |e: &csv::Error| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            format!("{}:{}", label, line)
        };

        let mut headers = if self.params.has_headers {
            reader
                .headers()
                .map_err(|e| EtlError::parse(location(&e), e.to_string()))?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| EtlError::parse(location(&e), e.to_string()))?;
            records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        if !self.params.has_headers {
            let width = records.first().map(Vec::len).unwrap_or(0);
            headers = (1..=width).map(|i| format!("column_{}", i)).collect();
        }

        Ok(RawFile {
            label: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(label),
            headers,
            records,
        })
    }
}

/// Union of all files' columns with widened inferred types
fn infer_schema(files: &[RawFile]) -> IndexMap<String, Option<ColumnType>> {
    let mut types: IndexMap<String, Option<ColumnType>> = IndexMap::new();
    for file in files {
        for (i, header) in file.headers.iter().enumerate() {
            let slot = types.entry(header.clone()).or_insert(None);
            for record in &file.records {
                let Some(observed) = record.get(i).and_then(|raw| ColumnType::infer(raw)) else {
                    continue;
                };
                *slot = Some(slot.map_or(observed, |current| current.widen(observed)));
            }
        }
    }
    types
}

fn build_batch(files: Vec<RawFile>, include_source_file: bool) -> EtlResult<TabularBatch> {
    let types = infer_schema(&files);
    let mut columns: Vec<Column> = types
        .iter()
        .map(|(name, ty)| Column::new(name.clone(), ty.unwrap_or(ColumnType::String)))
        .collect();
    if include_source_file {
        columns.push(Column::new(SOURCE_FILE_COLUMN, ColumnType::String));
    }
    let mut batch = TabularBatch::new(Schema::new(columns)?);

    for file in files {
        // Batch position of each column in this file
        let positions: Vec<usize> = file
            .headers
            .iter()
            .map(|h| batch.column_index(h))
            .collect::<Result<_, _>>()?;

        for (line, record) in file.records.into_iter().enumerate() {
            let mut row = vec![Value::Null; batch.schema().len()];
            for (raw, &position) in record.iter().zip(&positions) {
                let column_type = batch.schema().columns()[position].column_type;
                row[position] = Value::parse_as(raw, column_type).map_err(|e| {
                    EtlError::parse(format!("{} record {}", file.label, line + 1), e.to_string())
                })?;
            }
            if include_source_file {
                if let Some(last) = row.last_mut() {
                    *last = Value::String(file.label.clone());
                }
            }
            batch.push_row(row)?;
        }
    }
    Ok(batch)
}

#[async_trait]
impl Extractor for FileExtractor {
    #[instrument(skip(self), fields(files = self.params.paths.len()))]
    async fn extract(&self) -> EtlResult<TabularBatch> {
        for path in &self.params.paths {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(EtlError::SourceNotFound {
                    path: path.display().to_string(),
                });
            }
        }

        let mut files = Vec::with_capacity(self.params.paths.len());
        for path in &self.params.paths {
            let bytes = tokio::fs::read(path).await?;
            let file = self.parse(path, &bytes)?;
            debug!(path = %path.display(), rows = file.records.len(), "Parsed file");
            files.push(file);
        }

        let batch = build_batch(files, self.params.include_source_file)?;
        info!(rows = batch.len(), columns = batch.schema().len(), "File extraction complete");
        Ok(batch)
    }

    fn describe(&self) -> String {
        let paths: Vec<String> = self
            .params
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!("file {}", paths.join(", "))
    }
}
