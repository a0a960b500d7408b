//! Job configuration
//!
//! A job file maps job names to descriptors, in YAML or TOML:
//!
//! ```yaml
//! orders:
//!   source:
//!     source_kind: file
//!     paths: [data/orders.csv]
//!   target_table: processed_data.orders
//!   type_mapping: { order_date: timestamp }
//!   transform_spec:
//!     - { op: deduplicate }
//!     - { op: coerce, column: amount, to: float }
//!   load_strategy: upsert
//!   conflict_key: [order_id]
//! ```
//!
//! Declaration order is preserved and drives execution and summary order.
//! Every problem found by [`JobConfigSet::validate`] is reported at once
//! as a single configuration error, before any job touches a source.

use batchflow_common::ColumnType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{EtlError, EtlResult};
use crate::load::LoadStrategy;
use crate::quality::QualitySpec;
use crate::transform::TransformStep;

/// Schemas a qualified target table may live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    RawData,
    ProcessedData,
    Analytics,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::RawData, Namespace::ProcessedData, Namespace::Analytics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::RawData => "raw_data",
            Namespace::ProcessedData => "processed_data",
            Namespace::Analytics => "analytics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == s)
    }
}

/// A target table name, optionally qualified by namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub namespace: Option<Namespace>,
    pub name: String,
}

impl TableName {
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.split('.');
        let (first, second) = (parts.next(), parts.next());
        if parts.next().is_some() {
            return Err(format!("'{}' has more than two name parts", s));
        }
        match (first, second) {
            (Some(name), None) if is_identifier(name) => Ok(Self {
                namespace: None,
                name: name.to_string(),
            }),
            (Some(ns), Some(name)) if is_identifier(name) => {
                let namespace = Namespace::parse(ns).ok_or_else(|| {
                    format!(
                        "namespace '{}' must be one of raw_data, processed_data, analytics",
                        ns
                    )
                })?;
                Ok(Self {
                    namespace: Some(namespace),
                    name: name.to_string(),
                })
            },
            _ => Err(format!("'{}' is not a valid table name", s)),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            Some(ns) => write!(f, "{}.{}", ns.as_str(), self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One or two dot-separated identifiers
pub fn is_qualified_identifier(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() <= 2 && parts.iter().all(|p| is_identifier(p))
}

fn is_job_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_size_param() -> String {
    "limit".to_string()
}

fn default_first_page() -> u64 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

/// Delimited text files read in order and concatenated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSourceParams {
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub has_headers: bool,
    /// Add a `source_file` column naming the file each row came from
    #[serde(default)]
    pub include_source_file: bool,
}

/// Paginated JSON API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSourceParams {
    pub endpoint: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    pub page_size: usize,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_size_param")]
    pub size_param: String,
    #[serde(default = "default_first_page")]
    pub first_page: u64,
    /// Key holding the records; `data` or `results` when unset
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u64>,
    /// Environment variable holding a bearer token
    #[serde(default)]
    pub bearer_token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_kind", rename_all = "snake_case")]
pub enum SourceSpec {
    File(FileSourceParams),
    Http(HttpSourceParams),
}

impl SourceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::File(_) => "file",
            SourceSpec::Http(_) => "http",
        }
    }
}

/// Everything needed to run one job; immutable once a run starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    /// Filled from the job file key
    #[serde(skip)]
    pub job_name: String,
    pub source: SourceSpec,
    pub target_table: String,
    #[serde(default, alias = "transform")]
    pub transform_spec: Vec<TransformStep>,
    pub load_strategy: LoadStrategy,
    #[serde(default)]
    pub conflict_key: Option<Vec<String>>,
    #[serde(default)]
    pub type_mapping: IndexMap<String, ColumnType>,
    #[serde(default)]
    pub quality: QualitySpec,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub skip_if_succeeded_within_secs: Option<u64>,
}

impl JobDescriptor {
    /// Every problem with this descriptor, prefixed by the job name
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut problem = |msg: String| problems.push(format!("job '{}': {}", self.job_name, msg));

        if !is_job_name(&self.job_name) {
            problem("job name may only contain letters, digits, '_' and '-'".to_string());
        }

        if let Err(e) = TableName::parse(&self.target_table) {
            problem(format!("target_table {}", e));
        }

        match (&self.load_strategy, &self.conflict_key) {
            (LoadStrategy::Upsert, None) => problem("upsert requires conflict_key".to_string()),
            (LoadStrategy::Upsert, Some(keys)) if keys.is_empty() => {
                problem("conflict_key must not be empty".to_string())
            },
            (LoadStrategy::Upsert, Some(keys)) => {
                for key in keys.iter().filter(|k| !is_identifier(k)) {
                    problem(format!("conflict_key column '{}' is not a valid identifier", key));
                }
            },
            (strategy, Some(_)) => {
                problem(format!("conflict_key is only valid with upsert, not {}", strategy))
            },
            _ => {},
        }

        match &self.source {
            SourceSpec::File(params) => {
                if params.paths.is_empty() {
                    problem("file source needs at least one path".to_string());
                }
                if !params.delimiter.is_ascii() {
                    problem(format!("delimiter '{}' must be a single ASCII character", params.delimiter));
                }
            },
            SourceSpec::Http(params) => {
                if let Err(e) = reqwest::Url::parse(&params.endpoint) {
                    problem(format!("endpoint '{}' is not a valid URL: {}", params.endpoint, e));
                }
                if params.page_size == 0 {
                    problem("page_size must be greater than 0".to_string());
                }
                if params.max_pages == Some(0) {
                    problem("max_pages must be greater than 0".to_string());
                }
                if params.timeout_secs == 0 {
                    problem("timeout_secs must be greater than 0".to_string());
                }
                if params.page_param == params.size_param {
                    problem("page_param and size_param must differ".to_string());
                }
            },
        }

        for (column, _) in self.type_mapping.iter().filter(|(c, _)| c.trim().is_empty()) {
            problem(format!("type_mapping has an empty column name '{}'", column));
        }

        for (index, step) in self.transform_spec.iter().enumerate() {
            if let Err(e) = step.validate() {
                problem(format!("transform step {} ({}): {}", index, step.op_name(), e));
            }
        }

        for spec in &self.quality.metrics {
            if let Err(e) = spec.validate() {
                problem(format!("quality metric {}: {}", spec.kind.metric_name(), e));
            }
        }

        if self.skip_if_succeeded_within_secs == Some(0) {
            problem("skip_if_succeeded_within_secs must be greater than 0".to_string());
        }

        problems
    }
}

/// Ordered collection of job descriptors from one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobConfigSet {
    jobs: IndexMap<String, JobDescriptor>,
    /// Names given to more than one descriptor; the last one is kept
    duplicates: Vec<String>,
}

impl JobConfigSet {
    pub fn new(descriptors: Vec<JobDescriptor>) -> Self {
        let mut jobs = IndexMap::with_capacity(descriptors.len());
        let mut duplicates = Vec::new();
        for job in descriptors {
            if let Some(previous) = jobs.insert(job.job_name.clone(), job) {
                if !duplicates.contains(&previous.job_name) {
                    duplicates.push(previous.job_name);
                }
            }
        }
        Self { jobs, duplicates }
    }

    /// Load and validate a job file; the format follows the extension
    pub fn from_path(path: impl AsRef<Path>) -> EtlResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EtlError::config(format!("cannot read job file {}: {}", path.display(), e))
        })?;

        let set = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text)?,
            Some("toml") => Self::from_toml_str(&text)?,
            _ => {
                return Err(EtlError::config(format!(
                    "job file {} must end in .yaml, .yml or .toml",
                    path.display()
                )))
            },
        };

        set.validate()?;
        Ok(set)
    }

    pub fn from_yaml_str(text: &str) -> EtlResult<Self> {
        let jobs: IndexMap<String, JobDescriptor> = serde_yaml::from_str(text)
            .map_err(|e| EtlError::config(format!("invalid job file: {}", e)))?;
        Ok(Self::named(jobs))
    }

    pub fn from_toml_str(text: &str) -> EtlResult<Self> {
        let jobs: IndexMap<String, JobDescriptor> = toml::from_str(text)
            .map_err(|e| EtlError::config(format!("invalid job file: {}", e)))?;
        Ok(Self::named(jobs))
    }

    fn named(mut jobs: IndexMap<String, JobDescriptor>) -> Self {
        for (name, job) in jobs.iter_mut() {
            job.job_name = name.clone();
        }
        Self {
            jobs,
            duplicates: Vec::new(),
        }
    }

    /// Every problem across the set, duplicate names first
    pub fn problems(&self) -> Vec<String> {
        self.duplicates
            .iter()
            .map(|name| format!("job '{}': defined more than once", name))
            .chain(self.jobs.values().flat_map(|j| j.problems()))
            .collect()
    }

    /// Check every descriptor; all problems are reported together
    pub fn validate(&self) -> EtlResult<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EtlError::config(problems.join("; ")))
        }
    }

    /// Keep only the named jobs, in declaration order
    pub fn select(&self, names: &[String]) -> EtlResult<Self> {
        if let Some(unknown) = names.iter().find(|n| !self.jobs.contains_key(*n)) {
            return Err(EtlError::config(format!("unknown job '{}'", unknown)));
        }
        Ok(Self {
            jobs: self
                .jobs
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, job)| (name.clone(), job.clone()))
                .collect(),
            duplicates: self
                .duplicates
                .iter()
                .filter(|name| names.contains(name))
                .cloned()
                .collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.jobs.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
