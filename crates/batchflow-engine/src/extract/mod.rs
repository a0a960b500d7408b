//! Source extraction into a [`TabularBatch`]

mod file;
mod http;

pub use file::FileExtractor;
pub use http::HttpExtractor;

use async_trait::async_trait;
use batchflow_common::TabularBatch;

use crate::error::EtlResult;
use crate::jobs::SourceSpec;
use crate::retry::RetryPolicy;

/// Pulls one bounded batch from a source
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self) -> EtlResult<TabularBatch>;

    /// Short human-readable source description for logs
    fn describe(&self) -> String;
}

/// Build the extractor for a job source
pub fn build_extractor(source: &SourceSpec, retry: RetryPolicy) -> EtlResult<Box<dyn Extractor>> {
    Ok(match source {
        SourceSpec::File(params) => Box::new(FileExtractor::new(params.clone())),
        SourceSpec::Http(params) => Box::new(HttpExtractor::new(params.clone(), retry)?),
    })
}
