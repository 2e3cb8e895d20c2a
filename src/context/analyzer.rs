use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::index::{ContextIndex, IndexError};
use super::similarity::{SimilarityCalculator, SimilarityError};
use crate::cluster::SystemShutdown;
use crate::ir::ContextVector;

/// How many index candidates are rescored per requested context entry.
const CANDIDATES_PER_ENTRY: usize = 4;

#[derive(Debug, Error)]
pub enum ContextAnalyzerError {
    #[error("context index: {0}")]
    Index(#[from] IndexError),
    #[error("similarity: {0}")]
    Similarity(#[from] SimilarityError),
    #[error("read context file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected failure in context analyzer: {0}")]
    Unexpected(String),
    /// Failure of the dispatched job itself; the job error is the source.
    #[error("context job failed: {0}")]
    Dispatch(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Shutdown(#[from] SystemShutdown),
}

pub trait ContextAnalyzer: Send + Sync {
    fn context_vector(&self, text: &str, limit: usize) -> Result<ContextVector, ContextAnalyzerError>;

    /// Reads the context from a file on this machine.
    fn context_vector_from_file(
        &self,
        path: &Path,
        limit: usize,
    ) -> Result<ContextVector, ContextAnalyzerError> {
        let text = std::fs::read_to_string(path).map_err(|source| ContextAnalyzerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.context_vector(&text, limit)
    }
}

/// Builds context vectors by rescoring index candidates with cosine similarity.
pub struct IndexContextAnalyzer {
    index: Arc<dyn ContextIndex>,
    boost: bool,
}

impl IndexContextAnalyzer {
    pub fn new(index: Arc<dyn ContextIndex>, boost: bool) -> Self {
        Self { index, boost }
    }
}

impl ContextAnalyzer for IndexContextAnalyzer {
    fn context_vector(&self, text: &str, limit: usize) -> Result<ContextVector, ContextAnalyzerError> {
        if limit == 0 || text.trim().is_empty() {
            return Ok(ContextVector::default());
        }
        let terms = self.index.analyze(text)?;
        let candidates = self
            .index
            .candidates(&terms, limit.saturating_mul(CANDIDATES_PER_ENTRY))?;
        if candidates.is_empty() {
            return Ok(ContextVector::default());
        }

        // Each request gets its own calculator; batches never share one.
        let mut calc = SimilarityCalculator::new(self.index.clone());
        calc.set_boost(self.boost);
        calc.set_reference(text);
        calc.set_candidates(candidates.clone())?;
        calc.compute_all(true)?;

        let mut builder = ContextVector::builder().limit(limit);
        for doc in candidates {
            let score = calc.similarity(doc)?;
            if score <= 0.0 {
                continue;
            }
            if let Some(domain) = self.index.domain_of(doc) {
                builder = builder.add(domain, score);
            }
        }
        let cv = builder.build();
        debug!(terms = terms.len(), entries = cv.len(), "context vector computed");
        Ok(cv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::index::MemoryIndex;

    fn analyzer() -> IndexContextAnalyzer {
        let index = MemoryIndex::new();
        index.add(10, "court ruling appeal judge contract law");
        index.add(20, "vaccine dose patient clinical trial");
        index.add(30, "football match goal referee");
        IndexContextAnalyzer::new(Arc::new(index), true)
    }

    #[test]
    fn ranks_matching_domain_first() {
        let cv = analyzer()
            .context_vector("the judge dismissed the appeal on the contract", 5)
            .expect("cv");
        assert_eq!(cv.entries().first().map(|e| e.domain), Some(10));
        assert!(cv.weight_of(30).is_none());
    }

    #[test]
    fn limit_truncates_entries() {
        let cv = analyzer()
            .context_vector("judge patient referee", 2)
            .expect("cv");
        assert_eq!(cv.len(), 2);
    }

    #[test]
    fn unrelated_text_yields_empty_vector() {
        let cv = analyzer().context_vector("zzz qqq", 5).expect("cv");
        assert!(cv.is_empty());
    }

    #[test]
    fn reads_context_from_local_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ctx.txt");
        std::fs::write(&path, "clinical trial of the vaccine").expect("write");
        let cv = analyzer().context_vector_from_file(&path, 3).expect("cv");
        assert_eq!(cv.entries().first().map(|e| e.domain), Some(20));

        let missing = analyzer().context_vector_from_file(&dir.path().join("nope.txt"), 3);
        assert!(matches!(missing, Err(ContextAnalyzerError::Io { .. })));
    }
}
