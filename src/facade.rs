use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::cluster::{ClusterNode, Job, JobError, JobOutput, SystemShutdown};
use crate::context::ContextAnalyzerError;
use crate::decoder::FeatureWeights;
use crate::ir::{ContextVector, Translation};
use crate::processing::ProcessingError;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("problem while processing translation: {0}")]
    Processing(#[source] ProcessingError),
    #[error("unexpected failure while translating: {0}")]
    Unexpected(#[source] JobError),
    #[error("translate job returned {0}")]
    UnexpectedOutput(String),
    #[error(transparent)]
    Shutdown(#[from] SystemShutdown),
}

impl From<JobError> for TranslationError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Processing(e) => TranslationError::Processing(e),
            other => TranslationError::Unexpected(other),
        }
    }
}

/// Entry point for translation requests; work is dispatched through a cluster node.
pub struct TranslationService {
    node: Arc<dyn ClusterNode>,
}

impl TranslationService {
    pub fn new(node: Arc<dyn ClusterNode>) -> Self {
        Self { node }
    }

    pub fn translate(&self, text: &str) -> Result<Translation, TranslationError> {
        self.get(text, None, 0)
    }

    /// Translates `text` and resolves every unresolved multi-option token by
    /// translating each of its options with the same context.
    pub fn get(
        &self,
        text: &str,
        context: Option<&ContextVector>,
        nbest: usize,
    ) -> Result<Translation, TranslationError> {
        let job = Job::Translate {
            text: text.to_string(),
            context: context.cloned(),
            nbest,
        };
        let mut root = match self.node.submit(job).wait()?? {
            JobOutput::Translation(t) => t,
            other => {
                return Err(TranslationError::UnexpectedOutput(format!("{other:?}")))
            }
        };

        // Options are flat strings, so this recursion bottoms out after one level.
        for token in root.multi_option_tokens_mut() {
            if token.has_translated_options() {
                continue;
            }
            debug!(options = token.options.len(), "resolving multi-option token");
            let translations = token
                .options
                .iter()
                .map(|option| self.get(option, context, 0))
                .collect::<Result<Vec<_>, _>>()?;
            token.set_translated_options(translations);
        }
        Ok(root)
    }

    /// Context vector computed wherever the cluster schedules it.
    pub fn context_vector(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<ContextVector, ContextAnalyzerError> {
        let job = Job::ContextVector {
            context: text.to_string(),
            limit,
        };
        match self.node.submit(job).wait()? {
            Ok(JobOutput::ContextVector(cv)) => Ok(cv),
            Ok(other) => Err(ContextAnalyzerError::Unexpected(format!(
                "context job returned {other:?}"
            ))),
            Err(JobError::ContextAnalyzer(e)) => Err(e),
            Err(other) => Err(ContextAnalyzerError::Dispatch(Box::new(other))),
        }
    }

    /// The file only exists on this machine, so the local analyzer is used.
    pub fn context_vector_from_file(
        &self,
        path: &Path,
        limit: usize,
    ) -> Result<ContextVector, ContextAnalyzerError> {
        self.node
            .engine()
            .context_analyzer
            .context_vector_from_file(path, limit)
    }

    /// Current weights of every decoder feature; `None` for non-tunable ones.
    pub fn decoder_weights(&self) -> HashMap<String, Option<Vec<f32>>> {
        let engine = self.node.engine();
        engine
            .decoder
            .features()
            .into_iter()
            .map(|f| {
                let weights = if f.tunable {
                    engine.decoder.feature_weights(&f)
                } else {
                    None
                };
                (f.name, weights)
            })
            .collect()
    }

    pub fn set_decoder_weights(&self, weights: &FeatureWeights) {
        self.node.notify_decoder_weights_changed(weights);
    }

    pub fn source_language(&self) -> String {
        self.node.engine().source_language.clone()
    }

    pub fn target_language(&self) -> String {
        self.node.engine().target_language.clone()
    }
}
