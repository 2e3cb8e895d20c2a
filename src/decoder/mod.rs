mod neural;
mod process;
pub mod protocol;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::ir::{ContextVector, ScoreEntry, Sentence, Translation};

pub use neural::NeuralDecoder;
pub use process::{DecoderCommand, DecoderProcess};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineErrorKind {
    InvalidRequest,
    OutOfMemory,
    ModelUnavailable,
    /// Any decoder-side error type without a dedicated kind.
    Decoding,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid request",
            Self::OutOfMemory => "out of memory",
            Self::ModelUnavailable => "model unavailable",
            Self::Decoding => "decoding failure",
        };
        f.write_str(s)
    }
}

/// Error reported by the decoder process itself.
#[derive(Debug, Error)]
#[error("decoder {kind} ({error_type}): {}", .message.as_deref().unwrap_or("no message"))]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub error_type: String,
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start decoder process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode decoder request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to send request to decoder: {0}")]
    Send(#[source] std::io::Error),
    #[error("failed to read response from decoder: {0}")]
    Receive(#[source] std::io::Error),
    #[error("no response from decoder process, request was '{request}'")]
    NoResponse { request: String },
    #[error("invalid response from decoder: {response}")]
    Parse {
        response: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoder response carries no translation: {response}")]
    MissingTranslation { response: String },
    #[error("decoder process is not running")]
    Rejected,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("translation memory lookup failed: {0}")]
    Memory(String),
    #[error("no decoder process available")]
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecoderFeature {
    pub name: String,
    pub tunable: bool,
}

pub type FeatureWeights = HashMap<String, Vec<f32>>;

pub trait Decoder: Send + Sync {
    fn features(&self) -> Vec<DecoderFeature>;

    fn feature_weights(&self, feature: &DecoderFeature) -> Option<Vec<f32>>;

    fn set_default_feature_weights(&self, weights: &FeatureWeights);

    fn translate(&self, sentence: &Sentence) -> Result<Translation, DecoderError> {
        self.translate_with_context_nbest(sentence, None, 0)
    }

    fn translate_with_context(
        &self,
        sentence: &Sentence,
        context: &ContextVector,
    ) -> Result<Translation, DecoderError> {
        self.translate_with_context_nbest(sentence, Some(context), 0)
    }

    fn translate_nbest(&self, sentence: &Sentence, nbest: usize) -> Result<Translation, DecoderError> {
        self.translate_with_context_nbest(sentence, None, nbest)
    }

    fn translate_with_context_nbest(
        &self,
        sentence: &Sentence,
        context: Option<&ContextVector>,
        nbest: usize,
    ) -> Result<Translation, DecoderError>;
}

/// Source of suggestions that bias decoding toward known translations.
pub trait TranslationMemory: Send + Sync {
    fn suggestions(
        &self,
        sentence: &Sentence,
        context: &ContextVector,
        limit: usize,
    ) -> Result<Vec<ScoreEntry>, DecoderError>;
}
