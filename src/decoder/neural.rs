use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;

use super::{
    BridgeError, Decoder, DecoderCommand, DecoderError, DecoderFeature, DecoderProcess,
    FeatureWeights, TranslationMemory,
};
use crate::ir::{ContextVector, Sentence, Token, Translation};

const DEFAULT_SUGGESTIONS: usize = 4;
const MODEL_FEATURE: &str = "NeuralModel";

/// Decoder backed by one external process per GPU (or a single CPU process).
pub struct NeuralDecoder {
    processes: Vec<Mutex<DecoderProcess>>,
    next: AtomicUsize,
    memory: Option<Arc<dyn TranslationMemory>>,
    suggestions: usize,
}

impl NeuralDecoder {
    pub fn start(command: &DecoderCommand, gpus: &[usize]) -> Result<Self, BridgeError> {
        let processes = if gpus.is_empty() {
            vec![command.start(None)?]
        } else {
            gpus.iter()
                .map(|&gpu| command.start(Some(gpu)))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self::from_processes(processes))
    }

    pub fn from_processes(processes: Vec<DecoderProcess>) -> Self {
        Self {
            processes: processes.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            memory: None,
            suggestions: DEFAULT_SUGGESTIONS,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn TranslationMemory>, suggestions: usize) -> Self {
        self.memory = Some(memory);
        self.suggestions = suggestions;
        self
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Takes an idle process if there is one, otherwise queues on the next in turn.
    fn acquire(&self) -> Result<MutexGuard<'_, DecoderProcess>, DecoderError> {
        if self.processes.is_empty() {
            return Err(DecoderError::Unavailable);
        }
        for p in &self.processes {
            if let Ok(guard) = p.try_lock() {
                return Ok(guard);
            }
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.processes.len();
        Ok(self.processes[i].lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn close(&self) {
        for p in &self.processes {
            p.lock().unwrap_or_else(|e| e.into_inner()).close();
        }
    }
}

impl Decoder for NeuralDecoder {
    fn features(&self) -> Vec<DecoderFeature> {
        vec![DecoderFeature {
            name: MODEL_FEATURE.to_string(),
            tunable: false,
        }]
    }

    fn feature_weights(&self, _feature: &DecoderFeature) -> Option<Vec<f32>> {
        None
    }

    fn set_default_feature_weights(&self, weights: &FeatureWeights) {
        debug!(features = weights.len(), "neural decoder has no tunable weights, ignoring");
    }

    fn translate_with_context_nbest(
        &self,
        sentence: &Sentence,
        context: Option<&ContextVector>,
        nbest: usize,
    ) -> Result<Translation, DecoderError> {
        let started = Instant::now();
        let suggestions = match (context, self.memory.as_ref()) {
            (Some(ctx), Some(memory)) if !ctx.is_empty() => {
                memory.suggestions(sentence, ctx, self.suggestions)?
            }
            _ => Vec::new(),
        };

        let words = {
            let mut process = self.acquire()?;
            process.translate(sentence, Some(suggestions.as_slice()))?
        };

        let mut translation =
            Translation::new(sentence.clone(), words.into_iter().map(Token::Word).collect());
        if nbest > 0 {
            // The process protocol returns a single hypothesis.
            translation.nbest = Some(Vec::new());
        }
        translation.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(translation)
    }
}
