use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::context::{ContextAnalyzer, ContextAnalyzerError};
use crate::decoder::{Decoder, DecoderError, FeatureWeights};
use crate::ir::{ContextVector, Translation};
use crate::processing::{Postprocessor, Preprocessor, ProcessingError};
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("system shutdown: interrupted while awaiting a cluster result")]
pub struct SystemShutdown;

/// Everything a job needs to run on a node, passed explicitly to each job.
pub struct Engine {
    pub decoder: Arc<dyn Decoder>,
    pub preprocessor: Arc<dyn Preprocessor>,
    pub postprocessor: Arc<dyn Postprocessor>,
    pub context_analyzer: Arc<dyn ContextAnalyzer>,
    pub source_language: String,
    pub target_language: String,
}

/// Immutable, serializable description of one unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Job {
    Translate {
        text: String,
        context: Option<ContextVector>,
        nbest: usize,
    },
    ContextVector {
        context: String,
        limit: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobOutput {
    Translation(Translation),
    ContextVector(ContextVector),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error(transparent)]
    ContextAnalyzer(#[from] ContextAnalyzerError),
    #[error("job panicked: {0}")]
    Panicked(String),
}

pub type JobResult = Result<JobOutput, JobError>;

impl Job {
    pub fn execute(&self, engine: &Engine) -> JobResult {
        match self {
            Job::Translate {
                text,
                context,
                nbest,
            } => translate(engine, text, context.as_ref(), *nbest).map(JobOutput::Translation),
            Job::ContextVector { context, limit } => engine
                .context_analyzer
                .context_vector(context, *limit)
                .map(JobOutput::ContextVector)
                .map_err(JobError::from),
        }
    }
}

fn translate(
    engine: &Engine,
    text: &str,
    context: Option<&ContextVector>,
    nbest: usize,
) -> Result<Translation, JobError> {
    let sentence = engine.preprocessor.process(text)?;
    let decoder = &engine.decoder;
    let mut translation = match (context, nbest) {
        (Some(ctx), n) if n > 0 => decoder.translate_with_context_nbest(&sentence, Some(ctx), n)?,
        (Some(ctx), _) => decoder.translate_with_context(&sentence, ctx)?,
        (None, n) if n > 0 => decoder.translate_nbest(&sentence, n)?,
        (None, _) => decoder.translate(&sentence)?,
    };

    engine.postprocessor.process(&mut translation)?;
    if let Some(nbest) = translation.nbest.as_mut() {
        engine.postprocessor.process_all(nbest)?;
    }
    Ok(translation)
}

/// Future of a submitted job.
pub struct JobHandle {
    result: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    /// A handle plus the sender the executing side resolves it with.
    pub fn pending() -> (oneshot::Sender<JobResult>, JobHandle) {
        let (done, result) = oneshot::channel();
        (done, JobHandle { result })
    }

    /// Blocks until the job finishes. A job dropped without a result (node
    /// shutting down) surfaces as [`SystemShutdown`]. Must not be called
    /// from inside an async runtime.
    pub fn wait(self) -> Result<JobResult, SystemShutdown> {
        self.result.blocking_recv().map_err(|_| SystemShutdown)
    }
}

/// Where jobs get scheduled.
pub trait ClusterNode: Send + Sync {
    fn submit(&self, job: Job) -> JobHandle;

    /// The engine of this node, for work that must stay local.
    fn engine(&self) -> Arc<Engine>;

    fn notify_decoder_weights_changed(&self, weights: &FeatureWeights);
}

/// Single-node cluster executing jobs on a private worker pool.
pub struct LocalNode {
    engine: Arc<Engine>,
    pool: rayon::ThreadPool,
    shutdown: Arc<AtomicBool>,
}

impl LocalNode {
    pub fn new(engine: Arc<Engine>, workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("job-{i}"))
            .build()?;
        info!(
            workers,
            source = %engine.source_language,
            target = %engine.target_language,
            "local node ready"
        );
        Ok(Self {
            engine,
            pool,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Jobs not yet started, and any submitted afterwards, resolve as interrupted.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl ClusterNode for LocalNode {
    fn submit(&self, job: Job) -> JobHandle {
        let (done, handle) = JobHandle::pending();
        if self.is_shutdown() {
            return handle;
        }
        debug!(?job, "job submitted");

        let engine = self.engine.clone();
        let shutdown = self.shutdown.clone();
        self.pool.spawn(move || {
            if shutdown.load(Ordering::SeqCst) {
                drop(done);
                return;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| job.execute(&engine)));
            // The waiter may have given up; nothing to report then.
            let _ = done.send(outcome.unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(JobError::Panicked(msg))
            }));
        });
        handle
    }

    fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    fn notify_decoder_weights_changed(&self, weights: &FeatureWeights) {
        self.engine.decoder.set_default_feature_weights(weights);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::decoder::DecoderFeature;
    use crate::ir::{Sentence, Token, Word};
    use crate::processing::{SimplePostprocessor, SimplePreprocessor};

    /// Decoder that upper-cases every token and records the call shape used.
    #[derive(Default)]
    pub struct UpperDecoder {
        pub calls: Mutex<Vec<(bool, usize)>>,
        pub weights: Mutex<FeatureWeights>,
    }

    impl Decoder for UpperDecoder {
        fn features(&self) -> Vec<DecoderFeature> {
            vec![
                DecoderFeature {
                    name: "LM".to_string(),
                    tunable: true,
                },
                DecoderFeature {
                    name: "Distortion".to_string(),
                    tunable: false,
                },
            ]
        }

        fn feature_weights(&self, feature: &DecoderFeature) -> Option<Vec<f32>> {
            self.weights
                .lock()
                .expect("weights")
                .get(&feature.name)
                .cloned()
                .or_else(|| Some(vec![0.5]))
        }

        fn set_default_feature_weights(&self, weights: &FeatureWeights) {
            *self.weights.lock().expect("weights") = weights.clone();
        }

        fn translate_with_context_nbest(
            &self,
            sentence: &Sentence,
            context: Option<&ContextVector>,
            nbest: usize,
        ) -> Result<Translation, DecoderError> {
            self.calls
                .lock()
                .expect("calls")
                .push((context.is_some(), nbest));
            let words: Vec<Token> = sentence
                .tokens()
                .iter()
                .map(|t| {
                    let text = if crate::sentinels::is_opt_token(t.text()) {
                        t.text().to_string()
                    } else {
                        t.text().to_uppercase()
                    };
                    Token::Word(Word::new(text, Some(" ")))
                })
                .collect();
            let mut translation = Translation::new(sentence.clone(), words.clone());
            if nbest > 0 {
                translation.nbest = Some(
                    (0..nbest)
                        .map(|_| Translation::new(sentence.clone(), words.clone()))
                        .collect(),
                );
            }
            Ok(translation)
        }
    }

    pub struct FixedAnalyzer;

    impl ContextAnalyzer for FixedAnalyzer {
        fn context_vector(
            &self,
            text: &str,
            limit: usize,
        ) -> Result<ContextVector, ContextAnalyzerError> {
            match text {
                "fail" => return Err(ContextAnalyzerError::Unexpected("boom".to_string())),
                "panic" => panic!("analyzer exploded"),
                _ => {}
            }
            Ok(ContextVector::builder().add(1, 0.8).add(2, 0.1).limit(limit).build())
        }
    }

    pub fn engine(decoder: Arc<dyn Decoder>) -> Arc<Engine> {
        Arc::new(Engine {
            decoder,
            preprocessor: Arc::new(SimplePreprocessor::default()),
            postprocessor: Arc::new(SimplePostprocessor),
            context_analyzer: Arc::new(FixedAnalyzer),
            source_language: "en".to_string(),
            target_language: "it".to_string(),
        })
    }

    pub fn weights(name: &str, values: &[f32]) -> FeatureWeights {
        let mut map = HashMap::new();
        map.insert(name.to_string(), values.to_vec());
        map
    }
}
