use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use super::index::{ContextIndex, DocId, IdfTable, IndexError, CONTENT_FIELD};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SimilarityError {
    #[error("similarity index access failed: {0}")]
    IndexAccess(#[from] IndexError),
    #[error("this calculator is already running a batch")]
    AlreadyRunning,
    #[error("no batch has been started")]
    NotStarted,
    #[error("document {0} is not part of the current batch")]
    UnknownCandidate(DocId),
    #[error("similarity computation has been cancelled")]
    Cancelled,
    #[error("similarity task panicked: {0}")]
    TaskPanicked(String),
    #[error("failed to start similarity workers: {0}")]
    WorkerPool(String),
}

impl SimilarityError {
    /// Misuse of the calculator rather than a failure while scoring.
    #[must_use]
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::NotStarted | Self::UnknownCandidate(_) | Self::Cancelled
        )
    }
}

pub type TermWeights = HashMap<String, f32>;

/// Ad-hoc document compared against indexed candidates. Its term vector and
/// L2 norm are computed on first use and shared by every scoring task.
pub struct ReferenceDocument {
    text: String,
    terms: OnceCell<TermWeights>,
    norm: OnceCell<f64>,
}

impl ReferenceDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            terms: OnceCell::new(),
            norm: OnceCell::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn terms(
        &self,
        index: &dyn ContextIndex,
        idf: Option<&IdfTable>,
    ) -> Result<&TermWeights, IndexError> {
        self.terms.get_or_try_init(|| {
            let mut raw: HashMap<String, u32> = HashMap::new();
            for term in index.analyze(&self.text)? {
                *raw.entry(term).or_insert(0) += 1;
            }
            Ok(weigh(raw, idf))
        })
    }

    pub fn l2_norm(
        &self,
        index: &dyn ContextIndex,
        idf: Option<&IdfTable>,
    ) -> Result<f64, IndexError> {
        if let Some(n) = self.norm.get() {
            return Ok(*n);
        }
        let terms = self.terms(index, idf)?;
        Ok(*self.norm.get_or_init(|| l2_norm(terms)))
    }
}

fn weigh(raw: HashMap<String, u32>, idf: Option<&IdfTable>) -> TermWeights {
    raw.into_iter()
        .filter_map(|(term, freq)| {
            let f = match idf {
                Some(table) if freq > 0 => table.tf_idf(&term, freq),
                _ => freq as f32,
            };
            (f > 0.0).then_some((term, f))
        })
        .collect()
}

fn l2_norm(terms: &TermWeights) -> f64 {
    terms
        .values()
        .map(|v| (*v as f64) * (*v as f64))
        .sum::<f64>()
        .sqrt()
}

/// Cosine similarity of two weighted term vectors. NaN or infinite results
/// (an empty side) collapse to 0.
pub fn cosine_similarity(reference: &TermWeights, reference_norm: f64, other: &TermWeights) -> f32 {
    let dot: f64 = reference
        .iter()
        .filter_map(|(term, w)| other.get(term).map(|o| (*w as f64) * (*o as f64)))
        .sum();
    let similarity = (dot / (reference_norm * l2_norm(other))) as f32;
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

type ScoreResult = Result<f32, SimilarityError>;

enum Slot {
    Pending(oneshot::Receiver<ScoreResult>),
    Ready(ScoreResult),
}

impl Slot {
    /// Moves a delivered (or abandoned) result into the slot. Blocks for it
    /// when `block` is set.
    fn refresh(&mut self, block: bool) {
        let result = match self {
            Slot::Ready(_) => return,
            Slot::Pending(rx) if !block => match rx.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Closed) => Err(SimilarityError::Cancelled),
            },
            Slot::Pending(_) => {
                let taken = std::mem::replace(self, Slot::Ready(Err(SimilarityError::Cancelled)));
                let Slot::Pending(rx) = taken else {
                    return;
                };
                rx.blocking_recv().unwrap_or(Err(SimilarityError::Cancelled))
            }
        };
        *self = Slot::Ready(result);
    }
}

/// Result of one candidate; received once, then kept for repeated reads.
struct CandidateResult {
    slot: Mutex<Slot>,
}

impl CandidateResult {
    fn new(rx: oneshot::Receiver<ScoreResult>) -> Self {
        Self {
            slot: Mutex::new(Slot::Pending(rx)),
        }
    }

    fn is_ready(&self) -> bool {
        let mut slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            // Someone is blocked waiting on it.
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        slot.refresh(false);
        matches!(*slot, Slot::Ready(_))
    }

    fn wait(&self) -> ScoreResult {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.refresh(true);
        match &*slot {
            Slot::Ready(result) => result.clone(),
            Slot::Pending(_) => Err(SimilarityError::Cancelled),
        }
    }
}

struct Batch {
    results: HashMap<DocId, CandidateResult>,
}

impl Batch {
    fn is_running(&self) -> bool {
        self.results.values().any(|r| !r.is_ready())
    }

    fn await_all(&self) {
        for r in self.results.values() {
            let _ = r.wait();
        }
    }
}

/// Scores a batch of indexed candidates against one reference document.
///
/// One batch may be in flight at a time; use separate calculators for
/// parallel batches. A candidate's failure is reported only by
/// [`SimilarityCalculator::similarity`] for that candidate.
pub struct SimilarityCalculator {
    index: Arc<dyn ContextIndex>,
    boost: bool,
    workers: usize,
    reference: Option<Arc<ReferenceDocument>>,
    candidates: Vec<DocId>,
    batch: Mutex<Option<Arc<Batch>>>,
}

impl SimilarityCalculator {
    pub fn new(index: Arc<dyn ContextIndex>) -> Self {
        Self {
            index,
            boost: false,
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            reference: None,
            candidates: Vec::new(),
            batch: Mutex::new(None),
        }
    }

    /// Enables IDF weighting of both reference and candidate frequencies.
    /// The reference vector is recomputed under the new weighting.
    pub fn set_boost(&mut self, boost: bool) {
        if self.boost == boost {
            return;
        }
        self.boost = boost;
        if let Some(reference) = self.reference.take() {
            self.reference = Some(Arc::new(ReferenceDocument::new(reference.text())));
        }
    }

    /// Worker threads of each batch pool; defaults to the available parallelism.
    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers.max(1);
    }

    pub fn set_reference(&mut self, text: impl Into<String>) {
        self.reference = Some(Arc::new(ReferenceDocument::new(text)));
    }

    /// Replaces the candidate set and drops results of the previous batch.
    pub fn set_candidates(&mut self, ids: Vec<DocId>) -> Result<(), SimilarityError> {
        let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        if batch.as_ref().is_some_and(|b| b.is_running()) {
            return Err(SimilarityError::AlreadyRunning);
        }
        *batch = None;
        drop(batch);
        self.candidates = ids;
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.batch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|b| b.is_running())
    }

    /// Launches one task per candidate on a fresh pool. With `wait`, returns
    /// once every task has finished.
    pub fn compute_all(&self, wait: bool) -> Result<(), SimilarityError> {
        let reference = self.reference.clone().ok_or(SimilarityError::NotStarted)?;
        let batch = {
            let mut slot = self.batch.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|b| b.is_running()) {
                return Err(SimilarityError::AlreadyRunning);
            }

            let workers = self.workers;
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("similarity-{i}"))
                .build()
                .map_err(|e| SimilarityError::WorkerPool(e.to_string()))?;
            debug!(
                candidates = self.candidates.len(),
                workers, boost = self.boost, "similarity batch launched"
            );

            let idf = self.boost.then(|| self.index.idf_cache());
            let mut results = HashMap::with_capacity(self.candidates.len());
            for &doc in &self.candidates {
                let (done, result) = oneshot::channel::<ScoreResult>();
                results.insert(doc, CandidateResult::new(result));

                let index = self.index.clone();
                let reference = reference.clone();
                let idf = idf.clone();
                pool.spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        score_candidate(index.as_ref(), &reference, idf.as_deref(), doc)
                    }));
                    let score = outcome.unwrap_or_else(|panic| {
                        Err(SimilarityError::TaskPanicked(panic_message(panic.as_ref())))
                    });
                    // The batch may already be gone.
                    let _ = done.send(score);
                });
            }

            let batch = Arc::new(Batch { results });
            *slot = Some(batch.clone());
            batch
        };

        if wait {
            batch.await_all();
        }
        Ok(())
    }

    /// Blocks until every task of the current batch has finished.
    pub fn await_termination(&self) {
        let batch = self.batch.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(batch) = batch {
            batch.await_all();
        }
    }

    /// Blocks until the candidate's task completes and returns its score.
    pub fn similarity(&self, doc: DocId) -> Result<f32, SimilarityError> {
        let batch = self
            .batch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SimilarityError::NotStarted)?;
        let result = batch
            .results
            .get(&doc)
            .ok_or(SimilarityError::UnknownCandidate(doc))?;
        result.wait()
    }
}

fn score_candidate(
    index: &dyn ContextIndex,
    reference: &ReferenceDocument,
    idf: Option<&IdfTable>,
    doc: DocId,
) -> ScoreResult {
    let reference_terms = reference.terms(index, idf)?;
    let reference_norm = reference.l2_norm(index, idf)?;
    let terms = weigh(index.term_frequencies(doc, CONTENT_FIELD)?, idf);
    Ok(cosine_similarity(reference_terms, reference_norm, &terms))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::index::MemoryIndex;
    use crate::ir::DomainId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex as StdMutex};
    use std::time::Duration;

    fn weights(pairs: &[(&str, f32)]) -> TermWeights {
        pairs.iter().map(|(t, w)| (t.to_string(), *w)).collect()
    }

    #[test]
    fn cosine_is_bounded_and_zero_for_disjoint() {
        let a = weights(&[("cat", 2.0), ("dog", 1.0)]);
        let b = weights(&[("cat", 1.0), ("bird", 3.0)]);
        let c = weights(&[("fish", 1.0)]);

        let ab = cosine_similarity(&a, l2_norm(&a), &b);
        assert!(ab > 0.0 && ab <= 1.0, "ab={ab}");
        assert_eq!(cosine_similarity(&a, l2_norm(&a), &c), 0.0);

        let aa = cosine_similarity(&a, l2_norm(&a), &a);
        assert!((aa - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_vectors_score_zero_not_nan() {
        let empty = TermWeights::new();
        let a = weights(&[("cat", 1.0)]);
        assert_eq!(cosine_similarity(&empty, 0.0, &a), 0.0);
        assert_eq!(cosine_similarity(&a, l2_norm(&a), &empty), 0.0);
    }

    fn sample_index() -> Arc<MemoryIndex> {
        let index = MemoryIndex::new();
        index.add(1, "the contract shall terminate upon notice of breach");
        index.add(2, "the patient received a dose of the vaccine");
        index.add(3, "breach of contract and notice requirements");
        Arc::new(index)
    }

    #[test]
    fn batch_scores_every_candidate() {
        let mut calc = SimilarityCalculator::new(sample_index());
        calc.set_reference("notice of contract breach");
        calc.set_candidates(vec![1, 2, 3]).expect("candidates");
        calc.compute_all(true).expect("compute");

        let legal = calc.similarity(3).expect("3");
        let medical = calc.similarity(2).expect("2");
        assert!(legal > medical, "legal={legal} medical={medical}");
        assert!(calc.similarity(1).expect("1") > 0.0);
        assert_eq!(calc.similarity(9), Err(SimilarityError::UnknownCandidate(9)));
        assert!(!calc.is_running());
    }

    #[test]
    fn boost_keeps_scores_in_unit_range() {
        let mut calc = SimilarityCalculator::new(sample_index());
        calc.set_boost(true);
        calc.set_reference("the vaccine dose");
        calc.set_candidates(vec![1, 2, 3]).expect("candidates");
        calc.compute_all(true).expect("compute");
        for id in [1, 2, 3] {
            let s = calc.similarity(id).expect("score");
            assert!((0.0..=1.0 + 1e-6).contains(&s), "id={id} s={s}");
        }
        assert!(calc.similarity(2).expect("2") > calc.similarity(3).expect("3"));
    }

    #[test]
    fn toggling_boost_reweights_the_reference() {
        let mut reused = SimilarityCalculator::new(sample_index());
        reused.set_reference("the vaccine dose");
        reused.set_candidates(vec![1, 2, 3]).expect("candidates");
        reused.compute_all(true).expect("plain batch");
        reused.set_boost(true);
        reused.compute_all(true).expect("boosted batch");

        let mut fresh = SimilarityCalculator::new(sample_index());
        fresh.set_boost(true);
        fresh.set_reference("the vaccine dose");
        fresh.set_candidates(vec![1, 2, 3]).expect("candidates");
        fresh.compute_all(true).expect("fresh batch");

        for id in [1, 2, 3] {
            let a = reused.similarity(id).expect("reused");
            let b = fresh.similarity(id).expect("fresh");
            assert!((a - b).abs() < 1e-6, "id={id} reused={a} fresh={b}");
        }
    }

    /// Index that counts how often text is analyzed; analysis is slow so
    /// concurrent first uses overlap.
    struct CountingIndex {
        inner: MemoryIndex,
        analyzed: AtomicUsize,
    }

    impl ContextIndex for CountingIndex {
        fn analyze(&self, text: &str) -> Result<Vec<String>, IndexError> {
            self.analyzed.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.inner.analyze(text)
        }

        fn idf_cache(&self) -> Arc<IdfTable> {
            self.inner.idf_cache()
        }

        fn term_frequencies(
            &self,
            doc: DocId,
            field: &str,
        ) -> Result<HashMap<String, u32>, IndexError> {
            self.inner.term_frequencies(doc, field)
        }

        fn candidates(&self, terms: &[String], limit: usize) -> Result<Vec<DocId>, IndexError> {
            self.inner.candidates(terms, limit)
        }

        fn domain_of(&self, doc: DocId) -> Option<DomainId> {
            self.inner.domain_of(doc)
        }
    }

    #[test]
    fn reference_is_analyzed_once_per_batch() {
        let inner = MemoryIndex::new();
        for domain in 1..=8 {
            inner.add(domain, &format!("shared term plus word{domain}"));
        }
        let index = Arc::new(CountingIndex {
            inner,
            analyzed: AtomicUsize::new(0),
        });

        let mut calc = SimilarityCalculator::new(index.clone());
        calc.set_workers(4);
        calc.set_boost(true);
        calc.set_reference("shared term");
        calc.set_candidates((1..=8).collect()).expect("candidates");
        calc.compute_all(true).expect("compute");

        assert_eq!(index.analyzed.load(Ordering::SeqCst), 1);
        for domain in 1..=8 {
            assert!(calc.similarity(domain).expect("score") > 0.0);
        }
    }

    #[test]
    fn missing_candidate_fails_only_its_own_result() {
        let mut calc = SimilarityCalculator::new(sample_index());
        calc.set_reference("contract");
        calc.set_candidates(vec![1, 42]).expect("candidates");
        calc.compute_all(true).expect("compute");
        assert!(calc.similarity(1).expect("1") > 0.0);
        assert_eq!(
            calc.similarity(42),
            Err(SimilarityError::IndexAccess(IndexError::MissingDocument(42)))
        );
    }

    #[test]
    fn similarity_before_compute_is_a_state_error() {
        let calc = SimilarityCalculator::new(sample_index());
        let err = calc.similarity(1).expect_err("not started");
        assert!(err.is_state_error());
    }

    /// Index whose candidate lookups block until the gate opens.
    struct GatedIndex {
        inner: MemoryIndex,
        open: StdMutex<bool>,
        opened: Condvar,
    }

    impl GatedIndex {
        fn release(&self) {
            *self.open.lock().expect("gate") = true;
            self.opened.notify_all();
        }
    }

    impl ContextIndex for GatedIndex {
        fn analyze(&self, text: &str) -> Result<Vec<String>, IndexError> {
            self.inner.analyze(text)
        }

        fn idf_cache(&self) -> Arc<IdfTable> {
            self.inner.idf_cache()
        }

        fn term_frequencies(
            &self,
            doc: DocId,
            field: &str,
        ) -> Result<HashMap<String, u32>, IndexError> {
            let mut open = self.open.lock().expect("gate");
            while !*open {
                open = self.opened.wait(open).expect("gate");
            }
            drop(open);
            self.inner.term_frequencies(doc, field)
        }

        fn candidates(&self, terms: &[String], limit: usize) -> Result<Vec<DocId>, IndexError> {
            self.inner.candidates(terms, limit)
        }

        fn domain_of(&self, doc: DocId) -> Option<DomainId> {
            self.inner.domain_of(doc)
        }
    }

    fn gated_index() -> Arc<GatedIndex> {
        let inner = MemoryIndex::new();
        inner.add(1, "alpha beta");
        inner.add(2, "gamma");
        Arc::new(GatedIndex {
            inner,
            open: StdMutex::new(false),
            opened: Condvar::new(),
        })
    }

    #[test]
    fn second_batch_while_running_fails_fast() {
        let index = gated_index();
        let mut calc = SimilarityCalculator::new(index.clone());
        calc.set_reference("alpha");
        calc.set_candidates(vec![1, 2]).expect("candidates");

        calc.compute_all(false).expect("first batch");
        assert!(calc.is_running());
        assert_eq!(calc.compute_all(false), Err(SimilarityError::AlreadyRunning));
        assert_eq!(calc.set_candidates(vec![1]), Err(SimilarityError::AlreadyRunning));

        index.release();
        calc.await_termination();
        assert!(!calc.is_running());
        calc.compute_all(true).expect("rerun after completion");
    }

    #[test]
    fn similarity_blocks_until_the_result_is_ready() {
        let index = gated_index();
        let mut calc = SimilarityCalculator::new(index.clone());
        calc.set_reference("alpha");
        calc.set_candidates(vec![1, 2]).expect("candidates");
        calc.compute_all(false).expect("batch");

        let releaser = {
            let index = index.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                index.release();
            })
        };
        let score = calc.similarity(1).expect("score");
        releaser.join().expect("join");

        let expected = 1.0 / 2f32.sqrt();
        assert!((score - expected).abs() < 1e-6, "score={score}");
        assert_eq!(calc.similarity(2).expect("2"), 0.0);
    }
}
