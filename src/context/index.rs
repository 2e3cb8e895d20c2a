use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::ir::DomainId;

pub type DocId = u32;

/// Field under which every indexed document stores its term vector.
pub const CONTENT_FIELD: &str = "content";

static TERM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("term regex"));

#[derive(Clone, Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("document {0} not found in context index")]
    MissingDocument(DocId),
    #[error("document {doc} has no term vector for field {field}")]
    MissingTermVector { doc: DocId, field: String },
    #[error("context index i/o: {0}")]
    Io(String),
}

/// Read access to the index the similarity engine scores against.
pub trait ContextIndex: Send + Sync {
    /// Runs text through the same analysis chain used at indexing time.
    fn analyze(&self, text: &str) -> Result<Vec<String>, IndexError>;

    fn idf_cache(&self) -> Arc<IdfTable>;

    /// Stored raw term frequencies of one document.
    fn term_frequencies(&self, doc: DocId, field: &str) -> Result<HashMap<String, u32>, IndexError>;

    /// Documents sharing at least one of `terms`, best overlap first.
    fn candidates(&self, terms: &[String], limit: usize) -> Result<Vec<DocId>, IndexError>;

    fn domain_of(&self, doc: DocId) -> Option<DomainId>;
}

#[derive(Clone, Debug, Default)]
pub struct IdfTable {
    num_docs: u32,
    doc_freqs: HashMap<String, u32>,
}

impl IdfTable {
    pub fn new(num_docs: u32, doc_freqs: HashMap<String, u32>) -> Self {
        Self {
            num_docs,
            doc_freqs,
        }
    }

    #[must_use]
    pub fn idf(&self, term: &str) -> f32 {
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        let n = self.num_docs.max(1) as f64;
        (1.0 + (n / (df + 1.0)).ln()).max(0.0) as f32
    }

    #[must_use]
    pub fn tf_idf(&self, term: &str, freq: u32) -> f32 {
        freq as f32 * self.idf(term)
    }
}

pub fn analyze_text(text: &str) -> Vec<String> {
    TERM_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<DocId, IndexedDoc>,
    idf: Arc<IdfTable>,
}

struct IndexedDoc {
    domain: DomainId,
    terms: HashMap<String, u32>,
}

/// In-memory index holding one document per domain. Document ids equal domain ids.
#[derive(Default)]
pub struct MemoryIndex {
    inner: RwLock<Inner>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every `<domain_id>.txt` file in `dir`; other files are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, IndexError> {
        let index = Self::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| IndexError::Io(format!("read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| IndexError::Io(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("txt") {
                continue;
            }
            let Some(domain) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<DomainId>().ok())
            else {
                continue;
            };
            let text = std::fs::read_to_string(&path)
                .map_err(|e| IndexError::Io(format!("read {}: {e}", path.display())))?;
            index.add(domain, &text);
        }
        Ok(index)
    }

    /// Appends text to the domain's document, creating it when absent.
    pub fn add(&self, domain: DomainId, text: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let doc = inner.docs.entry(domain).or_insert_with(|| IndexedDoc {
            domain,
            terms: HashMap::new(),
        });
        for term in analyze_text(text) {
            *doc.terms.entry(term).or_insert(0) += 1;
        }
        inner.idf = Arc::new(build_idf(&inner.docs));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_idf(docs: &BTreeMap<DocId, IndexedDoc>) -> IdfTable {
    let mut doc_freqs: HashMap<String, u32> = HashMap::new();
    for doc in docs.values() {
        for term in doc.terms.keys() {
            *doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }
    }
    IdfTable::new(docs.len() as u32, doc_freqs)
}

impl ContextIndex for MemoryIndex {
    fn analyze(&self, text: &str) -> Result<Vec<String>, IndexError> {
        Ok(analyze_text(text))
    }

    fn idf_cache(&self) -> Arc<IdfTable> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).idf.clone()
    }

    fn term_frequencies(&self, doc: DocId, field: &str) -> Result<HashMap<String, u32>, IndexError> {
        if field != CONTENT_FIELD {
            return Err(IndexError::MissingTermVector {
                doc,
                field: field.to_string(),
            });
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .docs
            .get(&doc)
            .map(|d| d.terms.clone())
            .ok_or(IndexError::MissingDocument(doc))
    }

    fn candidates(&self, terms: &[String], limit: usize) -> Result<Vec<DocId>, IndexError> {
        let wanted: HashSet<&str> = terms.iter().map(|t| t.as_str()).collect();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<(usize, DocId)> = inner
            .docs
            .iter()
            .filter_map(|(id, doc)| {
                let overlap = wanted.iter().filter(|t| doc.terms.contains_key(**t)).count();
                (overlap > 0).then_some((overlap, *id))
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(_, id)| id).collect())
    }

    fn domain_of(&self, doc: DocId) -> Option<DomainId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.docs.get(&doc).map(|d| d.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyzer_lowercases_and_drops_punctuation() {
        assert_eq!(
            analyze_text("The Cat, the HAT! 42"),
            vec!["the", "cat", "the", "hat", "42"]
        );
    }

    #[test]
    fn idf_prefers_rare_terms() {
        let index = MemoryIndex::new();
        index.add(1, "common rare");
        index.add(2, "common");
        index.add(3, "common");
        let idf = index.idf_cache();
        assert!(idf.idf("rare") > idf.idf("common"));
        assert!(idf.idf("common") >= 0.0);
        assert_eq!(idf.tf_idf("rare", 0), 0.0);
    }

    #[test]
    fn candidates_rank_by_overlap() {
        let index = MemoryIndex::new();
        index.add(1, "alpha");
        index.add(2, "alpha beta");
        index.add(3, "gamma");
        let terms = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(index.candidates(&terms, 10).expect("candidates"), vec![2, 1]);
        assert_eq!(index.candidates(&terms, 1).expect("candidates"), vec![2]);
    }

    #[test]
    fn load_dir_indexes_numeric_txt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("4.txt"), "legal contract clause").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");
        std::fs::write(dir.path().join("5.md"), "ignored").expect("write");
        let index = MemoryIndex::load_dir(dir.path()).expect("load");
        assert_eq!(index.len(), 1);
        assert_eq!(index.domain_of(4), Some(4));
        let tf = index.term_frequencies(4, CONTENT_FIELD).expect("tf");
        assert_eq!(tf.get("clause"), Some(&1));
        assert!(matches!(
            index.term_frequencies(4, "title"),
            Err(IndexError::MissingTermVector { .. })
        ));
    }
}
