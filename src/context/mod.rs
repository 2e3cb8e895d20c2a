mod analyzer;
pub mod index;
pub mod similarity;

pub use analyzer::{ContextAnalyzer, ContextAnalyzerError, IndexContextAnalyzer};
pub use index::{ContextIndex, DocId, IdfTable, IndexError, MemoryIndex, CONTENT_FIELD};
pub use similarity::{cosine_similarity, SimilarityCalculator, SimilarityError};
