use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type DomainId = u32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    /// Whitespace emitted after this word when detokenizing; `None` on the last word.
    pub right_space: Option<String>,
}

impl Word {
    pub fn new(text: impl Into<String>, right_space: Option<&str>) -> Self {
        Self {
            text: text.into(),
            right_space: right_space.map(|s| s.to_string()),
        }
    }
}

/// A token carrying several alternative source renderings.
///
/// Options are flat strings: translating one option never yields another
/// unresolved `MultiOptionToken`, so resolving them recursively terminates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiOptionToken {
    pub placeholder: String,
    pub options: Vec<String>,
    pub right_space: Option<String>,
    translations: Option<Vec<Translation>>,
}

impl MultiOptionToken {
    pub fn new(placeholder: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
            options,
            right_space: None,
            translations: None,
        }
    }

    #[must_use]
    pub fn has_translated_options(&self) -> bool {
        self.translations.is_some()
    }

    #[must_use]
    pub fn translated_options(&self) -> Option<&[Translation]> {
        self.translations.as_deref()
    }

    /// Human-readable form: `{a|b}` over the translated options once they
    /// are attached, over the source options before that.
    #[must_use]
    pub fn display_text(&self) -> String {
        let alternatives: Vec<String> = match &self.translations {
            Some(translations) => translations.iter().map(Translation::text).collect(),
            None => self.options.clone(),
        };
        format!("{{{}}}", alternatives.join("|"))
    }

    /// Attaches one translation per option, in option order.
    pub fn set_translated_options(&mut self, translations: Vec<Translation>) -> bool {
        if translations.len() != self.options.len() {
            return false;
        }
        self.translations = Some(translations);
        true
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Token {
    Word(Word),
    MultiOption(MultiOptionToken),
}

impl Token {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Token::Word(w) => &w.text,
            Token::MultiOption(m) => &m.placeholder,
        }
    }

    #[must_use]
    pub fn right_space(&self) -> Option<&str> {
        match self {
            Token::Word(w) => w.right_space.as_deref(),
            Token::MultiOption(m) => m.right_space.as_deref(),
        }
    }

    pub fn set_right_space(&mut self, space: Option<String>) {
        match self {
            Token::Word(w) => w.right_space = space,
            Token::MultiOption(m) => m.right_space = space,
        }
    }
}

impl From<Word> for Token {
    fn from(w: Word) -> Self {
        Token::Word(w)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    tokens: Vec<Token>,
}

impl Sentence {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn from_words(words: Vec<Word>) -> Self {
        Self {
            tokens: words.into_iter().map(Token::Word).collect(),
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn surface(&self) -> String {
        detokenize(&self.tokens)
    }

    pub fn multi_option_tokens(&self) -> impl Iterator<Item = &MultiOptionToken> {
        self.tokens.iter().filter_map(|t| match t {
            Token::MultiOption(m) => Some(m),
            Token::Word(_) => None,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub source: Sentence,
    pub words: Vec<Token>,
    pub nbest: Option<Vec<Translation>>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl Translation {
    pub fn new(source: Sentence, words: Vec<Token>) -> Self {
        Self {
            source,
            words,
            nbest: None,
            elapsed_ms: 0,
        }
    }

    #[must_use]
    pub fn has_nbest(&self) -> bool {
        self.nbest.is_some()
    }

    #[must_use]
    pub fn text(&self) -> String {
        detokenize(&self.words)
    }

    pub fn multi_option_tokens_mut(&mut self) -> impl Iterator<Item = &mut MultiOptionToken> {
        self.words.iter_mut().filter_map(|t| match t {
            Token::MultiOption(m) => Some(m),
            Token::Word(_) => None,
        })
    }

    pub fn multi_option_tokens(&self) -> impl Iterator<Item = &MultiOptionToken> {
        self.words.iter().filter_map(|t| match t {
            Token::MultiOption(m) => Some(m),
            Token::Word(_) => None,
        })
    }
}

fn detokenize(tokens: &[Token]) -> String {
    let mut out = String::new();
    for tok in tokens {
        match tok {
            Token::Word(w) => out.push_str(&w.text),
            Token::MultiOption(m) => out.push_str(&m.display_text()),
        }
        if let Some(space) = tok.right_space() {
            out.push_str(space);
        }
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextScore {
    pub domain: DomainId,
    pub weight: f32,
}

/// Weighted set of domains a text resembles, unique by domain and sorted by
/// descending weight.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextVector {
    entries: Vec<ContextScore>,
}

impl ContextVector {
    pub fn builder() -> ContextVectorBuilder {
        ContextVectorBuilder::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[ContextScore] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn weight_of(&self, domain: DomainId) -> Option<f32> {
        self.entries
            .iter()
            .find(|e| e.domain == domain)
            .map(|e| e.weight)
    }
}

#[derive(Default)]
pub struct ContextVectorBuilder {
    weights: HashMap<DomainId, f32>,
    limit: Option<usize>,
}

impl ContextVectorBuilder {
    /// Negative and non-finite weights are dropped; duplicates keep the larger weight.
    pub fn add(mut self, domain: DomainId, weight: f32) -> Self {
        if !weight.is_finite() || weight < 0.0 {
            return self;
        }
        let slot = self.weights.entry(domain).or_insert(weight);
        if weight > *slot {
            *slot = weight;
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> ContextVector {
        let mut entries: Vec<ContextScore> = self
            .weights
            .into_iter()
            .map(|(domain, weight)| ContextScore { domain, weight })
            .collect();
        entries.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        if let Some(limit) = self.limit {
            entries.truncate(limit);
        }
        ContextVector { entries }
    }
}

/// Translation-memory suggestion used to bias decoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub sentence: Vec<String>,
    pub translation: Vec<String>,
    pub score: f32,
}

impl ScoreEntry {
    pub fn new(sentence: Vec<String>, translation: Vec<String>, score: f32) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            sentence,
            translation,
            score,
        }
    }
}
