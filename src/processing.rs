use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::ir::{MultiOptionToken, Sentence, Token, Translation, Word};
use crate::sentinels::{is_opt_token, opt_token};

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{[^{}]*\|[^{}]*\}|[\p{L}\p{N}]+(?:['’][\p{L}]+)*|\S").expect("token regex")
});

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("input has {tokens} tokens, limit is {max}")]
    TooLong { tokens: usize, max: usize },
    #[error("translation references unknown option placeholder {0}")]
    UnknownPlaceholder(String),
    #[error("{0}")]
    Other(String),
}

pub trait Preprocessor: Send + Sync {
    fn process(&self, text: &str) -> Result<Sentence, ProcessingError>;
}

pub trait Postprocessor: Send + Sync {
    fn process(&self, translation: &mut Translation) -> Result<(), ProcessingError>;

    fn process_all(&self, translations: &mut [Translation]) -> Result<(), ProcessingError> {
        for t in translations {
            self.process(t)?;
        }
        Ok(())
    }
}

/// Word/punctuation tokenizer. A `{a|b}` group becomes a [`MultiOptionToken`]
/// whose options are the literal alternatives; groups never nest.
pub struct SimplePreprocessor {
    max_tokens: usize,
}

impl SimplePreprocessor {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

impl Default for SimplePreprocessor {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Preprocessor for SimplePreprocessor {
    fn process(&self, text: &str) -> Result<Sentence, ProcessingError> {
        let matches: Vec<regex::Match<'_>> = TOKEN_RE.find_iter(text).collect();
        if matches.len() > self.max_tokens {
            return Err(ProcessingError::TooLong {
                tokens: matches.len(),
                max: self.max_tokens,
            });
        }

        let mut tokens: Vec<Token> = Vec::with_capacity(matches.len());
        let mut next_opt = 1usize;
        for (i, m) in matches.iter().enumerate() {
            let right_space = match matches.get(i + 1) {
                Some(next) if next.start() > m.end() => Some(" ".to_string()),
                _ => None,
            };
            let raw = m.as_str();
            let mut token = if raw.starts_with('{') && raw.len() > 1 {
                let options: Vec<String> = raw[1..raw.len() - 1]
                    .split('|')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                match options.len() {
                    0 => continue,
                    1 => Token::Word(Word::new(options[0].clone(), None)),
                    _ => {
                        let placeholder = opt_token(next_opt);
                        next_opt += 1;
                        Token::MultiOption(MultiOptionToken::new(placeholder, options))
                    }
                }
            } else {
                Token::Word(Word::new(raw, None))
            };
            token.set_right_space(right_space);
            tokens.push(token);
        }
        if let Some(last) = tokens.last_mut() {
            last.set_right_space(None);
        }
        Ok(Sentence::new(tokens))
    }
}

/// Restores source multi-option tokens where the decoder echoed their
/// placeholders, and terminates the word sequence.
#[derive(Default)]
pub struct SimplePostprocessor;

impl Postprocessor for SimplePostprocessor {
    fn process(&self, translation: &mut Translation) -> Result<(), ProcessingError> {
        let sources: Vec<MultiOptionToken> =
            translation.source.multi_option_tokens().cloned().collect();
        for token in &mut translation.words {
            let Token::Word(word) = token else {
                continue;
            };
            if !is_opt_token(&word.text) {
                continue;
            }
            let mut restored = sources
                .iter()
                .find(|m| m.placeholder == word.text)
                .cloned()
                .ok_or_else(|| ProcessingError::UnknownPlaceholder(word.text.clone()))?;
            restored.right_space = word.right_space.take();
            *token = Token::MultiOption(restored);
        }
        if let Some(last) = translation.words.last_mut() {
            last.set_right_space(None);
        }
        Ok(())
    }
}
