//! Line-delimited JSON exchanged with the decoder process.
//!
//! Request: `{"source": "...", "suggestions": [{"source", "target", "score"}]}`.
//! Response: `{"translation": "..."}` or `{"error": {"type": "...", "message": "..."}}`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{BridgeError, EngineError, EngineErrorKind};
use crate::ir::{ScoreEntry, Sentence, Word};
use crate::sentinels::{deescape_whitespaces, escape_whitespaces};

static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("spaces regex"));

#[derive(Debug, Serialize)]
struct Request {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestions: Option<Vec<Suggestion>>,
}

#[derive(Debug, Serialize)]
struct Suggestion {
    source: String,
    target: String,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    translation: Option<String>,
    #[serde(default)]
    error: Option<ErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

/// Fixed table from decoder-side error types to local kinds.
pub fn engine_error_kind(error_type: &str) -> EngineErrorKind {
    match error_type {
        "ValueError" | "InvalidRequestException" | "UnicodeDecodeError" => {
            EngineErrorKind::InvalidRequest
        }
        "MemoryError" | "OutOfMemoryError" | "CudaOutOfMemoryError" => EngineErrorKind::OutOfMemory,
        "ModelNotFoundException" | "ModelLoadError" | "IOError" => {
            EngineErrorKind::ModelUnavailable
        }
        _ => EngineErrorKind::Decoding,
    }
}

/// Sentence text as the decoder expects it: tokens separated by single
/// spaces, spaces inside a token escaped.
pub fn source_text(sentence: &Sentence) -> String {
    sentence
        .tokens()
        .iter()
        .map(|t| escape_whitespaces(t.text()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn serialize_request(
    sentence: &Sentence,
    suggestions: Option<&[ScoreEntry]>,
) -> Result<String, BridgeError> {
    let suggestions = suggestions.filter(|s| !s.is_empty()).map(|entries| {
        entries
            .iter()
            .map(|e| Suggestion {
                source: e.sentence.join(" "),
                target: e.translation.join(" "),
                score: e.score,
            })
            .collect()
    });
    let request = Request {
        source: source_text(sentence),
        suggestions,
    };
    let json = serde_json::to_string(&request).map_err(BridgeError::Encode)?;
    Ok(json.replace('\n', " "))
}

pub fn deserialize_response(line: &str) -> Result<Vec<Word>, BridgeError> {
    let response: Response =
        serde_json::from_str(line).map_err(|source| BridgeError::Parse {
            response: line.to_string(),
            source,
        })?;

    if let Some(err) = response.error {
        return Err(BridgeError::Engine(EngineError {
            kind: engine_error_kind(&err.kind),
            error_type: err.kind,
            message: err.message,
        }));
    }

    let translation = response.translation.ok_or_else(|| BridgeError::MissingTranslation {
        response: line.to_string(),
    })?;
    Ok(explode(&translation))
}

fn explode(text: &str) -> Vec<Word> {
    let pieces: Vec<&str> = SPACES_RE
        .split(text.trim())
        .filter(|p| !p.is_empty())
        .collect();
    let last = pieces.len().saturating_sub(1);
    pieces
        .iter()
        .enumerate()
        .map(|(i, p)| Word::new(deescape_whitespaces(p), (i < last).then_some(" ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Token;

    #[test]
    fn request_is_a_single_line() {
        let sentence = Sentence::new(vec![
            Token::Word(Word::new("New\nYork", Some(" "))),
            Token::Word(Word::new("rocks", None)),
        ]);
        let suggestions = vec![ScoreEntry::new(
            vec!["a\nb".into(), "c".into()],
            vec!["x".into()],
            0.5,
        )];
        let line = serialize_request(&sentence, Some(suggestions.as_slice())).expect("encode");
        assert!(!line.contains('\n'));

        let v: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(v["source"], "New\u{2581}York rocks");
        assert_eq!(v["suggestions"][0]["target"], "x");
        assert_eq!(v["suggestions"][0]["score"], 0.5);
    }

    #[test]
    fn empty_suggestions_are_omitted() {
        let sentence = Sentence::from_words(vec![Word::new("hi", None)]);
        let line = serialize_request(&sentence, Some(&[][..])).expect("encode");
        assert_eq!(line, r#"{"source":"hi"}"#);
    }

    #[test]
    fn translation_splits_into_words() {
        let words = deserialize_response(r#"{"translation":"a b"}"#).expect("words");
        assert_eq!(words, vec![Word::new("a", Some(" ")), Word::new("b", None)]);

        let words =
            deserialize_response(r#"{"translation":"x  New▁York","extra":1}"#).expect("words");
        assert_eq!(words[1].text, "New York");
        assert_eq!(words[1].right_space, None);

        assert!(deserialize_response(r#"{"translation":""}"#)
            .expect("empty")
            .is_empty());
    }

    #[test]
    fn error_payload_maps_through_table() {
        let err = deserialize_response(r#"{"error":{"type":"X","message":"m"}}"#)
            .expect_err("error");
        match err {
            BridgeError::Engine(e) => {
                assert_eq!(e.kind, EngineErrorKind::Decoding);
                assert_eq!(e.error_type, "X");
                assert_eq!(e.message.as_deref(), Some("m"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = deserialize_response(r#"{"error":{"type":"MemoryError"}}"#).expect_err("error");
        assert!(matches!(
            err,
            BridgeError::Engine(EngineError {
                kind: EngineErrorKind::OutOfMemory,
                message: None,
                ..
            })
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            deserialize_response("not json"),
            Err(BridgeError::Parse { .. })
        ));
        assert!(matches!(
            deserialize_response("{}"),
            Err(BridgeError::MissingTranslation { .. })
        ));
    }
}
