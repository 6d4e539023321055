//! Input rows for the document store.
//!
//! A [`Row`] carries an external uid, its [`Content`] and optional tags.
//! Structured content is stored verbatim in `documents`; any text it resolves
//! to becomes one `sections` row and consumes one label.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content of an input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text.
    Text(String),
    /// Pre-tokenized text, joined with single spaces.
    Tokens(Vec<String>),
    /// Structured document. Its `text` field, if a string, is the section text.
    Object(serde_json::Map<String, Value>),
}

/// A document to insert: `(uid, content, tags)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub uid: String,
    pub content: Content,
    #[serde(default)]
    pub tags: Option<String>,
}

impl Row {
    pub fn new(uid: impl Into<String>, content: Content) -> Self {
        Self {
            uid: uid.into(),
            content,
            tags: None,
        }
    }

    /// Plain-text row.
    pub fn text(uid: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(uid, Content::Text(text.into()))
    }

    /// Structured row. Non-object JSON values are wrapped as `{"value": ...}`.
    pub fn object(uid: impl Into<String>, data: Value) -> Self {
        let map = match data {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(uid, Content::Object(map))
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    /// Section text for this row, or `None` when it resolves to nothing.
    pub fn section_text(&self) -> Option<String> {
        let text = match &self.content {
            Content::Text(text) => text.clone(),
            Content::Tokens(tokens) => tokens.join(" "),
            Content::Object(map) => match map.get("text") {
                Some(Value::String(text)) => text.clone(),
                _ => return None,
            },
        };
        (!text.is_empty()).then_some(text)
    }

    /// Serialized structured content, stored in `documents.data`.
    pub fn data(&self) -> Option<String> {
        match &self.content {
            Content::Object(map) => Some(Value::Object(map.clone()).to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tokens_join() {
        let row = Row::new(
            "a",
            Content::Tokens(vec!["hello".into(), "world".into()]),
        );
        assert_eq!(row.section_text().as_deref(), Some("hello world"));
        assert!(row.data().is_none());
    }

    #[test]
    fn test_object_text_field() {
        let row = Row::object("a", json!({"text": "body", "lang": "en"}));
        assert_eq!(row.section_text().as_deref(), Some("body"));
        let data: Value = serde_json::from_str(&row.data().unwrap()).unwrap();
        assert_eq!(data["lang"], "en");
    }

    #[test]
    fn test_object_without_text() {
        let row = Row::object("a", json!({"title": 3}));
        assert!(row.section_text().is_none());
        assert!(row.data().is_some());
    }

    #[test]
    fn test_empty_text_is_none() {
        assert!(Row::text("a", "").section_text().is_none());
        assert!(Row::new("a", Content::Tokens(vec![])).section_text().is_none());
    }

    #[test]
    fn test_untagged_deserialize() {
        let row: Row = serde_json::from_value(json!({
            "uid": "x",
            "content": {"text": "t"},
            "tags": "news"
        }))
        .unwrap();
        assert!(matches!(row.content, Content::Object(_)));
        assert_eq!(row.tags.as_deref(), Some("news"));
    }
}
