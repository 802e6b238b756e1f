//! Typed chat actions derived from the numeric `action` code and its payload.

use serde_json::Value;

use crate::error::ValidationError;

/// Mode selected by a job's `action` code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    /// Action 1: free-form chat.
    PlainChat { message: String },
    /// Action 2: summarize one text.
    Summarize {
        doc: String,
        message: Option<String>,
    },
    /// Action 3: check one text, or a pair of texts, for contradictions.
    Contradiction {
        first: String,
        second: Option<String>,
        message: Option<String>,
    },
    /// Action 4: answer a question about a document.
    DocQa {
        doc: String,
        question: Option<String>,
        message: Option<String>,
    },
}

/// Structured fields sent upstream for one action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedInput {
    pub fdoc: String,
    pub sdoc: String,
    pub query: String,
    /// Content of the `user` turn sent upstream.
    pub content: String,
}

impl ChatAction {
    /// Parse the raw request fields. Only action 1 requires a message.
    pub fn from_parts(
        action: i64,
        message: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<Self, ValidationError> {
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let field = |name: &str| payload.and_then(|p| p.get(name)).and_then(text_of);
        let listed = |idx: usize| {
            payload
                .and_then(|p| p.get("docs"))
                .and_then(Value::as_array)
                .and_then(|docs| docs.get(idx))
                .and_then(text_of)
        };

        match action {
            1 => Ok(Self::PlainChat {
                message: message.ok_or(ValidationError::MessageRequired)?,
            }),
            2 => Ok(Self::Summarize {
                doc: field("doc")
                    .or_else(|| field("text"))
                    .or_else(|| listed(0))
                    .unwrap_or_default(),
                message,
            }),
            3 => {
                let (first, second) = match (listed(0), listed(1)) {
                    (Some(first), second) => (first, second),
                    (None, _) => (field("doc").unwrap_or_default(), field("doc2")),
                };
                Ok(Self::Contradiction {
                    first,
                    second,
                    message,
                })
            }
            4 => Ok(Self::DocQa {
                doc: field("doc").or_else(|| listed(0)).unwrap_or_default(),
                question: field("question")
                    .or_else(|| field("query"))
                    .filter(|q| !q.trim().is_empty()),
                message,
            }),
            other => Err(ValidationError::UnsupportedAction(other)),
        }
    }

    /// Numeric code as sent upstream.
    pub fn code(&self) -> i64 {
        match self {
            Self::PlainChat { .. } => 1,
            Self::Summarize { .. } => 2,
            Self::Contradiction { .. } => 3,
            Self::DocQa { .. } => 4,
        }
    }

    /// Text persisted as the user's message: the free text when present,
    /// otherwise a readable placeholder.
    pub fn user_content(&self) -> String {
        match self {
            Self::PlainChat { message } => message.clone(),
            Self::Summarize { message, .. } => message
                .clone()
                .unwrap_or_else(|| "Summarize document".to_string()),
            Self::Contradiction {
                message, second, ..
            } => message.clone().unwrap_or_else(|| {
                if second.is_some() {
                    "Check contradictions between documents".to_string()
                } else {
                    "Check contradictions in document".to_string()
                }
            }),
            Self::DocQa {
                message, question, ..
            } => message.clone().unwrap_or_else(|| match question {
                Some(q) => format!("Question about document: {}", q.trim()),
                None => "Question about document".to_string(),
            }),
        }
    }

    /// Derive the upstream fields for this action.
    pub fn derive(&self) -> DerivedInput {
        match self {
            Self::PlainChat { .. } => DerivedInput {
                content: self.user_content(),
                ..Default::default()
            },
            Self::Summarize { doc, .. } => DerivedInput {
                fdoc: doc.clone(),
                content: self.user_content(),
                ..Default::default()
            },
            Self::Contradiction { first, second, .. } => DerivedInput {
                fdoc: first.clone(),
                sdoc: second.clone().unwrap_or_default(),
                content: self.user_content(),
                ..Default::default()
            },
            Self::DocQa { doc, question, .. } => {
                let query = question.as_deref().map(normalize_query).unwrap_or_default();
                let content = if query.is_empty() {
                    self.user_content()
                } else {
                    query.clone()
                };
                DerivedInput {
                    fdoc: doc.clone(),
                    sdoc: String::new(),
                    query,
                    content,
                }
            }
        }
    }
}

/// Accept either a bare string or an object with a `text` field.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Trim and drop trailing question marks.
fn normalize_query(question: &str) -> String {
    question.trim().trim_end_matches('?').trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_chat_requires_message() {
        assert_eq!(
            ChatAction::from_parts(1, None, None),
            Err(ValidationError::MessageRequired)
        );
        assert_eq!(
            ChatAction::from_parts(1, Some("   "), None),
            Err(ValidationError::MessageRequired)
        );
        let action = ChatAction::from_parts(1, Some("hello"), None).unwrap();
        assert_eq!(action.derive().content, "hello");
        assert_eq!(action.code(), 1);
    }

    #[test]
    fn unknown_action_rejected() {
        assert_eq!(
            ChatAction::from_parts(7, Some("x"), None),
            Err(ValidationError::UnsupportedAction(7))
        );
    }

    #[test]
    fn summarize_uses_placeholder_without_message() {
        let payload = json!({"doc": {"text": "long text"}});
        let action = ChatAction::from_parts(2, None, Some(&payload)).unwrap();
        let derived = action.derive();
        assert_eq!(derived.fdoc, "long text");
        assert_eq!(derived.sdoc, "");
        assert_eq!(derived.content, "Summarize document");
    }

    #[test]
    fn contradiction_reads_doc_list() {
        let payload = json!({"docs": ["a", {"text": "b"}]});
        let action = ChatAction::from_parts(3, None, Some(&payload)).unwrap();
        let derived = action.derive();
        assert_eq!(derived.fdoc, "a");
        assert_eq!(derived.sdoc, "b");
        assert_eq!(derived.content, "Check contradictions between documents");
    }

    #[test]
    fn contradiction_single_doc() {
        let payload = json!({"doc": "only"});
        let action = ChatAction::from_parts(3, Some("check this"), Some(&payload)).unwrap();
        let derived = action.derive();
        assert_eq!(derived.fdoc, "only");
        assert_eq!(derived.sdoc, "");
        assert_eq!(derived.content, "check this");
    }

    #[test]
    fn doc_qa_question_becomes_content() {
        let payload = json!({"doc": {"text": "T"}, "question": "Q?"});
        let action = ChatAction::from_parts(4, None, Some(&payload)).unwrap();
        let derived = action.derive();
        assert_eq!(derived.fdoc, "T");
        assert_eq!(derived.query, "Q");
        assert_eq!(derived.content, "Q");
        assert_eq!(action.user_content(), "Question about document: Q?");
    }

    #[test]
    fn doc_qa_without_question_falls_back_to_message() {
        let payload = json!({"doc": "T"});
        let action = ChatAction::from_parts(4, Some("what is this"), Some(&payload)).unwrap();
        let derived = action.derive();
        assert_eq!(derived.query, "");
        assert_eq!(derived.content, "what is this");
    }
}
