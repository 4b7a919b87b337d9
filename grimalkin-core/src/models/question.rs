//! Questions and answered Q&As

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A question as submitted, before it has an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuestion {
    /// User the question is addressed to (partition key)
    pub asked: String,
    pub asker: String,
    #[serde(default)]
    pub is_anon: bool,
    pub question: String,
}

/// A pending (unanswered) question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question_id: Uuid,
    pub asked: String,
    pub asker: String,
    pub is_anon: bool,
    pub question: String,
}

impl Question {
    pub fn from_new(question_id: Uuid, q: NewQuestion) -> Self {
        Self {
            question_id,
            asked: q.asked,
            asker: q.asker,
            is_anon: q.is_anon,
            question: q.question,
        }
    }

    /// Name shown to readers; anonymous askers are hidden.
    pub fn display_asker(&self) -> Option<&str> {
        (!self.is_anon).then_some(self.asker.as_str())
    }
}

/// The answer the asked user gives to one of their pending questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub asked: String,
    pub answer: String,
}

impl Answer {
    pub fn new(asked: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            asked: asked.into(),
            answer: answer.into(),
        }
    }
}

/// An answered question.
///
/// The same logical record is stored once for its owner and once per
/// follower of the owner; every copy carries identical text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QAndA {
    pub question_id: Uuid,
    pub asked: String,
    pub asker: String,
    pub is_anon: bool,
    pub question: String,
    pub answer: String,
    pub answered_on: DateTime<Utc>,
}

impl QAndA {
    /// Combine a pending question with its answer under a fresh identifier.
    pub fn answering(
        question: Question,
        answer: String,
        question_id: Uuid,
        answered_on: DateTime<Utc>,
    ) -> Self {
        Self {
            question_id,
            asked: question.asked,
            asker: question.asker,
            is_anon: question.is_anon,
            question: question.question,
            answer,
            answered_on,
        }
    }

    /// True when `other` carries the same question and answer text.
    pub fn same_payload(&self, other: &QAndA) -> bool {
        self.question_id == other.question_id
            && self.asked == other.asked
            && self.asker == other.asker
            && self.is_anon == other.is_anon
            && self.question == other.question
            && self.answer == other.answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_asker_is_hidden() {
        let mut q = Question {
            question_id: Uuid::nil(),
            asked: "bob".into(),
            asker: "ann".into(),
            is_anon: true,
            question: "hi?".into(),
        };
        assert_eq!(q.display_asker(), None);
        q.is_anon = false;
        assert_eq!(q.display_asker(), Some("ann"));
    }

    #[test]
    fn question_json_uses_camel_case() {
        let json = r#"{"asked":"bob","asker":"ann","isAnon":true,"question":"hi?"}"#;
        let q: NewQuestion = serde_json::from_str(json).unwrap();
        assert!(q.is_anon);

        let json = r#"{"asked":"bob","asker":"ann","question":"hi?"}"#;
        let q: NewQuestion = serde_json::from_str(json).unwrap();
        assert!(!q.is_anon);
    }

    #[test]
    fn answering_keeps_question_text() {
        let q = Question {
            question_id: Uuid::nil(),
            asked: "bob".into(),
            asker: "ann".into(),
            is_anon: false,
            question: "hi?".into(),
        };
        let new_id = Uuid::now_v7();
        let qa = QAndA::answering(q, "hey!".into(), new_id, Utc::now());
        assert_eq!(qa.question_id, new_id);
        assert_eq!(qa.question, "hi?");
        assert_eq!(qa.answer, "hey!");
    }
}
