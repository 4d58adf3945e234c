use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors returned by the backend in the `errors` field, keyed by
/// the offending field (`"email"`, `"body"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorList(pub BTreeMap<String, Vec<String>>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.0.entry(field.into()).or_default().push(message.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Flattens the list into `"<field> <message>"` lines, the form the
    /// backend intends them to be shown in.
    pub fn messages(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(field, messages)| {
                messages.iter().map(move |message| format!("{field} {message}"))
            })
            .collect()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.messages().join("; "))
    }
}

#[derive(Debug, Error)]
#[error("malformed intent: {0}")]
pub struct IntentDecodeError(#[from] pub serde_json::Error);
