//! Page response validation
//!
//! Every page must carry an explicit error indicator. Error pages whose
//! messages are all advisory (documentation or metadata notices) are accepted
//! as warnings; anything else rejects the page.

use crate::error::SyncError;
use crate::models::{ApiMessage, PageResponse};

/// Outcome of validating one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    /// No error reported
    Clean,
    /// Error flagged, but every message is advisory; carries the message count
    Advisory(u32),
    /// Error flagged with at least one real failure
    Rejected(Vec<String>),
}

/// Classifies page responses
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseValidator {
    advisory_codes: Vec<String>,
    advisory_keywords: Vec<String>,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new(
            Vec::new(),
            vec!["documentation".to_string(), "metadata".to_string()],
        )
    }
}

impl ResponseValidator {
    /// Create a validator; codes and keywords are matched case-insensitively
    pub fn new(advisory_codes: Vec<String>, advisory_keywords: Vec<String>) -> Self {
        Self {
            advisory_codes: advisory_codes.iter().map(|c| c.to_lowercase()).collect(),
            advisory_keywords: advisory_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Validate page `page`
    pub fn validate(&self, response: &PageResponse, page: u32) -> Result<PageVerdict, SyncError> {
        let is_error = response
            .is_error
            .ok_or(SyncError::MissingErrorIndicator { page })?;

        if !is_error {
            return Ok(PageVerdict::Clean);
        }

        if !response.messages.is_empty() && response.messages.iter().all(|m| self.is_advisory(m)) {
            return Ok(PageVerdict::Advisory(response.messages.len() as u32));
        }

        let messages = if response.messages.is_empty() {
            vec!["remote reported an error without details".to_string()]
        } else {
            response.messages.iter().map(ToString::to_string).collect()
        };
        Ok(PageVerdict::Rejected(messages))
    }

    /// Whether a message is advisory
    ///
    /// An explicit code decides on its own; keywords are consulted only for
    /// messages without a code.
    pub fn is_advisory(&self, message: &ApiMessage) -> bool {
        if let Some(code) = &message.code {
            if !self.advisory_codes.is_empty() {
                return self.advisory_codes.contains(&code.to_lowercase());
            }
        }
        let text = message.message.to_lowercase();
        self.advisory_keywords.iter().any(|k| text.contains(k))
    }
}
