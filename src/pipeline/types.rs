//! Shared types for the link pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::links::normalize_identifier;

// ── Raw item ────────────────────────────────────────────────────────

/// Source-specific payload, as produced by a `Source`.
///
/// Raw items are never mutated after production. Their identity is their
/// position in the source sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Where the item came from ("mailbox:archive.mbox", "imap:INBOX", ...).
    pub origin: String,
    /// Subject line or file name, if the source has one.
    pub subject: Option<String>,
    /// Readable text body.
    pub body: String,
    /// When the message was sent or the file last modified.
    pub received_at: Option<DateTime<Utc>>,
}

impl RawItem {
    pub fn new(origin: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            subject: None,
            body: body.into(),
            received_at: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }
}

// ── Normalized item ─────────────────────────────────────────────────

/// Canonical link record.
///
/// `identifier` is non-empty once normalization succeeds. `category` and
/// `description` stay empty until enrichment completes; an item with all
/// three filled is an enriched item (see [`NormalizedItem::is_complete`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub identifier: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NormalizedItem {
    /// Create an unclassified item.
    pub fn new(identifier: impl Into<String>, origin: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            category: String::new(),
            description: String::new(),
            origin: origin.into(),
            created_at: at,
            updated_at: at,
        }
    }

    /// True iff identifier, category and description are all non-empty.
    pub fn is_complete(&self) -> bool {
        !self.identifier.is_empty() && !self.category.is_empty() && !self.description.is_empty()
    }

    /// Canonical form of this item. Applying it twice is a no-op.
    pub fn normalized(mut self) -> Self {
        self.identifier = normalize_identifier(&self.identifier);
        self.category = self.category.trim().to_string();
        self.description = self.description.trim().to_string();
        self.origin = self.origin.trim().to_string();
        self
    }

    /// Apply a successful enrichment result.
    pub fn with_analysis(mut self, analysis: Analysis) -> Self {
        self.category = analysis.category;
        self.description = analysis.description;
        self.updated_at = Utc::now();
        self
    }
}

/// Classification returned by an enrichment call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub category: String,
    pub description: String,
}

impl Analysis {
    pub fn new(category: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            description: description.into(),
        }
    }
}

// ── Run statistics ──────────────────────────────────────────────────

/// Counters accumulated over one executor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    /// Raw items pulled from the source.
    pub items_produced: usize,
    /// Items accepted by the consumer.
    pub items_consumed: usize,
    /// Items the consumer rejected as duplicates.
    pub duplicates_filtered: usize,
    /// Raw items whose pipeline pass produced no output.
    pub filtered: usize,
    /// Raw items whose pipeline pass failed.
    pub errors: usize,
    /// The source failed mid-run.
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatistics {
    pub fn start() -> Self {
        Self {
            items_produced: 0,
            items_consumed: 0,
            duplicates_filtered: 0,
            filtered: 0,
            errors: 0,
            aborted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
