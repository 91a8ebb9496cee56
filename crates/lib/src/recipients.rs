//! Recipient resolution: normalize raw phone-like identifiers into a canonical, deduplicated set.
//!
//! Canonical form is a single leading `+` followed by 7 to 15 digits. Spaces, dashes, dots and
//! parentheses are treated as formatting and removed; a leading `00` international prefix is
//! rewritten to `+`. The resolver is pure: callers pick whether invalid entries abort the batch
//! or are dropped and reported.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

/// A normalized recipient identifier (e.g. `+14155550123`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipient(String);

impl Recipient {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits without the leading qualifier.
    pub fn digits(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Recipient {
    type Err = InvalidRecipient;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

/// Why an identifier could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InvalidReason {
    Empty,
    IllegalCharacter { character: char },
    MisplacedQualifier,
    TooShort { digits: usize },
    TooLong { digits: usize },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::Empty => f.write_str("empty identifier"),
            InvalidReason::IllegalCharacter { character } => {
                write!(f, "illegal character {:?}", character)
            }
            InvalidReason::MisplacedQualifier => f.write_str("'+' is only allowed as a prefix"),
            InvalidReason::TooShort { digits } => {
                write!(f, "{} digits, at least {} required", digits, MIN_DIGITS)
            }
            InvalidReason::TooLong { digits } => {
                write!(f, "{} digits, at most {} allowed", digits, MAX_DIGITS)
            }
        }
    }
}

/// An identifier that could not be normalized, with the raw input preserved for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("invalid recipient {identifier:?}: {reason}")]
pub struct InvalidRecipient {
    pub identifier: String,
    pub reason: InvalidReason,
}

/// What to do with identifiers that fail normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRecipientPolicy {
    /// Drop invalid entries and report them alongside the resolved set.
    #[default]
    Drop,
    /// Fail the whole resolution on the first invalid entry.
    Abort,
}

/// Ordered set of distinct recipients; first-seen order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RecipientSet {
    items: Vec<Recipient>,
}

impl RecipientSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Recipient> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Recipient] {
        &self.items
    }
}

impl<'a> IntoIterator for &'a RecipientSet {
    type Item = &'a Recipient;
    type IntoIter = std::slice::Iter<'a, Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Result of a lenient resolution: the set plus what was rejected or collapsed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub recipients: RecipientSet,
    pub rejected: Vec<InvalidRecipient>,
    /// Entries that normalized to an identifier already in the set.
    pub duplicates: usize,
}

fn is_formatting(c: char) -> bool {
    c.is_whitespace() || matches!(c, '-' | '.' | '(' | ')')
}

/// Normalize one raw identifier into canonical `+<digits>` form.
pub fn normalize(raw: &str) -> Result<Recipient, InvalidRecipient> {
    let invalid = |reason| InvalidRecipient {
        identifier: raw.to_string(),
        reason,
    };

    let compact: String = raw.chars().filter(|c| !is_formatting(*c)).collect();
    if compact.is_empty() {
        return Err(invalid(InvalidReason::Empty));
    }

    let unqualified = compact.trim_start_matches('+');
    let body = if unqualified.len() == compact.len() {
        unqualified.strip_prefix("00").unwrap_or(unqualified)
    } else {
        unqualified
    };

    if let Some(c) = body.chars().find(|c| !c.is_ascii_digit()) {
        return Err(invalid(if c == '+' {
            InvalidReason::MisplacedQualifier
        } else {
            InvalidReason::IllegalCharacter { character: c }
        }));
    }

    let digits = body.len();
    if digits == 0 {
        return Err(invalid(InvalidReason::Empty));
    }
    if digits < MIN_DIGITS {
        return Err(invalid(InvalidReason::TooShort { digits }));
    }
    if digits > MAX_DIGITS {
        return Err(invalid(InvalidReason::TooLong { digits }));
    }
    Ok(Recipient(format!("+{}", body)))
}

/// Resolve every identifier or fail on the first one that cannot be normalized.
pub fn resolve<I, S>(raw: I) -> Result<RecipientSet, InvalidRecipient>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    resolve_with(raw, InvalidRecipientPolicy::Abort).map(|r| r.recipients)
}

/// Resolve what can be resolved; invalid identifiers are collected, never fatal.
pub fn resolve_lenient<I, S>(raw: I) -> Resolution
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut resolution = Resolution::default();
    for entry in raw {
        match normalize(entry.as_ref()) {
            Ok(recipient) => {
                if seen.insert(recipient.clone()) {
                    resolution.recipients.items.push(recipient);
                } else {
                    resolution.duplicates += 1;
                }
            }
            Err(e) => resolution.rejected.push(e),
        }
    }
    resolution
}

/// Resolve under the given policy. With `Abort`, the first invalid identifier is returned as the error.
pub fn resolve_with<I, S>(raw: I, policy: InvalidRecipientPolicy) -> Result<Resolution, InvalidRecipient>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let resolution = resolve_lenient(raw);
    match (policy, resolution.rejected.first()) {
        (InvalidRecipientPolicy::Abort, Some(first)) => Err(first.clone()),
        _ => Ok(resolution),
    }
}
