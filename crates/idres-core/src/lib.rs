use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Store-assigned contact identifier. Strictly increasing in assignment
/// order, which makes it a stable tie-breaker for primary election.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// One observed contact fact pair. Email and phone are never mutated after
/// creation; the only mutable linkage state is `link_precedence`/`linked_id`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One incoming identify request: an optional email plus an optional phone
/// number. A present-but-blank field is treated as absent after
/// [`Observation::normalize`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Observation {
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

impl Observation {
    #[must_use]
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Self {
        Self { email, phone_number }
    }

    /// Trim surrounding whitespace and map empty strings to absent.
    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            email: normalize_field(self.email),
            phone_number: normalize_field(self.phone_number),
        }
    }

    /// Reject observations carrying no identifying fact at all.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidRequest`] when both email and phone
    /// number are absent. Callers check this before any store access.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(ReconcileError::InvalidRequest(
                "at least one of email or phoneNumber is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn normalize_field(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

/// Consolidated cluster view returned to callers. Field names follow the
/// published wire contract, including the historical `primaryContatctId`
/// spelling.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsolidatedContact {
    #[serde(rename = "primaryContatctId")]
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    #[serde(rename = "phoneNumbers")]
    pub phone_numbers: Vec<String>,
    #[serde(rename = "secondaryContactIds")]
    pub secondary_contact_ids: Vec<ContactId>,
}

fn cluster_order(lhs: &Contact, rhs: &Contact) -> Ordering {
    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
}

/// Elect the cluster primary: the earliest-created contact still flagged
/// primary, ties broken by ascending id. A combined set holding no primary
/// row (foreign data) falls back to the earliest contact overall so that
/// reconciliation stays total.
#[must_use]
pub fn elect_primary(contacts: &[Contact]) -> Option<ContactId> {
    let flagged =
        contacts.iter().filter(|contact| contact.is_primary()).min_by(|a, b| cluster_order(a, b));
    match flagged {
        Some(contact) => Some(contact.id),
        None => contacts.iter().min_by(|a, b| cluster_order(a, b)).map(|contact| contact.id),
    }
}

/// Whether the observation contributes a fact not yet present anywhere in
/// the combined set. Only a genuinely new email or phone warrants a new
/// secondary row; an exact repeat inserts nothing.
#[must_use]
pub fn needs_new_record(observation: &Observation, contacts: &[Contact]) -> bool {
    let known_emails: BTreeSet<&str> =
        contacts.iter().filter_map(|contact| contact.email.as_deref()).collect();
    let known_phones: BTreeSet<&str> =
        contacts.iter().filter_map(|contact| contact.phone_number.as_deref()).collect();

    let new_email = observation
        .email
        .as_deref()
        .is_some_and(|email| !known_emails.contains(email));
    let new_phone = observation
        .phone_number
        .as_deref()
        .is_some_and(|phone| !known_phones.contains(phone));

    new_email || new_phone
}

/// Members of the combined set that must be re-parented under the elected
/// primary: any other contact still flagged primary, and any secondary whose
/// `linked_id` does not name the elected primary. Covering the losing
/// cluster's secondaries as well keeps every secondary pointing directly at
/// the surviving primary (no secondary chains).
#[must_use]
pub fn relink_targets(contacts: &[Contact], primary: ContactId) -> Vec<ContactId> {
    let mut targets: Vec<ContactId> = contacts
        .iter()
        .filter(|contact| contact.id != primary)
        .filter(|contact| contact.is_primary() || contact.linked_id != Some(primary))
        .map(|contact| contact.id)
        .collect();
    targets.sort_unstable();
    targets
}

/// Materialize the consolidated view of one cluster. Members are ordered by
/// `(created_at, id)`; email and phone sets keep order of first appearance
/// with duplicates dropped.
#[must_use]
pub fn consolidate(contacts: &[Contact], primary: ContactId) -> ConsolidatedContact {
    let mut ordered: Vec<&Contact> = contacts.iter().collect();
    ordered.sort_by(|a, b| cluster_order(a, b));

    let mut emails = Vec::new();
    let mut seen_emails = BTreeSet::new();
    let mut phone_numbers = Vec::new();
    let mut seen_phones = BTreeSet::new();
    let mut secondary_contact_ids = Vec::new();

    for contact in ordered {
        if let Some(email) = contact.email.as_deref() {
            if seen_emails.insert(email) {
                emails.push(email.to_string());
            }
        }
        if let Some(phone) = contact.phone_number.as_deref() {
            if seen_phones.insert(phone) {
                phone_numbers.push(phone.to_string());
            }
        }
        if contact.id != primary {
            secondary_contact_ids.push(contact.id);
        }
    }

    ConsolidatedContact { primary_contact_id: primary, emails, phone_numbers, secondary_contact_ids }
}
