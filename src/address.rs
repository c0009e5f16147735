//! Recipient parsing.
//!
//! Hosts hand us recipient fields in one of two shapes: the classic
//! `;`-separated header string (`Alice <alice@paytm.com>; bob@gmail.com`) or a
//! list of already-resolved recipient objects. Both are normalised into
//! [`Recipient`] values. Parsing never fails; a token we cannot make sense of
//! still yields a recipient, just one with `valid == false` and possibly an
//! empty domain, which the trust evaluator always treats as external.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*$",
    )
    .expect("email pattern compiles")
});

/// Kind of item being sent. Determines which recipient fields are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    #[default]
    Message,
    Appointment,
}

impl ItemKind {
    pub fn recipient_fields(self) -> &'static [RecipientField] {
        match self {
            ItemKind::Message => &[RecipientField::To, RecipientField::Cc, RecipientField::Bcc],
            ItemKind::Appointment => &[
                RecipientField::RequiredAttendees,
                RecipientField::OptionalAttendees,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Message => "message",
            ItemKind::Appointment => "appointment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecipientField {
    To,
    Cc,
    Bcc,
    RequiredAttendees,
    OptionalAttendees,
}

impl RecipientField {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientField::To => "to",
            RecipientField::Cc => "cc",
            RecipientField::Bcc => "bcc",
            RecipientField::RequiredAttendees => "requiredAttendees",
            RecipientField::OptionalAttendees => "optionalAttendees",
        }
    }
}

impl fmt::Display for RecipientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recipient object as supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientRef {
    pub email_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl RecipientRef {
    pub fn new(email_address: impl Into<String>) -> Self {
        Self {
            email_address: email_address.into(),
            display_name: None,
        }
    }
}

/// Raw contents of one recipient field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipientInput {
    Text(String),
    List(Vec<RecipientRef>),
}

impl Default for RecipientInput {
    fn default() -> Self {
        RecipientInput::List(Vec::new())
    }
}

/// Normalised recipient. `email` and `domain` are lower case; `domain` is
/// empty unless the address is a well-formed `local@domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email: String,
    pub display_name: String,
    pub domain: String,
    /// False when the address did not look like `local@domain`.
    pub valid: bool,
}

impl Recipient {
    /// Build a recipient from an already separated display name and address.
    pub fn from_parts(display_name: &str, address: &str) -> Self {
        let email = address.trim().to_lowercase();
        let valid = EMAIL_RE.is_match(&email);
        let domain = if valid {
            extract_domain(&email)
        } else {
            String::new()
        };
        Recipient {
            display_name: display_name.trim().to_string(),
            domain,
            valid,
            email,
        }
    }

    /// `alice@paytm.com` or `Alice <alice@paytm.com>` when a distinct name is known.
    pub fn to_header_value(&self) -> String {
        if self.display_name.is_empty() || self.display_name.eq_ignore_ascii_case(&self.email) {
            self.email.clone()
        } else {
            format!("{} <{}>", self.display_name, self.email)
        }
    }
}

/// Substring after the last `@`, lower-cased. Empty if there is no `@`.
pub fn extract_domain(email: &str) -> String {
    match email.rfind('@') {
        Some(idx) => email[idx + 1..].trim().to_lowercase(),
        None => String::new(),
    }
}

/// Parse a single token such as `"Name" <user@host>` or `user@host`.
pub fn parse_token(token: &str) -> Recipient {
    let token = token.trim();
    match (token.rfind('<'), token.rfind('>')) {
        (Some(start), Some(end)) if end > start => {
            let display = token[..start].trim().trim_matches('"');
            let address = &token[start + 1..end];
            Recipient::from_parts(display, address)
        }
        _ => Recipient::from_parts(token, token),
    }
}

/// Split a `;`-separated header value. Empty entries are dropped.
pub fn parse_header(raw: &str) -> Vec<Recipient> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_token)
        .collect()
}

fn parse_ref(r: &RecipientRef) -> Recipient {
    let mut recipient = if r.email_address.contains('<') {
        parse_token(&r.email_address)
    } else {
        Recipient::from_parts("", &r.email_address)
    };
    if let Some(name) = r.display_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        recipient.display_name = name.to_string();
    }
    recipient
}

/// Normalise one recipient field, preserving input order.
pub fn parse(input: &RecipientInput) -> Vec<Recipient> {
    match input {
        RecipientInput::Text(raw) => parse_header(raw),
        RecipientInput::List(refs) => refs
            .iter()
            .filter(|r| !r.email_address.trim().is_empty())
            .map(parse_ref)
            .collect(),
    }
}
