//! Confirmation dialog contract.
//!
//! The engine opens at most one [`DialogSession`] per send attempt, waits for
//! a single reply and closes the session before it resolves. Anything other
//! than a recognised reply token is a [`ChannelError`], which the engine turns
//! into a block.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::address::Recipient;
use crate::error::ChannelError;

/// Upper bound for the encoded dialog URL, including the base.
pub const MAX_DIALOG_URL_LEN: usize = 2000;
/// Share of the URL the subject may take, so addresses always have room.
const MAX_SUBJECT_SHARE: usize = MAX_DIALOG_URL_LEN / 2;
/// Replies longer than this are rejected without parsing.
pub const MAX_REPLY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelReply {
    Allow,
    Cancel,
    RemoveAndSend,
}

impl ChannelReply {
    pub fn as_token(self) -> &'static str {
        match self {
            ChannelReply::Allow => "allow",
            ChannelReply::Cancel => "cancel",
            ChannelReply::RemoveAndSend => "remove_and_send",
        }
    }

    /// Parse the raw message posted back by the dialog.
    pub fn from_token(raw: &str) -> Result<Self, ChannelError> {
        if raw.len() > MAX_REPLY_LEN {
            return Err(ChannelError::OversizedReply {
                len: raw.len(),
                limit: MAX_REPLY_LEN,
            });
        }
        match raw.trim() {
            "allow" => Ok(ChannelReply::Allow),
            "cancel" => Ok(ChannelReply::Cancel),
            "remove_and_send" => Ok(ChannelReply::RemoveAndSend),
            other => Err(ChannelError::UnrecognizedReply(other.to_string())),
        }
    }
}

impl fmt::Display for ChannelReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// What the dialog is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogRequest {
    pub url: String,
    /// Subject as carried in `url`, shortened when it would crowd out the
    /// address list.
    pub subject: String,
    /// External addresses actually carried in `url`.
    pub listed: Vec<String>,
    /// Addresses left out of `url` to respect [`MAX_DIALOG_URL_LEN`].
    pub omitted: usize,
}

impl DialogRequest {
    /// Encode the external list and subject into the dialog URL. A long
    /// subject is cut first, then addresses are added in order until the
    /// next one would exceed the URL limit.
    pub fn build(base: &Url, external: &[Recipient], subject: &str) -> Self {
        let subject = fit_subject(base, subject, external.len());
        let subject = subject.as_str();
        let mut listed: Vec<String> = Vec::new();
        let mut url = encode(base, &listed, subject, external.len());
        for r in external {
            let entry = if r.domain.is_empty() {
                r.email.clone()
            } else {
                format!("{} ({})", r.email, r.domain)
            };
            listed.push(entry);
            let candidate = encode(base, &listed, subject, external.len());
            if candidate.as_str().len() > MAX_DIALOG_URL_LEN {
                listed.pop();
                break;
            }
            url = candidate;
        }
        let omitted = external.len() - listed.len();
        if omitted > 0 {
            tracing::debug!(omitted, "dialog payload truncated");
        }
        DialogRequest {
            url: url.into(),
            subject: subject.to_string(),
            listed,
            omitted,
        }
    }
}

/// Longest prefix of `subject` (cut on a char boundary, marked with `…`)
/// whose encoded URL stays within [`MAX_SUBJECT_SHARE`].
fn fit_subject(base: &Url, subject: &str, total: usize) -> String {
    let fits = |s: &str| encode(base, &[], s, total).as_str().len() <= MAX_SUBJECT_SHARE;
    if fits(subject) {
        return subject.to_string();
    }
    let bounds: Vec<usize> = subject.char_indices().map(|(i, _)| i).collect();
    let prefix = |n: usize| format!("{}…", &subject[..bounds.get(n).copied().unwrap_or(subject.len())]);
    // Largest char count whose shortened form still fits.
    let (mut lo, mut hi) = (0, bounds.len());
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if fits(&prefix(mid)) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    tracing::debug!(original = bounds.len(), kept = lo, "dialog subject shortened");
    prefix(lo)
}

fn encode(base: &Url, listed: &[String], subject: &str, total: usize) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("subject", subject)
        .append_pair("total", &total.to_string())
        .append_pair("external", &listed.join(";"));
    url
}

/// An open dialog. Dropped only after `close` has been awaited.
#[async_trait]
pub trait DialogSession: Send {
    /// Wait for the dialog's message. `Ok(None)` means the user closed the
    /// dialog without answering.
    async fn reply(&mut self) -> Result<Option<String>, ChannelError>;
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn open(&self, request: &DialogRequest) -> Result<Box<dyn DialogSession>, ChannelError>;
}

/// Open the dialog, wait for one reply and close it again.
pub async fn confirm(
    channel: &dyn ConfirmationChannel,
    request: &DialogRequest,
) -> Result<ChannelReply, ChannelError> {
    let mut session = channel.open(request).await?;
    let raw = session.reply().await;
    session.close().await;
    match raw? {
        Some(token) => ChannelReply::from_token(&token),
        None => Err(ChannelError::ClosedWithoutReply),
    }
}

/// Channel that answers with a reply captured ahead of time, e.g. from a
/// client that already showed the dialog.
#[derive(Debug, Clone, Default)]
pub struct PresetChannel {
    reply: Option<String>,
}

impl PresetChannel {
    pub fn new(reply: Option<String>) -> Self {
        Self { reply }
    }
}

struct PresetSession(Option<String>);

#[async_trait]
impl DialogSession for PresetSession {
    async fn reply(&mut self) -> Result<Option<String>, ChannelError> {
        Ok(self.0.take())
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl ConfirmationChannel for PresetChannel {
    async fn open(&self, _request: &DialogRequest) -> Result<Box<dyn DialogSession>, ChannelError> {
        Ok(Box::new(PresetSession(self.reply.clone())))
    }
}
