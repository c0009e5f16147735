//! Capabilities the host exposes for the message being sent.
//!
//! The engine only talks to the host through [`MessageHost`] and
//! [`PropertyBag`]. [`SnapshotHost`] is an in-memory implementation built from
//! a request payload; it records every mutation so the caller can report the
//! rewritten fields back to the real client.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::{ItemKind, Recipient, RecipientField, RecipientInput};
use crate::error::HostError;

/// Custom key/value properties that travel with the message.
pub type CustomProperties = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub format: BodyFormat,
    #[serde(default)]
    pub content: String,
}

/// Per-message property store. `save` must not return before the write is
/// durable on the host side.
#[async_trait]
pub trait PropertyBag: Send + Sync {
    async fn load(&self) -> Result<CustomProperties, HostError>;
    async fn save(&self, props: &CustomProperties) -> Result<(), HostError>;
}

/// The message being sent, as seen by the policy engine.
#[async_trait]
pub trait MessageHost: Send + Sync {
    fn item_kind(&self) -> ItemKind;

    /// Identifier for logging only; never used as a state key.
    fn item_id(&self) -> Option<&str> {
        None
    }

    async fn recipients(&self, field: RecipientField) -> Result<RecipientInput, HostError>;
    async fn set_recipients(
        &self,
        field: RecipientField,
        recipients: &[Recipient],
    ) -> Result<(), HostError>;

    async fn subject(&self) -> Result<String, HostError>;
    async fn set_subject(&self, subject: &str) -> Result<(), HostError>;

    async fn body(&self) -> Result<MessageBody, HostError>;
    async fn set_body(&self, body: &MessageBody) -> Result<(), HostError>;

    fn properties(&self) -> &dyn PropertyBag;
}

/// In-memory property bag.
#[derive(Debug, Default)]
pub struct MemoryProperties {
    inner: Mutex<CustomProperties>,
}

impl MemoryProperties {
    pub fn new(initial: CustomProperties) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn snapshot(&self) -> CustomProperties {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PropertyBag for MemoryProperties {
    async fn load(&self) -> Result<CustomProperties, HostError> {
        self.inner
            .lock()
            .map(|g| g.clone())
            .map_err(|_| HostError::Failed("property store poisoned".into()))
    }

    async fn save(&self, props: &CustomProperties) -> Result<(), HostError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| HostError::Failed("property store poisoned".into()))?;
        *guard = props.clone();
        Ok(())
    }
}

/// Field contents as captured from the client: either the value or the
/// error the client hit while reading it.
pub type FieldSnapshot = Result<RecipientInput, HostError>;

#[derive(Debug, Default)]
struct SnapshotState {
    fields: BTreeMap<RecipientField, FieldSnapshot>,
    rewritten: BTreeMap<RecipientField, Vec<Recipient>>,
    subject: Option<String>,
    subject_changed: bool,
    body: Option<MessageBody>,
    body_changed: bool,
}

/// A message captured by the client and evaluated out of process. Subject
/// and body that were not captured read as [`HostError::Unsupported`], so
/// hooks never overwrite content they could not see.
#[derive(Debug, Default)]
pub struct SnapshotHost {
    kind: ItemKind,
    item_id: Option<String>,
    state: Mutex<SnapshotState>,
    properties: MemoryProperties,
}

/// Mutations applied while evaluating a [`SnapshotHost`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotChanges {
    pub recipients: BTreeMap<RecipientField, Vec<Recipient>>,
    pub subject: Option<String>,
    pub body: Option<MessageBody>,
    pub properties: CustomProperties,
}

impl SnapshotHost {
    pub fn new(kind: ItemKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_item_id(mut self, id: impl Into<String>) -> Self {
        self.item_id = Some(id.into());
        self
    }

    pub fn with_field(self, field: RecipientField, value: FieldSnapshot) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.fields.insert(field, value);
        }
        self
    }

    pub fn with_subject(self, subject: impl Into<String>) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.subject = Some(subject.into());
        }
        self
    }

    pub fn with_body(self, body: MessageBody) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.body = Some(body);
        }
        self
    }

    pub fn with_properties(mut self, props: CustomProperties) -> Self {
        self.properties = MemoryProperties::new(props);
        self
    }

    pub fn changes(&self) -> SnapshotChanges {
        let properties = self.properties.snapshot();
        match self.state.lock() {
            Ok(st) => SnapshotChanges {
                recipients: st.rewritten.clone(),
                subject: st.subject.clone().filter(|_| st.subject_changed),
                body: st.body.clone().filter(|_| st.body_changed),
                properties,
            },
            Err(_) => SnapshotChanges {
                properties,
                ..Default::default()
            },
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SnapshotState>, HostError> {
        self.state
            .lock()
            .map_err(|_| HostError::Failed("snapshot state poisoned".into()))
    }
}

#[async_trait]
impl MessageHost for SnapshotHost {
    fn item_kind(&self) -> ItemKind {
        self.kind
    }

    fn item_id(&self) -> Option<&str> {
        self.item_id.as_deref()
    }

    async fn recipients(&self, field: RecipientField) -> Result<RecipientInput, HostError> {
        let st = self.lock()?;
        match st.rewritten.get(&field) {
            Some(list) => Ok(RecipientInput::List(
                list.iter()
                    .map(|r| crate::address::RecipientRef {
                        email_address: r.email.clone(),
                        display_name: Some(r.display_name.clone()),
                    })
                    .collect(),
            )),
            None => st.fields.get(&field).cloned().unwrap_or_else(|| Ok(RecipientInput::default())),
        }
    }

    async fn set_recipients(
        &self,
        field: RecipientField,
        recipients: &[Recipient],
    ) -> Result<(), HostError> {
        let mut st = self.lock()?;
        st.rewritten.insert(field, recipients.to_vec());
        Ok(())
    }

    async fn subject(&self) -> Result<String, HostError> {
        self.lock()?
            .subject
            .clone()
            .ok_or(HostError::Unsupported("subject not captured"))
    }

    async fn set_subject(&self, subject: &str) -> Result<(), HostError> {
        let mut st = self.lock()?;
        st.subject = Some(subject.to_string());
        st.subject_changed = true;
        Ok(())
    }

    async fn body(&self) -> Result<MessageBody, HostError> {
        self.lock()?
            .body
            .clone()
            .ok_or(HostError::Unsupported("body not captured"))
    }

    async fn set_body(&self, body: &MessageBody) -> Result<(), HostError> {
        let mut st = self.lock()?;
        st.body = Some(body.clone());
        st.body_changed = true;
        Ok(())
    }

    fn properties(&self) -> &dyn PropertyBag {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_token;

    #[tokio::test]
    async fn rewrites_are_visible_and_reported() {
        let host = SnapshotHost::new(ItemKind::Message)
            .with_field(RecipientField::To, Ok(RecipientInput::Text("a@paytm.com; b@evil.com".into())))
            .with_subject("Q3");
        host.set_recipients(RecipientField::To, &[parse_token("a@paytm.com")])
            .await
            .unwrap();
        host.set_subject("[External] Q3").await.unwrap();

        match host.recipients(RecipientField::To).await.unwrap() {
            RecipientInput::List(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        let changes = host.changes();
        assert_eq!(changes.subject.as_deref(), Some("[External] Q3"));
        assert!(changes.body.is_none());
        assert_eq!(changes.recipients[&RecipientField::To][0].email, "a@paytm.com");
    }

    #[tokio::test]
    async fn missing_field_reads_as_empty() {
        let host = SnapshotHost::new(ItemKind::Appointment);
        let got = host.recipients(RecipientField::OptionalAttendees).await.unwrap();
        assert_eq!(got, RecipientInput::default());
    }

    #[tokio::test]
    async fn uncaptured_subject_and_body_are_unsupported() {
        let host = SnapshotHost::new(ItemKind::Message);
        assert!(matches!(host.subject().await, Err(HostError::Unsupported(_))));
        assert!(matches!(host.body().await, Err(HostError::Unsupported(_))));
        assert_eq!(host.changes().subject, None);
    }

    #[tokio::test]
    async fn property_bag_round_trips() {
        let bag = MemoryProperties::default();
        let mut props = bag.load().await.unwrap();
        props.insert("k".into(), "v".into());
        bag.save(&props).await.unwrap();
        assert_eq!(bag.snapshot().get("k").map(String::as_str), Some("v"));
    }
}
