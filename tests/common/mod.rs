#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use safesend::address::{ItemKind, Recipient, RecipientField, RecipientInput, RecipientRef};
use safesend::channel::{ConfirmationChannel, DialogRequest, DialogSession};
use safesend::engine::{EngineSettings, PolicyMode, SendPolicyEngine};
use safesend::error::{ChannelError, HostError};
use safesend::hooks::{HookConfig, HookPipeline};
use safesend::host::{CustomProperties, MessageBody, MessageHost, PropertyBag};
use safesend::trust::{StaticTrustSource, TrustConfig};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        self.originals
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Property bag shared between attempts on the same message, with switchable
/// failures.
#[derive(Default)]
pub struct TestBag {
    props: Mutex<CustomProperties>,
    pub fail_load: AtomicBool,
    pub fail_save: AtomicBool,
    pub saves: AtomicUsize,
}

impl TestBag {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(props: &[(&str, &str)]) -> Arc<Self> {
        let bag = Self::default();
        *bag.props.lock().unwrap() = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(bag)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.props.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.props.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl PropertyBag for TestBag {
    async fn load(&self) -> Result<CustomProperties, HostError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(HostError::Failed("load refused".into()));
        }
        Ok(self.props.lock().unwrap().clone())
    }

    async fn save(&self, props: &CustomProperties) -> Result<(), HostError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(HostError::Failed("quota exceeded".into()));
        }
        tokio::task::yield_now().await;
        *self.props.lock().unwrap() = props.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Compose window stand-in with per-field failures and delays.
pub struct TestHost {
    kind: ItemKind,
    fields: Mutex<BTreeMap<RecipientField, Result<RecipientInput, HostError>>>,
    delays: BTreeMap<RecipientField, Duration>,
    subject: Mutex<String>,
    body: Mutex<MessageBody>,
    pub fail_set_recipients: AtomicBool,
    /// Recipient writes to these fields always fail.
    pub fail_set_fields: Mutex<Vec<RecipientField>>,
    /// Recipient writes allowed before every further one fails.
    pub set_budget: Mutex<Option<usize>>,
    pub fail_set_subject: AtomicBool,
    pub fetches: AtomicUsize,
    bag: Arc<TestBag>,
}

impl TestHost {
    pub fn new(kind: ItemKind, bag: Arc<TestBag>) -> Self {
        Self {
            kind,
            fields: Mutex::new(BTreeMap::new()),
            delays: BTreeMap::new(),
            subject: Mutex::new(String::new()),
            body: Mutex::new(MessageBody::default()),
            fail_set_recipients: AtomicBool::new(false),
            fail_set_fields: Mutex::new(Vec::new()),
            set_budget: Mutex::new(None),
            fail_set_subject: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            bag,
        }
    }

    pub fn message(bag: Arc<TestBag>) -> Self {
        Self::new(ItemKind::Message, bag)
    }

    pub fn field(self, field: RecipientField, addresses: &[&str]) -> Self {
        let list = addresses.iter().map(|a| RecipientRef::new(*a)).collect();
        self.fields
            .lock()
            .unwrap()
            .insert(field, Ok(RecipientInput::List(list)));
        self
    }

    pub fn to(self, addresses: &[&str]) -> Self {
        self.field(RecipientField::To, addresses)
    }

    pub fn text_field(self, field: RecipientField, raw: &str) -> Self {
        self.fields
            .lock()
            .unwrap()
            .insert(field, Ok(RecipientInput::Text(raw.to_string())));
        self
    }

    pub fn failing_field(self, field: RecipientField) -> Self {
        self.fields
            .lock()
            .unwrap()
            .insert(field, Err(HostError::Failed("mailbox unavailable".into())));
        self
    }

    pub fn slow_field(mut self, field: RecipientField, delay: Duration) -> Self {
        self.delays.insert(field, delay);
        self
    }

    pub fn subject(self, subject: &str) -> Self {
        *self.subject.lock().unwrap() = subject.to_string();
        self
    }

    pub fn body(self, body: MessageBody) -> Self {
        *self.body.lock().unwrap() = body;
        self
    }

    pub fn current_subject(&self) -> String {
        self.subject.lock().unwrap().clone()
    }

    pub fn current_body(&self) -> MessageBody {
        self.body.lock().unwrap().clone()
    }

    /// Addresses currently in `field`, as the host would send them.
    pub fn emails(&self, field: RecipientField) -> Vec<String> {
        match self.fields.lock().unwrap().get(&field) {
            Some(Ok(input)) => safesend::address::parse(input)
                .into_iter()
                .map(|r| r.email)
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl MessageHost for TestHost {
    fn item_kind(&self) -> ItemKind {
        self.kind
    }

    fn item_id(&self) -> Option<&str> {
        Some("test-item")
    }

    async fn recipients(&self, field: RecipientField) -> Result<RecipientInput, HostError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&field) {
            tokio::time::sleep(*delay).await;
        }
        self.fields
            .lock()
            .unwrap()
            .get(&field)
            .cloned()
            .unwrap_or_else(|| Ok(RecipientInput::default()))
    }

    async fn set_recipients(
        &self,
        field: RecipientField,
        recipients: &[Recipient],
    ) -> Result<(), HostError> {
        if self.fail_set_recipients.load(Ordering::SeqCst)
            || self.fail_set_fields.lock().unwrap().contains(&field)
        {
            return Err(HostError::Failed("field is read-only".into()));
        }
        if let Some(left) = self.set_budget.lock().unwrap().as_mut() {
            if *left == 0 {
                return Err(HostError::Failed("mailbox disconnected".into()));
            }
            *left -= 1;
        }
        let list = recipients
            .iter()
            .map(|r| RecipientRef {
                email_address: r.email.clone(),
                display_name: Some(r.display_name.clone()),
            })
            .collect();
        self.fields
            .lock()
            .unwrap()
            .insert(field, Ok(RecipientInput::List(list)));
        Ok(())
    }

    async fn subject(&self) -> Result<String, HostError> {
        Ok(self.current_subject())
    }

    async fn set_subject(&self, subject: &str) -> Result<(), HostError> {
        if self.fail_set_subject.load(Ordering::SeqCst) {
            return Err(HostError::Failed("subject locked".into()));
        }
        *self.subject.lock().unwrap() = subject.to_string();
        Ok(())
    }

    async fn body(&self) -> Result<MessageBody, HostError> {
        Ok(self.current_body())
    }

    async fn set_body(&self, body: &MessageBody) -> Result<(), HostError> {
        *self.body.lock().unwrap() = body.clone();
        Ok(())
    }

    fn properties(&self) -> &dyn PropertyBag {
        self.bag.as_ref()
    }
}

#[derive(Clone, Debug)]
pub enum Script {
    Reply(Option<String>),
    OpenFails,
    ReplyFails,
}

/// Dialog surface that answers from a script and counts open/close calls.
pub struct ScriptedChannel {
    script: Script,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub requests: Mutex<Vec<DialogRequest>>,
}

impl ScriptedChannel {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(token: &str) -> Self {
        Self::new(Script::Reply(Some(token.to_string())))
    }

    pub fn closed() -> Self {
        Self::new(Script::Reply(None))
    }

    pub fn opened(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    script: Script,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl DialogSession for ScriptedSession {
    async fn reply(&mut self) -> Result<Option<String>, ChannelError> {
        match &self.script {
            Script::Reply(r) => Ok(r.clone()),
            Script::ReplyFails => Err(ChannelError::DisplayFailed("dialog crashed".into())),
            Script::OpenFails => unreachable!("session never opened"),
        }
    }

    async fn close(self: Box<Self>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfirmationChannel for ScriptedChannel {
    async fn open(&self, request: &DialogRequest) -> Result<Box<dyn DialogSession>, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Script::OpenFails = self.script {
            return Err(ChannelError::DisplayFailed("popup blocked".into()));
        }
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            closes: self.closes.clone(),
        }))
    }
}

pub fn paytm() -> TrustConfig {
    TrustConfig::new(["paytm.com"], std::iter::empty::<&str>())
}

pub fn engine_with(mode: PolicyMode, hooks: &[&str]) -> SendPolicyEngine {
    let order: Vec<String> = hooks.iter().map(|h| h.to_string()).collect();
    SendPolicyEngine::new(
        EngineSettings {
            mode,
            ..Default::default()
        },
        Arc::new(StaticTrustSource(paytm())),
        HookPipeline::new(&order, &HookConfig::default()),
    )
}

pub fn engine(mode: PolicyMode) -> SendPolicyEngine {
    engine_with(mode, &[])
}
