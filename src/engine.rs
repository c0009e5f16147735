//! Send policy engine.
//!
//! One call to [`SendPolicyEngine::evaluate`] handles one send attempt:
//!
//! ```text
//! START -> PARSED -> EVALUATED -> ALLOWED
//!                              -> BLOCKED_FIRST_WARNING | ALLOWED_SECOND_ATTEMPT   (warn-once)
//!                              -> PROMPTED -> ALLOWED | BLOCKED | REMEDIATED        (confirm)
//! ```
//!
//! Every awaited host call, including the property-bag save, completes before
//! the decision is returned, and every failure is folded into the decision:
//! infrastructure faults fail open, dialog and remediation faults fail closed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::address::{self, ItemKind, Recipient, RecipientField};
use crate::channel::{self, ChannelReply, ConfirmationChannel, DialogRequest};
use crate::error::{HostError, SendError};
use crate::hooks::{HookContext, HookPipeline, HookRun};
use crate::host::MessageHost;
use crate::state::WarningStore;
use crate::trust::{MatchMode, TrustConfig, TrustEvaluator, TrustSource};

pub const DEFAULT_DIALOG_URL: &str = "https://localhost/dialog.html";
/// External addresses spelled out in a warning before it says "and N more".
const MAX_LISTED_IN_MESSAGE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Block the first attempt with a warning, allow the next one.
    #[default]
    WarnOnce,
    /// Ask the user through the confirmation dialog within the same attempt.
    Confirm,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyMode::WarnOnce => "warn_once",
            PolicyMode::Confirm => "confirm",
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "warn_once" | "soft" | "warn" => Ok(PolicyMode::WarnOnce),
            "confirm" | "prompt" | "hard" => Ok(PolicyMode::Confirm),
            other => Err(format!("unknown policy mode '{}'", other)),
        }
    }
}

/// Stages passed through during one attempt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsed,
    Evaluated,
    Prompted,
    Remediated,
}

/// Terminal state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Allowed,
    BlockedFirstWarning,
    AllowedSecondAttempt,
    Blocked,
    Remediated,
}

impl DecisionState {
    pub const ALL: [DecisionState; 5] = [
        DecisionState::Allowed,
        DecisionState::BlockedFirstWarning,
        DecisionState::AllowedSecondAttempt,
        DecisionState::Blocked,
        DecisionState::Remediated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionState::Allowed => "allowed",
            DecisionState::BlockedFirstWarning => "blocked_first_warning",
            DecisionState::AllowedSecondAttempt => "allowed_second_attempt",
            DecisionState::Blocked => "blocked",
            DecisionState::Remediated => "remediated",
        }
    }

    pub fn allows(self) -> bool {
        !matches!(
            self,
            DecisionState::BlockedFirstWarning | DecisionState::Blocked
        )
    }
}

impl fmt::Display for DecisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single completion handed back to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub allow_event: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Transient state for an attempt that found external recipients.
#[derive(Debug, Clone, Default)]
pub struct PendingDecision {
    pub external_recipients: Vec<Recipient>,
    pub attempt_flag: bool,
}

/// Everything known about how an attempt was resolved.
#[derive(Debug, Clone)]
pub struct Decision {
    pub state: DecisionState,
    pub message: Option<String>,
    /// External recipients, deduplicated, in first-seen order.
    pub external: Vec<Recipient>,
    pub stages: Vec<Stage>,
    /// The fault that forced a fallback, if any.
    pub error: Option<SendError>,
    pub dialog: Option<DialogRequest>,
    pub hooks: Vec<HookRun>,
}

impl Decision {
    fn new(state: DecisionState, stages: Vec<Stage>) -> Self {
        Self {
            state,
            message: None,
            external: Vec::new(),
            stages,
            error: None,
            dialog: None,
            hooks: Vec::new(),
        }
    }

    pub fn allow(&self) -> bool {
        self.state.allows()
    }

    pub fn completion(&self) -> Completion {
        Completion {
            allow_event: self.allow(),
            error_message: if self.allow() {
                None
            } else {
                self.message.clone()
            },
        }
    }

    fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }

    fn with_error(mut self, error: SendError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: PolicyMode,
    pub match_mode: MatchMode,
    /// Per-field limit on recipient fetches. A timeout counts as a fetch
    /// failure and allows the send.
    pub fetch_timeout: Option<Duration>,
    pub dialog_url: Url,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: PolicyMode::default(),
            match_mode: MatchMode::default(),
            fetch_timeout: None,
            dialog_url: default_dialog_url(),
        }
    }
}

pub fn default_dialog_url() -> Url {
    Url::parse(DEFAULT_DIALOG_URL).expect("default dialog url is valid")
}

type ParsedFields = Vec<(RecipientField, Vec<Recipient>)>;

#[derive(Clone)]
pub struct SendPolicyEngine {
    settings: EngineSettings,
    trust: Arc<dyn TrustSource>,
    hooks: HookPipeline,
}

impl SendPolicyEngine {
    pub fn new(settings: EngineSettings, trust: Arc<dyn TrustSource>, hooks: HookPipeline) -> Self {
        Self {
            settings,
            trust,
            hooks,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    /// Decide one send attempt using the configured policy mode.
    pub async fn evaluate(
        &self,
        host: &dyn MessageHost,
        channel: &dyn ConfirmationChannel,
    ) -> Decision {
        self.evaluate_with_mode(host, channel, self.settings.mode).await
    }

    pub async fn evaluate_with_mode(
        &self,
        host: &dyn MessageHost,
        channel: &dyn ConfirmationChannel,
        mode: PolicyMode,
    ) -> Decision {
        let mut stages = Vec::new();
        let kind = host.item_kind();

        let fields = match self.gather(host, kind).await {
            Ok(fields) => fields,
            Err(err) => {
                tracing::warn!(item = ?host.item_id(), error = %err, "recipients unavailable, allowing send");
                return Decision::new(DecisionState::Allowed, stages).with_error(err);
            }
        };
        stages.push(Stage::Parsed);

        let all: Vec<Recipient> = fields.iter().flat_map(|(_, r)| r.iter().cloned()).collect();
        if all.is_empty() {
            tracing::debug!(item = ?host.item_id(), "no recipients, nothing to evaluate");
            return Decision::new(DecisionState::Allowed, stages);
        }

        let config = self.load_trust();
        let evaluator = TrustEvaluator::new(self.settings.match_mode);
        let evaluation = evaluator.evaluate(&all, &config);
        stages.push(Stage::Evaluated);

        if !evaluation.has_external() {
            tracing::debug!(item = ?host.item_id(), recipients = all.len(), "all recipients trusted");
            return Decision::new(DecisionState::Allowed, stages);
        }

        let pending = PendingDecision {
            external_recipients: evaluation.unique_external(),
            attempt_flag: false,
        };
        let decision = match mode {
            PolicyMode::WarnOnce => self.warn_once(host, pending, stages).await,
            PolicyMode::Confirm => {
                self.confirm(host, channel, &fields, &config, evaluator, pending, stages)
                    .await
            }
        };
        tracing::info!(
            item = ?host.item_id(),
            mode = %mode,
            outcome = %decision.state,
            external = decision.external.len(),
            "send decision"
        );
        decision
    }

    /// Fetch every recipient field of the item concurrently and parse them.
    async fn gather(&self, host: &dyn MessageHost, kind: ItemKind) -> Result<ParsedFields, SendError> {
        let timeout = self.settings.fetch_timeout;
        let fetches = kind.recipient_fields().iter().map(|&field| async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, host.recipients(field)).await {
                    Ok(r) => r,
                    Err(_) => Err(HostError::Timeout(millis(limit))),
                },
                None => host.recipients(field).await,
            };
            (field, result)
        });

        let mut out = Vec::new();
        for (field, result) in join_all(fetches).await {
            let input = result.map_err(|source| SendError::RecipientFetch { field, source })?;
            let parsed = address::parse(&input);
            tracing::trace!(field = %field, count = parsed.len(), "recipients parsed");
            out.push((field, parsed));
        }
        Ok(out)
    }

    fn load_trust(&self) -> TrustConfig {
        match self.trust.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "trust configuration unavailable, using fallback list");
                self.trust.fallback()
            }
        }
    }

    async fn run_hooks(&self, host: &dyn MessageHost, external: &[Recipient]) -> Vec<HookRun> {
        self.hooks.run(host, &HookContext { external }).await
    }

    async fn warn_once(
        &self,
        host: &dyn MessageHost,
        mut pending: PendingDecision,
        stages: Vec<Stage>,
    ) -> Decision {
        let store = WarningStore::new(host.properties());
        pending.attempt_flag = match store.has_pending_warning().await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(error = %e, "warning flag unreadable, treating as first attempt");
                false
            }
        };

        if pending.attempt_flag {
            let mut decision = Decision::new(DecisionState::AllowedSecondAttempt, stages);
            if let Err(e) = store.clear_warning().await {
                tracing::warn!(error = %e, "could not clear warning flag");
                decision.error = Some(SendError::StatePersistence(e));
            }
            decision.hooks = self.run_hooks(host, &pending.external_recipients).await;
            decision.external = pending.external_recipients;
            return decision;
        }

        match store.mark_warned().await {
            Ok(()) => {
                let message = warning_message(&pending.external_recipients);
                let mut decision =
                    Decision::new(DecisionState::BlockedFirstWarning, stages).with_message(message);
                decision.external = pending.external_recipients;
                decision
            }
            Err(e) => {
                // Without a durable flag the next attempt would warn again, forever.
                tracing::warn!(error = %e, "could not persist warning flag, allowing send");
                let mut decision = Decision::new(DecisionState::Allowed, stages)
                    .with_error(SendError::StatePersistence(e));
                decision.hooks = self.run_hooks(host, &pending.external_recipients).await;
                decision.external = pending.external_recipients;
                decision
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn confirm(
        &self,
        host: &dyn MessageHost,
        channel: &dyn ConfirmationChannel,
        fields: &ParsedFields,
        config: &TrustConfig,
        evaluator: TrustEvaluator,
        pending: PendingDecision,
        mut stages: Vec<Stage>,
    ) -> Decision {
        let subject = match host.subject().await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "subject unavailable for dialog");
                String::new()
            }
        };
        let request = DialogRequest::build(
            &self.settings.dialog_url,
            &pending.external_recipients,
            &subject,
        );
        stages.push(Stage::Prompted);
        let reply = channel::confirm(channel, &request).await;

        let mut decision = match reply {
            Ok(ChannelReply::Allow) => {
                let mut d = Decision::new(DecisionState::Allowed, stages);
                d.hooks = self.run_hooks(host, &pending.external_recipients).await;
                d
            }
            Ok(ChannelReply::Cancel) => Decision::new(DecisionState::Blocked, stages)
                .with_message("Send cancelled. Review the external recipients and try again.".into()),
            Ok(ChannelReply::RemoveAndSend) => {
                match remediate(host, fields, config, evaluator).await {
                    Ok(removed) => {
                        tracing::info!(removed, "external recipients removed before send");
                        stages.push(Stage::Remediated);
                        Decision::new(DecisionState::Remediated, stages)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "remediation failed, blocking send");
                        Decision::new(DecisionState::Blocked, stages)
                            .with_message(remediation_failure_message(&err))
                            .with_error(err)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "confirmation dialog gave no decision, blocking send");
                Decision::new(DecisionState::Blocked, stages)
                    .with_message(
                        "Send blocked: the external recipient confirmation was not completed."
                            .into(),
                    )
                    .with_error(SendError::ConfirmationChannel(e))
            }
        };
        decision.external = pending.external_recipients;
        decision.dialog = Some(request);
        decision
    }
}

/// Rewrite every field that holds an external recipient to its trusted
/// subset, keeping order. Returns the number of recipients removed. If a
/// write fails, fields already rewritten are restored to their original
/// recipients.
async fn remediate(
    host: &dyn MessageHost,
    fields: &ParsedFields,
    config: &TrustConfig,
    evaluator: TrustEvaluator,
) -> Result<usize, SendError> {
    let mut rewrites = Vec::new();
    let mut kept_total = 0;
    let mut removed = 0;
    for (field, recipients) in fields {
        let kept = evaluator.retain_trusted(recipients, config);
        kept_total += kept.len();
        if kept.len() != recipients.len() {
            removed += recipients.len() - kept.len();
            rewrites.push((*field, kept));
        }
    }
    if kept_total == 0 {
        return Err(SendError::NoTrustedRecipients);
    }
    for (idx, (field, kept)) in rewrites.iter().enumerate() {
        if let Err(e) = host.set_recipients(*field, kept).await {
            let unrestored = restore(host, fields, &rewrites[..idx]).await;
            return Err(SendError::Remediation {
                field: *field,
                reason: e.to_string(),
                unrestored,
            });
        }
    }
    Ok(removed)
}

/// Put the original recipients back into `done`. Returns the fields that
/// could not be restored.
async fn restore(
    host: &dyn MessageHost,
    fields: &ParsedFields,
    done: &[(RecipientField, Vec<Recipient>)],
) -> Vec<RecipientField> {
    let mut unrestored = Vec::new();
    for (field, _) in done {
        let Some((_, original)) = fields.iter().find(|(f, _)| f == field) else {
            continue;
        };
        if let Err(e) = host.set_recipients(*field, original).await {
            tracing::warn!(field = %field, error = %e, "could not restore recipients after failed remediation");
            unrestored.push(*field);
        }
    }
    unrestored
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn remediation_failure_message(err: &SendError) -> String {
    let mut message = format!(
        "External recipients could not be removed ({}). The message was not sent.",
        err
    );
    if let SendError::Remediation { unrestored, .. } = err {
        if !unrestored.is_empty() {
            let names: Vec<&str> = unrestored.iter().map(|f| f.as_str()).collect();
            message.push_str(&format!(
                " The {} field(s) were already changed; check them before sending again.",
                names.join(", ")
            ));
        }
    }
    message
}

/// Text shown when the first attempt is blocked.
pub fn warning_message(external: &[Recipient]) -> String {
    let more = external.len().saturating_sub(MAX_LISTED_IN_MESSAGE);
    let tail = format!("and {} more", more);
    let mut listed: Vec<&str> = external
        .iter()
        .take(MAX_LISTED_IN_MESSAGE)
        .map(|r| r.email.as_str())
        .collect();
    if more > 0 {
        listed.push(&tail);
    }
    format!(
        "⚠️ External Recipient Warning: You are sending to {} outside address(es): {}. Click Send again to confirm.",
        external.len(),
        listed.join(", ")
    )
}
