//! Post-allow hooks.
//!
//! Hooks run only after a send with external recipients has been allowed
//! (user confirmed, or second attempt after a warning). They decorate the
//! outgoing message and are strictly best effort: a failing hook is logged
//! and skipped, it never turns the allow into a block.

use std::sync::Arc;

use crate::address::Recipient;
use crate::error::HostError;
use crate::host::MessageHost;

pub mod subject_tag;
pub mod warning_footer;

use self::subject_tag::SubjectTagHook;
use self::warning_footer::WarningFooterHook;

pub const DEFAULT_SUBJECT_TAG: &str = "[External]";
pub const DEFAULT_FOOTER_TEXT: &str = "This email was sent to external recipients.";

/// Settings shared by the built-in hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookConfig {
    pub subject_tag: String,
    pub footer_text: String,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            subject_tag: DEFAULT_SUBJECT_TAG.to_owned(),
            footer_text: DEFAULT_FOOTER_TEXT.to_owned(),
        }
    }
}

/// What a hook gets to see about the allowed send.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub external: &'a [Recipient],
}

/// Trait implemented by all hooks. `Ok(true)` means the message was changed,
/// `Ok(false)` that there was nothing to do.
#[async_trait::async_trait]
pub trait AllowHook: Send + Sync {
    fn name(&self) -> &str;
    async fn apply(&self, host: &dyn MessageHost, ctx: &HookContext<'_>) -> Result<bool, HostError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    Applied,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct HookRun {
    pub name: String,
    pub status: HookStatus,
    pub elapsed_ms: u64,
}

/// Runs the configured hooks in order.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn AllowHook>>,
}

impl HookPipeline {
    pub fn new(order: &[String], cfg: &HookConfig) -> Self {
        // Unknown names are skipped with a warning.
        let mut hooks: Vec<Arc<dyn AllowHook>> = Vec::new();
        for name in order {
            match name.as_str() {
                "subject_tag" => hooks.push(Arc::new(SubjectTagHook::new(&cfg.subject_tag))),
                "warning_footer" => {
                    hooks.push(Arc::new(WarningFooterHook::new(&cfg.footer_text)))
                }
                _ => {
                    tracing::warn!(hook = %name, "unknown hook name, skipping");
                }
            }
        }
        Self { hooks }
    }

    pub fn from_hooks(hooks: Vec<Arc<dyn AllowHook>>) -> Self {
        Self { hooks }
    }

    pub async fn run(&self, host: &dyn MessageHost, ctx: &HookContext<'_>) -> Vec<HookRun> {
        let mut runs = Vec::with_capacity(self.hooks.len());
        for hook in &self.hooks {
            let name = hook.name();
            let start = std::time::Instant::now();
            let status = match hook.apply(host, ctx).await {
                Ok(true) => HookStatus::Applied,
                Ok(false) => HookStatus::Skipped,
                Err(e) => {
                    tracing::warn!(hook = %name, error = %e, "hook failed, send still allowed");
                    HookStatus::Failed(e.to_string())
                }
            };
            let elapsed_ms = crate::engine::millis(start.elapsed());
            tracing::debug!(hook = %name, status = ?status, elapsed_ms, "hook finished");
            runs.push(HookRun {
                name: name.to_string(),
                status,
                elapsed_ms,
            });
        }
        runs
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Read the hook order from `SAFESEND_HOOKS`. Defaults to subject tagging only.
pub fn parse_hook_order() -> Vec<String> {
    if let Ok(var) = std::env::var("SAFESEND_HOOKS") {
        var.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    } else {
        vec!["subject_tag".into()]
    }
}
