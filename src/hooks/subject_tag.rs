use super::{AllowHook, HookContext};
use crate::error::HostError;
use crate::host::MessageHost;

/// Prefixes the subject with a tag such as `[External]`. A subject that
/// already carries the tag (any case) is left alone, so repeated
/// warn/allow cycles never stack tags.
pub struct SubjectTagHook {
    tag: String,
}

impl SubjectTagHook {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.trim().to_string(),
        }
    }
}

pub(crate) fn tag_subject(subject: &str, tag: &str) -> Option<String> {
    if tag.is_empty() || subject.to_lowercase().contains(&tag.to_lowercase()) {
        return None;
    }
    let rest = subject.trim_start();
    if rest.is_empty() {
        Some(tag.to_string())
    } else {
        Some(format!("{} {}", tag, rest))
    }
}

#[async_trait::async_trait]
impl AllowHook for SubjectTagHook {
    fn name(&self) -> &str {
        "subject_tag"
    }

    async fn apply(&self, host: &dyn MessageHost, _ctx: &HookContext<'_>) -> Result<bool, HostError> {
        let subject = host.subject().await?;
        match tag_subject(&subject, &self.tag) {
            Some(tagged) => {
                host.set_subject(&tagged).await?;
                tracing::debug!(subject = %tagged, "subject tagged");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
