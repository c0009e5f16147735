use super::{AllowHook, HookContext};
use crate::error::HostError;
use crate::host::{BodyFormat, MessageBody, MessageHost};

/// Appends a warning line to the body in the body's own format.
pub struct WarningFooterHook {
    text: String,
}

impl WarningFooterHook {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
        }
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn with_footer(body: &MessageBody, text: &str) -> Option<MessageBody> {
    if text.is_empty() {
        return None;
    }
    let content = match body.format {
        BodyFormat::Text => {
            if body.content.contains(text) {
                return None;
            }
            format!("{}\n\n---\n⚠️ {}", body.content, text)
        }
        BodyFormat::Html => {
            let escaped = escape_html(text);
            if body.content.contains(&escaped) {
                return None;
            }
            let para = format!(
                "<p style='color: #d32f2f; font-size: 11px;'>⚠️ {}</p>",
                escaped
            );
            // Keep the footer inside the document when there is a </body>.
            match body.content.to_ascii_lowercase().rfind("</body>") {
                Some(idx) => format!("{}{}{}", &body.content[..idx], para, &body.content[idx..]),
                None => format!("{}{}", body.content, para),
            }
        }
    };
    Some(MessageBody {
        format: body.format,
        content,
    })
}

#[async_trait::async_trait]
impl AllowHook for WarningFooterHook {
    fn name(&self) -> &str {
        "warning_footer"
    }

    async fn apply(&self, host: &dyn MessageHost, _ctx: &HookContext<'_>) -> Result<bool, HostError> {
        let body = host.body().await?;
        match with_footer(&body, &self.text) {
            Some(updated) => {
                host.set_body(&updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
