use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::engine::{default_dialog_url, PolicyMode};
use crate::hooks::{parse_hook_order, HookConfig};
use crate::trust::{MatchMode, TrustConfig};

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub policy_mode: PolicyMode,
    pub match_mode: MatchMode,
    /// Optional JSON trust file, re-read on every evaluation.
    pub trust_config_path: Option<PathBuf>,
    /// Used when no trust file is configured or it cannot be read.
    pub fallback_trust: TrustConfig,
    pub hook_order: Vec<String>,
    pub hook_config: HookConfig,
    pub dialog_url: Url,
    pub fetch_timeout_ms: Option<u64>,
    pub log_file: Option<String>,
    pub audit_log_file: Option<String>,
    pub allowed_tokens: Option<HashSet<String>>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub max_request_bytes: Option<usize>,
    pub audit_only: bool,
    pub log_sample_n: Option<u64>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            policy_mode: PolicyMode::default(),
            match_mode: MatchMode::default(),
            trust_config_path: None,
            fallback_trust: TrustConfig::builtin(),
            hook_order: vec!["subject_tag".to_string()],
            hook_config: HookConfig::default(),
            dialog_url: default_dialog_url(),
            fetch_timeout_ms: None,
            log_file: None,
            audit_log_file: None,
            allowed_tokens: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
            max_request_bytes: None,
            audit_only: false,
            log_sample_n: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let policy_mode = parse_enum_env::<PolicyMode>("SAFESEND_POLICY_MODE")?.unwrap_or_default();
        let match_mode = parse_enum_env::<MatchMode>("SAFESEND_MATCH_MODE")?.unwrap_or_default();

        let trust_config_path = non_empty_env("SAFESEND_TRUST_CONFIG").map(PathBuf::from);
        let fallback_trust = match non_empty_env("SAFESEND_TRUSTED_DOMAINS") {
            Some(raw) => {
                let cfg = TrustConfig::new(split_list(&raw), std::iter::empty::<String>());
                if cfg.trusted_domains.is_empty() {
                    return Err(anyhow!("SAFESEND_TRUSTED_DOMAINS lists no domains"));
                }
                cfg
            }
            None => TrustConfig::builtin(),
        };

        let hook_order = parse_hook_order();
        let defaults = HookConfig::default();
        let hook_config = HookConfig {
            subject_tag: non_empty_env("SAFESEND_SUBJECT_TAG").unwrap_or(defaults.subject_tag),
            footer_text: non_empty_env("SAFESEND_FOOTER_TEXT").unwrap_or(defaults.footer_text),
        };

        let dialog_url = match non_empty_env("SAFESEND_DIALOG_URL") {
            Some(raw) => Url::parse(raw.trim())
                .with_context(|| format!("SAFESEND_DIALOG_URL '{}' is not a valid URL", raw))?,
            None => default_dialog_url(),
        };
        let fetch_timeout_ms = parse_optional_u64("SAFESEND_FETCH_TIMEOUT_MS")?.filter(|ms| *ms > 0);

        let log_file = env::var("LOG_FILE").ok();
        let audit_log_file = env::var("AUDIT_LOG_FILE").ok();

        let allowed_tokens = env::var("STRICT_AUTH_ALLOWED_TOKENS")
            .ok()
            .map(|raw| split_list(&raw).collect::<HashSet<_>>())
            .filter(|set: &HashSet<String>| !set.is_empty());

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?
                .map(|k| k as usize)
                .unwrap_or(RotationConfig::default().keep),
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let log_stdout = parse_bool_env("SAFESEND_LOG_STDOUT")?.unwrap_or(false);
        let audit_only = parse_bool_env("SAFESEND_AUDIT_ONLY")?.unwrap_or(false);
        let max_request_bytes =
            parse_optional_u64("SAFESEND_MAX_REQUEST_BYTES")?.map(|v| v as usize);
        let log_sample_n = parse_optional_u64("SAFESEND_LOG_SAMPLE_N")?.filter(|n| *n > 1);

        Ok(Self {
            policy_mode,
            match_mode,
            trust_config_path,
            fallback_trust,
            hook_order,
            hook_config,
            dialog_url,
            fetch_timeout_ms,
            log_file,
            audit_log_file,
            allowed_tokens,
            rotation,
            log_stdout,
            max_request_bytes,
            audit_only,
            log_sample_n,
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_enum_env<T>(var: &str) -> Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    match non_empty_env(var) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{}: {}", var, e)),
        None => Ok(None),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
