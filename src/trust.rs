//! Trusted-domain configuration and recipient classification.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::address::Recipient;
use crate::error::TrustSourceError;

/// Domains trusted when no override is configured.
pub const DEFAULT_TRUSTED_DOMAINS: &[&str] = &["paytm.com"];

/// How a recipient domain is compared against trusted entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Domain must equal a trusted entry.
    Exact,
    /// Domain equals a trusted entry or is a subdomain of one.
    #[default]
    Suffix,
}

impl MatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Suffix => "suffix",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(MatchMode::Exact),
            "suffix" | "subdomain" => Ok(MatchMode::Suffix),
            other => Err(format!("unknown match mode '{}'", other)),
        }
    }
}

/// Trusted domains plus a partner allow-list. Entries are stored trimmed and
/// lower-cased; a leading `@` or `.` is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustConfig {
    pub trusted_domains: AHashSet<String>,
    pub allow_list: AHashSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustFile {
    #[serde(default)]
    trusted_domains: Vec<String>,
    #[serde(default)]
    allow_list: Vec<String>,
}

fn normalise_domain(raw: &str) -> Option<String> {
    let d = raw
        .trim()
        .trim_start_matches('@')
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_lowercase();
    (!d.is_empty()).then_some(d)
}

impl TrustConfig {
    pub fn new<I, J, S, T>(trusted: I, allow: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            trusted_domains: trusted
                .into_iter()
                .filter_map(|d| normalise_domain(d.as_ref()))
                .collect(),
            allow_list: allow
                .into_iter()
                .filter_map(|d| normalise_domain(d.as_ref()))
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(DEFAULT_TRUSTED_DOMAINS.iter(), std::iter::empty::<&str>())
    }

    fn entries(&self) -> impl Iterator<Item = &String> {
        self.trusted_domains.iter().chain(self.allow_list.iter())
    }

    /// Whether `domain` is trusted under `mode`. Empty domains never are.
    pub fn is_trusted(&self, domain: &str, mode: MatchMode) -> bool {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return false;
        }
        match mode {
            MatchMode::Exact => {
                self.trusted_domains.contains(&domain) || self.allow_list.contains(&domain)
            }
            MatchMode::Suffix => self.entries().any(|d| {
                domain == *d
                    || (domain.len() > d.len()
                        && domain.ends_with(d.as_str())
                        && domain.as_bytes()[domain.len() - d.len() - 1] == b'.')
            }),
        }
    }

    /// Sorted list of all entries, for diagnostics.
    pub fn describe(&self) -> Vec<String> {
        let mut all: Vec<String> = self.entries().cloned().collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Result of classifying one recipient snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Trusted recipients, deduplicated by email.
    pub trusted: AHashSet<String>,
    /// External recipients in input order, duplicates kept.
    pub external: Vec<Recipient>,
}

impl Evaluation {
    pub fn has_external(&self) -> bool {
        !self.external.is_empty()
    }

    /// External recipients deduplicated by email, first occurrence wins.
    pub fn unique_external(&self) -> Vec<Recipient> {
        let mut seen = AHashSet::new();
        self.external
            .iter()
            .filter(|r| seen.insert(r.email.clone()))
            .cloned()
            .collect()
    }
}

/// Partitions recipients into trusted and external.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustEvaluator {
    pub mode: MatchMode,
}

impl TrustEvaluator {
    pub fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    /// Malformed recipients are never trusted, whatever their domain says.
    pub fn is_trusted(&self, recipient: &Recipient, config: &TrustConfig) -> bool {
        recipient.valid && config.is_trusted(&recipient.domain, self.mode)
    }

    pub fn evaluate(&self, recipients: &[Recipient], config: &TrustConfig) -> Evaluation {
        let mut out = Evaluation::default();
        for r in recipients {
            if self.is_trusted(r, config) {
                out.trusted.insert(r.email.clone());
            } else {
                out.external.push(r.clone());
            }
        }
        out
    }

    /// Keep only trusted recipients, in original order.
    pub fn retain_trusted(&self, recipients: &[Recipient], config: &TrustConfig) -> Vec<Recipient> {
        recipients
            .iter()
            .filter(|r| self.is_trusted(r, config))
            .cloned()
            .collect()
    }
}

/// Where the trust configuration comes from. Loaded at the start of every
/// evaluation so edits take effect between messages.
pub trait TrustSource: Send + Sync {
    fn load(&self) -> Result<TrustConfig, TrustSourceError>;

    /// Used when `load` fails.
    fn fallback(&self) -> TrustConfig {
        TrustConfig::builtin()
    }
}

/// Fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticTrustSource(pub TrustConfig);

impl TrustSource for StaticTrustSource {
    fn load(&self) -> Result<TrustConfig, TrustSourceError> {
        Ok(self.0.clone())
    }
}

/// JSON file `{"trustedDomains": [...], "allowList": [...]}`. A missing file
/// yields the fallback list; an unreadable or malformed one is an error.
#[derive(Debug, Clone)]
pub struct FileTrustSource {
    path: PathBuf,
    fallback: TrustConfig,
}

impl FileTrustSource {
    pub fn new(path: impl Into<PathBuf>, fallback: TrustConfig) -> Self {
        Self {
            path: path.into(),
            fallback,
        }
    }
}

impl TrustSource for FileTrustSource {
    fn load(&self) -> Result<TrustConfig, TrustSourceError> {
        let shown = self.path.display().to_string();
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %shown, "trust file absent, using fallback list");
                return Ok(self.fallback.clone());
            }
            Err(source) => {
                return Err(TrustSourceError::Read {
                    path: shown,
                    source,
                })
            }
        };
        let file: TrustFile =
            serde_json::from_str(&content).map_err(|source| TrustSourceError::Parse {
                path: shown.clone(),
                source,
            })?;
        if file.trusted_domains.is_empty() && file.allow_list.is_empty() {
            tracing::warn!(path = %shown, "trust file lists no domains, using fallback list");
            return Ok(self.fallback.clone());
        }
        Ok(TrustConfig::new(file.trusted_domains, file.allow_list))
    }

    fn fallback(&self) -> TrustConfig {
        self.fallback.clone()
    }
}
