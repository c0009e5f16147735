//! Warn-once flag kept in the message's own property bag.
//!
//! The flag lives on the message, not in process memory, so it follows the
//! draft through exactly one blocked send and disappears with it. Keys written
//! by earlier releases share the [`WARNING_KEY_PREFIX`]; they are ignored when
//! reading and dropped on every write so an upgrade can never leave a draft
//! stuck in the warned state.

use crate::error::HostError;
use crate::host::{CustomProperties, PropertyBag};

pub const WARNING_KEY: &str = "WarningShown_V1";
pub const WARNING_KEY_PREFIX: &str = "WarningShown";
const FLAG_SET: &str = "yes";

pub struct WarningStore<'a> {
    bag: &'a dyn PropertyBag,
}

impl<'a> WarningStore<'a> {
    pub fn new(bag: &'a dyn PropertyBag) -> Self {
        Self { bag }
    }

    pub async fn has_pending_warning(&self) -> Result<bool, HostError> {
        let props = self.bag.load().await?;
        Ok(props.get(WARNING_KEY).map(String::as_str) == Some(FLAG_SET))
    }

    /// Set the flag. Returns only after the host confirmed the save.
    pub async fn mark_warned(&self) -> Result<(), HostError> {
        let mut props = self.bag.load().await?;
        drop_stale_keys(&mut props);
        props.insert(WARNING_KEY.to_string(), FLAG_SET.to_string());
        self.bag.save(&props).await
    }

    pub async fn clear_warning(&self) -> Result<(), HostError> {
        let mut props = self.bag.load().await?;
        let stale = drop_stale_keys(&mut props);
        if props.remove(WARNING_KEY).is_none() && stale == 0 {
            return Ok(());
        }
        self.bag.save(&props).await
    }
}

fn drop_stale_keys(props: &mut CustomProperties) -> usize {
    let before = props.len();
    props.retain(|k, _| k == WARNING_KEY || !k.starts_with(WARNING_KEY_PREFIX));
    let removed = before - props.len();
    if removed > 0 {
        tracing::debug!(removed, "dropped warning keys from an earlier release");
    }
    removed
}
