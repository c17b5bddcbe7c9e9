//! Auto-reply settings and per-user conversation state.
//!
//! Toggles are re-read from the store at the top of every inbound handling
//! path via [`Settings::snapshot`]. A snapshot can go stale between refresh
//! and use; that is accepted for these low-stakes flags.

use std::collections::HashSet;
use std::sync::Arc;

use crate::relay::store::Store;

/// Store namespace for toggles and persona preferences.
pub const SETTINGS_NS: &str = "gweb_settings";
/// Store namespace for per-user conversation state.
pub const SESSIONS_NS: &str = "gweb_sessions";

/// Point-in-time view of the reply toggles.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub enabled_users: HashSet<i64>,
    pub disabled_users: HashSet<i64>,
    pub for_all: bool,
    pub default_persona: Option<String>,
}

impl SettingsSnapshot {
    /// Whether the bot should auto-reply to this user. An explicit disable
    /// always wins over the global flag.
    pub fn should_reply(&self, user_id: i64) -> bool {
        if self.disabled_users.contains(&user_id) {
            return false;
        }
        self.for_all || self.enabled_users.contains(&user_id)
    }
}

#[derive(Clone)]
pub struct Settings {
    store: Arc<Store>,
}

impl Settings {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Re-read all toggles from the store.
    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            enabled_users: self
                .store
                .get::<Vec<i64>>(SETTINGS_NS, "enabled_users")
                .unwrap_or_default()
                .into_iter()
                .collect(),
            disabled_users: self
                .store
                .get::<Vec<i64>>(SETTINGS_NS, "disabled_users")
                .unwrap_or_default()
                .into_iter()
                .collect(),
            for_all: self.store.get(SETTINGS_NS, "for_all").unwrap_or(false),
            default_persona: self.store.get(SETTINGS_NS, "default_persona"),
        }
    }

    pub fn enable_user(&self, user_id: i64) {
        let snap = self.snapshot();
        let mut disabled = snap.disabled_users;
        let mut enabled = snap.enabled_users;
        disabled.remove(&user_id);
        enabled.insert(user_id);
        self.store
            .set(SETTINGS_NS, "disabled_users", &sorted(disabled));
        self.store.set(SETTINGS_NS, "enabled_users", &sorted(enabled));
    }

    pub fn disable_user(&self, user_id: i64) {
        let snap = self.snapshot();
        let mut disabled = snap.disabled_users;
        let mut enabled = snap.enabled_users;
        enabled.remove(&user_id);
        disabled.insert(user_id);
        self.store
            .set(SETTINGS_NS, "disabled_users", &sorted(disabled));
        self.store.set(SETTINGS_NS, "enabled_users", &sorted(enabled));
    }

    /// Remove the user from both sets. Returns true if anything changed.
    pub fn forget_user(&self, user_id: i64) -> bool {
        let snap = self.snapshot();
        let mut disabled = snap.disabled_users;
        let mut enabled = snap.enabled_users;
        let changed = enabled.remove(&user_id) | disabled.remove(&user_id);
        if changed {
            self.store
                .set(SETTINGS_NS, "disabled_users", &sorted(disabled));
            self.store.set(SETTINGS_NS, "enabled_users", &sorted(enabled));
        }
        changed
    }

    /// Toggle the respond-to-everyone flag, returning the new value.
    pub fn toggle_for_all(&self) -> bool {
        let next = !self.snapshot().for_all;
        self.store.set(SETTINGS_NS, "for_all", &next);
        next
    }

    pub fn set_default_persona(&self, persona: Option<&str>) {
        match persona {
            Some(p) => self.store.set(SETTINGS_NS, "default_persona", &p),
            None => self.store.remove(SETTINGS_NS, "default_persona"),
        }
    }

    pub fn set_user_persona(&self, user_id: i64, persona: Option<&str>) {
        let key = format!("user_persona.{user_id}");
        match persona {
            Some(p) => self.store.set(SETTINGS_NS, &key, &p),
            None => self.store.remove(SETTINGS_NS, &key),
        }
    }

    /// Persona for a user: per-user override, falling back to the default.
    pub fn persona_for(&self, user_id: i64) -> Option<String> {
        self.store
            .get(SETTINGS_NS, &format!("user_persona.{user_id}"))
            .or_else(|| self.store.get(SETTINGS_NS, "default_persona"))
    }

    /// Opaque upstream continuation token for a user, if any.
    pub fn continuation(&self, user_id: i64) -> Option<serde_json::Value> {
        self.store
            .get(SESSIONS_NS, &format!("continuation.{user_id}"))
    }

    pub fn set_continuation(&self, user_id: i64, token: &serde_json::Value) {
        self.store
            .set(SESSIONS_NS, &format!("continuation.{user_id}"), token);
    }

    pub fn clear_continuation(&self, user_id: i64) {
        self.store
            .remove(SESSIONS_NS, &format!("continuation.{user_id}"));
    }
}

fn sorted(set: HashSet<i64>) -> Vec<i64> {
    let mut v: Vec<i64> = set.into_iter().collect();
    v.sort_unstable();
    v
}
