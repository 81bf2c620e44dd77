// Shared display and moderation settings, plus the partial-update merge that
// admins drive through `admin-settings` frames.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::feedback::{CycleResetReason, FeedbackCollector};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_CUSTOM_EMOJI: &str = "⭐";
pub const MAX_CUSTOM_EMOJI_CHARS: usize = 8;

pub const SLOW_MODE_SECONDS: RangeInclusive<i64> = 1..=60;
pub const MAX_MESSAGES: RangeInclusive<i64> = 1..=100;
pub const FONT_SIZE: RangeInclusive<i64> = 8..=72;

pub const CEE_PROVIDERS: [&str; 2] = ["openai", "gemini"];
pub const DEFAULT_CEE_PROVIDER: &str = "openai";
pub const MAX_CEE_SYSTEM_PROMPT_CHARS: usize = 4_000;

// ---------------------------------------------------------------------------
// Settings record
// ---------------------------------------------------------------------------

/// The single shared settings record. Broadcast in full on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub max_messages: u32,
    pub font_size: u32,
    pub show_join_code: bool,
    pub show_mobile_link: bool,
    pub hide_ip: bool,
    pub disable_chat_history: bool,
    pub custom_emoji: String,
    pub emoji_direct_send: bool,
    pub slow_mode_enabled: bool,
    pub slow_mode_seconds: u32,
    pub enable_feedback_form: bool,
    pub feedback_cycle_id: u64,
    pub enable_cee_agent: bool,
    pub cee_api_provider: String,
    /// Whether an API key is stored. The key itself never leaves the store.
    pub cee_api_key_set: bool,
    pub cee_system_prompt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_messages: 10,
            font_size: 16,
            show_join_code: true,
            show_mobile_link: true,
            hide_ip: true,
            disable_chat_history: false,
            custom_emoji: DEFAULT_CUSTOM_EMOJI.to_string(),
            emoji_direct_send: true,
            slow_mode_enabled: false,
            slow_mode_seconds: 3,
            enable_feedback_form: false,
            feedback_cycle_id: 0,
            enable_cee_agent: false,
            cee_api_provider: DEFAULT_CEE_PROVIDER.to_string(),
            cee_api_key_set: false,
            cee_system_prompt: String::new(),
        }
    }
}

impl Settings {
    /// Cooldown between accepted messages, or `None` when slow mode is off.
    pub fn slow_mode_cooldown(&self) -> Option<Duration> {
        self.slow_mode_enabled
            .then(|| Duration::from_secs(u64::from(self.slow_mode_seconds)))
    }
}

// ---------------------------------------------------------------------------
// Partial update
// ---------------------------------------------------------------------------

/// A partial settings update. Absent fields leave the current value alone;
/// fields of the wrong JSON type are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default, deserialize_with = "lenient")]
    pub max_messages: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub font_size: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub show_join_code: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub show_mobile_link: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub hide_ip: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub disable_chat_history: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub custom_emoji: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub emoji_direct_send: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub slow_mode_enabled: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub slow_mode_seconds: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub enable_feedback_form: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub enable_cee_agent: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub cee_api_provider: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub cee_api_key: Option<ApiKey>,
    #[serde(default, deserialize_with = "lenient")]
    pub cee_system_prompt: Option<String>,
}

/// Write-only agent API key. `Debug` never prints the value.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Trim and cap a custom emoji string, falling back to the default.
pub fn sanitize_custom_emoji(raw: &str) -> String {
    let capped: String = raw.trim().chars().take(MAX_CUSTOM_EMOJI_CHARS).collect();
    if capped.is_empty() {
        DEFAULT_CUSTOM_EMOJI.to_string()
    } else {
        capped
    }
}

/// Trim and cap the agent system prompt.
pub fn sanitize_system_prompt(raw: &str) -> String {
    raw.trim().chars().take(MAX_CEE_SYSTEM_PROMPT_CHARS).collect()
}

fn in_range(value: Option<i64>, range: &RangeInclusive<i64>, field: &str) -> Option<u32> {
    match value {
        Some(v) if range.contains(&v) => u32::try_from(v).ok(),
        Some(v) => {
            debug!(field, value = v, "dropping out-of-range settings value");
            None
        }
        None => None,
    }
}

// ---------------------------------------------------------------------------
// SettingsStore
// ---------------------------------------------------------------------------

/// Exclusive owner of the shared [`Settings`].
pub struct SettingsStore {
    settings: Settings,
    cee_api_key: Option<ApiKey>,
    feedback: Arc<FeedbackCollector>,
}

impl SettingsStore {
    pub fn new(feedback: Arc<FeedbackCollector>) -> Self {
        Self::with_settings(Settings::default(), feedback)
    }

    /// Start from an explicit record. The feedback flag and cycle id always
    /// start from the collector's state, not from `settings`.
    pub fn with_settings(mut settings: Settings, feedback: Arc<FeedbackCollector>) -> Self {
        settings.enable_feedback_form = feedback.is_enabled();
        settings.feedback_cycle_id = feedback.current_cycle();
        settings.cee_api_key_set = false;
        Self {
            settings,
            cee_api_key: None,
            feedback,
        }
    }

    pub fn current(&self) -> &Settings {
        &self.settings
    }

    pub fn cee_api_key(&self) -> Option<&ApiKey> {
        self.cee_api_key.as_ref()
    }

    /// Merge the fields present in `update` and return the full snapshot.
    pub fn apply(&mut self, update: &SettingsUpdate) -> Settings {
        let s = &mut self.settings;

        if let Some(v) = in_range(update.max_messages, &MAX_MESSAGES, "maxMessages") {
            s.max_messages = v;
        }
        if let Some(v) = in_range(update.font_size, &FONT_SIZE, "fontSize") {
            s.font_size = v;
        }
        if let Some(v) = in_range(update.slow_mode_seconds, &SLOW_MODE_SECONDS, "slowModeSeconds") {
            s.slow_mode_seconds = v;
        }
        if let Some(v) = update.show_join_code {
            s.show_join_code = v;
        }
        if let Some(v) = update.show_mobile_link {
            s.show_mobile_link = v;
        }
        if let Some(v) = update.hide_ip {
            s.hide_ip = v;
        }
        if let Some(v) = update.disable_chat_history {
            s.disable_chat_history = v;
        }
        if let Some(raw) = update.custom_emoji.as_deref() {
            s.custom_emoji = sanitize_custom_emoji(raw);
        }
        if let Some(v) = update.emoji_direct_send {
            s.emoji_direct_send = v;
        }
        if let Some(v) = update.slow_mode_enabled {
            s.slow_mode_enabled = v;
        }
        if let Some(v) = update.enable_cee_agent {
            s.enable_cee_agent = v;
        }
        if let Some(provider) = update.cee_api_provider.as_deref() {
            let provider = provider.trim().to_ascii_lowercase();
            if CEE_PROVIDERS.contains(&provider.as_str()) {
                s.cee_api_provider = provider;
            } else {
                debug!(provider = %provider, "dropping unknown agent provider");
            }
        }
        if let Some(prompt) = update.cee_system_prompt.as_deref() {
            s.cee_system_prompt = sanitize_system_prompt(prompt);
        }
        if let Some(key) = &update.cee_api_key {
            let trimmed = key.expose().trim();
            self.cee_api_key = (!trimmed.is_empty()).then(|| ApiKey::new(trimmed));
            self.settings.cee_api_key_set = self.cee_api_key.is_some();
        }
        if let Some(v) = update.enable_feedback_form {
            self.set_feedback_enabled(v);
        }

        self.settings.clone()
    }

    /// Toggle the feedback form. Returns whether anything changed.
    ///
    /// Enabling starts a new feedback cycle; disabling closes the open one.
    pub fn set_feedback_enabled(&mut self, next: bool) -> bool {
        if self.settings.enable_feedback_form == next {
            return false;
        }
        self.settings.enable_feedback_form = next;
        if next {
            let cycle_id = self.feedback.start_cycle();
            self.settings.feedback_cycle_id = cycle_id;
            info!(cycle_id, "feedback form enabled");
        } else {
            self.feedback.close_cycle(CycleResetReason::FeedbackDisabled);
            info!(cycle_id = self.settings.feedback_cycle_id, "feedback form disabled");
        }
        true
    }
}
