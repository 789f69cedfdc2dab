//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use haven_core::directory::registry::default_registry;
use haven_core::{
    Channel, Contact, DirectoryConfig, DispatchConfig, EngineConfig, SafeLocation, TriggerWordSet,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable that overrides the settings file location.
pub const SETTINGS_ENV: &str = "HAVEN_SETTINGS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub sender_name: String,
    pub countdown_seconds: u32,
    pub max_retries: u32,
    pub search_radius_km: f64,
    pub contacts: Vec<Contact>,
    pub trigger_words: TriggerWordSet,
    pub safe_locations: Vec<SafeLocation>,
    /// Query OpenStreetMap for nearby police stations and hospitals.
    pub live_poi_lookup: bool,
    pub overpass_endpoint: Option<String>,
    /// Per-channel webhook URLs. With none configured, alerts are dry-run only.
    pub webhooks: WebhookSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct WebhookSettings {
    pub location_share: Option<String>,
    pub sms: Option<String>,
    pub email: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            sender_name: "Haven user".into(),
            countdown_seconds: 10,
            max_retries: 2,
            search_radius_km: 3.0,
            contacts: Vec::new(),
            trigger_words: TriggerWordSet::builtin(),
            safe_locations: default_registry(),
            live_poi_lookup: false,
            overpass_endpoint: None,
            webhooks: WebhookSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.sender_name = self.sender_name.trim().to_string();
        if self.sender_name.is_empty() {
            self.sender_name = "Haven user".into();
        }
        self.countdown_seconds = self.countdown_seconds.clamp(3, 60);
        self.max_retries = self.max_retries.clamp(0, 5);
        if !self.search_radius_km.is_finite() {
            self.search_radius_km = 3.0;
        }
        self.search_radius_km = self.search_radius_km.clamp(0.5, 50.0);
        self.contacts = normalize_contacts(&self.contacts);
        if self.trigger_words.is_empty() {
            self.trigger_words = TriggerWordSet::builtin();
        }
        self.overpass_endpoint = normalize_url(self.overpass_endpoint.as_deref());
        self.webhooks.location_share = normalize_url(self.webhooks.location_share.as_deref());
        self.webhooks.sms = normalize_url(self.webhooks.sms.as_deref());
        self.webhooks.email = normalize_url(self.webhooks.email.as_deref());
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            countdown_ticks: self.countdown_seconds,
            tick_interval: Duration::from_secs(1),
            sender_name: self.sender_name.clone(),
            contacts: self.contacts.clone(),
            trigger_words: self.trigger_words.clone(),
            dispatch: DispatchConfig {
                max_retries: self.max_retries,
                ..DispatchConfig::default()
            },
            directory: DirectoryConfig {
                radius_km: self.search_radius_km,
                registry: self.safe_locations.clone(),
                ..DirectoryConfig::default()
            },
        }
    }
}

impl WebhookSettings {
    pub fn is_empty(&self) -> bool {
        self.endpoints().next().is_none()
    }

    /// Configured `(channel, url)` pairs.
    pub fn endpoints(&self) -> impl Iterator<Item = (Channel, &str)> {
        [
            (Channel::LocationShare, self.location_share.as_deref()),
            (Channel::Sms, self.sms.as_deref()),
            (Channel::Email, self.email.as_deref()),
        ]
        .into_iter()
        .filter_map(|(channel, url)| url.map(|u| (channel, u)))
    }
}

fn normalize_url(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

/// Trim fields, drop unusable contacts and duplicate phone numbers.
fn normalize_contacts(raw: &[Contact]) -> Vec<Contact> {
    let mut out: Vec<Contact> = Vec::new();
    for contact in raw {
        let mut contact = contact.clone();
        contact.name = contact.name.trim().to_string();
        contact.phone = contact.phone.trim().to_string();
        contact.email = normalize_url(contact.email.as_deref());
        if let Err(e) = contact.validate() {
            warn!("dropping contact from settings: {e}");
            continue;
        }
        if out.iter().any(|c| c.phone == contact.phone) {
            continue;
        }
        if contact.id.trim().is_empty() {
            contact.id = (out.len() + 1).to_string();
        }
        out.push(contact);
    }
    out
}

/// `$HAVEN_SETTINGS` if set, otherwise the platform default.
pub fn settings_path() -> PathBuf {
    std::env::var_os(SETTINGS_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Haven")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("haven")
            .join("settings.json")
    }
}

/// Missing or malformed files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<AppSettings>(&raw) {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(path = %path.display(), "ignoring malformed settings: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(name: &str, phone: &str, email: Option<&str>) -> Contact {
        Contact {
            id: String::new(),
            name: name.into(),
            phone: phone.into(),
            email: email.map(Into::into),
            relationship: String::new(),
        }
    }

    #[test]
    fn normalize_clamps_ranges() {
        let mut settings = AppSettings {
            countdown_seconds: 0,
            max_retries: 99,
            search_radius_km: f64::NAN,
            sender_name: "   ".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.countdown_seconds, 3);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.search_radius_km, 3.0);
        assert_eq!(settings.sender_name, "Haven user");

        settings.countdown_seconds = 600;
        settings.normalize();
        assert_eq!(settings.countdown_seconds, 60);
    }

    #[test]
    fn normalize_drops_invalid_and_duplicate_contacts() {
        let mut settings = AppSettings {
            contacts: vec![
                contact(" Wanjiru ", "+254711111111", Some("wanjiru@example.com")),
                contact("No Phone", "  ", None),
                contact("Bad Mail", "+254733333333", Some("not-an-address")),
                contact("Duplicate", "+254711111111", None),
                contact("Otieno", "+254722222222", Some("  ")),
            ],
            ..AppSettings::default()
        };
        settings.normalize();
        let names: Vec<_> = settings.contacts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Wanjiru", "Otieno"]);
        assert_eq!(settings.contacts[0].id, "1");
        assert_eq!(settings.contacts[1].email, None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let raw = r#"{ "senderName": "Amina", "triggerWords": { "en": ["Help"] } }"#;
        let mut settings: AppSettings = serde_json::from_str(raw).expect("parse");
        settings.normalize();
        assert_eq!(settings.sender_name, "Amina");
        assert_eq!(settings.countdown_seconds, 10);
        assert_eq!(settings.trigger_words.words("en"), ["help"]);
        assert_eq!(settings.safe_locations.len(), 5);
        assert!(settings.webhooks.is_empty());
    }

    #[test]
    fn empty_trigger_words_fall_back_to_builtin() {
        let raw = r#"{ "triggerWords": {} }"#;
        let mut settings: AppSettings = serde_json::from_str(raw).expect("parse");
        settings.normalize();
        assert_eq!(settings.trigger_words, TriggerWordSet::builtin());
    }

    #[test]
    fn webhook_endpoints_skip_blank_urls() {
        let mut settings = AppSettings {
            webhooks: WebhookSettings {
                location_share: Some(" ".into()),
                sms: Some(" https://hooks.example.com/sms ".into()),
                email: None,
            },
            ..AppSettings::default()
        };
        settings.normalize();
        let endpoints: Vec<_> = settings.webhooks.endpoints().collect();
        assert_eq!(endpoints, vec![(Channel::Sms, "https://hooks.example.com/sms")]);
    }

    #[test]
    fn engine_config_carries_settings() {
        let settings = AppSettings {
            countdown_seconds: 5,
            max_retries: 1,
            ..AppSettings::default()
        };
        let config = settings.engine_config();
        assert_eq!(config.countdown_ticks, 5);
        assert_eq!(config.dispatch.max_retries, 1);
        assert_eq!(config.directory.registry.len(), 5);
    }

    #[test]
    fn save_then_load_preserves_contacts() {
        let dir = std::env::temp_dir().join(format!("haven-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            sender_name: "Amina".into(),
            contacts: vec![contact("Wanjiru", "+254711111111", None)],
            ..AppSettings::default()
        };
        save_settings(&path, &settings).expect("save");
        let loaded = load_settings(&path);
        assert_eq!(loaded.sender_name, "Amina");
        assert_eq!(loaded.contacts.len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("haven-bad-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("settings.json");
        fs::write(&path, "{ not json").expect("write");
        let loaded = load_settings(&path);
        assert_eq!(loaded.countdown_seconds, 10);
        let _ = fs::remove_dir_all(dir);
    }
}
