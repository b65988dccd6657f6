//! JSON-file persistence for subscriptions and download settings.
//!
//! Reads fail soft: a missing or corrupt file behaves like an empty
//! subscription list or like the default settings. Writes go through a temp
//! file in the same directory and a rename, under the data-directory lock.
//! A subscriptions file that does not parse at all is never overwritten, and
//! individual entries that do not parse are carried over untouched.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{channel::extract_channel_id, config::ServiceConfig, error::StoreError, lock::DirLock};

pub const DEFAULT_QUALITY: &str = "best";
pub const DEFAULT_FORMAT: &str = "bestvideo+bestaudio";

/// A channel the nightly job keeps in sync. Never edited in place; removing
/// and re-adding is the only way to change one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub audio_only: bool,
    #[serde(default)]
    pub added_at: String,
}

impl Subscription {
    /// Reads one stored entry, filling in what a hand-edited file may lack.
    fn from_entry(entry: &Value) -> Option<Self> {
        let mut sub: Self = serde_json::from_value(entry.clone()).ok()?;
        if sub.url.is_empty() {
            return None;
        }
        if sub.id.is_empty() {
            sub.id = extract_channel_id(&sub.url);
        }
        if sub.name.is_empty() {
            sub.name = sub.id.clone();
        }
        Some(sub)
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

/// Entries stay raw JSON so ones we cannot read survive a rewrite.
#[derive(Serialize, Deserialize)]
struct SubscriptionsDocument {
    #[serde(default)]
    subscriptions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

/// Flat option mapping. Unknown keys are kept so the UI can store whatever it
/// likes next to the options the downloader understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(Map<String, Value>);

impl Settings {
    pub fn defaults() -> Self {
        let mut map = Map::new();
        map.insert("quality".into(), json!(DEFAULT_QUALITY));
        map.insert("format".into(), json!(DEFAULT_FORMAT));
        map.insert("updated_at".into(), json!(timestamp()));
        Self(map)
    }

    pub fn quality(&self) -> &str {
        self.0
            .get("quality")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_QUALITY)
    }

    /// Explicit format preference, if one is stored.
    pub fn format(&self) -> Option<&str> {
        self.0.get("format").and_then(Value::as_str)
    }

    pub fn auto_hardlink(&self) -> bool {
        self.0
            .get("auto_hardlink")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
    subscriptions_file: PathBuf,
    settings_file: PathBuf,
}

impl Store {
    pub fn new(config: &ServiceConfig) -> Result<Self, StoreError> {
        let store = Self {
            data_dir: config.data_dir.clone(),
            subscriptions_file: config.subscriptions_file.clone(),
            settings_file: config.settings_file.clone(),
        };
        for path in [&store.subscriptions_file, &store.settings_file] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| StoreError::io(format!("creating {}", parent.display()), err))?;
            }
        }
        Ok(store)
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        let entries = self.load_entries().unwrap_or_else(|err| {
            warn!(error = %err, "ignoring unreadable subscriptions file");
            Vec::new()
        });
        entries.iter().filter_map(Subscription::from_entry).collect()
    }

    pub fn find_subscription(&self, id: &str) -> Option<Subscription> {
        self.list_subscriptions().into_iter().find(|sub| sub.id == id)
    }

    pub fn add_subscription(
        &self,
        url: &str,
        name: Option<&str>,
        audio_only: bool,
    ) -> Result<Subscription, StoreError> {
        let _lock = self.lock()?;
        let mut entries = self.load_entries()?;

        let taken = entries
            .iter()
            .any(|entry| entry.get("url").and_then(Value::as_str) == Some(url));
        if taken {
            return Err(StoreError::DuplicateSubscription(url.to_string()));
        }

        let id = extract_channel_id(url);
        let subscription = Subscription {
            name: name
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| id.clone()),
            id,
            url: url.to_string(),
            audio_only,
            added_at: timestamp(),
        };
        entries.push(serde_json::to_value(&subscription).map_err(|source| {
            StoreError::Json {
                context: "subscription".to_string(),
                source,
            }
        })?);
        self.save_subscriptions(entries)?;

        info!(id = %subscription.id, url, audio_only, "subscription added");
        Ok(subscription)
    }

    /// Returns whether an entry with `id` existed. Every entry sharing the id
    /// is dropped.
    pub fn remove_subscription(&self, id: &str) -> Result<bool, StoreError> {
        let _lock = self.lock()?;
        let mut entries = self.load_entries()?;
        let before = entries.len();
        entries.retain(|entry| Subscription::from_entry(entry).is_none_or(|sub| sub.id != id));

        if entries.len() == before {
            return Ok(false);
        }
        self.save_subscriptions(entries)?;
        info!(id, "subscription removed");
        Ok(true)
    }

    pub fn get_settings(&self) -> Settings {
        read_json::<Settings>(&self.settings_file).unwrap_or_else(Settings::defaults)
    }

    /// Merges `partial` over the stored settings; keys absent from `partial`
    /// keep their value.
    pub fn update_settings(&self, partial: Map<String, Value>) -> Result<Settings, StoreError> {
        let _lock = self.lock()?;
        let mut settings = self.get_settings();
        settings.0.extend(partial);
        settings.0.insert("updated_at".into(), json!(timestamp()));
        write_json(&self.settings_file, &settings, "settings")?;
        Ok(settings)
    }

    /// Raw entries for a read-modify-write. A file that exists but cannot be
    /// read or parsed is an error so the caller never replaces it.
    fn load_entries(&self) -> Result<Vec<Value>, StoreError> {
        let path = &self.subscriptions_file;
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(format!("reading {}", path.display()), err)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<SubscriptionsDocument>(&content)
            .map(|doc| doc.subscriptions)
            .map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })
    }

    fn save_subscriptions(&self, subscriptions: Vec<Value>) -> Result<(), StoreError> {
        let doc = SubscriptionsDocument {
            subscriptions,
            updated_at: Some(timestamp()),
        };
        write_json(&self.subscriptions_file, &doc, "subscriptions")
    }

    fn lock(&self) -> Result<DirLock, StoreError> {
        DirLock::acquire(&self.data_dir)
            .map_err(|err| StoreError::io(format!("locking {}", self.data_dir.display()), err))
    }
}

/// Local wall-clock time in ISO-8601 with microseconds, no offset.
pub fn timestamp() -> String {
    Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read store file");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring corrupt store file");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, label: &str) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let body = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        context: label.to_string(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| StoreError::io(format!("creating temp file in {}", parent.display()), err))?;
    tmp.write_all(body.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| StoreError::io(format!("writing {label}"), err))?;
    tmp.persist(path)
        .map_err(|err| StoreError::io(format!("replacing {}", path.display()), err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn temp_store() -> (TempDir, Store) {
        let dir = tempdir().unwrap();
        let config = ServiceConfig::rooted_at(dir.path());
        let store = Store::new(&config).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_file_lists_nothing() {
        let (_dir, store) = temp_store();
        assert!(store.list_subscriptions().is_empty());
    }

    #[test]
    fn corrupt_file_lists_nothing() {
        let (_dir, store) = temp_store();
        fs::write(&store.subscriptions_file, "{not json").unwrap();
        assert!(store.list_subscriptions().is_empty());
    }

    #[test]
    fn corrupt_file_is_not_overwritten() {
        let (_dir, store) = temp_store();
        fs::write(&store.subscriptions_file, "{not json").unwrap();
        let err = store
            .add_subscription("https://www.youtube.com/c/New", None, false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(store.remove_subscription("New").is_err());
        assert_eq!(fs::read_to_string(&store.subscriptions_file).unwrap(), "{not json");
    }

    #[test]
    fn incomplete_entries_do_not_hide_or_lose_others() {
        let (_dir, store) = temp_store();
        let doc = json!({
            "subscriptions": [
                {"id": "A", "url": "https://www.youtube.com/c/A", "name": "Alpha", "audio_only": false, "added_at": "x"},
                {"url": "https://www.youtube.com/c/B", "audio_only": "true"},
                {"name": "no url at all"}
            ]
        });
        fs::write(&store.subscriptions_file, doc.to_string()).unwrap();

        let listed = store.list_subscriptions();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].id, "B");
        assert_eq!(listed[1].name, "B");
        assert!(listed[1].audio_only);

        store
            .add_subscription("https://www.youtube.com/c/C", None, false)
            .unwrap();
        let ids: Vec<_> = store.list_subscriptions().into_iter().map(|sub| sub.id).collect();
        assert_eq!(ids, ["A", "B", "C"]);

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&store.subscriptions_file).unwrap()).unwrap();
        assert_eq!(raw["subscriptions"].as_array().unwrap().len(), 4);
        assert_eq!(raw["subscriptions"][2], json!({"name": "no url at all"}));

        assert!(store.remove_subscription("A").unwrap());
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&store.subscriptions_file).unwrap()).unwrap();
        assert_eq!(raw["subscriptions"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn add_derives_id_and_default_name() {
        let (_dir, store) = temp_store();
        let sub = store
            .add_subscription("https://www.youtube.com/channel/UC123", None, true)
            .unwrap();
        assert_eq!(sub.id, "UC123");
        assert_eq!(sub.name, "UC123");
        assert!(sub.audio_only);
        assert_eq!(store.list_subscriptions(), vec![sub]);
    }

    #[test]
    fn duplicate_url_is_rejected() {
        let (_dir, store) = temp_store();
        let url = "https://www.youtube.com/c/Dupe";
        store.add_subscription(url, Some("Dupe"), false).unwrap();
        let err = store.add_subscription(url, None, false).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSubscription(ref u) if u == url));
        assert_eq!(store.list_subscriptions().len(), 1);
    }

    #[test]
    fn remove_unknown_id_leaves_file_alone() {
        let (_dir, store) = temp_store();
        store
            .add_subscription("https://youtube.com/user/keep", None, false)
            .unwrap();
        let before = fs::read_to_string(&store.subscriptions_file).unwrap();

        assert!(!store.remove_subscription("missing").unwrap());
        assert_eq!(fs::read_to_string(&store.subscriptions_file).unwrap(), before);
    }

    #[test]
    fn remove_known_id() {
        let (_dir, store) = temp_store();
        store
            .add_subscription("https://youtube.com/user/gone", None, false)
            .unwrap();
        assert!(store.remove_subscription("gone").unwrap());
        assert!(store.list_subscriptions().is_empty());
    }

    #[test]
    fn file_layout_matches_script_expectations() {
        let (_dir, store) = temp_store();
        store
            .add_subscription("https://youtube.com/c/Layout", None, false)
            .unwrap();
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&store.subscriptions_file).unwrap()).unwrap();
        assert_eq!(raw["subscriptions"][0]["url"], "https://youtube.com/c/Layout");
        assert_eq!(raw["subscriptions"][0]["audio_only"], false);
        assert!(raw["updated_at"].is_string());
    }

    #[test]
    fn settings_default_when_missing() {
        let (_dir, store) = temp_store();
        let settings = store.get_settings();
        assert_eq!(settings.quality(), "best");
        assert_eq!(settings.format(), Some("bestvideo+bestaudio"));
        assert!(!settings.auto_hardlink());
        assert!(serde_json::to_value(&settings).unwrap()["updated_at"].is_string());
    }

    #[test]
    fn partial_update_keeps_other_keys() {
        let (_dir, store) = temp_store();
        let mut partial = Map::new();
        partial.insert("quality".into(), json!("720p"));
        let settings = store.update_settings(partial).unwrap();

        assert_eq!(settings.quality(), "720p");
        assert_eq!(settings.format(), Some(DEFAULT_FORMAT));
        assert_eq!(store.get_settings(), settings);

        let mut partial = Map::new();
        partial.insert("auto_hardlink".into(), json!(true));
        let settings = store.update_settings(partial).unwrap();
        assert_eq!(settings.quality(), "720p");
        assert!(settings.auto_hardlink());
    }
}
