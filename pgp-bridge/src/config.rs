//! # Config
//!
//! Module dedicated to key configuration. It contains the
//! [`KeyConfiguration`] consumed by the bridge, as well as the
//! [`ConfigStore`] trait used to persist it in a plain key-value
//! preference store.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tracing::debug;

use crate::{Error, Result};

/// The provider used when no provider has been recorded yet.
pub const DEFAULT_PROVIDER_ID: &str = "org.sufficientlysecure.keychain";

/// The domain used to derive the default user id.
pub const DEFAULT_USER_DOMAIN: &str = "echo.chat";

/// The store key holding the provider identifier.
pub const PROVIDER_ID_KEY: &str = "openpgp_provider_list";

/// The store key holding the key identifier.
pub const KEY_ID_KEY: &str = "openpgp_key";

/// Builds the default user id from a display name and a domain.
///
/// ```
/// use pgp_bridge::config::default_user_id;
///
/// assert_eq!(default_user_id("alice", "echo.chat"), "alice <alice@echo.chat>");
/// ```
pub fn default_user_id(display_name: impl AsRef<str>, domain: impl AsRef<str>) -> String {
    let name = display_name.as_ref();
    let domain = domain.as_ref();
    format!("{name} <{name}@{domain}>")
}

/// The key configuration.
///
/// Identifies the provider to bind to and the key to use for signing
/// operations. It is mutated only through the configuration flow and
/// read by the request builder.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct KeyConfiguration {
    /// The identifier of the provider service.
    provider_id: String,

    /// The identifier of the selected key, if any.
    #[cfg_attr(feature = "derive", serde(default))]
    key_id: Option<u64>,

    /// The user id proposed to the provider when no key is selected.
    default_user_id: String,
}

impl KeyConfiguration {
    /// Creates a new key configuration using the
    /// [`DEFAULT_USER_DOMAIN`].
    pub fn new(provider_id: impl ToString, display_name: impl AsRef<str>) -> Self {
        Self::new_with_domain(provider_id, display_name, DEFAULT_USER_DOMAIN)
    }

    pub fn new_with_domain(
        provider_id: impl ToString,
        display_name: impl AsRef<str>,
        domain: impl AsRef<str>,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            key_id: None,
            default_user_id: default_user_id(display_name, domain),
        }
    }

    /// Loads the key configuration from the given store.
    ///
    /// Falls back to the [`DEFAULT_PROVIDER_ID`] when the store does
    /// not contain any provider.
    pub fn load(store: &dyn ConfigStore, display_name: impl AsRef<str>) -> Result<Self> {
        let provider_id = store
            .get(PROVIDER_ID_KEY)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDER_ID.to_owned());

        let key_id = match store.get(KEY_ID_KEY) {
            None => None,
            Some(id) => Some(
                id.trim()
                    .parse::<u64>()
                    .map_err(|err| Error::ParseKeyIdError(err, id.clone()))?,
            ),
        };

        debug!(provider = provider_id, ?key_id, "loaded key configuration");

        let mut config = Self::new(provider_id, display_name);
        config.key_id = key_id;
        Ok(config)
    }

    /// Saves the key configuration into the given store.
    pub fn save(&self, store: &dyn ConfigStore) {
        debug!(provider = self.provider_id, key_id = ?self.key_id, "saving key configuration");
        store.set(PROVIDER_ID_KEY, Some(self.provider_id.clone()));
        store.set(KEY_ID_KEY, self.key_id.map(|id| id.to_string()));
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn key_id(&self) -> Option<u64> {
        self.key_id
    }

    pub fn default_user_id(&self) -> &str {
        &self.default_user_id
    }

    /// Changes the provider.
    ///
    /// Keys belong to a provider, so the selected key is forgotten
    /// when the provider actually changes.
    pub fn set_provider_id(&mut self, provider_id: impl ToString) {
        let provider_id = provider_id.to_string();
        if provider_id != self.provider_id {
            self.provider_id = provider_id;
            self.key_id = None;
        }
    }

    pub fn set_key_id(&mut self, key_id: Option<u64>) {
        self.key_id = key_id;
    }

    pub fn with_key_id(mut self, key_id: Option<u64>) -> Self {
        self.set_key_id(key_id);
        self
    }
}

/// The configuration store trait.
///
/// Simple key-value preference store. Setting a key to `None` removes
/// it.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: Option<String>);
}

/// In-memory configuration store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore(Mutex<HashMap<String, String>>);

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Option<String>) {
        let mut entries = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                entries.insert(key.to_owned(), value);
            }
            None => {
                entries.remove(key);
            }
        }
    }
}
