//! Credential store: maps verified credentials to user ids.
//!
//! Shared between the router (user id lookup) and the direct transport
//! (handshake verification). Credentials can be added at runtime when a
//! remote instance is pre-authorised in setup mode.

use crate::config::CredentialConfig;
use crate::hooks::Authenticator;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone)]
struct StoredCredential {
    secret: String,
    user_id: String,
    identities: Vec<String>,
}

/// Thread-safe credential store.
#[derive(Debug, Default)]
pub struct CredentialStore {
    credentials: RwLock<HashMap<String, StoredCredential>>,
    /// identity -> key_id proved by its connection.
    logins: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(credentials: &[CredentialConfig]) -> Self {
        let store = Self::new();
        for cred in credentials {
            store.add_restricted(&cred.key_id, &cred.secret, &cred.user_id, cred.identities.clone());
        }
        store
    }

    /// Add or replace a credential usable by any identity.
    pub fn add(&self, key_id: &str, secret: &str, user_id: &str) {
        self.add_restricted(key_id, secret, user_id, Vec::new());
    }

    pub fn add_restricted(&self, key_id: &str, secret: &str, user_id: &str, identities: Vec<String>) {
        let mut creds = self.credentials.write().unwrap_or_else(|e| e.into_inner());
        creds.insert(
            key_id.to_string(),
            StoredCredential {
                secret: secret.to_string(),
                user_id: user_id.to_string(),
                identities,
            },
        );
        info!(key_id, "Credential registered");
    }

    pub fn remove(&self, key_id: &str) -> bool {
        let mut creds = self.credentials.write().unwrap_or_else(|e| e.into_inner());
        creds.remove(key_id).is_some()
    }

    pub fn contains(&self, key_id: &str) -> bool {
        let creds = self.credentials.read().unwrap_or_else(|e| e.into_inner());
        creds.contains_key(key_id)
    }

    /// The shared secret for `key_id`.
    pub fn secret(&self, key_id: &str) -> Option<String> {
        let creds = self.credentials.read().unwrap_or_else(|e| e.into_inner());
        creds.get(key_id).map(|c| c.secret.clone())
    }

    pub fn user_id(&self, key_id: &str) -> Option<String> {
        let creds = self.credentials.read().unwrap_or_else(|e| e.into_inner());
        creds.get(key_id).map(|c| c.user_id.clone())
    }

    /// Record that `identity` connected with `key_id`.
    pub fn record_login(&self, identity: &str, key_id: &str) {
        let mut logins = self.logins.write().unwrap_or_else(|e| e.into_inner());
        logins.insert(identity.to_string(), key_id.to_string());
    }

    pub fn forget_login(&self, identity: &str) {
        let mut logins = self.logins.write().unwrap_or_else(|e| e.into_inner());
        logins.remove(identity);
    }

    pub fn login_key(&self, identity: &str) -> Option<String> {
        let logins = self.logins.read().unwrap_or_else(|e| e.into_inner());
        logins.get(identity).cloned()
    }
}

impl Authenticator for CredentialStore {
    fn lookup_user_id(
        &self,
        sender: &str,
        _recipient: &str,
        credential: Option<&str>,
    ) -> Option<String> {
        let key_id = match credential {
            Some(key) => key.to_string(),
            None => self.login_key(sender)?,
        };
        self.user_id(&key_id)
    }

    fn check_permissions(&self, identity: &str) -> Option<String> {
        let key_id = self.login_key(identity)?;
        let creds = self.credentials.read().unwrap_or_else(|e| e.into_inner());
        match creds.get(&key_id) {
            None => Some(format!("credential {key_id:?} has been revoked")),
            Some(cred) if !cred.identities.is_empty() && !cred.identities.iter().any(|i| i == identity) => {
                Some(format!(
                    "identity {identity:?} is not permitted to use credential {key_id:?}"
                ))
            }
            Some(_) => None,
        }
    }
}
