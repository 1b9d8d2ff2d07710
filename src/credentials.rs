//! Terminal endpoint configuration stored in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Hosts that manage secrets themselves
//! can build a [`ServerEndpoint`] directly instead.

use keyring::Entry;
use tracing::{info, warn};

use crate::api;

const SERVICE_NAME: &str = "the-small-pos";

// Credential keys
const KEY_ADMIN_URL: &str = "admin_dashboard_url";
const KEY_TERMINAL_ID: &str = "terminal_id";
const KEY_API_KEY: &str = "pos_api_key";
const KEY_BRANCH_ID: &str = "branch_id";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_TERMINAL_ID, KEY_API_KEY, KEY_BRANCH_ID];

/// Where and as whom this terminal talks to the admin dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub terminal_id: String,
    pub branch_id: Option<String>,
}

impl ServerEndpoint {
    /// Build an endpoint, unpacking a connection string in `api_key` if one
    /// was pasted instead of a raw key.
    pub fn new(base_url: &str, api_key: &str, terminal_id: &str) -> Self {
        let raw = api_key.trim();
        let base_url = api::extract_admin_url_from_connection_string(raw)
            .unwrap_or_else(|| api::normalize_admin_url(base_url));
        let terminal_id = api::extract_terminal_id_from_connection_string(raw)
            .unwrap_or_else(|| terminal_id.trim().to_string());
        let api_key = api::extract_api_key_from_connection_string(raw)
            .unwrap_or_else(|| raw.to_string());
        Self {
            base_url,
            api_key,
            terminal_id,
            branch_id: None,
        }
    }

    pub fn with_branch(mut self, branch_id: &str) -> Self {
        let trimmed = branch_id.trim();
        self.branch_id = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist (or the platform returns a "not found" error).
fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if !pw.trim().is_empty() => Some(pw),
        Ok(_) => None,
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The terminal is configured when admin URL, terminal id and API key are
/// all present in the credential store.
pub fn is_configured() -> bool {
    load_endpoint().is_some()
}

/// Read the stored endpoint, if complete.
pub fn load_endpoint() -> Option<ServerEndpoint> {
    let base_url = get_credential(KEY_ADMIN_URL)?;
    let api_key = get_credential(KEY_API_KEY)?;
    let terminal_id = get_credential(KEY_TERMINAL_ID)?;
    let endpoint = ServerEndpoint::new(&base_url, &api_key, &terminal_id);
    Some(match get_credential(KEY_BRANCH_ID) {
        Some(branch) => endpoint.with_branch(&branch),
        None => endpoint,
    })
}

/// Persist an endpoint received during terminal onboarding.
pub fn store_endpoint(endpoint: &ServerEndpoint) -> Result<(), String> {
    if endpoint.api_key.trim().is_empty() {
        return Err("Missing required field: apiKey".to_string());
    }
    if endpoint.terminal_id.trim().is_empty() {
        return Err("Missing required field: terminalId".to_string());
    }
    set_credential(KEY_ADMIN_URL, &endpoint.base_url)?;
    set_credential(KEY_API_KEY, endpoint.api_key.trim())?;
    set_credential(KEY_TERMINAL_ID, endpoint.terminal_id.trim())?;
    match endpoint.branch_id.as_deref() {
        Some(branch) => set_credential(KEY_BRANCH_ID, branch)?,
        None => delete_credential(KEY_BRANCH_ID)?,
    }
    info!(terminal_id = %endpoint.terminal_id, "terminal endpoint stored");
    Ok(())
}

/// Delete every stored credential (factory reset).
pub fn clear() -> Result<(), String> {
    info!("deleting all terminal credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
