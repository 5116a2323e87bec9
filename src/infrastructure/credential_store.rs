use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Signed-in guardian session handed over by the authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
}

pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<(), InfraError>;
    fn load_session(&self) -> Result<Option<Session>, InfraError>;
    fn delete_session(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringSessionStore {
    service_name: String,
    account_name: String,
}

impl KeyringSessionStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringSessionStore {
    fn default() -> Self {
        Self::new("chorestar.session", "default")
    }
}

impl SessionStore for KeyringSessionStore {
    fn save_session(&self, session: &Session) -> Result<(), InfraError> {
        let payload = serde_json::to_string(session)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        self.entry()?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_session(&self) -> Result<Option<Session>, InfraError> {
        let payload = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        let session = serde_json::from_str::<Session>(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        Ok(Some(session))
    }

    fn delete_session(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl InMemorySessionStore {
    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Option<Session>>, InfraError> {
        self.session
            .lock()
            .map_err(|error| InfraError::StateLock(format!("session store: {error}")))
    }
}

impl SessionStore for InMemorySessionStore {
    fn save_session(&self, session: &Session) -> Result<(), InfraError> {
        *self.guard()? = Some(session.clone());
        Ok(())
    }

    fn load_session(&self) -> Result<Option<Session>, InfraError> {
        Ok(self.guard()?.clone())
    }

    fn delete_session(&self) -> Result<(), InfraError> {
        *self.guard()? = None;
        Ok(())
    }
}
