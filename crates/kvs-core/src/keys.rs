//! Store key derivation.
//!
//! Every key is namespaced under `application:{app}:`. Application names
//! may not contain `:`, so a key's application segment always parses back
//! uniquely and distinct `(app, id)` pairs never share a key.

use crate::error::{Error, Result};

/// Key namespace for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    application: String,
}

impl KeySpace {
    pub fn new(application: impl Into<String>) -> Result<Self> {
        let application = application.into();
        if application.is_empty() {
            return Err(Error::Config("application name must not be empty".into()));
        }
        if application.contains(':') {
            return Err(Error::Config(format!(
                "application name {application:?} must not contain ':'"
            )));
        }
        Ok(Self { application })
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// `application:{app}:session:{id}`
    pub fn session(&self, id: &str) -> String {
        format!("application:{}:session:{id}", self.application)
    }

    // ── Collaborator keys (membership, roles) ──

    /// `application:{app}:user:{username}`, username lower-cased.
    pub fn user(&self, username: &str) -> String {
        format!("application:{}:user:{}", self.application, username.to_lowercase())
    }

    pub fn users(&self) -> String {
        format!("application:{}:users", self.application)
    }

    pub fn user_count(&self) -> String {
        format!("application:{}:usercount", self.application)
    }

    pub fn users_online(&self) -> String {
        format!("application:{}:useronline", self.application)
    }

    pub fn roles(&self) -> String {
        format!("application:{}:roles", self.application)
    }

    pub fn role_users(&self, role: &str) -> String {
        format!("application:{}:role:{role}:users", self.application)
    }

    pub fn user_roles(&self, username: &str) -> String {
        format!("application:{}:user:{username}:roles", self.application)
    }
}
