//! Authentication Module
//!
//! Checks local client credentials against the static user list from the
//! configuration. Lookup is a linear scan in configuration order and the
//! first entry with a matching user name decides the outcome, even when a
//! later entry with the same name would accept the password.

use crate::config::User;
use crate::protocol::ReasonCode;


/// Why a credential check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No user name was presented
    MissingUserName,
    /// No configured user has this name
    UnknownUser,
    /// The user exists but the password differs
    WrongPassword,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::MissingUserName => write!(f, "no user name"),
            AuthFailure::UnknownUser => write!(f, "unknown user"),
            AuthFailure::WrongPassword => write!(f, "wrong password"),
        }
    }
}

/// Ordered, read-only credential list
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: Vec<User>,
}

impl CredentialStore {
    pub fn new(users: &[User]) -> Self {
        Self {
            users: users.to_vec(),
        }
    }

    /// First configured user with this name
    pub fn find(&self, user_name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.user_name == user_name)
    }

    /// Check a user name / password pair
    pub fn check(
        &self,
        user_name: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<&User, AuthFailure> {
        let user_name = user_name.ok_or(AuthFailure::MissingUserName)?;
        let user = self.find(user_name).ok_or(AuthFailure::UnknownUser)?;

        match password {
            Some(password) if password == user.password.expose().as_bytes() => Ok(user),
            _ => Err(AuthFailure::WrongPassword),
        }
    }

    /// Connect reason code for a user name / password pair
    pub fn verify(&self, user_name: Option<&str>, password: Option<&[u8]>) -> ReasonCode {
        match self.check(user_name, password) {
            Ok(_) => ReasonCode::Success,
            Err(_) => ReasonCode::BadUserNameOrPassword,
        }
    }
}
