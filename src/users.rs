//! In-memory user store.
//!
//! Users live only for the lifetime of the process; there is no persistence.
//! The store is owned by the reactor thread and shared through the server
//! context, so it needs no locking.

use crate::socks5::auth::MAX_CREDENTIAL_LEN;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of users the store holds
pub const MAX_USERS: usize = 10;

/// Privilege of a user. Ordered: `Admin` is above `User`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    User = 0x00,
    Admin = 0x01,
}

impl Privilege {
    /// from_byte converts a wire byte into a privilege level
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Privilege::User),
            0x01 => Some(Privilege::Admin),
            _ => None,
        }
    }
}

/// LookupResult is the outcome of checking a username/password pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Ok(Privilege),
    UnknownUser,
    WrongPassword,
}

impl LookupResult {
    /// grants returns true for a match at or above `min`
    pub fn grants(&self, min: Privilege) -> bool {
        matches!(self, LookupResult::Ok(privilege) if *privilege >= min)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserStoreError {
    #[error("user '{0}' already exists")]
    AlreadyExists(String),

    #[error("user '{0}' does not exist")]
    NotFound(String),

    #[error("user store is full ({MAX_USERS} users)")]
    Full,

    #[error("username and password must be 1 to {MAX_CREDENTIAL_LEN} bytes")]
    InvalidCredentials,
}

/// UserPass holds username/password credentials as given on the
/// command line, in `user:pass` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl FromStr for UserPass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (username, password) = s
            .split_once(':')
            .ok_or_else(|| format!("expected user:pass, got '{s}'"))?;

        if !valid_field(username) || !valid_field(password) {
            return Err(UserStoreError::InvalidCredentials.to_string());
        }

        Ok(UserPass {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// User is a stored account
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    password: String,
    pub privilege: Privilege,
}

/// UserStore maps usernames to accounts
#[derive(Debug, Default)]
pub struct UserStore {
    users: HashMap<String, User>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// add inserts a new user
    pub fn add(
        &mut self,
        username: &str,
        password: &str,
        privilege: Privilege,
    ) -> Result<(), UserStoreError> {
        if !valid_field(username) || !valid_field(password) {
            return Err(UserStoreError::InvalidCredentials);
        }
        if self.users.contains_key(username) {
            return Err(UserStoreError::AlreadyExists(username.to_string()));
        }
        if self.users.len() >= MAX_USERS {
            return Err(UserStoreError::Full);
        }

        self.users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password: password.to_string(),
                privilege,
            },
        );
        Ok(())
    }

    /// remove deletes a user
    pub fn remove(&mut self, username: &str) -> Result<User, UserStoreError> {
        self.users
            .remove(username)
            .ok_or_else(|| UserStoreError::NotFound(username.to_string()))
    }

    /// lookup checks raw credentials as received on the wire
    pub fn lookup(&self, username: &[u8], password: &[u8]) -> LookupResult {
        let Some(user) = std::str::from_utf8(username)
            .ok()
            .and_then(|name| self.users.get(name))
        else {
            return LookupResult::UnknownUser;
        };

        if user.password.as_bytes() == password {
            LookupResult::Ok(user.privilege)
        } else {
            LookupResult::WrongPassword
        }
    }

    /// list returns every user sorted by name
    pub fn list(&self) -> Vec<&User> {
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }
}

fn valid_field(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_CREDENTIAL_LEN
}
