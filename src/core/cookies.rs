//! First-party cookie surface.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use super::storage::StorageError;

/// A cookie write, rendered the way `document.cookie` expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub expires: DateTime<Utc>,
    pub path: String,
    pub same_site: Option<String>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires,
            path: "/".to_string(),
            same_site: Some("Lax".to_string()),
        }
    }

    /// Cookie that deletes `name` when written.
    pub fn expired(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            expires: DateTime::<Utc>::UNIX_EPOCH,
            path: "/".to_string(),
            same_site: Some("Lax".to_string()),
        }
    }

    pub fn to_cookie_string(&self) -> String {
        let mut out = format!(
            "{}={}; expires={}; path={}",
            self.name,
            self.value,
            self.expires.format("%a, %d %b %Y %H:%M:%S GMT"),
            self.path
        );
        if let Some(ref same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site);
        }
        out
    }
}

pub trait CookieJar: Send + Sync {
    /// Raw (still encoded) value of `name`, if present and unexpired.
    fn read(&self, name: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, cookie: &SetCookie) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct StoredCookie {
    value: String,
    expires: Option<DateTime<Utc>>,
}

/// In-memory jar that honours expiry.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<HashMap<String, StoredCookie>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the jar from a `document.cookie` style header (`a=1; b=2`).
    /// Seeded cookies never expire.
    pub fn from_cookie_header(header: &str) -> Self {
        let jar = Self::new();
        {
            let mut guard = jar.cookies.lock().unwrap_or_else(PoisonError::into_inner);
            for pair in header.split(';') {
                let Some((name, value)) = pair.trim().split_once('=') else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                guard.insert(
                    name.to_string(),
                    StoredCookie {
                        value: value.to_string(),
                        expires: None,
                    },
                );
            }
        }
        jar
    }

    /// Current cookies as a `document.cookie` style header.
    pub fn cookie_header(&self) -> String {
        let now = Utc::now();
        let guard = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pairs: Vec<_> = guard
            .iter()
            .filter(|(_, cookie)| cookie.expires.is_none_or(|at| at > now))
            .map(|(name, cookie)| format!("{}={}", name, cookie.value))
            .collect();
        pairs.sort();
        pairs.join("; ")
    }

    /// Expiry recorded for `name`, if any.
    pub fn expires_at(&self, name: &str) -> Option<DateTime<Utc>> {
        let guard = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(name).and_then(|cookie| cookie.expires)
    }
}

impl CookieJar for MemoryCookieJar {
    fn read(&self, name: &str) -> Result<Option<String>, StorageError> {
        let now = Utc::now();
        let guard = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .get(name)
            .filter(|cookie| cookie.expires.is_none_or(|at| at > now))
            .map(|cookie| cookie.value.clone()))
    }

    fn write(&self, cookie: &SetCookie) -> Result<(), StorageError> {
        let mut guard = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        if cookie.expires <= Utc::now() {
            guard.remove(&cookie.name);
        } else {
            guard.insert(
                cookie.name.clone(),
                StoredCookie {
                    value: cookie.value.clone(),
                    expires: Some(cookie.expires),
                },
            );
        }
        Ok(())
    }
}
