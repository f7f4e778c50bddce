//! Per-account session cookie persistence.
//!
//! One JSON file per account, named by the hashed account key, loaded
//! before navigation and overwritten after every fresh successful login.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chromiumoxide::cdp::browser_protocol::network::{Cookie, CookieParam};
use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::util;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

impl StoredCookie {
    pub fn from_cookie(cookie: &Cookie) -> Self {
        Self {
            name: cookie.name.clone(),
            value: cookie.value.clone(),
            domain: cookie.domain.clone(),
            path: cookie.path.clone(),
            secure: cookie.secure,
            http_only: cookie.http_only,
        }
    }

    pub fn to_param(&self) -> CookieParam {
        let mut param = CookieParam::new(self.name.clone(), self.value.clone());
        param.domain = Some(self.domain.clone());
        param.path = Some(self.path.clone());
        param.secure = Some(self.secure);
        param.http_only = Some(self.http_only);
        param
    }
}

pub struct CookieStore {
    dir: PathBuf,
}

impl CookieStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Load the persisted cookie set for an account. A missing or corrupt
    /// file is just "no session to resume".
    pub fn load(&self, account_id: &str) -> Option<Vec<StoredCookie>> {
        let path = self.path_for(account_id);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(cookies) => Some(cookies),
            Err(e) => {
                warn!("discarding unreadable cookie file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, account_id: &str, cookies: &[StoredCookie]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cookie dir {}", self.dir.display()))?;
        let path = self.path_for(account_id);
        let raw = serde_json::to_string_pretty(cookies)?;
        fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", util::account_key(account_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<StoredCookie> {
        vec![
            StoredCookie {
                name: "rain-session".into(),
                value: "deadbeef".into(),
                domain: ".example.com".into(),
                path: "/".into(),
                secure: true,
                http_only: true,
            },
            StoredCookie {
                name: "lang".into(),
                value: "zh-CN".into(),
                domain: "app.example.com".into(),
                path: "/".into(),
                secure: false,
                http_only: false,
            },
        ]
    }

    #[test]
    fn round_trip_preserves_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf());
        store.save("user@example.com", &sample()).unwrap();
        let loaded = store.load("user@example.com").unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn accounts_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf());
        store.save("alice", &sample()).unwrap();
        assert!(store.load("bob").is_none());
    }

    #[test]
    fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf());
        store.save("alice", &sample()).unwrap();
        let path = dir
            .path()
            .join(format!("{}.json", crate::util::account_key("alice")));
        std::fs::write(path, "{not json").unwrap();
        assert!(store.load("alice").is_none());
    }

    #[test]
    fn param_conversion_keeps_fields() {
        let cookie = &sample()[0];
        let param = cookie.to_param();
        assert_eq!(param.name, "rain-session");
        assert_eq!(param.domain.as_deref(), Some(".example.com"));
        assert_eq!(param.secure, Some(true));
    }
}
