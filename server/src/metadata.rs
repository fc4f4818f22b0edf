//! Allow-list and identity cache
//!
//! [`Metadata`] owns the server config, `whitelist.json` and
//! `uuid_cache.json`, and implements the two collaborators the connection
//! handler consults after identity verification: [`AccessPolicy`] and
//! [`IdentityCache`].

use crate::auth::VerifiedIdentity;
use crate::config::{read_json, write_json, ServerConfig};
use crate::error::ConfigError;
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

pub const WHITELIST_FILE: &str = "whitelist.json";
pub const UUID_CACHE_FILE: &str = "uuid_cache.json";

/// On-disk shapes of `uuid_cache.json`. The cache is written as an array of
/// `[name, uuid]` pairs; a plain `{name: uuid}` object is read as well.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UuidCacheFile {
    Pairs(Vec<(String, String)>),
    Map(BTreeMap<String, String>),
}

impl From<UuidCacheFile> for BTreeMap<String, String> {
    fn from(file: UuidCacheFile) -> Self {
        match file {
            UuidCacheFile::Pairs(pairs) => pairs.into_iter().collect(),
            UuidCacheFile::Map(map) => map,
        }
    }
}

/// Who may use the server
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn is_allowed(&self, identity: &VerifiedIdentity) -> bool;

    /// Game address clients must report in their handshake
    async fn expected_game_address(&self) -> String;
}

/// Best-effort record of display name to uuid, for operator tooling
#[async_trait]
pub trait IdentityCache: Send + Sync {
    async fn remember(&self, identity: &VerifiedIdentity);
}

/// Config, allow-list and identity cache backed by the data directory
#[derive(Debug)]
pub struct Metadata {
    data_dir: PathBuf,
    config: ServerConfig,
    whitelist: RwLock<BTreeSet<String>>,
    uuid_cache: RwLock<BTreeMap<String, String>>,
}

impl Metadata {
    /// Loads everything from `data_dir`, creating the directory and any
    /// missing files
    pub async fn load(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| ConfigError::Io {
                path: data_dir.display().to_string(),
                source,
            })?;

        let config = ServerConfig::load_or_create(&data_dir).await?;
        let metadata = Self {
            config,
            whitelist: RwLock::new(BTreeSet::new()),
            uuid_cache: RwLock::new(BTreeMap::new()),
            data_dir,
        };

        metadata.whitelist_load().await?;

        let cache_path = metadata.data_dir.join(UUID_CACHE_FILE);
        match read_json::<UuidCacheFile>(&cache_path).await? {
            Some(cache) => *metadata.uuid_cache.write().await = cache.into(),
            None => metadata.uuid_cache_save().await?,
        }

        if !metadata.config.whitelist {
            warn!("Whitelist is disabled; any verified player may connect");
        }

        Ok(metadata)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Re-reads `whitelist.json`, creating an empty one if missing.
    /// Returns the number of entries.
    pub async fn whitelist_load(&self) -> Result<usize, ConfigError> {
        let path = self.data_dir.join(WHITELIST_FILE);
        let entries = match read_json::<Vec<String>>(&path).await? {
            Some(entries) => entries,
            None => {
                write_json(&path, &Vec::<String>::new()).await?;
                Vec::new()
            }
        };

        let mut whitelist = self.whitelist.write().await;
        *whitelist = entries.into_iter().collect();
        info!("Loaded {} whitelist entries", whitelist.len());
        Ok(whitelist.len())
    }

    pub async fn whitelist_save(&self) -> Result<(), ConfigError> {
        let entries: Vec<String> = self.whitelist.read().await.iter().cloned().collect();
        write_json(&self.data_dir.join(WHITELIST_FILE), &entries).await
    }

    /// Adds a uuid; returns false if it was already listed
    pub async fn whitelist_add(&self, uuid: &str) -> bool {
        self.whitelist.write().await.insert(uuid.to_string())
    }

    /// Removes a uuid; returns false if it was not listed
    pub async fn whitelist_remove(&self, uuid: &str) -> bool {
        self.whitelist.write().await.remove(uuid)
    }

    pub async fn whitelist_contains(&self, uuid: &str) -> bool {
        self.whitelist.read().await.contains(uuid)
    }

    pub async fn whitelist_entries(&self) -> Vec<String> {
        self.whitelist.read().await.iter().cloned().collect()
    }

    /// Looks up the uuid last seen for a display name
    pub async fn lookup_uuid(&self, name: &str) -> Option<String> {
        self.uuid_cache.read().await.get(name).cloned()
    }

    /// Caches a display name and saves the cache file
    pub async fn cache_uuid(&self, name: &str, uuid: &str) -> Result<(), ConfigError> {
        self.uuid_cache
            .write()
            .await
            .insert(name.to_string(), uuid.to_string());
        self.uuid_cache_save().await
    }

    async fn uuid_cache_save(&self) -> Result<(), ConfigError> {
        let pairs: Vec<(String, String)> = self
            .uuid_cache
            .read()
            .await
            .iter()
            .map(|(name, uuid)| (name.clone(), uuid.clone()))
            .collect();
        write_json(&self.data_dir.join(UUID_CACHE_FILE), &pairs).await
    }
}

#[async_trait]
impl AccessPolicy for Metadata {
    async fn is_allowed(&self, identity: &VerifiedIdentity) -> bool {
        !self.config.whitelist || self.whitelist_contains(&identity.uuid).await
    }

    async fn expected_game_address(&self) -> String {
        self.config.game_address.clone()
    }
}

#[async_trait]
impl IdentityCache for Metadata {
    async fn remember(&self, identity: &VerifiedIdentity) {
        if let Err(e) = self.cache_uuid(&identity.name, &identity.uuid).await {
            warn!("Failed to save uuid cache: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, uuid: &str) -> VerifiedIdentity {
        VerifiedIdentity {
            uuid: uuid.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_load_creates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("mapsync");

        let metadata = Metadata::load(&data_dir).await.unwrap();
        assert!(metadata.config().whitelist);
        assert!(data_dir.join("config.json").exists());
        assert!(data_dir.join(WHITELIST_FILE).exists());
        assert!(data_dir.join(UUID_CACHE_FILE).exists());
        assert!(metadata.whitelist_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_whitelist_enforced_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Metadata::load(dir.path()).await.unwrap();
        let alice = identity("alice", "aaaa");

        assert!(!metadata.is_allowed(&alice).await);
        assert!(metadata.whitelist_add("aaaa").await);
        assert!(!metadata.whitelist_add("aaaa").await);
        assert!(metadata.is_allowed(&alice).await);
        assert!(metadata.whitelist_remove("aaaa").await);
        assert!(!metadata.is_allowed(&alice).await);
    }

    #[tokio::test]
    async fn test_disabled_whitelist_allows_everyone() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("config.json"), r#"{"whitelist": false}"#)
            .await
            .unwrap();

        let metadata = Metadata::load(dir.path()).await.unwrap();
        assert!(metadata.is_allowed(&identity("anyone", "ffff")).await);
        assert_eq!(metadata.expected_game_address().await, "localhost:25565");
    }

    #[tokio::test]
    async fn test_whitelist_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Metadata::load(dir.path()).await.unwrap();

        metadata.whitelist_add("bbbb").await;
        metadata.whitelist_add("aaaa").await;
        metadata.whitelist_save().await.unwrap();

        let saved = tokio::fs::read_to_string(dir.path().join(WHITELIST_FILE))
            .await
            .unwrap();
        let saved: Vec<String> = serde_json::from_str(&saved).unwrap();
        assert_eq!(saved, vec!["aaaa", "bbbb"]);

        // unsaved changes are discarded by a reload
        metadata.whitelist_add("cccc").await;
        assert_eq!(metadata.whitelist_load().await.unwrap(), 2);
        assert!(!metadata.whitelist_contains("cccc").await);
    }

    #[tokio::test]
    async fn test_remember_persists_uuid_cache() {
        let dir = tempfile::tempdir().unwrap();
        {
            let metadata = Metadata::load(dir.path()).await.unwrap();
            metadata.remember(&identity("Gjum", "1234")).await;
            assert_eq!(metadata.lookup_uuid("Gjum").await, Some("1234".to_string()));
        }

        let reloaded = Metadata::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.lookup_uuid("Gjum").await, Some("1234".to_string()));
        assert_eq!(reloaded.lookup_uuid("gjum").await, None);

        let saved = tokio::fs::read_to_string(dir.path().join(UUID_CACHE_FILE))
            .await
            .unwrap();
        let saved: Vec<(String, String)> = serde_json::from_str(&saved).unwrap();
        assert_eq!(saved, vec![("Gjum".to_string(), "1234".to_string())]);
    }

    #[tokio::test]
    async fn test_uuid_cache_reads_pairs_and_objects() {
        let pairs = tempfile::tempdir().unwrap();
        tokio::fs::write(
            pairs.path().join(UUID_CACHE_FILE),
            r#"[["Gjum","abcd"],["Alice","ef01"]]"#,
        )
        .await
        .unwrap();
        let metadata = Metadata::load(pairs.path()).await.unwrap();
        assert_eq!(metadata.lookup_uuid("Gjum").await, Some("abcd".to_string()));
        assert_eq!(metadata.lookup_uuid("Alice").await, Some("ef01".to_string()));

        let object = tempfile::tempdir().unwrap();
        tokio::fs::write(object.path().join(UUID_CACHE_FILE), r#"{"Gjum":"abcd"}"#)
            .await
            .unwrap();
        let metadata = Metadata::load(object.path()).await.unwrap();
        assert_eq!(metadata.lookup_uuid("Gjum").await, Some("abcd".to_string()));
    }
}
