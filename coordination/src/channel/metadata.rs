//! Build-agent metadata store.
//!
//! Uses the CI agent's `meta-data` subcommands as the shared substrate. The
//! metadata API has no delete, so a consumed key is acknowledged by writing
//! `<key>.consumed`; acknowledged keys read as absent from then on.

use async_trait::async_trait;
use tokio::process::Command;

use super::store::{ExchangeStore, StoreError};

/// `meta-data exists` exit status for a key that has never been set.
const EXIT_KEY_MISSING: i32 = 100;

const ACK_SUFFIX: &str = ".consumed";

/// Store backed by `buildkite-agent meta-data`.
#[derive(Debug, Clone)]
pub struct AgentMetadataStore {
    bin: String,
}

impl AgentMetadataStore {
    pub fn new() -> Self {
        Self::with_binary("buildkite-agent")
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, key: &str, args: &[&str]) -> Result<std::process::Output, StoreError> {
        Command::new(&self.bin)
            .arg("meta-data")
            .args(args)
            .output()
            .await
            .map_err(|e| StoreError::Io {
                key: key.to_string(),
                source: e,
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let output = self.run(key, &["exists", key]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(EXIT_KEY_MISSING) => Ok(false),
            _ => Err(StoreError::CommandFailed {
                key: key.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn fetch(&self, key: &str) -> Result<String, StoreError> {
        let output = self.run(key, &["get", key]).await?;
        if !output.status.success() {
            return Err(StoreError::CommandFailed {
                key: key.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn acknowledged(&self, key: &str) -> Result<bool, StoreError> {
        self.exists(&format!("{key}{ACK_SUFFIX}")).await
    }
}

impl Default for AgentMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeStore for AgentMetadataStore {
    fn describe(&self) -> String {
        format!("{} meta-data", self.bin)
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let output = self.run(key, &["set", key, value]).await?;
        if !output.status.success() {
            return Err(StoreError::CommandFailed {
                key: key.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        if !self.exists(key).await? || self.acknowledged(key).await? {
            return Ok(None);
        }
        self.fetch(key).await.map(Some)
    }

    // Not atomic across agents: two readers racing on the same key can both
    // observe it before either acknowledgment lands. Keys are exchange-unique,
    // so a second reader for one key is already a caller bug.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(value) = self.read(key).await? else {
            return Ok(None);
        };
        self.write(&format!("{key}{ACK_SUFFIX}"), "1").await?;
        Ok(Some(value))
    }
}
