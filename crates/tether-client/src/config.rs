use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tether_arbiter::ArbiterOptions;
use tether_transport::store::StoreOptions;
use tether_transport::storage::StorageOptions;
use tether_transport::{ChannelOptions, TransportKind};

use crate::client::ClientOptions;
use crate::error::ClientError;
use crate::file_cache::FileCacheOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub channel_name: String,
    /// `native`, `store` or `storage`; probed when unset.
    pub transport: Option<String>,
    pub worker_support: bool,
    pub is_background: bool,
    #[serde(with = "humantime_serde")]
    pub settle_window: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub store_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub storage_dedup_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    pub cache_budget_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub immunity_window: Duration,
    pub store_path: Option<PathBuf>,
    pub blob_store_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Defaults, then the optional file, then `TETHER_*` environment variables.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("channel_name", "tether")?
            .set_default("transport", None::<String>)?
            .set_default("worker_support", true)?
            .set_default("is_background", false)?
            .set_default("settle_window", "300ms")?
            .set_default("poll_interval", "150ms")?
            .set_default("store_ttl", "45s")?
            .set_default("storage_dedup_ttl", "60s")?
            .set_default("close_timeout", "5s")?
            .set_default("cache_budget_bytes", 100_000_000_u64)?
            .set_default("immunity_window", "60s")?
            .set_default("store_path", None::<String>)?
            .set_default("blob_store_path", None::<String>)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("TETHER").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn transport_kind(&self) -> Result<Option<TransportKind>, ClientError> {
        self.transport
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .map(str::parse::<TransportKind>)
            .transpose()
            .map_err(ClientError::from)
    }

    pub fn client_options(&self) -> Result<ClientOptions, ClientError> {
        let channel = ChannelOptions {
            transport: self.transport_kind()?,
            worker_support: self.worker_support,
            store: StoreOptions {
                poll_interval: self.poll_interval,
                ttl: self.store_ttl,
                ..StoreOptions::default()
            },
            storage: StorageOptions {
                dedup_ttl: self.storage_dedup_ttl,
            },
        };
        Ok(ClientOptions {
            arbiter: ArbiterOptions {
                channel_name: self.channel_name.clone(),
                is_background: self.is_background,
                settle_window: self.settle_window,
                channel,
            },
            cache: FileCacheOptions {
                budget_bytes: self.cache_budget_bytes,
                immunity_window: self.immunity_window,
            },
            close_timeout: self.close_timeout,
        })
    }
}
