use clap::Parser;
use records_hub_core::storage::StoreConfig;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Medical records organizer server
#[derive(Parser, Debug, Clone)]
#[command(name = "records-hub")]
#[command(about = "Multi-tenant medical document store with sharing and audit history")]
pub struct Config {
    /// Listen address
    #[arg(long, env = "RECORDS_HUB_ADDR", default_value = "127.0.0.1:3000")]
    pub addr: SocketAddr,

    /// Directory for item, grant and history records. Omit to keep
    /// everything in memory.
    #[arg(long, env = "RECORDS_HUB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory for uploaded file contents. Defaults to `<data-dir>/blobs`.
    #[arg(long, env = "RECORDS_HUB_BLOB_DIR")]
    pub blob_dir: Option<PathBuf>,

    /// HS256 secret for bearer tokens
    #[arg(long, env = "RECORDS_HUB_JWT_SECRET", default_value = "secret", hide_env_values = true)]
    pub jwt_secret: String,
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        match &self.data_dir {
            Some(dir) => StoreConfig::persistent(dir),
            None => StoreConfig::in_memory(),
        }
    }

    /// Where blobs go, if anywhere on disk.
    pub fn blob_dir(&self) -> Option<PathBuf> {
        self.blob_dir
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|d| d.join("blobs")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_dir_defaults_under_data_dir() {
        let config = Config::parse_from(["records-hub", "--data-dir", "/var/lib/records"]);
        assert_eq!(config.blob_dir(), Some(PathBuf::from("/var/lib/records/blobs")));
        assert!(config.store_config().data_dir().is_some());

        let config = Config::parse_from(["records-hub", "--addr", "0.0.0.0:8080"]);
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.blob_dir(), None);
        assert!(config.store_config().data_dir().is_none());
    }
}
