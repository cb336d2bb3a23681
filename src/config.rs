//! Environment-driven configuration
//!
//! Every knob is a CLI flag backed by an environment variable with a
//! default, so containers configure the service purely through the
//! environment.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "threatsieve")]
#[command(about = "Crawl file trees for IOCs, index them, and serve bulk lookups")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API server
    Serve,
    /// Run one crawl-and-process pass over the data directory
    Ingest,
}

#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Root directory to crawl for files
    #[arg(long, env = "DATA_PATH", default_value = "/data")]
    pub data_path: PathBuf,

    #[command(flatten)]
    pub clickhouse: ClickHouseConfig,

    #[command(flatten)]
    pub redis: RedisConfig,

    #[command(flatten)]
    pub blob: BlobConfig,

    #[command(flatten)]
    pub api: ApiConfig,

    #[command(flatten)]
    pub worker: WorkerConfig,

    #[command(flatten)]
    pub log: LogConfig,

    #[command(flatten)]
    pub metrics: MetricsConfig,
}

/// Columnar store (registry + IOC index).
#[derive(Debug, Clone, clap::Args)]
pub struct ClickHouseConfig {
    #[arg(id = "clickhouse_host", long = "clickhouse-host", env = "CLICKHOUSE_HOST", default_value = "localhost")]
    pub host: String,

    /// HTTP interface port
    #[arg(id = "clickhouse_port", long = "clickhouse-port", env = "CLICKHOUSE_PORT", default_value_t = 8123)]
    pub port: u16,

    #[arg(long = "clickhouse-database", env = "CLICKHOUSE_DATABASE", default_value = "threat_intel")]
    pub database: String,

    #[arg(long = "clickhouse-user", env = "CLICKHOUSE_USER", default_value = "default")]
    pub user: String,

    #[arg(id = "clickhouse_password", long = "clickhouse-password", env = "CLICKHOUSE_PASSWORD", default_value = "")]
    pub password: String,
}

/// Membership store (Bloom filter + rate-limit counters).
#[derive(Debug, Clone, clap::Args)]
pub struct RedisConfig {
    #[arg(id = "redis_host", long = "redis-host", env = "REDIS_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(id = "redis_port", long = "redis-port", env = "REDIS_PORT", default_value_t = 6379)]
    pub port: u16,

    #[arg(id = "redis_password", long = "redis-password", env = "REDIS_PASSWORD", default_value = "")]
    pub password: String,

    #[arg(long = "redis-db", env = "REDIS_DB", default_value_t = 0)]
    pub db: i64,

    #[arg(long = "bloom-filter-name", env = "BLOOM_FILTER_NAME", default_value = "ioc_bloom")]
    pub bloom_filter_name: String,

    #[arg(long = "bloom-filter-error-rate", env = "BLOOM_FILTER_ERROR_RATE", default_value_t = 0.001)]
    pub bloom_filter_error_rate: f64,

    #[arg(long = "bloom-filter-capacity", env = "BLOOM_FILTER_CAPACITY", default_value_t = 10_000_000)]
    pub bloom_filter_capacity: i64,
}

/// S3-compatible object store for file bodies.
#[derive(Debug, Clone, clap::Args)]
pub struct BlobConfig {
    /// host:port of the object store, no scheme
    #[arg(long = "minio-endpoint", env = "MINIO_ENDPOINT", default_value = "localhost:9002")]
    pub endpoint: String,

    #[arg(long = "minio-access-key", env = "MINIO_ACCESS_KEY", default_value = "admin")]
    pub access_key: String,

    #[arg(long = "minio-secret-key", env = "MINIO_SECRET_KEY", default_value = "")]
    pub secret_key: String,

    #[arg(long = "minio-bucket", env = "MINIO_BUCKET", default_value = "misc-data")]
    pub bucket: String,

    #[arg(long = "minio-use-ssl", env = "MINIO_USE_SSL", default_value_t = false, action = clap::ArgAction::Set)]
    pub use_ssl: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ApiConfig {
    #[arg(id = "api_host", long = "api-host", env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(id = "api_port", long = "api-port", env = "API_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Static API key; empty accepts any presented key
    #[arg(long = "api-key", env = "API_KEY", default_value = "")]
    pub api_key: String,
}

#[derive(Debug, Clone, clap::Args)]
pub struct WorkerConfig {
    #[arg(long = "worker-count", env = "WORKER_COUNT", default_value_t = 50)]
    pub count: usize,

    #[arg(long = "batch-size", env = "BATCH_SIZE", default_value_t = 1000)]
    pub batch_size: usize,

    /// Extensions eligible for ingestion; an empty list admits every file
    #[arg(
        long = "file-extensions",
        env = "FILE_EXTENSIONS",
        value_delimiter = ',',
        default_value = ".txt,.log,.json,.csv,.xml,.html,.md",
        global = true
    )]
    pub file_extensions: Vec<String>,
}

impl WorkerConfig {
    /// Lowercased extension allow-list for the directory walker.
    pub fn extension_set(&self) -> HashSet<String> {
        self.file_extensions
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct LogConfig {
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub level: String,

    /// "json" or "console"
    #[arg(long = "log-format", env = "LOG_FORMAT", default_value = "json")]
    pub format: String,

    #[arg(long = "log-file", env = "LOG_FILE")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct MetricsConfig {
    #[arg(long = "metrics-enabled", env = "METRICS_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub enabled: bool,

    #[arg(id = "metrics_port", long = "metrics-port", env = "METRICS_PORT", default_value_t = 9090)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::parse_from(["threatsieve", "ingest"]);
        let cfg = cli.config;
        assert_eq!(cfg.data_path, PathBuf::from("/data"));
        assert_eq!(cfg.worker.count, 50);
        assert_eq!(cfg.worker.batch_size, 1000);
        assert_eq!(cfg.redis.bloom_filter_capacity, 10_000_000);
        assert_eq!(cfg.redis.bloom_filter_error_rate, 0.001);
        assert_eq!(cfg.api.port, 8080);
        assert_eq!(cfg.metrics.port, 9090);
        assert!(cfg.metrics.enabled);
    }

    #[test]
    fn extension_list_parses_and_normalizes() {
        let cli = Cli::parse_from([
            "threatsieve",
            "ingest",
            "--file-extensions",
            ".TXT, .log ,.Json",
        ]);
        let set = cli.config.worker.extension_set();
        assert!(set.contains(".txt"));
        assert!(set.contains(".log"));
        assert!(set.contains(".json"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn default_extensions_cover_text_artifacts() {
        let cli = Cli::parse_from(["threatsieve", "serve"]);
        let set = cli.config.worker.extension_set();
        for ext in [".txt", ".log", ".json", ".csv", ".xml", ".html", ".md"] {
            assert!(set.contains(ext), "missing {ext}");
        }
    }
}
