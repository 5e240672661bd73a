use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

use crate::services::{archive_streamer::ArchiveOptions, path_builder::DedupScope};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub s3: S3Config,
    pub redis: RedisConfig,
    /// `None` disables the per-request deadline.
    pub request_timeout: Option<Duration>,
    pub strict: bool,
    pub dedup_scope: DedupScope,
    pub chunk_size: usize,
}

/// Remote content store settings.
#[derive(Clone)]
pub struct S3Config {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub force_path_style: bool,
}

/// Key-value store settings.
#[derive(Clone)]
pub struct RedisConfig {
    pub url: String,
    pub auth: Option<String>,
    pub max_connections: usize,
    pub wait_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Streams ZIP archives assembled from S3 objects")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket holding the archived objects (overrides AWS_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Redis address (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Per-request deadline in seconds, 0 disables it (overrides ZIPPER_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Abort the archive on the first entry failure
    #[arg(long)]
    pub strict: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge parsed arguments with a variable lookup. CLI values win.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let require = |name: &str| {
            var(name).with_context(|| format!("missing required environment variable {}", name))
        };

        let s3 = S3Config {
            access_key: require("AWS_ACCESS_KEY")?,
            secret_key: require("AWS_SECRET_KEY")?,
            bucket: match args.bucket {
                Some(bucket) => bucket,
                None => require("AWS_BUCKET")?,
            },
            endpoint: var("S3_ENDPOINT"),
            region: var("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            force_path_style: parse_var(&var, "S3_FORCE_PATH_STYLE", false)?,
        };

        let redis = RedisConfig {
            url: match args.redis_url {
                Some(url) => url,
                None => require("REDIS_URL")?,
            },
            auth: var("REDIS_AUTH"),
            max_connections: parse_var(&var, "REDIS_MAX_CONNECTIONS", 10)?,
            wait_timeout: Duration::from_secs(parse_var(&var, "REDIS_WAIT_TIMEOUT_SECS", 5)?),
        };
        if redis.max_connections == 0 {
            bail!("REDIS_MAX_CONNECTIONS must be at least 1");
        }

        let timeout_secs = match args.request_timeout_secs {
            Some(secs) => secs,
            None => parse_var(&var, "ZIPPER_REQUEST_TIMEOUT_SECS", 3600)?,
        };

        let dedup_scope = match var("ZIPPER_DEDUP_SCOPE").as_deref() {
            None | Some("base") => DedupScope::BaseName,
            Some("path") => DedupScope::FullPath,
            Some(other) => bail!("ZIPPER_DEDUP_SCOPE must be `base` or `path`, got `{}`", other),
        };

        let chunk_size = parse_var(&var, "ZIPPER_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        if chunk_size == 0 {
            bail!("ZIPPER_CHUNK_SIZE must be at least 1");
        }

        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => parse_var(&var, "PORT", 8000)?,
            },
            s3,
            redis,
            request_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            strict: args.strict || parse_var(&var, "ZIPPER_STRICT", false)?,
            dedup_scope,
            chunk_size,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            continue_on_entry_error: !self.strict,
            dedup_scope: self.dedup_scope,
            chunk_size: self.chunk_size,
            request_timeout: self.request_timeout,
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}
