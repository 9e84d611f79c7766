use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DB_PATH: &str = "data/courier.db";
const DEFAULT_AMQP_URL: &str = "amqp://127.0.0.1:5672/%2f";
const DEFAULT_EXCHANGE_NAME: &str = "courier.events";
const DEFAULT_LOG_DIRECTIVES: &str = "info";

#[derive(Debug, Clone)]
pub struct Conf {
    pub listen_addr: SocketAddr,
    pub api_key: String,
    pub admin_key: String,
    pub auth_secret: String,
    pub db_path: Utf8PathBuf,
    pub amqp_url: String,
    pub exchange_name: String,
    pub log_directives: String,
    pub log_file: Option<Utf8PathBuf>,
    pub upstream_mode: UpstreamMode,
    pub worker: WorkerConf,
    pub pool: PoolConf,
    pub pairing_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConf {
    pub task_queue_size: usize,
    pub event_queue_size: usize,
    pub task_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConf {
    pub healthcheck_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_workers_per_tenant: usize,
}

impl PoolConf {
    /// Hard cap on the total number of live workers.
    pub fn global_worker_cap(&self) -> usize {
        self.max_workers_per_tenant * 10
    }
}

/// Which protocol driver backs the sessions. The loopback driver is the only
/// built-in one; production deployments plug a real driver behind
/// [`crate::upstream::ClientConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    Loopback,
}

impl UpstreamMode {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "loopback" => Ok(Self::Loopback),
            other => anyhow::bail!("unknown UPSTREAM_MODE: {other}"),
        }
    }
}

impl Conf {
    pub fn from_env() -> anyhow::Result<Arc<Self>> {
        let conf = Conf {
            listen_addr: parsed_var("LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?,
            api_key: required_var("API_KEY")?,
            admin_key: required_var("ADMIN_KEY")?,
            auth_secret: required_var("AUTH_SECRET")?,
            db_path: Utf8PathBuf::from(string_var("DB_PATH", DEFAULT_DB_PATH)),
            amqp_url: string_var("AMQP_URL", DEFAULT_AMQP_URL),
            exchange_name: string_var("EXCHANGE_NAME", DEFAULT_EXCHANGE_NAME),
            log_directives: string_var("LOG_DIRECTIVES", DEFAULT_LOG_DIRECTIVES),
            log_file: env::var("LOG_FILE").ok().map(Utf8PathBuf::from),
            upstream_mode: UpstreamMode::parse(&string_var("UPSTREAM_MODE", "loopback"))?,
            worker: WorkerConf {
                task_queue_size: parsed_var("WORKER_TASK_QUEUE_SIZE", "100")?,
                event_queue_size: parsed_var("WORKER_EVENT_QUEUE_SIZE", "1000")?,
                task_timeout: Duration::from_secs(parsed_var("WORKER_TIMEOUT_SEC", "30")?),
                idle_timeout: Duration::from_secs(60 * parsed_var::<u64>("WORKER_IDLE_TIMEOUT_MIN", "30")?),
            },
            pool: PoolConf {
                healthcheck_interval: Duration::from_secs(parsed_var("POOL_HEALTHCHECK_SEC", "30")?),
                cleanup_interval: Duration::from_secs(60 * parsed_var::<u64>("POOL_CLEANUP_MIN", "5")?),
                max_workers_per_tenant: parsed_var("POOL_MAX_WORKERS_PER_TENANT", "3")?,
            },
            pairing_timeout: Duration::from_secs(60 * parsed_var::<u64>("PAIRING_TIMEOUT_MIN", "5")?),
        };

        conf.ensure_db_parent_dir()?;

        Ok(Arc::new(conf))
    }

    fn ensure_db_parent_dir(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create database directory {parent}"))?;
            }
        }

        Ok(())
    }
}

fn required_var(key: &str) -> anyhow::Result<String> {
    env::var(key).with_context(|| format!("{key} must be set"))
}

fn string_var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parsed_var<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_owned())
        .parse::<T>()
        .with_context(|| format!("invalid value for {key}"))
}
