use anyhow::Context as _;
use courier_gateway::config::Conf;
use courier_gateway::{log, service};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let conf = Conf::from_env().context("failed to load configuration")?;

    let _logger_guard =
        log::init(&conf.log_directives, conf.log_file.as_deref()).context("failed to set up logging")?;

    info!(
        service = service::SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        "Starting"
    );

    service::run(conf).await
}
