mod logging;

use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use logging::LogFormat;
use snapshot_lib::{
    BalanceChecker, GroupSnapshotter, JsonRpcChainClient, MetadataFetcher, ProposalSnapshotter,
};
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::watch;
use tracing::info;
use validator_monitor::api;
use validator_monitor::config::{parse_address_list, MonitorConfig};
use validator_monitor::liveness::LivenessTracker;
use validator_monitor::poll::PollLoop;
use validator_monitor::status::StatusBoard;
use validator_monitor::store::ReconciliationStore;

/// Tracks missed signatures of Celo validators and keeps a relational copy of
/// validator groups and governance proposals.
#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
pub struct Cli {
    /// TOML configuration file. Flags below override its values.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// JSON-RPC endpoint of a Celo node
    #[structopt(long, env = "RPC_URL")]
    rpc_url: Option<String>,

    /// Comma separated signer addresses to report on
    #[structopt(long, env = "SIGNER_ADDRESSES")]
    signer_addresses: Option<String>,

    /// Comma separated validator group addresses to snapshot
    #[structopt(long, env = "GROUP_ADDRESSES")]
    group_addresses: Option<String>,

    /// Comma separated wallets whose combined balance is logged every cycle
    #[structopt(long, env = "WALLET_ADDRESSES")]
    wallet_addresses: Option<String>,

    /// SQLite database url, e.g. `sqlite://monitor.db`
    #[structopt(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// `plain` or `json`
    #[structopt(long, default_value = "plain")]
    log_format: LogFormat,
}

impl Cli {
    fn into_config(self) -> Result<MonitorConfig, Report> {
        let Self {
            config,
            rpc_url,
            signer_addresses,
            group_addresses,
            wallet_addresses,
            database_url,
            log_format: _,
        } = self;

        let mut settings = match config {
            Some(path) => MonitorConfig::load(&path)?,
            None => MonitorConfig::default(),
        };
        if let Some(rpc_url) = rpc_url {
            settings.rpc_url = rpc_url;
        }
        if let Some(signers) = signer_addresses {
            settings.monitored_signers = parse_address_list(&signers)?;
        }
        if let Some(groups) = group_addresses {
            settings.groups = parse_address_list(&groups)?;
        }
        if let Some(wallets) = wallet_addresses {
            settings.balance_wallets = parse_address_list(&wallets)?;
        }
        if let Some(database_url) = database_url {
            settings.database_url = database_url;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let cli = Cli::from_args();
    logging::init(cli.log_format);
    run(cli.into_config()?).await
}

async fn run(config: MonitorConfig) -> Result<(), Report> {
    let store = ReconciliationStore::connect(&config.database_url)
        .await
        .wrap_err_with(|| format!("could not open {}", config.database_url))?;
    let chain = Arc::new(
        JsonRpcChainClient::connect(
            config.rpc_url()?,
            config.registry_address,
            config.rpc_timeout(),
        )
        .await
        .wrap_err("could not resolve core contracts")?,
    );
    let metadata = MetadataFetcher::new(config.metadata_timeout())?;
    let status = Arc::new(StatusBoard::new());

    let poll = PollLoop::new(
        chain.clone(),
        store.clone(),
        LivenessTracker::new(chain.clone(), store.clone(), config.monitored_signers.clone()),
        GroupSnapshotter::new(chain.clone(), metadata),
        ProposalSnapshotter::new(chain.clone(), config.proposal_concurrency),
        BalanceChecker::new(chain, config.balance_wallets.clone()),
        config.groups.clone(),
        config.poll_interval(),
        status.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_task = tokio::spawn(poll.run(shutdown_rx));

    let router = api::router(store, status, config.groups);
    api::serve(router, config.listen_addr, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
    })
    .await?;

    let _ = shutdown_tx.send(true);
    poll_task.await?;
    Ok(())
}
