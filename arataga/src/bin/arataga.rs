use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arataga::acl::AclDispatcher;
use arataga::admin::{self, AdminState};
use arataga::config::parse_config;
use arataga::user_list::parse_auth_data;
use utils::logging::{self, LogLevel};

/// arataga forward proxy
#[derive(Parser)]
#[command(version, about)]
struct CliArgs {
    /// listen for incoming admin HTTP connections on ip:port
    #[clap(long, default_value = "127.0.0.1:8088")]
    admin_http: SocketAddr,

    /// value required in the Arataga-Admin-Token header of admin requests
    #[clap(long, env = "ARATAGA_ADMIN_TOKEN")]
    admin_token: String,

    /// directory with local copies of the config and the user-list
    #[clap(long, default_value = ".")]
    local_config_path: PathBuf,

    /// number of I/O contexts; defaults to the CPU count minus two
    #[clap(long)]
    io_threads: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let io_threads = args.io_threads.unwrap_or_else(|| {
        // two cores are left for the admin entry and the timers
        num_cpus::get().saturating_sub(2).max(1)
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(io_threads)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async_main(args, io_threads))
}

async fn async_main(args: CliArgs, io_threads: usize) -> anyhow::Result<()> {
    let log_level = logging::init(LogLevel::Info)?;

    info!(io_threads, "arataga is starting");

    let shutdown = CancellationToken::new();
    let dispatcher = AclDispatcher::new(io_threads, shutdown.child_token());

    // Locally stored config and user-list are applied before the admin
    // entry opens; failures here are tolerated, the core then just waits
    // for an admin push.
    apply_local_files(&args, &dispatcher, &log_level);

    // Failing to own the admin endpoint is fatal: without it the proxy
    // can never be (re)configured.
    let admin_listener = TcpListener::bind(args.admin_http).await.map_err(|error| {
        error!(addr = %args.admin_http, %error, critical = true, "unable to open admin HTTP entry");
        anyhow::anyhow!("unable to open admin HTTP entry on {}: {error}", args.admin_http)
    })?;

    let admin_state = Arc::new(AdminState {
        admin_token: args.admin_token,
        local_config_path: args.local_config_path,
        dispatcher: Arc::clone(&dispatcher),
        log_level,
    });

    tokio::spawn(utils::shutdown::wait_for_signals(shutdown.clone()));

    let served = admin::run_admin_server(admin_listener, admin_state, shutdown.clone()).await;

    dispatcher.shutdown_all();
    info!("arataga finished");

    served
}

fn apply_local_files(
    args: &CliArgs,
    dispatcher: &Arc<AclDispatcher>,
    log_level: &logging::LogLevelHandle,
) {
    let config_path = args.local_config_path.join(admin::LOCAL_CONFIG_FILE);
    match std::fs::read_to_string(&config_path) {
        Ok(content) => match parse_config(&content) {
            Ok(cfg) => {
                if let Err(error) = log_level.set(cfg.log_level) {
                    warn!(%error, "unable to apply log level from local config");
                }
                dispatcher.apply_config(&cfg);
                info!(path = %config_path.display(), "local config applied");
            }
            Err(error) => {
                warn!(path = %config_path.display(), %error, "local config is not usable");
            }
        },
        Err(error) => {
            warn!(path = %config_path.display(), %error, "local config is not readable");
        }
    }

    let user_list_path = args.local_config_path.join(admin::LOCAL_USER_LIST_FILE);
    match std::fs::read_to_string(&user_list_path) {
        Ok(content) => match parse_auth_data(&content) {
            Ok(auth_data) => {
                dispatcher.apply_user_list(&auth_data);
                info!(path = %user_list_path.display(), "local user-list applied");
            }
            Err(error) => {
                warn!(path = %user_list_path.display(), %error, "local user-list is not usable");
            }
        },
        Err(error) => {
            warn!(path = %user_list_path.display(), %error, "local user-list is not readable");
        }
    }
}
