// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # x402 Operator Node
//!
//! Entry point for the `x402-node` binary. Parses CLI arguments, loads the
//! configuration, opens the store and either runs the daemon or performs a
//! one-shot operator command.
//!
//! Subcommands:
//!
//! - `run`         start the expiry sweeper and the health/metrics server
//! - `init`        create a data directory, config and vault master key
//! - `stats`       print escrow statistics
//! - `spending`    print the current spend windows
//! - `sweep`       expire overdue escrow locks once
//! - `stranded`    list escrow funding awaiting manual reconciliation
//! - `credentials` store, inspect, delete or audit bank credentials
//! - `version`     print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use zeroize::Zeroizing;

use x402_core::config::{VaultConfig, X402Config};
use x402_core::{BankCredentials, X402Core, X402Db};

use cli::{Commands, CredentialCommands, X402NodeCli};
use metrics::NodeMetrics;

const CONFIG_FILE_NAME: &str = "config.toml";
const MASTER_KEY_FILE_NAME: &str = "master.key";
const DB_DIR_NAME: &str = "db";
const MASTER_KEY_BYTES: usize = 32;
const ROUTING_NUMBER_ENV: &str = "X402_ROUTING_NUMBER";
const ACCOUNT_NUMBER_ENV: &str = "X402_ACCOUNT_NUMBER";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = X402NodeCli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format);

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref(), cli.data_dir.as_deref())?;
            run_node(config, args).await
        }
        Commands::Init(args) => {
            let data_dir = cli
                .data_dir
                .unwrap_or_else(|| PathBuf::from("./x402-data"));
            init_node(&data_dir, args)
        }
        Commands::Stats => {
            let core = open_core(cli.config.as_deref(), cli.data_dir.as_deref())?;
            print_json(&core.escrow().get_stats()?)
        }
        Commands::Spending => {
            let core = open_core(cli.config.as_deref(), cli.data_dir.as_deref())?;
            print_json(&core.authorizer().spending_summary()?)
        }
        Commands::Sweep => {
            let core = open_core(cli.config.as_deref(), cli.data_dir.as_deref())?;
            let expired = core.sweep_expired(chrono::Utc::now())?;
            core.db().flush()?;
            print_json(&serde_json::json!({ "expired": expired }))
        }
        Commands::Stranded => {
            let core = open_core(cli.config.as_deref(), cli.data_dir.as_deref())?;
            print_json(&core.authorizer().stranded_funds()?)
        }
        Commands::Credentials(cmd) => {
            let core = open_core(cli.config.as_deref(), cli.data_dir.as_deref())?;
            run_credentials(&core, cmd)
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Resolve configuration: explicit file, else `config.toml` in the data
/// directory, else defaults. A `--data-dir` always wins over the file's
/// `data_dir` for the database location.
fn load_config(config_path: Option<&Path>, data_dir: Option<&Path>) -> Result<X402Config> {
    let candidate = match (config_path, data_dir) {
        (Some(path), _) => Some(path.to_path_buf()),
        (None, Some(dir)) => {
            let path = dir.join(CONFIG_FILE_NAME);
            path.exists().then_some(path)
        }
        (None, None) => None,
    };

    let mut config = match &candidate {
        Some(path) => X402Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            tracing::warn!("no config file found, using built-in defaults");
            X402Config::default()
        }
    };

    if let Some(dir) = data_dir {
        config.data_dir = dir.join(DB_DIR_NAME);
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(
        config = ?candidate.as_ref().map(|p| p.display().to_string()),
        data_dir = %config.data_dir.display(),
        payer_id = %config.payer_id,
        "configuration loaded"
    );
    Ok(config)
}

fn open_core(config_path: Option<&Path>, data_dir: Option<&Path>) -> Result<X402Core> {
    let config = load_config(config_path, data_dir)?;
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "failed to create database directory: {}",
            config.data_dir.display()
        )
    })?;
    X402Core::open(&config)
        .with_context(|| format!("failed to open x402 core at {}", config.data_dir.display()))
}

/// Runs the daemon until SIGINT/SIGTERM.
async fn run_node(config: X402Config, args: cli::RunArgs) -> Result<()> {
    let sweep_interval = args
        .sweep_interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.escrow.sweep_interval());
    if sweep_interval.is_zero() {
        bail!("sweep interval must be greater than zero");
    }

    tracing::info!(
        metrics_port = args.metrics_port,
        sweep_interval_secs = sweep_interval.as_secs(),
        data_dir = %config.data_dir.display(),
        "starting x402-node"
    );

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "failed to create database directory: {}",
            config.data_dir.display()
        )
    })?;
    let core = Arc::new(
        X402Core::open(&config)
            .with_context(|| format!("failed to open x402 core at {}", config.data_dir.display()))?,
    );

    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        core: Arc::clone(&core),
        metrics: Arc::clone(&node_metrics),
        started_at: chrono::Utc::now(),
    };
    let router = api::create_router(app_state);

    let addr = format!("{}:{}", args.listen_addr, args.metrics_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", addr))?;
    tracing::info!("health and metrics server listening on {}", addr);

    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&core),
        Arc::clone(&node_metrics),
        sweep_interval,
    ));

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    if let Err(e) = core.db().flush() {
        tracing::error!("failed to flush store on shutdown: {}", e);
    }
    served.context("HTTP server error")?;
    tracing::info!("x402-node stopped");
    Ok(())
}

/// Expire overdue locks every `interval` and refresh the gauges. A failed
/// pass is logged and retried on the next tick.
async fn sweep_loop(core: Arc<X402Core>, metrics: Arc<NodeMetrics>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let started = Instant::now();
        let sweep_core = Arc::clone(&core);
        let outcome =
            tokio::task::spawn_blocking(move || sweep_core.sweep_expired(chrono::Utc::now())).await;
        metrics
            .sweep_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        metrics.sweeps_total.inc();

        match outcome {
            Ok(Ok(0)) => tracing::debug!("expiry sweep found nothing to expire"),
            Ok(Ok(n)) => {
                metrics.locks_expired_total.inc_by(n as u64);
                tracing::info!(expired = n, "expiry sweep completed");
            }
            Ok(Err(e)) => {
                metrics.sweep_failures_total.inc();
                tracing::error!("expiry sweep failed: {}", e);
            }
            Err(e) => {
                metrics.sweep_failures_total.inc();
                tracing::error!("expiry sweep task panicked: {}", e);
            }
        }

        match (
            core.escrow().get_stats(),
            core.authorizer().spending_summary(),
        ) {
            (Ok(stats), Ok(spending)) => metrics.update_from(&stats, &spending),
            (Err(e), _) => tracing::warn!("failed to read escrow stats: {}", e),
            (_, Err(e)) => tracing::warn!("failed to read spending summary: {}", e),
        }
    }
}

/// Create the data directory, a default config and a random master key.
/// `--force` still refuses while the vault holds credentials sealed under
/// the current key.
fn init_node(data_dir: &Path, args: cli::InitArgs) -> Result<()> {
    tracing::info!(data_dir = %data_dir.display(), "initializing data directory");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE_NAME);
    let key_path = data_dir.join(MASTER_KEY_FILE_NAME);
    if !args.force {
        for path in [&config_path, &key_path] {
            if path.exists() {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
        }
    }
    let sealed = sealed_credential_count(data_dir, &config_path)?;
    if sealed > 0 {
        bail!(
            "the vault holds {sealed} stored credential set(s) sealed under the current master key; \
             a new key would leave them unreadable. Remove them with `x402-node credentials delete` first"
        );
    }

    let mut secret = Zeroizing::new([0u8; MASTER_KEY_BYTES]);
    rand::rngs::OsRng.fill_bytes(&mut *secret);
    let encoded = Zeroizing::new(hex::encode(&*secret));
    std::fs::write(&key_path, encoded.as_bytes())
        .with_context(|| format!("failed to write master key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict permissions on {}", key_path.display()))?;
    }

    let config = X402Config {
        data_dir: data_dir.join(DB_DIR_NAME),
        payer_id: args.payer_id,
        vault: VaultConfig {
            master_key_file: Some(key_path.clone()),
            ..VaultConfig::default()
        },
        ..X402Config::default()
    };
    config.validate().context("generated config is invalid")?;
    let rendered = config.to_toml_string()?;
    std::fs::write(&config_path, rendered)
        .with_context(|| format!("failed to write config to {}", config_path.display()))?;

    tracing::info!(
        config = %config_path.display(),
        key_path = %key_path.display(),
        "data directory initialized"
    );

    println!("Data directory initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Master key     : {}", key_path.display());
    println!("  Payer          : {}", config.payer_id);
    Ok(())
}

/// Credentials in the database under `data_dir`, and in the one the existing
/// config points at if that differs.
fn sealed_credential_count(data_dir: &Path, config_path: &Path) -> Result<usize> {
    let mut db_dirs = vec![data_dir.join(DB_DIR_NAME)];
    if config_path.exists() {
        match X402Config::load(config_path) {
            Ok(config) if !db_dirs.contains(&config.data_dir) => db_dirs.push(config.data_dir),
            Ok(_) => {}
            Err(e) => tracing::warn!("ignoring unreadable {}: {}", config_path.display(), e),
        }
    }

    let mut sealed = 0;
    for dir in db_dirs.iter().filter(|dir| dir.exists()) {
        let db = X402Db::open(dir).with_context(|| {
            format!(
                "failed to open {} to check for stored credentials (is the node running?)",
                dir.display()
            )
        })?;
        sealed += db.credential_count();
    }
    Ok(sealed)
}

/// A bank number from `env_var`, else one line of `input` after a prompt on
/// stderr. Never taken from argv.
fn read_secret(env_var: &str, label: &str, input: &mut impl BufRead) -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(env_var) {
        let value = Zeroizing::new(value);
        if !value.trim().is_empty() {
            return Ok(Zeroizing::new(value.trim().to_string()));
        }
    }

    eprint!("{label}: ");
    std::io::stderr().flush()?;
    let mut line = Zeroizing::new(String::new());
    input
        .read_line(&mut line)
        .with_context(|| format!("failed to read {label} from stdin"))?;
    let value = line.trim();
    if value.is_empty() {
        bail!("no {label} given; set {env_var} or pass it on stdin");
    }
    Ok(Zeroizing::new(value.to_string()))
}

fn run_credentials(core: &X402Core, cmd: CredentialCommands) -> Result<()> {
    let vault = core.vault();
    match cmd {
        CredentialCommands::Store(args) => {
            let mut input = std::io::stdin().lock();
            let routing = read_secret(ROUTING_NUMBER_ENV, "routing number", &mut input)?;
            let account = read_secret(ACCOUNT_NUMBER_ENV, "account number", &mut input)?;
            let mut creds = BankCredentials::new(routing.as_str(), account.as_str(), args.name);
            if let Some(bank) = args.bank_name {
                creds = creds.with_bank_name(bank);
            }
            let credential_id = vault
                .store_credentials(&args.owner_id, &creds)
                .with_context(|| format!("failed to store credentials for {}", args.owner_id))?;
            core.db().flush()?;
            let info = vault.get_credential_info(&args.owner_id)?;
            print_json(&serde_json::json!({ "credential_id": credential_id, "info": info }))
        }
        CredentialCommands::Info { owner_id } => match vault.get_credential_info(&owner_id)? {
            Some(info) => print_json(&info),
            None => bail!("no credentials stored for {}", owner_id),
        },
        CredentialCommands::Delete { owner_id } => {
            let deleted = vault.delete_credentials(&owner_id)?;
            core.db().flush()?;
            print_json(&serde_json::json!({ "owner_id": owner_id, "deleted": deleted }))
        }
        CredentialCommands::Audit { owner_id } => {
            print_json(&vault.audit_log(owner_id.as_deref())?)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_version() {
    println!("x402-node {}", env!("CARGO_PKG_VERSION"));
    println!("schema    {}", x402_core::storage::db::SCHEMA_VERSION);
    println!("rustc     {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first. If a
/// handler cannot be installed, that branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_config_and_key() {
        let dir = tempfile::tempdir().unwrap();
        init_node(
            dir.path(),
            cli::InitArgs {
                force: false,
                payer_id: "biz_42".into(),
            },
        )
        .unwrap();

        let key = std::fs::read_to_string(dir.path().join(MASTER_KEY_FILE_NAME)).unwrap();
        assert_eq!(key.len(), MASTER_KEY_BYTES * 2);

        let config = load_config(None, Some(dir.path())).unwrap();
        assert_eq!(config.payer_id, "biz_42");
        assert_eq!(config.data_dir, dir.path().join(DB_DIR_NAME));
        assert_eq!(
            config.vault.master_key_file,
            Some(dir.path().join(MASTER_KEY_FILE_NAME))
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(MASTER_KEY_FILE_NAME))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let args = || cli::InitArgs {
            force: false,
            payer_id: "default".into(),
        };
        init_node(dir.path(), args()).unwrap();
        assert!(init_node(dir.path(), args()).is_err());
        init_node(
            dir.path(),
            cli::InitArgs {
                force: true,
                ..args()
            },
        )
        .unwrap();
    }

    #[test]
    fn forced_init_keeps_the_key_while_credentials_are_sealed() {
        use x402_core::crypto::VaultKey;
        use x402_core::MockWallet;

        let dir = tempfile::tempdir().unwrap();
        let args = |force| cli::InitArgs {
            force,
            payer_id: "biz_1".into(),
        };
        init_node(dir.path(), args(false)).unwrap();
        let key_path = dir.path().join(MASTER_KEY_FILE_NAME);
        let original_key = std::fs::read_to_string(&key_path).unwrap();

        {
            let config = load_config(None, Some(dir.path())).unwrap();
            let core = X402Core::from_parts(
                config.clone(),
                X402Db::open(&config.data_dir).unwrap(),
                Arc::new(MockWallet::default()),
                VaultKey::from_bytes([9u8; 32]),
            );
            core.vault()
                .store_credentials(
                    "biz_1",
                    &BankCredentials::new("021000021", "123456789012", "Acme Corp"),
                )
                .unwrap();
            core.db().flush().unwrap();
        }

        let err = init_node(dir.path(), args(true)).unwrap_err();
        assert!(err.to_string().contains("sealed"), "got {err:#}");
        assert_eq!(std::fs::read_to_string(&key_path).unwrap(), original_key);
    }

    #[test]
    fn forced_init_over_an_empty_vault_rotates_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let args = |force| cli::InitArgs {
            force,
            payer_id: "biz_1".into(),
        };
        init_node(dir.path(), args(false)).unwrap();
        let key_path = dir.path().join(MASTER_KEY_FILE_NAME);
        let original_key = std::fs::read_to_string(&key_path).unwrap();
        X402Db::open(dir.path().join(DB_DIR_NAME))
            .unwrap()
            .flush()
            .unwrap();

        init_node(dir.path(), args(true)).unwrap();
        assert_ne!(std::fs::read_to_string(&key_path).unwrap(), original_key);
    }

    #[test]
    fn secrets_prefer_the_environment() {
        std::env::set_var("X402_TEST_ROUTING_FROM_ENV", " 021000021 ");
        let mut input = std::io::Cursor::new(Vec::new());
        let routing =
            read_secret("X402_TEST_ROUTING_FROM_ENV", "routing number", &mut input).unwrap();
        assert_eq!(routing.as_str(), "021000021");
    }

    #[test]
    fn secrets_fall_back_to_stdin_lines() {
        let mut input = std::io::Cursor::new(b"021000021\n123456789012\n".to_vec());
        let routing =
            read_secret("X402_TEST_ROUTING_UNSET", "routing number", &mut input).unwrap();
        let account =
            read_secret("X402_TEST_ACCOUNT_UNSET", "account number", &mut input).unwrap();
        assert_eq!(routing.as_str(), "021000021");
        assert_eq!(account.as_str(), "123456789012");

        let err = read_secret("X402_TEST_ACCOUNT_UNSET", "account number", &mut input).unwrap_err();
        assert!(err.to_string().contains("X402_TEST_ACCOUNT_UNSET"));
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(None, Some(dir.path())).unwrap();
        assert_eq!(config.payer_id, X402Config::default().payer_id);
        assert_eq!(config.data_dir, dir.path().join(DB_DIR_NAME));
    }

    #[test]
    fn explicit_config_must_exist() {
        assert!(load_config(Some(Path::new("/definitely/not/here.toml")), None).is_err());
    }
}
