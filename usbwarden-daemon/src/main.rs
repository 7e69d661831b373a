use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing_subscriber::EnvFilter;

use usbwarden_auth::{recovery, CredentialStore, CredentialVerifier, Totp};
use usbwarden_core::DefaultPolicy;
use usbwarden_daemon::audit_log::AuditLog;
use usbwarden_daemon::config::ConfigStore;
use usbwarden_daemon::coordinator::Coordinator;
use usbwarden_daemon::ipc;
use usbwarden_daemon::monitor::UsbMonitor;
use usbwarden_daemon::port::{DevicePort, SysfsPort};
use usbwarden_daemon::whitelist::Whitelist;

const AUDIT_RETENTION_DAYS: i64 = 90;

#[derive(Parser)]
#[command(name = "usbwardend", about = "USB device authorization daemon", version)]
struct Cli {
    /// Directory for databases, config and the control socket
    #[arg(long, env = "USBWARDEN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (the default when no subcommand is given)
    Serve,
    /// Enroll a TOTP secret and print a fresh batch of recovery codes
    Setup {
        /// Replace an existing enrollment
        #[arg(long)]
        force: bool,
        /// How many recovery codes to generate
        #[arg(long, default_value_t = 10)]
        codes: usize,
        /// Issuer label shown in the authenticator app
        #[arg(long, default_value = "usbwarden")]
        issuer: String,
    },
    /// Replace the recovery code batch, keeping the enrolled secret
    RegenerateRecovery {
        /// How many recovery codes to generate
        #[arg(long, default_value_t = 10)]
        codes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state_dir = cli.state_dir.unwrap_or_else(default_state_dir);
    std::fs::create_dir_all(&state_dir)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(state_dir).await,
        Commands::Setup {
            force,
            codes,
            issuer,
        } => setup(&state_dir, force, codes, &issuer).await,
        Commands::RegenerateRecovery { codes } => regenerate_recovery(&state_dir, codes).await,
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("usbwarden")
}

async fn open_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);
    // Single writer; the coordinator serializes access anyway.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

async fn serve(state_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err("usbwardend must run as root to manage sysfs authorization".into());
    }

    let config = ConfigStore::load(state_dir.join("config.json"))?;

    let auth_pool = open_pool(&state_dir.join("auth.db")).await?;
    let store = CredentialStore::open(auth_pool).await?;
    let verifier = CredentialVerifier::load(store).await?;
    if verifier.is_none() {
        tracing::warn!(
            "no credential enrolled, run `usbwardend setup`; new devices will be allowed"
        );
    }

    let daemon_pool = open_pool(&state_dir.join("daemon.db")).await?;
    let audit = AuditLog::open(daemon_pool.clone()).await?;
    let whitelist = Whitelist::open(daemon_pool).await?;
    match audit.cleanup_older_than(AUDIT_RETENTION_DAYS).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "aged out old audit events"),
        Err(err) => tracing::warn!(%err, "audit cleanup failed"),
    }

    let port: Arc<dyn DevicePort> = Arc::new(SysfsPort::new());
    let protecting = config.enabled() && verifier.is_some();
    let (coordinator, handle) = Coordinator::new(
        Arc::clone(&port),
        verifier,
        audit,
        whitelist,
        config,
    );
    let coordinator_task = tokio::spawn(coordinator.run());

    port.set_default_policy(if protecting {
        DefaultPolicy::Block
    } else {
        DefaultPolicy::Allow
    });

    let monitor_task = tokio::spawn(UsbMonitor::new(handle.clone()).run());

    let socket_path = state_dir.join("usbwardend.sock");
    let listener = ipc::bind_socket(&socket_path)?;
    let ipc_task = tokio::spawn(ipc::serve(listener, handle.clone()));

    tracing::info!(
        protecting,
        state_dir = %state_dir.display(),
        socket = %socket_path.display(),
        "usbwardend started"
    );

    wait_for_shutdown().await?;
    tracing::info!("shutdown signal received");

    monitor_task.abort();
    ipc_task.abort();
    handle.shutdown().await;
    let _ = coordinator_task.await;

    // Never leave the machine refusing keyboards after the daemon exits.
    port.set_default_policy(DefaultPolicy::Allow);
    let _ = std::fs::remove_file(&socket_path);

    tracing::info!("usbwardend stopped");
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

async fn setup(
    state_dir: &Path,
    force: bool,
    codes: usize,
    issuer: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = open_pool(&state_dir.join("auth.db")).await?;
    let store = CredentialStore::open(pool).await?;
    if store.is_configured().await? && !force {
        return Err("a credential is already enrolled; pass --force to replace it".into());
    }

    let secret = usbwarden_auth::generate_secret();
    let codes = recovery::generate_codes(codes);
    let hashes: Vec<String> = codes.iter().map(|c| recovery::hash_code(c)).collect();
    store.save(&secret, &hashes).await?;

    let totp = Totp::from_secret(&secret)?;
    println!("TOTP secret: {secret}");
    println!("Provisioning URI: {}", totp.provisioning_uri("root", issuer));
    println!();
    println!("Recovery codes (shown once, keep them offline):");
    for code in &codes {
        println!("  {code}");
    }
    Ok(())
}

async fn regenerate_recovery(
    state_dir: &Path,
    codes: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = open_pool(&state_dir.join("auth.db")).await?;
    let store = CredentialStore::open(pool).await?;

    let codes = recovery::generate_codes(codes);
    let hashes: Vec<String> = codes.iter().map(|c| recovery::hash_code(c)).collect();
    store.replace_recovery_codes(&hashes).await?;

    println!("New recovery codes (the old batch is void):");
    for code in &codes {
        println!("  {code}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn state_dir_flag_parses() {
        let cli = Cli::try_parse_from(["usbwardend", "--state-dir", "/tmp/uw", "serve"]).unwrap();
        assert_eq!(cli.state_dir.as_deref(), Some(Path::new("/tmp/uw")));
        assert!(matches!(cli.command, Some(Commands::Serve)));
    }

    #[test]
    fn state_dir_reads_environment() {
        let command = Cli::command();
        let arg = command
            .get_arguments()
            .find(|a| a.get_id() == "state_dir")
            .unwrap();
        assert_eq!(
            arg.get_env(),
            Some(std::ffi::OsStr::new("USBWARDEN_STATE_DIR"))
        );
    }

    #[test]
    fn setup_defaults() {
        let cli = Cli::try_parse_from(["usbwardend", "setup"]).unwrap();
        match cli.command {
            Some(Commands::Setup {
                force,
                codes,
                issuer,
            }) => {
                assert!(!force);
                assert_eq!(codes, 10);
                assert_eq!(issuer, "usbwarden");
            }
            other => panic!("unexpected command parse: {}", other.is_some()),
        }
    }
}
