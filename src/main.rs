use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use privtx::config::{self, Config, CONFIG_FILE_NAME};
use privtx::enclave::{Enclave, LocalEnclave};
use privtx::error::AppError;
use privtx::network::client::{HttpPeerClient, PeerClient};
use privtx::network::party_info::PartyInfoService;
use privtx::network::peer_validator::PeerDiscoveryValidator;
use privtx::network::poller::PartyInfoPoller;
use privtx::network::server::PeerServer;
use privtx::payload::{EncryptedRawTransaction, EncryptedTransaction};
use privtx::privacy::StorePrivacyValidator;
use privtx::publisher::HttpPayloadPublisher;
use privtx::shutdown::ShutdownManager;
use privtx::storage::{open_database, InMemoryStore, RecordStore, SledStore};
use privtx::transaction_manager::TransactionManager;

#[derive(Parser, Debug)]
#[command(name = "privtxd")]
#[command(about = "Private transaction manager daemon", long_about = None)]
struct Args {
    /// Config file (defaults to privtxd.toml in the data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Write the default configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::get_data_dir().join(CONFIG_FILE_NAME));

    if args.generate_config {
        match Config::default().save_to_file(&config_path) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", config_path.display());
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    tracing::info!("🚀 privtxd v{} ({})", version, git_hash);
    tracing::info!("  └─ Config: {}", config_path.display());

    if let Err(e) = run(config).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let password = config.enclave.password();
    let enclave = LocalEnclave::load_or_generate(&config.enclave.key_file, password.as_deref())?
        .with_forwarding_keys(config.enclave.forwarding_keys()?);
    let enclave: Arc<dyn Enclave> = Arc::new(enclave);
    tracing::info!(
        "🔑 Enclave ready with {} keys (default {})",
        enclave.managed_keys().len(),
        enclave.default_public_key()
    );

    let (encrypted_store, raw_store) = open_stores(&config)?;
    let codec = config.storage.codec;

    let party_info = Arc::new(PartyInfoService::new(
        &config.node.url,
        enclave.managed_keys(),
        config.peers.bootstrap.clone(),
    ));
    let client: Arc<dyn PeerClient> = Arc::new(
        HttpPeerClient::new(config.peers.validation_timeout())
            .map_err(|e| AppError::Network(e.to_string()))?,
    );

    let privacy = Arc::new(StorePrivacyValidator::new(encrypted_store.clone()));
    let publisher = Arc::new(HttpPayloadPublisher::new(
        client.clone(),
        party_info.clone(),
        codec,
    ));
    let manager = Arc::new(TransactionManager::new(
        enclave.clone(),
        encrypted_store,
        raw_store,
        privacy,
        publisher,
        codec,
    ));
    let validator = Arc::new(PeerDiscoveryValidator::new(
        enclave,
        client.clone(),
        party_info.clone(),
        codec,
        config.peers.validation_timeout(),
        config.peers.max_concurrent_validations,
    ));

    let mut shutdown = ShutdownManager::default();

    let listener = TcpListener::bind(&config.node.listen_address).await?;
    let server = Arc::new(
        PeerServer::new(manager, party_info.clone(), validator.clone(), codec)
            .with_read_timeout(config.node.read_timeout()),
    );
    let token = shutdown.token();
    shutdown.register_task(tokio::spawn(async move {
        if let Err(e) = server.run(listener, token).await {
            tracing::error!("Peer server failed: {}", e);
        }
    }));

    let poller = Arc::new(PartyInfoPoller::new(
        party_info,
        validator,
        client,
        config.peers.poll_interval(),
    ));
    let token = shutdown.token();
    shutdown.register_task(tokio::spawn(poller.run(token)));

    tracing::info!("✓ Node {} is running", config.node.url);
    shutdown.wait_for_shutdown().await;
    Ok(())
}

type Stores = (
    Arc<dyn RecordStore<EncryptedTransaction>>,
    Arc<dyn RecordStore<EncryptedRawTransaction>>,
);

fn open_stores(config: &Config) -> Result<Stores, AppError> {
    match config.storage.backend.as_str() {
        "memory" => {
            tracing::warn!("⚠️ Using in-memory storage, transactions are lost on restart");
            let encrypted: Arc<dyn RecordStore<EncryptedTransaction>> =
                Arc::new(InMemoryStore::new());
            let raw: Arc<dyn RecordStore<EncryptedRawTransaction>> = Arc::new(InMemoryStore::new());
            Ok((encrypted, raw))
        }
        "sled" => {
            let db = open_database(&config.storage.data_dir)?;
            tracing::info!("✓ Opened database at {}", config.storage.data_dir);
            let encrypted: Arc<dyn RecordStore<EncryptedTransaction>> =
                Arc::new(SledStore::open(&db, "encrypted_transactions")?);
            let raw: Arc<dyn RecordStore<EncryptedRawTransaction>> =
                Arc::new(SledStore::open(&db, "raw_transactions")?);
            Ok((encrypted, raw))
        }
        other => Err(AppError::Config(format!(
            "unknown storage backend '{}'",
            other
        ))),
    }
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // journald already adds timestamp and host
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt().json().with_env_filter(filter).with_thread_ids(false).init();
        }
        _ if is_systemd => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_timer(HostTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
}

/// UTC time plus short hostname: "2025-12-10 18:09:43.150 [node1]"
struct HostTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for HostTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
