//! Issuer node binary.
//!
//! Wires storage, keys, chain access and the iden3comm packager together,
//! starts the background publisher and serves the HTTP API until SIGTERM
//! or SIGINT. Startup failures are returned from `main`, never panicked.

use issuer_chain::{
    parse_address, EthClient, EthStateContract, InMemoryStateContract, StateContract,
    Transactor, TreeStoreContract,
};
use issuer_claims::{Cache, ClaimService, MemoryCache, RespCache, SchemaLoader, TtlStore};
use issuer_crypto::prover::NativeProver;
use issuer_crypto::zk::{CircuitId, Groth16Verifier, ProofVerifier};
use issuer_iden3comm::{ChainStateResolver, LocalDidResolver, Packager};
use issuer_identity::IdentityRegistry;
use issuer_kms::{AwsCredentials, AwsKmsProvider, KeyProvider, Kms, LocalProvider, VaultProvider};
use issuer_merkle::IdentityLocks;
use issuer_observe::EventBus;
use issuer_revocation::{HttpRhs, OnChainRhs, RetryPolicy, RhsPublisher, StatusBuilder};
use issuer_server::config::{self, CacheBackend, Config, KeyBackend, KmsConfig};
use issuer_server::{app, background, AppState, BasicAuth};
use issuer_state::{Publisher, PublisherSettings, TransitionEngine};
use std::fmt::Display;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn startup(context: &str, error: impl Display) -> BoxError {
    format!("{context}: {error}").into()
}

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ISSUER_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

/// Opens the provider for one key kind. Both kinds share `local` when
/// they both use the local backend.
async fn key_provider(
    backend: KeyBackend,
    config: &KmsConfig,
    local: &mut Option<Arc<dyn KeyProvider>>,
) -> Result<Arc<dyn KeyProvider>, BoxError> {
    match backend {
        KeyBackend::Local => {
            if let Some(provider) = local {
                return Ok(provider.clone());
            }
            let provider: Arc<dyn KeyProvider> = match config.passphrase.as_deref() {
                Some(passphrase) => Arc::new(
                    LocalProvider::open(&config.local_path, passphrase)
                        .await
                        .map_err(|e| startup("failed to open local key store", e))?,
                ),
                None => {
                    tracing::warn!(
                        "kms.passphrase not set, keys are kept in memory and lost on restart"
                    );
                    Arc::new(LocalProvider::in_memory())
                }
            };
            *local = Some(provider.clone());
            Ok(provider)
        }
        KeyBackend::Vault => {
            let token = config
                .vault_token
                .as_deref()
                .ok_or("kms.vault_token is required for the vault backend")?;
            let provider = VaultProvider::new(&config.vault_addr, &config.vault_mount, token)
                .map_err(|e| startup("failed to configure vault key provider", e))?;
            Ok(Arc::new(provider))
        }
        KeyBackend::Aws => {
            let provider = AwsKmsProvider::new(
                &config.aws_region,
                AwsCredentials {
                    access_key: config.aws_access_key.clone(),
                    secret_key: config.aws_secret_key.clone().into(),
                    session_token: None,
                },
                config.aws_endpoint.as_deref(),
            )
            .map_err(|e| startup("failed to configure aws key provider", e))?;
            Ok(Arc::new(provider))
        }
    }
}

fn schema_cache(config: &Config) -> Result<Arc<dyn Cache>, BoxError> {
    let capacity = NonZeroUsize::new(config.schema_cache.capacity).unwrap_or(NonZeroUsize::MIN);
    match (config.schema_cache.backend, config.schema_cache.url.as_deref()) {
        (CacheBackend::Memory, _) | (_, None) => Ok(Arc::new(MemoryCache::new(capacity))),
        (backend, Some(url)) => {
            tracing::info!(?backend, "using remote schema cache");
            let cache = RespCache::new(
                url,
                Duration::from_secs(config.schema_cache.fetch_timeout_secs),
            )
            .map_err(|e| startup("failed to configure schema cache", e))?;
            Ok(Arc::new(cache))
        }
    }
}

fn status_builder(config: &Config) -> StatusBuilder {
    let mut status = StatusBuilder::new(config.server.public_url.clone())
        .with_default_mode(config.revocation.mode);
    if let Some(url) = &config.revocation.rhs_url {
        status = status.with_rhs_url(url.clone());
    }
    if let Some(contract) = &config.revocation.rhs_contract {
        status = status.with_onchain(config.ethereum.chain_id, contract.clone());
    }
    status
}

fn publisher_settings(config: &Config) -> PublisherSettings {
    let eth = &config.ethereum;
    PublisherSettings {
        publish_interval: Duration::from_secs(eth.publish_interval_secs),
        confirmation_blocks: eth.confirmation_blocks,
        confirmation_timeout: Duration::from_secs(eth.confirmation_timeout_secs),
        wait_receipt_cycle: Duration::from_secs(eth.wait_receipt_cycle_secs),
        rhs_retry: RetryPolicy {
            ignore_errors: config.revocation.ignore_rhs_errors,
            ..RetryPolicy::default()
        },
        ..PublisherSettings::default()
    }
}

fn http_rhs(config: &Config) -> Result<RhsPublisher, BoxError> {
    match &config.revocation.rhs_url {
        Some(url) => {
            let rhs = HttpRhs::new(url.clone(), config.ethereum.rpc_timeout())
                .map_err(|e| startup("failed to configure reverse hash service client", e))?;
            Ok(RhsPublisher::Http(rhs))
        }
        None => Ok(RhsPublisher::Noop),
    }
}

/// The State contract and the RHS publisher. Without an RPC endpoint the
/// node runs against an in-memory contract.
fn chain(config: &Config, kms: &Kms) -> Result<(Arc<dyn StateContract>, RhsPublisher), BoxError> {
    let eth = &config.ethereum;
    let Some(url) = &eth.rpc_url else {
        tracing::warn!("ethereum.rpc_url not set, using an in-memory state contract");
        return Ok((Arc::new(InMemoryStateContract::new()), http_rhs(config)?));
    };

    let rpc = EthClient::new(url.clone(), eth.rpc_timeout())
        .map_err(|e| startup("failed to configure ethereum rpc client", e))?;
    let transactor = Arc::new(Transactor::new(
        Arc::new(rpc),
        kms.clone(),
        eth.chain_id,
        eth.gas.clone(),
    ));
    let state_address = parse_address(&eth.state_contract)
        .map_err(|e| startup("invalid ethereum.state_contract", e))?;
    let contract: Arc<dyn StateContract> =
        Arc::new(EthStateContract::new(transactor.clone(), state_address));

    let rhs = match &config.revocation.rhs_contract {
        Some(address) => {
            let address = parse_address(address)
                .map_err(|e| startup("invalid revocation.rhs_contract", e))?;
            RhsPublisher::OnChain(OnChainRhs::new(Arc::new(TreeStoreContract::new(
                transactor, address,
            ))))
        }
        None => http_rhs(config)?,
    };
    tracing::info!(chain_id = eth.chain_id, "using on-chain state contract");
    Ok((contract, rhs))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .map_err(|e| startup("failed to load configuration", e))?;

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = issuer_db::create_pool(
        &config.database.path,
        issuer_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .map_err(|e| startup("failed to create database pool", e))?;

    {
        let conn = pool
            .get()
            .map_err(|e| startup("failed to get database connection for migrations", e))?;
        let applied = issuer_db::run_migrations(&conn)
            .map_err(|e| startup("failed to run database migrations", e))?;
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Keys
    let mut local = None;
    let bjj = key_provider(config.kms.bjj_provider, &config.kms, &mut local).await?;
    let eth = key_provider(config.kms.eth_provider, &config.kms, &mut local).await?;
    let kms = Kms::new(bjj, eth);

    // Identities and credentials
    let events = EventBus::default();
    let registry = IdentityRegistry::new(pool, kms.clone(), events.clone(), status_builder(&config));
    let mut schemas = SchemaLoader::new(
        schema_cache(&config)?,
        Duration::from_secs(config.schema_cache.ttl_secs),
        Duration::from_secs(config.schema_cache.fetch_timeout_secs),
    )
    .map_err(|e| startup("failed to build schema loader", e))?;
    if let Some(gateway) = &config.schema_cache.ipfs_gateway {
        schemas = schemas.with_ipfs_gateway(gateway.clone());
    }
    let locks = IdentityLocks::new();
    let claims = ClaimService::new(
        registry.clone(),
        Arc::new(schemas),
        locks.clone(),
        TtlStore::new(Duration::from_secs(config.sessions.qr_ttl_secs)),
        config.server.public_url.clone(),
    );

    let prover = NativeProver::new(&config.circuits.path)
        .with_node_bin(&config.circuits.node_bin)
        .with_prover_bin(&config.circuits.prover_bin)
        .with_timeout(Duration::from_secs(config.circuits.proving_timeout_secs));
    let engine = TransitionEngine::new(registry.clone(), locks, Arc::new(prover));

    // Chain access
    let (contract, rhs) = chain(&config, &kms)?;
    let publisher = if config.ethereum.publishing_enabled {
        Publisher::on_chain(
            engine.clone(),
            contract.clone(),
            rhs,
            publisher_settings(&config),
        )
    } else {
        Publisher::Noop
    };

    // iden3comm
    let verifier: Arc<dyn ProofVerifier> =
        match Groth16Verifier::load(Path::new(&config.circuits.path), &[CircuitId::AuthV2]) {
            Ok(verifier) => Arc::new(verifier),
            Err(e) => {
                tracing::warn!(error = %e, "no auth verification key loaded, zkp envelopes will be rejected");
                Arc::new(Groth16Verifier::new())
            }
        };
    let packager = Packager::new(
        registry.clone(),
        Arc::new(LocalDidResolver::new(registry)),
        Arc::new(ChainStateResolver::new(contract.clone())),
        verifier,
    )
    .with_zkp(engine.clone(), contract);

    let state = AppState {
        claims,
        engine,
        publisher: publisher.clone(),
        packager,
        sessions: TtlStore::new(Duration::from_secs(config.sessions.ttl_secs)),
        auth: BasicAuth::new(config.auth.user.clone(), config.auth.password.clone()),
        identity_defaults: config.identity,
        public_url: config.server.public_url.trim_end_matches('/').to_string(),
    };

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher_task = tokio::spawn(publisher.run(events.subscribe(), shutdown_rx.clone()));
    let sweeper_task = tokio::spawn(background::start_sweeper_task(
        Arc::new(state.clone()),
        Duration::from_secs(config.sessions.sweep_interval_secs),
        shutdown_rx,
    ));

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, public_url = %config.server.public_url, "starting issuer node");

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| startup(&format!("failed to bind to {addr}"), e))?;

    // Serve with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = publisher_task.await {
        tracing::error!(error = %e, "state publisher task failed");
    }
    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "ttl sweeper task failed");
    }

    served.map_err(|e| startup("server error", e))?;
    tracing::info!("issuer node shut down");
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
