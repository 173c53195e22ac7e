use std::{path::Path, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portcullis::{
    adapters::{
        AcmeAuthority, FileCertificateStore, FileConfigProvider, Forwarder,
        HttpHandler, PlaintextState, TerminatorTimeouts, TlsServer, TlsTerminator,
        plaintext_router, tls_terminator::install_crypto_provider,
    },
    config::{ServerConfigValidator, autosave, loader::load_config, models::ServerConfig},
    core::{CertificateManager, ChallengeManager, ManagerSettings, RenewalScheduler, SiteRouter},
    metrics,
    ports::{
        certificate_authority::CertificateAuthority, certificate_store::CertificateStore,
        config_provider::ConfigProvider,
    },
    tracing_setup,
    utils::{ConnectionTracker, GracefulShutdown, ShutdownReason},
};
use tokio::net::TcpListener;

const DEFAULT_CONFIG: &str = "portcullis.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = DEFAULT_CONFIG)]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Run the proxy (default)
    Serve {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// List stored certificates and their expiry
    Certs {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Delete the stored ACME account for the configured directory
    ResetAccount {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
        /// Confirm the deletion
        #[clap(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Certs { config }) => certs_command(&config).await,
        Some(Commands::ResetAccount { config, yes }) => reset_account_command(&config, yes).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

/// Read every manual site's PEM files and install them as active records.
/// Returns how many sites failed.
async fn install_manual_certificates(manager: &CertificateManager, config: &ServerConfig) -> usize {
    let mut failures = 0;
    for site in &config.sites {
        let portcullis::config::SiteTls::Manual {
            cert_path,
            key_path,
        } = &site.tls
        else {
            continue;
        };

        let pems = tokio::try_join!(
            tokio::fs::read_to_string(cert_path),
            tokio::fs::read_to_string(key_path)
        );
        let result = match pems {
            Ok((chain, key)) => manager
                .install_manual(&site.hostname, chain, key)
                .await
                .map_err(|e| eyre!(e)),
            Err(e) => Err(eyre!(e)),
        };

        match result {
            Ok(record) => tracing::info!(
                hostname = %site.hostname,
                not_after = %record.not_after,
                "Installed manual certificate"
            ),
            Err(e) => {
                failures += 1;
                tracing::error!(
                    hostname = %site.hostname,
                    cert_path = %cert_path,
                    error = %e,
                    "Failed to install manual certificate, site will not be served"
                );
            }
        }
    }
    failures
}

fn build_authority(
    config: &ServerConfig,
    store: Arc<dyn CertificateStore>,
    challenges: ChallengeManager,
) -> Arc<dyn CertificateAuthority> {
    let authority = AcmeAuthority::from_config(&config.acme, store, challenges);
    tracing::info!(
        directory = %authority.directory_url(),
        acme_sites = config.uses_acme(),
        "ACME issuance available"
    );
    Arc::new(authority)
}

/// Log settings that only take effect after a restart.
fn log_restart_only_changes(old: &ServerConfig, new: &ServerConfig) {
    let changed = [
        ("http_addr", old.http_addr != new.http_addr),
        ("https_addr", old.https_addr != new.https_addr),
        ("storage", old.storage != new.storage),
        ("acme", old.acme != new.acme),
        ("timeouts", old.timeouts != new.timeouts),
        ("upstream", old.upstream != new.upstream),
        ("logging", old.logging != new.logging),
    ];
    for (section, _) in changed.iter().filter(|(_, differs)| *differs) {
        tracing::warn!(section = %section, "Configuration change requires a restart to apply");
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    tracing_setup::init_tracing_with_config(&config.logging.level, config.logging.json)
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;
    install_crypto_provider();
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {e}"))?;

    tracing::info!(config = %config_path, sites = config.sites.len(), "Starting Portcullis");

    let store: Arc<dyn CertificateStore> = Arc::new(
        FileCertificateStore::open(&config.storage.data_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to open certificate store at {}",
                    config.storage.data_dir.display()
                )
            })?,
    );
    let challenges = ChallengeManager::new();
    let authority = build_authority(&config, store.clone(), challenges.clone());
    let certificates = Arc::new(CertificateManager::new(
        store.clone(),
        Some(authority),
        ManagerSettings::from(&config.acme),
    ));

    let loaded = certificates
        .warm_cache()
        .await
        .context("Failed to read certificate store")?;
    tracing::info!(records = loaded, "Loaded stored certificates");
    install_manual_certificates(&certificates, &config).await;

    if let Err(e) = autosave(&config).await {
        tracing::warn!(error = %e, "Failed to autosave configuration");
    }

    let router = Arc::new(SiteRouter::new(&config.sites).context("Invalid site table")?);
    for entry in router.snapshot().entries() {
        tracing::info!(hostname = %entry.hostname, upstream = %entry.upstream, "Configured site");
    }

    let forwarder = Arc::new(Forwarder::new(&config.upstream));
    let handler = HttpHandler::new(router.clone(), forwarder, config.hsts_max_age_secs);
    let terminator = Arc::new(TlsTerminator::new(
        router.clone(),
        certificates.clone(),
        TerminatorTimeouts::new(&config.timeouts, config.acme.issuance_timeout()),
    ));
    let tls_server = TlsServer::new(
        terminator,
        handler,
        ConnectionTracker::new(),
        config.timeouts.header_read(),
    );

    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(config.shutdown_timeout()));
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        signal_handler_shutdown.run_signal_handler().await;
    });

    let https_listener = TcpListener::bind(&config.https_addr)
        .await
        .with_context(|| format!("Failed to bind TLS listener on {}", config.https_addr))?;
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind plaintext listener on {}", config.http_addr))?;

    // Plaintext listener: challenges plus redirect/reject
    let plaintext_app = plaintext_router(PlaintextState {
        challenges: challenges.clone(),
        router: router.clone(),
        policy: config.plaintext,
        https_port: config.redirect_port(),
    });
    let plaintext_shutdown = graceful_shutdown.clone();
    let mut plaintext_token = graceful_shutdown.shutdown_token();
    let http_addr = config.http_addr.clone();
    tokio::spawn(async move {
        tracing::info!(addr = %http_addr, "Plaintext listener started");
        let result = axum::serve(http_listener, plaintext_app)
            .with_graceful_shutdown(async move {
                plaintext_token.wait_for_shutdown().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Plaintext listener failed");
            plaintext_shutdown.trigger_shutdown(ShutdownReason::Requested);
        }
    });

    // Renewal scheduler
    let scheduler = RenewalScheduler::new(
        router.clone(),
        certificates.clone(),
        challenges.clone(),
        config.acme.check_interval(),
    );
    let scheduler_token = graceful_shutdown.shutdown_token();
    tokio::spawn(async move {
        scheduler.run(scheduler_token).await;
    });

    // Config watcher: swaps the routing snapshot on valid changes
    let config_holder = Arc::new(ArcSwap::from_pointee(config));
    let debounce_duration = Duration::from_secs(2);
    let mut notify_rx = config_provider.watch();
    let watcher_router = router.clone();
    let watcher_certificates = certificates.clone();
    let watcher_holder = config_holder.clone();
    let config_path_for_watcher = config_path.to_string();
    tokio::spawn(async move {
        tracing::info!("Config watcher task started");
        let mut last_reload = tokio::time::Instant::now()
            .checked_sub(debounce_duration)
            .unwrap_or_else(tokio::time::Instant::now);

        while notify_rx.recv().await.is_some() {
            if last_reload.elapsed() < debounce_duration {
                tokio::time::sleep(debounce_duration - last_reload.elapsed()).await;
            }
            while notify_rx.try_recv().is_ok() {}
            last_reload = tokio::time::Instant::now();

            tracing::info!(config = %config_path_for_watcher, "Reloading configuration");
            let new_config = match config_provider.load_config().await {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reload configuration, keeping current sites");
                    continue;
                }
            };

            // certificates first, so a new manual site is servable the moment it routes
            install_manual_certificates(&watcher_certificates, &new_config).await;
            match watcher_router.replace(&new_config.sites) {
                Ok(version) => {
                    tracing::info!(version, sites = new_config.sites.len(), "Routing table replaced");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Rejected new site table, keeping current sites");
                    continue;
                }
            }

            log_restart_only_changes(&watcher_holder.load(), &new_config);
            if let Err(e) = autosave(&new_config).await {
                tracing::warn!(error = %e, "Failed to autosave configuration");
            }
            watcher_holder.store(Arc::new(new_config));
        }
        tracing::info!("Config watcher task is shutting down");
    });

    println!(
        "Portcullis listening on {} (TLS) and {} (plaintext)",
        config_holder.load().https_addr,
        config_holder.load().http_addr
    );

    tls_server
        .run(https_listener, graceful_shutdown.shutdown_token())
        .await?;

    let drain_timeout = graceful_shutdown.drain_timeout();
    let stats = tls_server.tracker().get_stats().await;
    tracing::info!(
        timeout = ?drain_timeout,
        connections = stats.total_connections,
        idle_connections = stats.idle_connections,
        active_requests = stats.total_active_requests,
        oldest_connection_age = ?stats.oldest_connection_age,
        "Draining connections"
    );
    if !tls_server.tracker().wait_for_drain(drain_timeout).await {
        tracing::warn!("Shutdown timeout reached with connections still open");
    }
    tracing::info!("Portcullis stopped");
    Ok(())
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration summary:");
            println!("   TLS listener:       {}", config.https_addr);
            println!("   Plaintext listener: {} ({:?})", config.http_addr, config.plaintext);
            println!("   Sites:              {}", config.sites.len());
            for site in &config.sites {
                println!("     {} -> {}", site.hostname, site.upstream);
            }
            if config.uses_acme() {
                println!("   ACME directory:     {}", config.acme.directory());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Portcullis configuration

http_addr = "0.0.0.0:80"
https_addr = "0.0.0.0:443"
plaintext = "redirect"
# hsts_max_age_secs = 31536000

[storage]
data_dir = "/data"
config_dir = "/config"

[acme]
email = "ops@example.com"
# Use the Let's Encrypt staging directory while testing
staging = true

[[sites]]
hostname = "example.com"
upstream = "127.0.0.1:3000"

# A site with an operator supplied certificate
# [[sites]]
# hostname = "internal.example.com"
# upstream = "127.0.0.1:4000"
# [sites.tls]
# mode = "manual"
# cert_path = "/certs/internal.pem"
# key_path = "/certs/internal.key"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created starter configuration at: {config_path}");
    println!("   Run 'portcullis serve --config {config_path}' to start the proxy");
    Ok(())
}

async fn certs_command(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let store = FileCertificateStore::open(&config.storage.data_dir)
        .await
        .context("Failed to open certificate store")?;

    let hostnames = store.list().await.context("Failed to list certificates")?;
    if hostnames.is_empty() {
        println!("No certificates stored in {}", config.storage.data_dir.display());
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!("{:<40} {:<8} {:<26} {:>6}", "HOSTNAME", "SOURCE", "NOT AFTER", "DAYS");
    for hostname in hostnames {
        match store.get(&hostname).await {
            Ok(Some(record)) => {
                let source = if record.is_manual() { "manual" } else { "acme" };
                println!(
                    "{:<40} {:<8} {:<26} {:>6}",
                    record.hostname,
                    source,
                    record.not_after.to_rfc3339(),
                    (record.not_after - now).num_days()
                );
            }
            Ok(None) => {}
            Err(e) => println!("{hostname:<40} unreadable: {e}"),
        }
    }
    Ok(())
}

async fn reset_account_command(config_path: &str, confirmed: bool) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let directory = config.acme.directory().to_string();

    if !confirmed {
        eprintln!("This deletes the ACME account stored for {directory}.");
        eprintln!("A new account is registered on the next issuance. Re-run with --yes to proceed.");
        std::process::exit(1);
    }

    let store = FileCertificateStore::open(&config.storage.data_dir)
        .await
        .context("Failed to open certificate store")?;
    if store
        .delete_account(&directory)
        .await
        .context("Failed to delete ACME account")?
    {
        println!("Deleted ACME account for {directory}");
    } else {
        println!("No ACME account stored for {directory}");
    }
    Ok(())
}
