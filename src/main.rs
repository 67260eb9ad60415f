use proxyvisor::config::{BackendType, Config};
use proxyvisor::installer::{ArtifactInstaller, Platform, Verification};
use proxyvisor::sequencer::Sequencer;
use std::path::PathBuf;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyvisor=debug".parse().expect("valid log directive")),
        )
        .init();

    // `proxyvisor install [config.toml]` only fetches the proxy binary
    let mut args = std::env::args().skip(1).peekable();
    let install_only = args.peek().map(String::as_str) == Some("install");
    if install_only {
        args.next();
    }

    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    if install_only {
        return install(&config).await;
    }

    print_startup_banner(&config);

    let mut sequencer = Sequencer::new(config)?;
    sequencer.bring_up().await?;

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    sequencer.teardown().await?;
    info!("Shutdown complete");
    Ok(())
}

async fn install(config: &Config) -> anyhow::Result<()> {
    let installer = ArtifactInstaller::new(&config.install.dir, config.install.unverified)?
        .with_release_url(config.install.release_url.clone());
    let platform = match config.install.platform {
        Some(ref platform) => platform.parse::<Platform>()?,
        None => Platform::current(),
    };

    let target = installer.resolve(&config.install.version, &platform);
    let installation = installer.install(&target).await?;

    println!("{}", installation.binary.display());
    if installation.verification == Verification::Untested {
        warn!(version = %target.version, "Installed without a recorded checksum");
    }
    println!("Versions with recorded checksums:");
    for version in installer.manifest().versions() {
        println!("  {}", version);
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    let backend = match config.backend.backend_type {
        BackendType::File => format!("file {}", config.backend.dynamic_config_file.display()),
        BackendType::Etcd => format!("etcd {}", config.backend.endpoint()),
        BackendType::Consul => format!("consul {}", config.backend.endpoint()),
    };

    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!("  Proxy:   {} (api {})", config.proxy.public_url, config.proxy.api_url);
    info!("  Backend: {}", backend);
    info!("  Version: traefik {}", config.install.version);
    info!("========================================");
}
