use crate::command;
use crate::configuration::watcher::{CredentialWatcher, Reloadable};
use crate::configuration::{self, Configuration};
use crate::oidc::OidcVerifier;
use crate::proxy::{
    IdentityVerifier, Proxy, ProxyConfig, TransportSet, UpstreamCredentials, UpstreamTransport,
};
use crate::server::lifecycle::{Lifecycle, Readiness};
use crate::server::listener::Listener;
use crate::server::probe::ProbeServer;
use crate::token_review::KubeTokenReviewer;
use argh::FromArgs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "serve",
    description = "Run the authenticating proxy"
)]
pub struct Options {}

pub struct Command {
    proxy: Arc<Proxy>,
    verifier: Arc<OidcVerifier>,
    listener: Arc<Listener>,
    credentials: Arc<UpstreamCredentials>,
    probe: ProbeServer,
    lifecycle: Lifecycle,
    watched_files: Vec<PathBuf>,
    reload_interval: Duration,
}

impl Command {
    /// Builds every component from `config`. Nothing is bound or spawned yet.
    pub fn new(config: &Configuration) -> Result<Command, configuration::Error> {
        let upstream = config.upstream()?;
        match &upstream.token_file {
            Some(token_file) => info!(
                "Upstream {} with token from {}",
                upstream.url,
                token_file.display()
            ),
            None => info!("Upstream {} without proxy token", upstream.url),
        }

        let credentials = Arc::new(UpstreamCredentials::new(upstream.token_file.clone())?);
        let transports = TransportSet::new(
            UpstreamTransport::new(upstream)?,
            Arc::clone(&credentials),
        );

        let verifier = Arc::new(OidcVerifier::new(&config.oidc)?);
        let identity_verifier: Arc<dyn IdentityVerifier> = verifier.clone();
        let mut proxy = Proxy::new(ProxyConfig::new(config)?, identity_verifier, transports);

        if config.token_passthrough.enabled {
            info!("Token passthrough enabled, unverified tokens go through token review");
            let reviewer = KubeTokenReviewer::new(
                upstream,
                config.token_passthrough.audiences.clone(),
                Arc::clone(&credentials),
            )?;
            proxy = proxy.with_token_reviewer(Arc::new(reviewer));
        }

        if config.proxy.disable_impersonation {
            info!("Impersonation disabled, verified requests are forwarded unmodified");
        }

        let readiness = Readiness::default();

        Ok(Command {
            proxy: Arc::new(proxy),
            verifier,
            listener: Arc::new(Listener::new(&config.server)?),
            credentials,
            probe: ProbeServer::new(&config.probe, readiness.clone()),
            lifecycle: Lifecycle::new(config.lifecycle.clone(), readiness),
            watched_files: config.watched_files(),
            reload_interval: config.watch.reload_interval(),
        })
    }

    /// Starts the background tasks and runs the lifecycle until `stop`
    /// resolves and connections are drained.
    pub async fn run<F>(self, stop: F) -> Result<(), command::Error>
    where
        F: Future<Output = ()>,
    {
        let Command {
            proxy,
            verifier,
            listener,
            credentials,
            probe,
            lifecycle,
            watched_files,
            reload_interval,
        } = self;

        let reloadables = vec![
            listener.clone() as Arc<dyn Reloadable>,
            credentials as Arc<dyn Reloadable>,
        ];
        let _watcher = CredentialWatcher::new(&watched_files, reload_interval, reloadables)?;

        let probe_listener = probe.bind().await?;
        let probe = tokio::spawn(probe.serve(probe_listener));
        let refresh = verifier.spawn_refresh();

        let result = lifecycle.run(&listener, proxy, stop).await;

        refresh.abort();
        probe.abort();
        info!("Shutdown complete");
        result
    }
}

/// Resolves on the first SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {e}");
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
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
