use crate::command;
use crate::configuration::LifecycleConfig;
use crate::proxy::Proxy;
use crate::server::listener::Listener;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Process states, in the only order they may be entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Init = 0,
    WarmingUp = 1,
    NotReady = 2,
    Ready = 3,
    Draining = 4,
    Stopped = 5,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Init,
            1 => State::WarmingUp,
            2 => State::NotReady,
            3 => State::Ready,
            4 => State::Draining,
            _ => State::Stopped,
        }
    }
}

/// Process-wide state shared with the readiness probe.
///
/// Transitions only move forward, so a late readiness flip can never
/// overwrite `Draining`.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicU8>);

impl Readiness {
    pub fn state(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn advance(&self, state: State) {
        let previous = State::from_u8(self.0.fetch_max(state as u8, Ordering::AcqRel));
        if previous < state {
            info!("Lifecycle: {previous:?} -> {state:?}");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == State::Ready
    }
}

pub fn spawn_readiness_flip(readiness: Readiness, grace_period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace_period).await;
        readiness.advance(State::Ready);
    })
}

pub struct Lifecycle {
    config: LifecycleConfig,
    readiness: Readiness,
}

impl Lifecycle {
    pub fn new(config: LifecycleConfig, readiness: Readiness) -> Self {
        Self { config, readiness }
    }

    /// Warms up, serves until `stop` resolves, then drains.
    ///
    /// The identity provider gets at most `provider_warmup_timeout` to signal
    /// readiness before the listener is bound regardless.
    pub async fn run<F>(
        &self,
        listener: &Listener,
        proxy: Arc<Proxy>,
        stop: F,
    ) -> Result<(), command::Error>
    where
        F: Future<Output = ()>,
    {
        self.readiness.advance(State::WarmingUp);

        let warmup_timeout = self.config.provider_warmup_timeout();
        if tokio::time::timeout(warmup_timeout, proxy.verifier().ready())
            .await
            .is_err()
        {
            warn!("Identity provider not ready after {warmup_timeout:?}, serving anyway");
        }

        let tcp = listener.bind().await?;
        self.readiness.advance(State::NotReady);

        let flip = spawn_readiness_flip(
            self.readiness.clone(),
            self.config.readiness_grace_period(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let serving = listener.serve(tcp, proxy, shutdown_rx, self.config.shutdown_timeout());
        tokio::pin!(serving);
        tokio::pin!(stop);

        tokio::select! {
            result = &mut serving => {
                flip.abort();
                self.readiness.advance(State::Stopped);
                return result.map_err(command::Error::from);
            }
            () = &mut stop => {}
        }

        info!("Stop signal received, draining connections");
        flip.abort();
        self.readiness.advance(State::Draining);
        let _ = shutdown_tx.send(true);

        let result = serving.await;
        self.readiness.advance(State::Stopped);
        result.map_err(command::Error::from)
    }
}
