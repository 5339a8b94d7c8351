use crate::config::ProxyConfig;
use crate::control_api;
use crate::control_api::TlsMaterial;
use crate::dns;
use crate::http_proxy;
use crate::otlp;
use crate::state::SessionState;
use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns every component of one proxy session and runs the listeners. The
/// session dies with the process; restarting is the intended recovery path
/// for any inconsistent state.
pub struct ProxyServer {
    state: Arc<SessionState>,
    config: ProxyConfig,
    tls_config: rustls::ServerConfig,
}

impl ProxyServer {
    /// Construct all components. Missing TLS environment variables are fatal
    /// here: the control plane must never run in the clear.
    pub fn from_config(config: ProxyConfig) -> Result<Self> {
        let tls_material = TlsMaterial::from_env()?;
        let tls_config = control_api::server_tls_config(&tls_material)?;
        let state = Arc::new(SessionState::from_config(config.clone())?);
        Ok(Self {
            state,
            config,
            tls_config,
        })
    }

    pub fn state(&self) -> Arc<SessionState> {
        self.state.clone()
    }

    /// Run every listener until the first one fails or `cancel` fires.
    /// Listener tasks loop forever, so any completion is an error path; no
    /// graceful drain is attempted on cancellation.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut listeners: JoinSet<Result<()>> = JoinSet::new();

        {
            let state = self.state.clone();
            let addr = self.config.proxy_addr();
            listeners.spawn(async move {
                http_proxy::run_http_proxy(state, addr)
                    .await
                    .context("HTTP proxy listener failed")
            });
        }
        {
            let state = self.state.clone();
            let addr = self.config.dns_addr();
            listeners.spawn(
                async move { dns::run_dns(state, addr).await.context("DNS listener failed") },
            );
        }
        {
            let state = self.state.clone();
            let addr = self.config.control_api_addr();
            let tls_config = self.tls_config;
            listeners.spawn(async move {
                control_api::run_control_api(state, addr, tls_config)
                    .await
                    .context("control API listener failed")
            });
        }
        if self.config.otlp_enabled() {
            let state = self.state;
            let addr = self.config.otlp_addr();
            listeners.spawn(async move {
                otlp::run_otlp(state, addr)
                    .await
                    .context("OTLP listener failed")
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("proxy cancelled, shutting down listeners");
                listeners.shutdown().await;
                Ok(())
            }
            joined = listeners.join_next() => {
                listeners.shutdown().await;
                match joined {
                    Some(Ok(Ok(()))) => bail!("listener exited unexpectedly"),
                    Some(Ok(Err(err))) => Err(err),
                    Some(Err(err)) => Err(err).context("listener task panicked"),
                    None => bail!("no listeners were started"),
                }
            }
        }
    }
}
