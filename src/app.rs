use crate::{
    clock::SystemClock,
    config::AppConfig,
    host::ShimHost,
    server::{self, ServerState},
    session::{DirectiveSender, RetryPolicy, TabRegistry, spawn_coordinator},
    storage::Storage,
    tui,
    usage::{Settings, UsageStore},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
    headless: bool,
}

impl App {
    pub async fn new(config: AppConfig, headless: bool) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            headless,
        })
    }

    pub async fn run(self) -> Result<()> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;
        tracing::info!(path = %storage.path().display(), "usage database ready");

        let store = UsageStore::new(storage, Arc::new(SystemClock));
        store
            .rollover_if_new_day()
            .await
            .context("initial rollover check failed")?;
        let limits = &self.config.limits;
        store
            .seed_settings(Settings {
                daily_limit_seconds: limits.default_daily_limit_secs,
                redirect_url: limits.default_redirect_url.clone(),
            })
            .await?;

        let host = ShimHost::new();
        let registry = TabRegistry::default();
        let delivery = &self.config.delivery;
        let directives = DirectiveSender::new(
            registry.clone(),
            Arc::new(host.clone()),
            RetryPolicy::new(delivery.max_attempts, delivery.retry_delay()),
            delivery.reinject_settle(),
        );
        let (coordinator_handle, client) = spawn_coordinator(
            store.clone(),
            directives,
            Duration::from_secs(self.config.storage.rollover_check_secs),
        );

        let server_handle = server::spawn(
            &self.config.server.listen_addr,
            ServerState {
                client: client.clone(),
                registry,
                store: store.clone(),
                host,
            },
        )
        .await?;

        let ui_result = if self.headless {
            tracing::info!("running headless; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")
        } else {
            tracing::info!("Launching interactive TUI (requires an attached terminal)");
            tui::run(self.config.clone(), client.clone(), store).await
        };

        if let Err(err) = server_handle.shutdown().await {
            tracing::warn!(error = %err, "message endpoint stopped with an error");
        }
        drop(client);
        coordinator_handle.shutdown().await;
        tracing::info!("shut down");
        ui_result
    }
}
