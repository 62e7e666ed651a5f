//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::{DeployError, DeployResult};
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{deployer, reaper};

/// Run the deployment service until the shutdown signal fires
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> DeployResult<()> {
    info!("Initializing deployment service...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start deployment service: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> DeployResult<()> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    for id in 0..options.worker_concurrency {
        init_deployer_worker(
            deployer::Options {
                id,
                ..options.deployer.clone()
            },
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        );
    }

    if options.worker_concurrency > 0 {
        init_reaper(
            options.reaper.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_server {
        init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_deployer_worker(
    options: deployer::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(worker = options.id, "Initializing deployment worker...");

    let queue = app_state.queue.clone();
    let orchestrator = app_state.orchestrator.clone();

    let handle = tokio::spawn(async move {
        deployer::run(
            &options,
            queue,
            orchestrator,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle(handle);
}

fn init_reaper(
    options: reaper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> DeployResult<()> {
    info!("Initializing reaper...");

    let queue = app_state.queue.clone();
    let orchestrator = app_state.orchestrator.clone();

    let handle = tokio::spawn(async move {
        reaper::run(
            &options,
            queue,
            orchestrator,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reaper_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> DeployResult<()> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.queue.clone(),
        app_state.store.clone(),
        app_state.orchestrator.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<DeployResult<()>>>,
    worker_handles: Vec<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            worker_handles: Vec::new(),
            reaper_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> DeployResult<()> {
        if self.app_state.is_some() {
            return Err(DeployError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_worker_handle(&mut self, handle: JoinHandle<()>) {
        self.worker_handles.push(handle);
    }

    pub fn with_reaper_handle(&mut self, handle: JoinHandle<()>) -> DeployResult<()> {
        if self.reaper_handle.is_some() {
            return Err(DeployError::ShutdownError("reaper_handle already set".to_string()));
        }
        self.reaper_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(&mut self, handle: JoinHandle<DeployResult<()>>) -> DeployResult<()> {
        if self.server_handle.is_some() {
            return Err(DeployError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> DeployResult<()> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> DeployResult<()> {
        info!("Shutting down deployment service...");

        // 1. Server stops accepting triggers
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))??;
        }

        // 2. Workers finish their in-flight job
        for handle in self.worker_handles.drain(..) {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 3. Reaper
        if let Some(handle) = self.reaper_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 4. Queue and store connections
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
