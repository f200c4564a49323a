//! Omnichat platform server: provider webhook ingress, the WebSocket hub,
//! the automation pipeline, and the background job fabric (webhook outbox,
//! campaign workers, media sweeper) in one process.

mod ai;
mod api;
mod config;
mod ingress;
mod state;
mod telemetry;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use omc_auth::{run_invalidation_listener, PermissionCache, TokenSigner};
use omc_automation::{AiStage, Pipeline};
use omc_campaigns::CampaignService;
use omc_core::CloudApiClient;
use omc_mediagc::MediaSweeper;
use omc_outbox::{DeliveryProcessor, OutboxDispatcher};
use omc_safehttp::SafeHttpClient;
use omc_storage::Store;
use omc_transfers::TransferManager;
use tokio::sync::watch;

use crate::ai::ChatCompletionResponder;
use crate::config::Config;
use crate::state::AppState;

/// Cadence of the transfer queue tick that re-offers queued transfers to
/// auto-assigning teams.
const QUEUE_TICK_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    telemetry::init(config.json_logs);

    let store = Store::connect(&config.database_url).await?;
    let redis = redis::Client::open(config.redis_url.as_str())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub = omc_hub::spawn();
    let safehttp = SafeHttpClient::new(
        config.allow_internal_urls,
        format!("Omnichat-Webhook/{}", env!("CARGO_PKG_VERSION")),
    );
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let provider: Arc<dyn omc_core::ChatProvider> =
        Arc::new(CloudApiClient::new(http.clone(), &config.provider_api_base));

    let outbox = OutboxDispatcher::new(store.clone(), safehttp.clone());
    let transfers = TransferManager::new(store.clone(), hub.clone(), outbox.clone());
    let ai_stage = config.ai.clone().map(|ai_config| {
        AiStage::new(
            safehttp.clone(),
            Arc::new(ChatCompletionResponder::new(http.clone(), ai_config)),
        )
    });
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        provider.clone(),
        ai_stage,
        transfers.clone(),
        hub.clone(),
        outbox.clone(),
    ));
    let pipeline_tx = omc_automation::spawn(pipeline, config.pipeline_buffer);

    let permissions = PermissionCache::new();
    spawn_invalidation_listener(redis.clone(), permissions.clone(), shutdown_rx.clone());
    spawn_webhook_cache_listener(redis.clone(), outbox.clone(), shutdown_rx.clone());

    let processor = DeliveryProcessor::new(
        store.clone(),
        safehttp.clone(),
        Duration::from_secs(config.webhook_poll_secs),
    );
    tokio::spawn(processor.run(shutdown_rx.clone()));

    let sweeper = MediaSweeper::new(
        store.clone(),
        config.media_root.clone(),
        Duration::from_secs(config.media_sweep_secs),
    );
    tokio::spawn(sweeper.run(shutdown_rx.clone()));

    omc_campaigns::spawn_workers(
        config.campaign_workers,
        store.clone(),
        redis.clone(),
        provider.clone(),
        hub.clone(),
        shutdown_rx.clone(),
    );

    spawn_queue_tick(store.clone(), transfers.clone(), shutdown_rx.clone());

    let campaigns = CampaignService::new(store.clone(), redis.clone(), hub.clone());
    let signer = TokenSigner::hs256(&config.jwt_secret)
        .map_err(|err| anyhow::anyhow!("jwt signer: {err}"))?;

    let app_state = AppState {
        config: config.clone(),
        store,
        hub,
        signer,
        permissions,
        transfers,
        outbox,
        campaigns,
        pipeline_tx,
        provider,
    };

    let app = Router::new()
        .route("/webhook", get(ingress::verify).post(ingress::receive))
        .route("/ws", get(ws::upgrade))
        .route("/healthz", get(ingress::healthz))
        .route("/availability", post(api::set_availability))
        .route("/transfers", post(api::create_transfer))
        .route("/transfers/{id}/resume", post(api::resume_transfer))
        .route("/campaigns/{id}/start", post(api::start_campaign))
        .route("/campaigns/{id}/pause", post(api::pause_campaign))
        .route("/campaigns/{id}/resume", post(api::resume_campaign))
        .route("/campaigns/{id}/retry-failed", post(api::retry_campaign))
        .route("/webhooks/{id}/test", post(api::test_webhook))
        .route("/webhooks/{id}/retry", post(api::retry_webhook_deliveries))
        .route("/webhooks/{id}/health", get(api::webhook_health))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "omnichat-server listening");

    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown({
        let mut shutdown = shutdown_rx.clone();
        async move {
            let _ = shutdown.changed().await;
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    server.await?;
    tracing::info!("omnichat-server stopped");
    Ok(())
}

/// Keeps the permission cache coherent across processes; the subscriber is
/// restarted if the connection drops.
fn spawn_invalidation_listener(
    redis: redis::Client,
    cache: PermissionCache,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(err) = run_invalidation_listener(redis.clone(), cache.clone()).await {
                tracing::warn!(error = %err, "permission invalidation listener failed");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

/// Drops per-tenant webhook config cache entries when another process
/// announces a CRUD change.
fn spawn_webhook_cache_listener(
    redis: redis::Client,
    outbox: OutboxDispatcher,
    shutdown: watch::Receiver<bool>,
) {
    use futures::StreamExt;
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let listen = async {
                let mut pubsub = redis.get_async_pubsub().await?;
                pubsub.subscribe(omc_outbox::CACHE_CHANNEL).await?;
                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = message.get_payload().unwrap_or_default();
                    match payload.parse::<uuid::Uuid>() {
                        Ok(org_id) => outbox.cache().invalidate(org_id),
                        Err(_) => tracing::warn!(payload = %payload, "bad webhook cache invalidation"),
                    }
                }
                Ok::<(), redis::RedisError>(())
            };
            if let Err(err) = listen.await {
                tracing::warn!(error = %err, "webhook cache listener failed");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

/// Periodically re-offers queued transfers to teams with an auto-assign
/// strategy, so agents coming back from a break pick work up again.
fn spawn_queue_tick(
    store: Store,
    transfers: TransferManager,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(QUEUE_TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match store.org_ids().await {
                        Ok(orgs) => {
                            for org_id in orgs {
                                if let Err(err) = transfers.assign_queued(org_id).await {
                                    tracing::warn!(error = %err, org = %org_id, "queue tick failed");
                                }
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "queue tick org list failed"),
                    }
                }
            }
        }
    });
}
