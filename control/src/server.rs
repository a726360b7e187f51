//! Control-plane bootstrap: storage, queue backing, both servers, the
//! health monitor, and the ordered graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ferry_common::rate_limit::RateLimiter;
use ferry_common::shutdown::shutdown_signal;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Identity, Server, ServerTlsConfig};

use crate::args::ServerArgs;
use crate::credentials::CredentialStore;
use crate::db;
use crate::error::ControlError;
use crate::events::EventPublisher;
use crate::http;
use crate::monitor::run_health_monitor;
use crate::proto::relayer::relayer_server::RelayerServer;
use crate::queue::{MemoryWorkQueue, RedisWorkQueue, WorkQueue};
use crate::registry::ConnectionRegistry;
use crate::session::RelayerService;
use crate::state::{AppState, RuntimeConfig};

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let pool = ferry_common::postgres::create_pool(args.postgres.clone()).await?;
    db::init_schema(&pool).await?;

    let (queue, redis_pool): (Arc<dyn WorkQueue>, Option<deadpool_redis::Pool>) =
        match args.queue_backend.as_str() {
            "redis" => {
                let redis = ferry_common::redis::init_redis(&args.redis).await?;
                (
                    Arc::new(RedisWorkQueue::new(redis.clone(), args.queue_depth_limit)),
                    Some(redis),
                )
            }
            "memory" => {
                println!(
                    "{}",
                    "⚠️ In-memory work queue: queued dispatches will not survive a restart"
                        .yellow()
                );
                (Arc::new(MemoryWorkQueue::new(args.queue_depth_limit)), None)
            }
            other => bail!("unknown queue backend: {other}"),
        };

    let config = RuntimeConfig {
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        stale_threshold: Duration::from_millis(args.heartbeat_timeout_ms),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        idle_timeout: Duration::from_millis(args.idle_timeout_ms),
        dequeue_wait: Duration::from_secs(5),
        send_timeout: Duration::from_secs(10),
        send_channel_capacity: args.send_channel_capacity,
    };

    let state = AppState {
        pool: pool.clone(),
        queue: queue.clone(),
        registry: ConnectionRegistry::new(),
        credentials: CredentialStore::new(
            pool.clone(),
            Duration::from_millis(args.auth_timeout_ms),
        ),
        events: EventPublisher::new(redis_pool.clone()),
        sessions: TaskTracker::new(),
        config,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let monitor = tokio::spawn(run_health_monitor(state.clone(), cancel.child_token()));

    // Relayer stream endpoint.
    let grpc_addr: SocketAddr = format!("{}:{}", args.grpc_host, args.grpc_port).parse()?;
    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_millis(args.grpc_keepalive_time_ms)))
        .http2_keepalive_timeout(Some(Duration::from_millis(args.grpc_keepalive_timeout_ms)))
        .max_concurrent_streams(Some(args.grpc_max_concurrent_streams));
    if let Some(age_ms) = args.grpc_max_connection_age_ms {
        builder = builder.max_connection_age(Duration::from_millis(age_ms));
    }
    if args.grpc_tls_enabled {
        let cert_file = args
            .grpc_tls_cert_file
            .as_deref()
            .context("GRPC_TLS_CERT_FILE is required when TLS is enabled")?;
        let key_file = args
            .grpc_tls_key_file
            .as_deref()
            .context("GRPC_TLS_KEY_FILE is required when TLS is enabled")?;
        let cert = tokio::fs::read(cert_file)
            .await
            .with_context(|| format!("failed to read {cert_file}"))?;
        let key = tokio::fs::read(key_file)
            .await
            .with_context(|| format!("failed to read {key_file}"))?;
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
            .context("invalid TLS configuration")?;
    }
    tracing::info!(%grpc_addr, tls = args.grpc_tls_enabled, "starting relayer stream server");
    let grpc_cancel = cancel.clone();
    let grpc_server = builder
        .add_service(RelayerServer::new(RelayerService::new(state.clone())))
        .serve_with_shutdown(grpc_addr, async move {
            grpc_cancel.cancelled().await;
        });

    // Internal HTTP surface.
    let limiter = if args.rate_limit_enabled {
        match redis_pool.clone() {
            Some(redis) => Some(RateLimiter::new(redis, args.rate_limiter.clone().into())),
            None => {
                tracing::warn!("rate limiting requested but no Redis backing; disabled");
                None
            }
        }
    } else {
        None
    };
    let app = http::router(state.clone(), limiter);
    let http_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    tracing::info!(%http_addr, "starting internal HTTP server");
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_cancel = cancel.clone();
    let http_server = axum::serve(listener, app).with_graceful_shutdown(async move {
        http_cancel.cancelled().await;
    });

    let mut grpc_join = Box::pin(tokio::spawn(async move { grpc_server.await }));
    let mut http_join = Box::pin(tokio::spawn(async move { http_server.await }));
    tokio::select! {
        res = &mut grpc_join => {
            cancel.cancel();
            http_join
                .await
                .context("failed to join HTTP server task")?
                .context("HTTP server failed")?;
            res.context("failed to join relayer server task")?
                .context("relayer server failed")?;
        }
        res = &mut http_join => {
            cancel.cancel();
            grpc_join
                .await
                .context("failed to join relayer server task")?
                .context("relayer server failed")?;
            res.context("failed to join HTTP server task")?
                .context("HTTP server failed")?;
        }
    }

    // Ordered teardown: the monitor first, then every session (their
    // drains re-enqueue in-flight messages), then the queue.
    monitor.await.context("health monitor task failed")?;
    for conn in state.registry.drain() {
        conn.close(ControlError::StreamIo("control plane shutting down".into()));
    }
    state.sessions.close();
    state.sessions.wait().await;
    queue.close();

    println!("{}", "🛑 All servers shut down gracefully.".red());
    Ok(())
}
