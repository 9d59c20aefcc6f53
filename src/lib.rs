pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod loop_guard;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod read_tracker;
pub mod registry;
pub mod router;
pub mod routes;
pub mod sessions;
pub mod webhook_dispatcher;

use std::sync::Arc;
use std::time::Duration;

use bridge::UpstreamBridge;
use config::Config;
use db::Db;
use loop_guard::LoopGuard;
use metrics::Metrics;
use rate_limit::RateLimiter;
use read_tracker::ReadTracker;
use registry::AgentRegistry;
use router::RouterDeps;
use sessions::SessionRegistry;
use webhook_dispatcher::WebhookDispatcher;

/// Idempotency-cache and event-log entries are both swept on the same
/// interval; neither is on the hot path.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// How often to check live sessions against the current registry snapshot
/// for the revocation-while-connected metric.
const REVOCATION_WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Watch every principal id with a live socket or stream session; if the
/// registry no longer carries an active agent for one (token rotated away
/// or the agent suspended/removed by a refresh) while the session is still
/// open, raise the revocation-while-connected counter once per gap — not
/// once per tick — by tracking which ids have already been flagged.
fn spawn_revocation_watch(registry: Arc<AgentRegistry>, sessions: Arc<SessionRegistry>, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let mut flagged = std::collections::HashSet::new();
        loop {
            tokio::time::sleep(REVOCATION_WATCH_INTERVAL).await;
            let live = sessions.live_principal_ids();
            flagged.retain(|id| live.contains(id));
            for principal_id in &live {
                let still_valid = registry.get_by_principal(principal_id).is_some_and(|a| a.is_active());
                if !still_valid && flagged.insert(principal_id.clone()) {
                    metrics.record_revocation_while_connected();
                }
            }
        }
    });
}

/// Build the gateway's Rocket instance: bootstrap the agent registry
/// (failing fast on a fatal startup error), wire every managed-state
/// dependency, spawn the background tasks — the bridge's reconnect loop,
/// the router, the registry refresh loop, the loop-guard sweeper, and the
/// metrics flush loop — then mount routes and attach a shutdown fairing
/// that drains live sessions.
pub async fn build() -> rocket::Rocket<rocket::Build> {
    build_with_config(Config::from_env()).await
}

/// Synchronous wrapper around [`build_with_config`] for callers (notably
/// `tests/integration`) that only have a blocking `rocket::local::blocking`
/// client available and need a `Rocket<Build>` value, not a future.
pub fn build_with_config_blocking(config: Config) -> rocket::Rocket<rocket::Build> {
    tokio::runtime::Runtime::new()
        .expect("failed to start a runtime to build the gateway")
        .block_on(build_with_config(config))
}

/// Same as [`build`] but takes an explicit [`Config`] — split out so
/// integration tests can point every persisted path at a throwaway
/// location instead of the process environment.
pub async fn build_with_config(config: Config) -> rocket::Rocket<rocket::Build> {
    let registry = Arc::new(
        AgentRegistry::bootstrap(&config.upstream_base_url, &config.upstream_gateway_token, &config.agent_config_path)
            .await
            .unwrap_or_else(|e| panic!("agent gateway: fatal startup error: {e}")),
    );

    let db = Arc::new(Db::new(&config.storage_path));
    let bridge = Arc::new(UpstreamBridge::new(
        config.upstream_base_url.clone(),
        config.upstream_gateway_token.clone(),
        config.upstream_gateway_username.clone(),
        config.credential_cache_path.clone(),
    ));
    let sessions = Arc::new(SessionRegistry::new());
    let loop_guard = Arc::new(LoopGuard::new());
    let read_tracker = Arc::new(ReadTracker::load(&config.read_tracker_path));
    let metrics = Arc::new(Metrics::new());
    metrics.record_registry_refresh_ok();
    let webhooks = Arc::new(WebhookDispatcher::new());
    let rate_limiter = Arc::new(RateLimiter::new());

    let router_deps = RouterDeps {
        registry: Arc::clone(&registry),
        sessions: Arc::clone(&sessions),
        bridge: Arc::clone(&bridge),
        db: Arc::clone(&db),
        loop_guard: Arc::clone(&loop_guard),
        read_tracker: Arc::clone(&read_tracker),
        webhooks: Arc::clone(&webhooks),
        metrics: Arc::clone(&metrics),
    };

    let figment = rocket::Config::figment().merge(("port", config.port));

    // Every background task is spawned from an `on_liftoff` fairing rather
    // than inline here, the same way the teacher defers its webhook
    // dispatcher/retention/mDNS tasks to `on_liftoff` in its own
    // `build_rocket` — it's the only point guaranteed to run inside the
    // Rocket instance's own Tokio runtime, whether that's the real
    // `#[rocket::main]` runtime or a `local::blocking::Client`'s internal
    // one. Spawning here instead would tie these tasks to whatever
    // runtime happens to be polling this `async fn` at the call site,
    // which for a blocking test client is a throwaway `Runtime` that gets
    // dropped (aborting every task it spawned) the moment this function
    // returns.
    let (tx, rx) = tokio::sync::mpsc::channel(1024);
    let refresh_registry = Arc::clone(&registry);
    let refresh_base_url = config.upstream_base_url.clone();
    let refresh_token = config.upstream_gateway_token.clone();
    let refresh_metrics = Arc::clone(&metrics);
    let bridge_for_liftoff = Arc::clone(&bridge);
    let loop_guard_for_liftoff = Arc::clone(&loop_guard);
    let metrics_for_liftoff = Arc::clone(&metrics);
    let metrics_log_path = config.metrics_log_path.clone();
    let sweep_db = Arc::clone(&db);
    let registry_for_watch = Arc::clone(&registry);
    let sessions_for_watch = Arc::clone(&sessions);
    let metrics_for_watch = Arc::clone(&metrics);

    // `AdHoc::on_liftoff` takes an `Fn`, not `FnOnce`, even though liftoff
    // only ever fires once per instance — so the router's receiver half
    // (not `Clone`) is parked behind a `Mutex<Option<_>>` and taken on
    // that first and only call.
    let router_start = std::sync::Mutex::new(Some((rx, router_deps)));

    rocket::custom(figment)
        .manage(config)
        .manage(registry)
        .manage(db)
        .manage(bridge)
        .manage(sessions)
        .manage(loop_guard)
        .manage(read_tracker)
        .manage(metrics)
        .manage(webhooks)
        .manage(rate_limiter)
        .register("/", rocket::catchers![routes::too_many_requests, routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::metrics_report,
                routes::metrics_json,
                routes::send_as_agent,
                routes::session_status,
                routes::sse_health,
                routes::legacy_send,
                sessions::socket::socket_route,
                sessions::stream::stream_route,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff("Gateway Background Tasks", move |_rocket| {
            Box::pin(async move {
                if let Some((rx, router_deps)) = router_start.lock().unwrap().take() {
                    tokio::spawn(router::run(rx, router_deps));
                    tokio::spawn(Arc::clone(&bridge_for_liftoff).run(tx.clone()));
                }

                Arc::clone(&refresh_registry).spawn_refresh_loop(
                    refresh_base_url.clone(),
                    refresh_token.clone(),
                    Arc::clone(&refresh_metrics),
                );
                Arc::clone(&loop_guard_for_liftoff).spawn_sweeper();
                Arc::clone(&metrics_for_liftoff).spawn_flush_loop(metrics_log_path.clone());

                let sweep_db = Arc::clone(&sweep_db);
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(SWEEP_INTERVAL).await;
                        let now = chrono::Utc::now().timestamp();
                        sweep_db.sweep_expired_events(now);
                        sweep_db.sweep_expired_idempotency(now);
                    }
                });

                spawn_revocation_watch(
                    Arc::clone(&registry_for_watch),
                    Arc::clone(&sessions_for_watch),
                    Arc::clone(&metrics_for_watch),
                );

                println!("🌉 Agent gateway background tasks started");
            })
        }))
        .attach(rocket::fairing::AdHoc::on_shutdown("Graceful Drain", |rocket| {
            Box::pin(async move {
                let sessions: &Arc<SessionRegistry> = rocket.state::<Arc<SessionRegistry>>().unwrap();
                let metrics: &Arc<Metrics> = rocket.state::<Arc<Metrics>>().unwrap();
                let config: &Config = rocket.state::<Config>().unwrap();

                sessions.shutdown_all();
                metrics.flush_now(&config.metrics_log_path);
                println!("👋 Agent gateway shutting down gracefully");
            })
        }))
}
