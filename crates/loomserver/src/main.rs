use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use loomcore::{EnginePolicy, EventHub, RunEvent, RunRecord};
use loomruntime::{compile, Engine, HandlerRegistry};
use loomstore::RecordStore;

/// Application state shared across handlers
struct AppState {
    engine: Engine,
    hub: EventHub,
    store: RecordStore,
    registry: Arc<HandlerRegistry>,
    /// Shared secret for the event stream; unset means open access.
    ws_token: Option<String>,
}

/// Request body for flow execution
#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    graph: serde_json::Value,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    run_id: String,
    flow_id: String,
    flow_name: String,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    token: Option<String>,
}

/// Inbound WS control frame; anything else is ignored.
#[derive(Debug, Deserialize)]
struct SubscribeFrame {
    #[serde(rename = "type")]
    kind: String,
    run_id: Option<String>,
    token: Option<String>,
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "loomflow"
    }))
}

/// Compile a raw graph and start a run. Responds immediately with the
/// run id; progress streams over the events socket and lands in the
/// record store.
#[post("/api/flows/execute")]
async fn execute_flow(
    data: web::Data<AppState>,
    req: web::Json<ExecuteRequest>,
) -> ActixResult<impl Responder> {
    let ExecuteRequest { graph, input } = req.into_inner();

    let flow = match compile(&graph) {
        Ok(flow) => Arc::new(flow),
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse {
                error: e.to_string(),
            }))
        }
    };

    let run_id = Uuid::new_v4().to_string();
    info!(run_id = %run_id, flow = %flow.name, "starting run");

    // placeholder record so the run is readable before the first
    // persisted event
    let record = RunRecord::with_id(run_id.clone(), flow.id.clone(), input.clone());
    if let Err(e) = data.store.runs.save(record).await {
        error!(run_id = %run_id, error = %e, "failed to persist run");
        return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
            error: e.to_string(),
        }));
    }

    let response = ExecuteResponse {
        run_id: run_id.clone(),
        flow_id: flow.id.clone(),
        flow_name: flow.name.clone(),
    };

    let engine = data.engine.clone();
    let hub = data.hub.clone();
    let store = data.store.clone();
    tokio::spawn(async move {
        // mirror hub events into the store while the run is live
        let mut sub = hub.subscribe(&run_id).await;
        let event_store = store.clone();
        let event_run_id = run_id.clone();
        let mirror = tokio::spawn(async move {
            while let Some(envelope) = sub.recv().await {
                match serde_json::from_str::<RunEvent>(&envelope) {
                    Ok(event) => {
                        if let Err(e) = event_store.runs.append_event(&event_run_id, event).await
                        {
                            error!(run = %event_run_id, error = %e, "event persist failed");
                        }
                    }
                    Err(e) => error!(run = %event_run_id, error = %e, "bad event envelope"),
                }
            }
        });

        let final_record = match engine.execute_with_id(run_id.clone(), &flow, input).await {
            Ok(done) => done.record,
            Err(failure) => {
                error!(run_id = %run_id, error = %failure.error, "run failed");
                failure.record
            }
        };
        mirror.await.ok();

        // authoritative overwrite of the mirrored stream
        if let Err(e) = store.runs.save(final_record).await {
            error!(run_id = %run_id, error = %e, "failed to persist final run state");
        }
        if let Err(e) = store.runs.flush().await {
            error!(run_id = %run_id, error = %e, "flush failed");
        }
    });

    Ok(HttpResponse::Accepted().json(response))
}

/// List all runs
#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let mut runs = data.store.runs.list().await;
    runs.sort_by(|a, b| a.id.cmp(&b.id));
    let summaries: Vec<_> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.id,
                "flow_id": r.flow_id,
                "status": r.status,
                "events": r.events.len(),
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(summaries))
}

/// Get a specific run
#[get("/api/runs/{id}")]
async fn get_run(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.store.runs.get(&run_id).await {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Run {} not found", run_id),
        })),
    }
}

/// List registered node kinds
#[get("/api/nodes")]
async fn list_node_kinds(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let kinds: Vec<&str> = data.registry.kinds().iter().map(|k| k.as_str()).collect();
    Ok(HttpResponse::Ok().json(kinds))
}

fn authorized(expected: &Option<String>, provided: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(token) => provided == Some(token.as_str()),
    }
}

/// WebSocket endpoint for one run's event stream.
///
/// The token is checked at handshake and again on every inbound
/// subscribe frame; an unauthorized request gets an error frame before
/// the socket closes.
#[get("/api/runs/{id}/events")]
async fn run_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<EventsQuery>,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let run_id = path.into_inner();
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    let hub = data.hub.clone();
    let expected = data.ws_token.clone();
    let handshake_token = query.into_inner().token;

    actix_web::rt::spawn(async move {
        if !authorized(&expected, handshake_token.as_deref()) {
            let _ = session
                .text(r#"{"type":"error","error":"unauthorized"}"#)
                .await;
            let _ = session.close(None).await;
            return;
        }

        info!(run = %run_id, "event stream client connected");
        let mut sub = hub.subscribe(&run_id).await;

        loop {
            tokio::select! {
                envelope = sub.recv() => {
                    match envelope {
                        Some(json) => {
                            if session.text(json.to_string()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Text(text) => {
                            let Ok(frame) = serde_json::from_str::<SubscribeFrame>(&text) else {
                                continue;
                            };
                            if frame.kind != "subscribe" {
                                continue;
                            }
                            if !authorized(&expected, frame.token.as_deref()) {
                                let _ = session
                                    .text(r#"{"type":"error","error":"unauthorized"}"#)
                                    .await;
                                break;
                            }
                            if let Some(other) = frame.run_id {
                                sub = hub.subscribe(&other).await;
                            }
                        }
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("event stream client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn policy_from_env() -> EnginePolicy {
    let mut policy = EnginePolicy::default();
    if std::env::var("LOOM_ALLOW_CODE_EXECUTION").as_deref() == Ok("1") {
        policy.allow_code_execution = true;
    }
    if std::env::var("LOOM_ALLOW_PRIVATE_NETWORK").as_deref() == Ok("1") {
        policy.allow_private_network = true;
    }
    if let Ok(list) = std::env::var("LOOM_HTTP_ALLOWLIST") {
        policy.http_allowlist = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Ok(budget) = std::env::var("LOOM_STEP_BUDGET") {
        if let Ok(budget) = budget.parse() {
            policy.step_budget = budget;
        }
    }
    policy
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting loomflow server");

    let mut registry = HandlerRegistry::new();
    loomnodes::register_all(&mut registry);
    let registry = Arc::new(registry);

    let hub = EventHub::new();
    let engine = Engine::new(registry.clone(), policy_from_env()).with_hub(hub.clone());

    let data_dir = std::env::var("LOOM_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let store = RecordStore::open(&data_dir).await?;
    info!(dir = %data_dir, "record store ready");

    let app_state = web::Data::new(AppState {
        engine,
        hub,
        store,
        registry,
        ws_token: std::env::var("LOOM_WS_TOKEN").ok(),
    });

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(execute_flow)
            .service(list_runs)
            .service(get_run)
            .service(list_node_kinds)
            .service(run_events)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
