use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::engine::ToIntegrationMessage;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Body of the `update_entity` service call
#[derive(Debug, Deserialize)]
struct UpdateEntityRequest {
    entity_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpdateEntityResponse {
    /// Ids no integration claimed; the rest were still processed
    unknown: Vec<String>,
}

/// Body of the `heartbeat_known_boards` service call
#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    entry_id: String,
}

/// Optional body of an entity command
#[derive(Debug, Default, Deserialize)]
struct CommandRequest {
    position: Option<u8>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for GET /v1/state
#[tracing::instrument(skip(state))]
async fn engine_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/state request");
    let snapshot = state.engine.state_snapshot();
    (StatusCode::OK, Json(crate::engine::State::clone(&snapshot)))
}

/// Handler for POST /v1/services/dscript/update_entity
#[tracing::instrument(skip(state))]
async fn update_entity(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateEntityRequest>,
) -> impl IntoResponse {
    let unknown = state.engine.update_entities(request.entity_ids);
    (StatusCode::OK, Json(UpdateEntityResponse { unknown }))
}

/// Handler for POST /v1/services/dscript/heartbeat_known_boards
#[tracing::instrument(skip(state))]
async fn heartbeat_known_boards(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HeartbeatRequest>,
) -> axum::response::Response {
    match state.engine.heartbeat_known_boards(&request.entry_id) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::warn!("heartbeat_known_boards for '{}': {}", request.entry_id, e);
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// Map a command name to the message for `entity_id`.
fn command_message(
    entity_id: String,
    command: &str,
    request: CommandRequest,
) -> Result<ToIntegrationMessage, String> {
    Ok(match command {
        "turn_on" => ToIntegrationMessage::TurnOn { entity_id },
        "turn_off" => ToIntegrationMessage::TurnOff { entity_id },
        "open_cover" => ToIntegrationMessage::OpenCover { entity_id },
        "close_cover" => ToIntegrationMessage::CloseCover { entity_id },
        "stop_cover" => ToIntegrationMessage::StopCover { entity_id },
        "set_cover_position" => {
            let position = request
                .position
                .ok_or_else(|| "set_cover_position requires a position".to_string())?;
            if position > 100 {
                return Err(format!("position {} is out of range 0..=100", position));
            }
            ToIntegrationMessage::SetCoverPosition {
                entity_id,
                position,
            }
        }
        other => return Err(format!("unknown command '{}'", other)),
    })
}

/// Handler for POST /v1/entities/:entity_id/:command
#[tracing::instrument(skip(state, body))]
async fn entity_command(
    State(state): State<Arc<AppState>>,
    Path((entity_id, command)): Path<(String, String)>,
    body: Option<Json<CommandRequest>>,
) -> axum::response::Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let msg = match command_message(entity_id.clone(), &command, request) {
        Ok(msg) => msg,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match state.engine.send_command(msg) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::warn!("{} for '{}': {}", command, entity_id, e);
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/state", get(engine_state))
        .route("/v1/entities/:entity_id/:command", post(entity_command))
        .route("/v1/services/dscript/update_entity", post(update_entity))
        .route(
            "/v1/services/dscript/heartbeat_known_boards",
            post(heartbeat_known_boards),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        create_router(Arc::new(AppState {
            version: "test",
            engine: Arc::new(Engine::new()),
        }))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let response = router()
            .oneshot(Request::get("/v1/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_state_starts_empty() {
        let response = router()
            .oneshot(Request::get("/v1/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["entities"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_update_entity_reports_unknown_ids() {
        let response = router()
            .oneshot(post_json(
                "/v1/services/dscript/update_entity",
                r#"{"entity_ids": ["light.office_light1"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"unknown": ["light.office_light1"]})
        );
    }

    #[tokio::test]
    async fn test_command_for_unknown_entity() {
        let response = router()
            .oneshot(post_json("/v1/entities/light.office_light1/turn_on", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "No integration found for entity: light.office_light1");
    }

    #[tokio::test]
    async fn test_bad_commands_are_rejected() {
        for (uri, body) in [
            ("/v1/entities/light.office_light1/explode", "{}"),
            ("/v1/entities/cover.office_cover1/set_cover_position", "{}"),
            ("/v1/entities/cover.office_cover1/set_cover_position", r#"{"position": 101}"#),
        ] {
            let response = router().oneshot(post_json(uri, body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    struct OneCover {
        seen: Arc<std::sync::Mutex<Vec<ToIntegrationMessage>>>,
    }

    #[async_trait::async_trait]
    impl crate::engine::Integration for OneCover {
        fn name(&self) -> &str {
            "office"
        }

        async fn setup(
            &mut self,
            tx: crate::engine::FromIntegrationSender,
        ) -> Result<(), Box<dyn std::error::Error + Send>> {
            let msg = crate::engine::FromIntegrationMessage::EntityDiscovered {
                entity_id: "cover.office_cover1".to_string(),
                integration_name: "office".to_string(),
                platform: "cover".to_string(),
                device: None,
            };
            tx.send(msg)
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send> { Box::new(e) })
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), Box<dyn std::error::Error + Send>> {
            self.seen.lock().unwrap().push(msg);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), Box<dyn std::error::Error + Send>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commands_reach_the_owning_integration() {
        let engine = Arc::new(Engine::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        engine.register_integration("office".to_string(), Box::new(OneCover { seen: seen.clone() }));
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        for _ in 0..100 {
            if !engine.state_snapshot().entities.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let app = create_router(Arc::new(AppState {
            version: "test",
            engine: engine.clone(),
        }));
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/entities/cover.office_cover1/set_cover_position",
                r#"{"position": 40}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let response = app
            .oneshot(
                Request::post("/v1/entities/cover.office_cover1/stop_cover")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ToIntegrationMessage::SetCoverPosition {
                    entity_id: "cover.office_cover1".to_string(),
                    position: 40,
                },
                ToIntegrationMessage::StopCover {
                    entity_id: "cover.office_cover1".to_string(),
                },
            ]
        );
        runner.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_entry() {
        let response = router()
            .oneshot(post_json(
                "/v1/services/dscript/heartbeat_known_boards",
                r#"{"entry_id": "office"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
