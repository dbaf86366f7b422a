use super::ManagerState;
use crate::error::ManagerError;
use crate::store::{Filter, NodeCandidate, NodeStatus, PipelineSettings, RuleGroup, Settings};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("static response parts")
}

fn ok_json<T: serde::Serialize>(value: &T) -> Response<BoxBody> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_response(&ManagerError::Fatal(format!("serialize response: {}", e))),
    }
}

fn error_response(err: &ManagerError) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(
        status,
        serde_json::json!({"error": err.to_string()}).to_string(),
    )
}

fn not_found() -> Response<BoxBody> {
    json_response(
        StatusCode::NOT_FOUND,
        r#"{"error":"not found"}"#.to_string(),
    )
}

fn result_to_response<T: serde::Serialize>(result: Result<T, ManagerError>) -> Response<BoxBody> {
    match result {
        Ok(value) => ok_json(&value),
        Err(e) => error_response(&e),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, ManagerError> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| ManagerError::InvalidArgument(format!("read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| ManagerError::InvalidArgument(format!("parse body: {}", e)))
}

fn query_param(req: &Request<Incoming>, key: &str) -> Option<String> {
    req.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
    })
}

fn limit_param(req: &Request<Incoming>, default: usize) -> usize {
    query_param(req, "limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shared-secret gate for `/api/*`. Open when no secret is configured.
fn authorized(req: &Request<Incoming>, state: &ManagerState) -> bool {
    let settings = state.control.settings_snapshot();
    if settings.clash_api_secret.is_empty() {
        return true;
    }
    req.headers()
        .get("x-api-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == settings.clash_api_secret)
        .unwrap_or(false)
}

pub async fn handle_api(
    req: Request<Incoming>,
    state: ManagerState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = route(req, &state, &method, &path).await;
    metrics::counter!(
        "manager_http_requests_total",
        "status" => response.status().as_u16().to_string(),
    )
    .increment(1);
    Ok(response)
}

async fn route(
    req: Request<Incoming>,
    state: &ManagerState,
    method: &Method,
    path: &str,
) -> Response<BoxBody> {
    // Unauthenticated probes.
    match (method.as_str(), path) {
        ("GET", "/health" | "/healthz") => {
            return json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string());
        }
        ("GET", "/metrics") => {
            return Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(state.metrics.render()))
                .expect("static response parts");
        }
        _ => {}
    }

    if !authorized(&req, state) {
        return json_response(
            StatusCode::UNAUTHORIZED,
            r#"{"error":"missing or invalid secret"}"#.to_string(),
        );
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        // --- status & telemetry -------------------------------------------
        ("GET", ["api", "status"]) => result_to_response(state.control.status().await),

        ("GET", ["api", "activity"]) => {
            let limit = limit_param(&req, 100);
            result_to_response(state.store.get_activity_events(limit))
        }

        ("GET", ["api", "measurements", "latest"]) => {
            let limit = limit_param(&req, 100);
            result_to_response(state.store.get_latest_measurements(limit))
        }

        ("GET", ["api", "verifications"]) => {
            let limit = limit_param(&req, 20);
            result_to_response(state.store.get_verification_logs(limit))
        }

        // --- nodes ---------------------------------------------------------
        ("GET", ["api", "nodes"]) => match query_param(&req, "status") {
            Some(raw) => match NodeStatus::parse(&raw) {
                Some(status) => result_to_response(state.store.get_nodes(status)),
                None => error_response(&ManagerError::InvalidArgument(format!(
                    "unknown status {}",
                    raw
                ))),
            },
            None => result_to_response(state.store.get_all_nodes()),
        },

        ("POST", ["api", "nodes"]) => {
            let candidate: NodeCandidate = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.control.add_manual_node(candidate).await)
        }

        ("DELETE", ["api", "nodes", id]) => match id.parse::<i64>() {
            Ok(id) => result_to_response(state.control.delete_node(id).await),
            Err(_) => error_response(&ManagerError::InvalidArgument("bad node id".to_string())),
        },

        ("POST", ["api", "nodes", id, "favorite"]) => {
            let id = match id.parse::<i64>() {
                Ok(id) => id,
                Err(_) => {
                    return error_response(&ManagerError::InvalidArgument(
                        "bad node id".to_string(),
                    ))
                }
            };
            #[derive(serde::Deserialize)]
            struct Body {
                favorite: bool,
            }
            let body: Body = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.control.set_favorite(id, body.favorite))
        }

        ("POST", ["api", "nodes", id, "unarchive"]) => match id.parse::<i64>() {
            Ok(id) => result_to_response(state.control.unarchive_node(id)),
            Err(_) => error_response(&ManagerError::InvalidArgument("bad node id".to_string())),
        },

        // --- subscriptions -------------------------------------------------
        ("GET", ["api", "subscriptions"]) => {
            result_to_response(state.store.list_subscriptions())
        }

        ("POST", ["api", "subscriptions"]) => {
            #[derive(serde::Deserialize)]
            struct Body {
                name: String,
                url: String,
                #[serde(default)]
                pipeline: PipelineSettings,
            }
            let body: Body = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.store.add_subscription(&body.name, &body.url, &body.pipeline))
        }

        ("PUT", ["api", "subscriptions", id]) => {
            let id = match id.parse::<i64>() {
                Ok(id) => id,
                Err(_) => {
                    return error_response(&ManagerError::InvalidArgument(
                        "bad subscription id".to_string(),
                    ))
                }
            };
            let mut sub: crate::store::Subscription = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            sub.id = id;
            result_to_response(state.store.update_subscription(&sub))
        }

        ("DELETE", ["api", "subscriptions", id]) => match id.parse::<i64>() {
            Ok(id) => result_to_response(state.store.delete_subscription(id)),
            Err(_) => error_response(&ManagerError::InvalidArgument(
                "bad subscription id".to_string(),
            )),
        },

        ("POST", ["api", "subscriptions", "refresh"]) => {
            result_to_response(state.control.refresh_all().await)
        }

        ("POST", ["api", "subscriptions", id, "refresh"]) => match id.parse::<i64>() {
            Ok(id) => result_to_response(state.control.refresh_subscription(id).await),
            Err(_) => error_response(&ManagerError::InvalidArgument(
                "bad subscription id".to_string(),
            )),
        },

        // --- filters & rule groups ----------------------------------------
        ("GET", ["api", "filters"]) => result_to_response(state.store.list_filters()),

        ("POST", ["api", "filters"]) => {
            let filter: Filter = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.store.add_filter(&filter))
        }

        ("DELETE", ["api", "filters", id]) => match id.parse::<i64>() {
            Ok(id) => result_to_response(state.store.delete_filter(id)),
            Err(_) => error_response(&ManagerError::InvalidArgument("bad filter id".to_string())),
        },

        ("GET", ["api", "rule-groups"]) => result_to_response(state.store.list_rule_groups()),

        ("POST", ["api", "rule-groups"]) => {
            let group: RuleGroup = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.store.add_rule_group(&group))
        }

        ("DELETE", ["api", "rule-groups", id]) => match id.parse::<i64>() {
            Ok(id) => result_to_response(state.store.delete_rule_group(id)),
            Err(_) => error_response(&ManagerError::InvalidArgument(
                "bad rule group id".to_string(),
            )),
        },

        // --- settings ------------------------------------------------------
        ("GET", ["api", "settings"]) => result_to_response(state.control.get_settings()),

        ("PUT", ["api", "settings"]) => {
            let settings: Settings = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.control.set_settings(settings).await)
        }

        // --- commands ------------------------------------------------------
        ("POST", ["api", "verify", "run"]) => {
            let trigger = state.control.run_verification_now();
            ok_json(&serde_json::json!({"result": trigger}))
        }

        ("POST", ["api", "config", "apply"]) => {
            result_to_response(state.control.apply_config().await)
        }

        ("POST", ["api", "proxy", "switch"]) => {
            #[derive(serde::Deserialize)]
            struct Body {
                group: String,
                tag: String,
            }
            let body: Body = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.control.switch_proxy(&body.group, &body.tag).await)
        }

        ("POST", ["api", "kernel", "start"]) => {
            result_to_response(state.control.supervisor().start().await)
        }

        ("POST", ["api", "kernel", "stop"]) => {
            result_to_response(state.control.supervisor().stop().await)
        }

        ("POST", ["api", "kernel", "restart"]) => {
            result_to_response(state.control.supervisor().restart().await)
        }

        ("GET", ["api", "kernel", "version"]) => {
            result_to_response(state.control.supervisor().version().await)
        }

        // --- debug ---------------------------------------------------------
        ("POST", ["api", "debug", "enable"]) => {
            #[derive(serde::Deserialize)]
            struct Body {
                enabled: bool,
            }
            let body: Body = match read_json(req).await {
                Ok(v) => v,
                Err(e) => return error_response(&e),
            };
            result_to_response(state.control.enable_debug_api(body.enabled))
        }

        ("GET", ["api", "debug", "dump"]) => {
            if !state.control.settings_snapshot().debug_api_enabled {
                return not_found();
            }
            result_to_response(state.control.debug_dump().await)
        }

        _ => not_found(),
    }
}
