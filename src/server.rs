use std::sync::Arc;
use axum::{routing::post, Router, Json};
use tower_http::cors::{CorsLayer, Any};
use serde::{Deserialize, Serialize};
use axum::http::StatusCode;
use tracing::{info, warn};
use crate::error::EfapsError;
use crate::interface::EqlInterface;
use crate::statement::{DataRow, StatementResult};

#[derive(Deserialize)]
pub struct EqlRequest {
    pub statement: String,
    #[serde(default)]
    pub actor: Option<i64>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Serialize)]
pub struct FailedInstance {
    pub oid: String,
    pub error: String,
}

#[derive(Serialize, Default)]
pub struct EqlResponse {
    pub id: u64,
    pub status: String,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<DataRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<FailedInstance>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EqlResponse {
    fn from_result(id: u64, elapsed_ms: f64, result: StatementResult) -> Self {
        let mut body = EqlResponse { id, status: "ok".into(), elapsed_ms, ..Default::default() };
        match result {
            StatementResult::Rows(rows) => body.rows = Some(rows),
            StatementResult::Inserted(instance) => body.instances = Some(vec![instance.oid()]),
            StatementResult::Batch(outcome) => {
                if !outcome.is_complete() {
                    body.status = "partial".into();
                }
                body.instances = Some(outcome.succeeded.iter().map(|i| i.oid()).collect());
                body.failed = Some(
                    outcome
                        .failed
                        .iter()
                        .map(|(i, e)| FailedInstance { oid: i.oid(), error: e.to_string() })
                        .collect(),
                );
            }
        }
        body
    }
}

pub fn router(interface: Arc<EqlInterface>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::POST])
        .allow_headers(Any);
    Router::new()
        .route("/v1/eql", post(move |Json(req): Json<EqlRequest>| {
        let iface = Arc::clone(&interface);
        async move {
            // statements run on a blocking thread since the engine is synchronous
            let started = std::time::Instant::now();
            let completed = tokio::task::spawn_blocking(move || {
                iface.run(&req.statement, req.actor, req.locale.as_deref())
            }).await.map_err(|e| {
                warn!(error=%e, "Join error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Join error")
            })?;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let id = completed.id.value();
            match completed.result {
                Ok(result) => {
                    info!(id, ms=elapsed_ms, engine_ms=completed.elapsed.as_secs_f64() * 1000.0, "statement complete");
                    Ok::<_, (StatusCode, &'static str)>((StatusCode::OK, Json(EqlResponse::from_result(id, elapsed_ms, result))))
                }
                Err(e) => {
                    let status = if matches!(e, EfapsError::Parse { .. }) { StatusCode::BAD_REQUEST } else { StatusCode::INTERNAL_SERVER_ERROR };
                    let msg = format!("{e}");
                    warn!(id, %msg, code=%status.as_u16(), "statement error");
                    let body = EqlResponse { id, status: "error".into(), elapsed_ms, error: Some(msg), ..Default::default() };
                    Ok::<_, (StatusCode, &'static str)>((status, Json(body)))
                }
            }
        }
    }))
    .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::BatchOutcome;
    use crate::value::Instance;

    #[test]
    fn failed_instances_make_a_partial_response() {
        let outcome = BatchOutcome {
            succeeded: vec![Instance::new(4, 1)],
            failed: vec![(Instance::new(4, 2), EfapsError::Execution("instance 4.2 does not exist".into()))],
        };
        let body = EqlResponse::from_result(9, 1.5, StatementResult::Batch(outcome));
        assert_eq!(body.status, "partial");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["instances"], serde_json::json!(["4.1"]));
        assert_eq!(json["failed"][0]["oid"], "4.2");
        assert!(json.get("rows").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn inserts_report_the_new_oid() {
        let body = EqlResponse::from_result(1, 0.1, StatementResult::Inserted(Instance::new(3, 8)));
        assert_eq!(body.status, "ok");
        assert_eq!(body.instances, Some(vec!["3.8".to_string()]));
        assert!(body.failed.is_none());
    }
}
