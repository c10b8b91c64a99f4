//! HTTP Query Server
//!
//! Handlers read the committed ledger only; a block being processed is
//! never visible here.

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use orbit_ledger::LedgerStore;
use serde::Deserialize;
use serde_json::json;
use std::{future::Future, sync::Arc};
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing query parameter: {0}")]
    MissingParameter(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingParameter(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct UserTokensQuery {
    #[serde(default)]
    pub address: Option<String>,
}

/// Query server over a shared ledger store
pub struct ApiServer {
    store: Arc<LedgerStore>,
}

impl ApiServer {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/user_tokens", get(user_tokens))
            .route("/status", get(status))
            .layer(cors)
            .with_state(self.store)
    }

    /// Serve until `shutdown` resolves
    pub async fn run(
        self,
        addr: &str,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web API listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Web API stopped");
        Ok(())
    }
}

async fn user_tokens(
    State(store): State<Arc<LedgerStore>>,
    Query(query): Query<UserTokensQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let address = query
        .address
        .filter(|a| !a.is_empty())
        .ok_or(ApiError::MissingParameter("address"))?;

    tracing::debug!("user_tokens for {}", address);
    let tokens = store.user_tokens(&address);
    Ok(Json(json!({ "user_tokens": tokens })))
}

async fn status(State(store): State<Arc<LedgerStore>>) -> impl IntoResponse {
    Json(json!({ "last_height": store.last_height() }))
}
