//! HTTP submission surface for order messages.
//!
//! Validates the raw body and the three required headers, then hands the
//! message to the queue. Everything past the queue belongs to the ingestion
//! pipeline; this crate never parses payloads.

pub mod kafka;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use thiserror::Error;
use tracing::{info, warn};

pub const HEADER_COMPANY_ID: &str = "CompanyId";
pub const HEADER_MESSAGE_TYPE: &str = "MessageType";
pub const HEADER_SENDER_ID: &str = "SenderId";

pub const MSG_ACCEPTED: &str = "订单提交成功，正在处理中";
pub const MSG_EMPTY_BODY: &str = "订单报文为空";
pub const MSG_EMPTY_COMPANY_ID: &str = "公司ID为空";
pub const MSG_EMPTY_MESSAGE_TYPE: &str = "消息类型为空";
pub const MSG_EMPTY_SENDER_ID: &str = "发送者ID为空";
pub const MSG_SUBMIT_FAILED: &str = "订单提交失败";
pub const MSG_HEALTHY: &str = "Order Service is healthy";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("queue publish failed: {reason}")]
    Failed { reason: String },
}

/// Seam between the HTTP surface and the queue so tests never need a broker.
pub trait QueuePublisher: Send + Sync + 'static {
    fn publish(
        &self,
        payload: &str,
        headers: &HashMap<String, String>,
    ) -> impl Future<Output = std::result::Result<(), PublishError>> + Send;
}

pub fn router<P: QueuePublisher>(publisher: Arc<P>) -> Router {
    Router::new()
        .route("/api/orders/submit", post(submit_order::<P>))
        .route("/api/orders/health", get(health))
        .with_state(publisher)
}

/// Bind and serve until the process exits.
pub async fn serve<P: QueuePublisher>(bind_addr: &str, publisher: Arc<P>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "order ingress listening");
    axum::serve(listener, router(publisher)).await?;
    Ok(())
}

async fn submit_order<P: QueuePublisher>(
    State(publisher): State<Arc<P>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    if body.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, MSG_EMPTY_BODY.to_string());
    }

    let Some(company_id) = header_value(&headers, HEADER_COMPANY_ID) else {
        return (StatusCode::BAD_REQUEST, MSG_EMPTY_COMPANY_ID.to_string());
    };
    let Some(message_type) = header_value(&headers, HEADER_MESSAGE_TYPE) else {
        return (StatusCode::BAD_REQUEST, MSG_EMPTY_MESSAGE_TYPE.to_string());
    };
    let Some(sender_id) = header_value(&headers, HEADER_SENDER_ID) else {
        return (StatusCode::BAD_REQUEST, MSG_EMPTY_SENDER_ID.to_string());
    };

    let mut queue_headers = HashMap::new();
    queue_headers.insert(HEADER_COMPANY_ID.to_string(), company_id.clone());
    queue_headers.insert(HEADER_MESSAGE_TYPE.to_string(), message_type);
    queue_headers.insert(HEADER_SENDER_ID.to_string(), sender_id);

    match publisher.publish(&body, &queue_headers).await {
        Ok(()) => {
            info!(company_id, "order message accepted");
            (StatusCode::OK, MSG_ACCEPTED.to_string())
        }
        Err(e) => {
            warn!(company_id, error = %e, "failed to forward order message");
            (StatusCode::INTERNAL_SERVER_ERROR, MSG_SUBMIT_FAILED.to_string())
        }
    }
}

async fn health() -> (StatusCode, String) {
    (StatusCode::OK, MSG_HEALTHY.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
