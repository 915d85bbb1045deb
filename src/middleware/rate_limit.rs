use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use axum::body::Body;
use http::{header, HeaderValue, StatusCode};
use tower_governor::GovernorError;

const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Error handler shared by every limiter. A rejected request gets the same
/// `{"error":{code,message}}` shape as `AppError` plus `Retry-After`.
pub fn rate_limit_error(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let body = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": "Rate limit exceeded",
                    "details": { "retry_after_seconds": wait_time }
                }
            })
            .to_string();

            let mut resp = json_response(StatusCode::TOO_MANY_REQUESTS, body);
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(wait_time));
            resp
        }
        GovernorError::UnableToExtractKey => {
            let body = serde_json::json!({
                "error": {
                    "code": "INVALID_REQUEST",
                    "message": "Unable to determine client IP for rate limiting"
                }
            })
            .to_string();
            json_response(StatusCode::BAD_REQUEST, body)
        }
        GovernorError::Other { code, msg, headers } => {
            let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp
        }
    }
}

fn json_response(status: StatusCode, body: String) -> http::Response<Body> {
    let mut resp = http::Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Run `sweep` every minute on a plain thread until `stop` is set. `sweep`
/// drops stale limiter entries and returns how many keys remain.
pub fn spawn_limiter_cleaner<F>(name: &'static str, stop: Arc<AtomicBool>, sweep: F) -> JoinHandle<()>
where
    F: Fn() -> usize + Send + 'static,
{
    std::thread::spawn(move || {
        // Sleep in short ticks so shutdown is noticed quickly.
        let tick = Duration::from_secs(1);
        loop {
            for _ in 0..CLEANUP_INTERVAL_SECS {
                if stop.load(Ordering::SeqCst) {
                    tracing::info!("{} rate limiter cleanup thread exiting", name);
                    return;
                }
                std::thread::sleep(tick);
            }
            let remaining = sweep();
            tracing::debug!("{} rate limiter size: {}", name, remaining);
        }
    })
}
