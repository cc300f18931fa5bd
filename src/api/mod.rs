pub mod ws;

use std::convert::Infallible;

use serde::Serialize;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Mirrors the teacher's `handle_rejection` shape: every rejection becomes
/// a JSON `{message}` body with an appropriate status instead of warp's
/// default plaintext. Origin rejection is no longer one of these cases:
/// a disallowed origin is only discoverable after the WS upgrade, so it
/// is surfaced as a `{type:"error"}` WS frame by the upgrade handler in
/// `ws.rs`, not an HTTP-layer rejection here.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { message }),
        code,
    ))
}
