use crate::controller::{health_check_controller, publish_controller, subscribe_controller};
use crate::error::{Error, ResponseFormat, WebErrorKind};
use crate::AppState;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

/// RFC 5785 well-known path both Mercure operations live under.
pub const WELL_KNOWN_PATH: &str = "/.well-known/mercure";

const SERVER_NAME: &str = "mercure-hub";

pub fn define_routes(app_state: AppState) -> Router {
    let cors = cors_layer(&app_state);
    Router::new()
        .merge(mercure_routes(app_state))
        .merge(health_routes())
        .fallback(not_found)
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("same-origin"),
        ))
}

fn mercure_routes(app_state: AppState) -> Router {
    Router::new()
        .route(
            WELL_KNOWN_PATH,
            get(subscribe_controller::subscribe)
                .post(publish_controller::publish)
                .fallback(method_not_allowed),
        )
        .with_state(app_state)
}

fn health_routes() -> Router {
    Router::new().route("/healthz", get(health_check_controller::health_check))
}

async fn not_found(headers: HeaderMap) -> impl IntoResponse {
    Error::new(WebErrorKind::NotFound).with_format(ResponseFormat::negotiate(&headers))
}

async fn method_not_allowed(headers: HeaderMap) -> impl IntoResponse {
    Error::new(WebErrorKind::MethodNotAllowed("GET, POST"))
        .with_format(ResponseFormat::negotiate(&headers))
}

fn cors_layer(app_state: &AppState) -> CorsLayer {
    let origins = &app_state.config().allowed_origins;
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("last-event-id"),
        ])
}
