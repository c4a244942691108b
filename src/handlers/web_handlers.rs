//! Fronts the web client's origin through the edge cache controller.

use crate::{
    cache_controller::{CacheController, CacheMode, FetchDecision, FetchRequest, FetchResponse, RequestMode},
    errors::AppError,
    handlers::caller::Caller,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri, header},
    response::Response,
};
use serde::Serialize;

/// Request headers forwarded to the origin.
const FORWARDED: [header::HeaderName; 3] =
    [header::ACCEPT, header::ACCEPT_LANGUAGE, header::USER_AGENT];

/// Response headers that belong to the upstream hop only.
const HOP_BY_HOP: [header::HeaderName; 3] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
];

#[derive(Serialize)]
pub struct RefreshResponse {
    pub refreshed: usize,
}

/// GET `/web/{*path}`
pub async fn web_asset(
    State(edge): State<Option<CacheController>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve(edge, &path, method, uri, headers).await
}

/// GET `/web` and `/web/`
pub async fn web_root(
    State(edge): State<Option<CacheController>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve(edge, "", method, uri, headers).await
}

/// POST `/edge/refresh` (admin)
pub async fn refresh_edge(
    State(edge): State<Option<CacheController>>,
    caller: Caller,
) -> Result<Json<RefreshResponse>, AppError> {
    caller.require_admin()?;
    let edge = edge.ok_or_else(|| AppError::unavailable("edge cache is not running"))?;
    let refreshed = edge.refresh_critical_assets().await;
    Ok(Json(RefreshResponse { refreshed }))
}

async fn serve(
    edge: Option<CacheController>,
    path: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let edge = edge.ok_or_else(|| AppError::unavailable("edge cache is not running"))?;
    let request = to_fetch_request(&edge, path, method, &uri, &headers)?;

    let response = match edge.handle_fetch(request.clone()).await {
        FetchDecision::Respond(result) => result?,
        FetchDecision::Passthrough => edge.network().fetch(&request, CacheMode::Default).await?,
    };
    Ok(into_response(response))
}

fn to_fetch_request(
    edge: &CacheController,
    path: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<FetchRequest, AppError> {
    let mut url = edge
        .config()
        .origin
        .join(path)
        .map_err(|err| AppError::bad_request(format!("invalid path: {}", err)))?;
    if url.origin() != edge.config().origin.origin() {
        return Err(AppError::bad_request("path escapes the web origin"));
    }
    url.set_query(uri.query());

    let navigate = headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "navigate")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));

    let mut forwarded = HeaderMap::new();
    for name in FORWARDED {
        if let Some(value) = headers.get(&name) {
            forwarded.insert(name, value.clone());
        }
    }

    Ok(FetchRequest {
        method,
        url,
        mode: if navigate {
            RequestMode::Navigate
        } else {
            RequestMode::Subresource
        },
        headers: forwarded,
    })
}

fn into_response(fetched: FetchResponse) -> Response {
    let mut response = Response::new(Body::from(fetched.body));
    *response.status_mut() = fetched.status;
    let headers = response.headers_mut();
    for (name, value) in &fetched.headers {
        if !HOP_BY_HOP.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_controller::{CacheConfig, MemoryCacheStorage};
    use crate::testing::FakeNetwork;
    use axum::http::{HeaderValue, StatusCode};
    use std::sync::Arc;
    use url::Url;

    fn edge(network: Arc<FakeNetwork>) -> CacheController {
        let origin = Url::parse("https://app.tripbasket.test/").unwrap();
        CacheController::new(
            CacheConfig::tripbasket(origin, "v1"),
            Arc::new(MemoryCacheStorage::new()),
            network,
        )
    }

    #[test]
    fn html_accept_marks_a_navigation() {
        let edge = edge(Arc::new(FakeNetwork::default()));
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,*/*"));
        headers.insert(header::COOKIE, HeaderValue::from_static("secret"));
        let uri: Uri = "/web/trips?id=3".parse().unwrap();

        let req = to_fetch_request(&edge, "trips", Method::GET, &uri, &headers).unwrap();
        assert_eq!(req.url.as_str(), "https://app.tripbasket.test/trips?id=3");
        assert_eq!(req.mode, RequestMode::Navigate);
        assert!(req.headers.get(header::COOKIE).is_none());
    }

    #[test]
    fn protocol_relative_paths_are_rejected() {
        let edge = edge(Arc::new(FakeNetwork::default()));
        let uri: Uri = "/web//evil.test/x".parse().unwrap();
        let err = to_fetch_request(&edge, "//evil.test/x", Method::GET, &uri, &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_controller_is_unavailable() {
        let err = serve(None, "main.dart.js", Method::GET, Uri::from_static("/web/main.dart.js"), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn uncached_api_calls_go_straight_to_origin() {
        let network = Arc::new(FakeNetwork::default());
        let target = Url::parse("https://app.tripbasket.test/api/trips").unwrap();
        network.respond(target, StatusCode::OK, "[]").await;

        let response = serve(
            Some(edge(network.clone())),
            "api/trips",
            Method::GET,
            Uri::from_static("/web/api/trips"),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(network.calls().await.len(), 1);
    }

    #[test]
    fn repeated_origin_headers_all_reach_the_client() {
        let mut fetched = FetchResponse::new(
            StatusCode::OK,
            Url::parse("https://app.tripbasket.test/").unwrap(),
            "<html></html>",
        );
        fetched
            .headers
            .append(header::SET_COOKIE, HeaderValue::from_static("session=abc"));
        fetched
            .headers
            .append(header::SET_COOKIE, HeaderValue::from_static("theme=dark"));
        fetched
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("13"));

        let response = into_response(fetched);
        let cookies: Vec<_> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, ["session=abc", "theme=dark"]);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }
}
