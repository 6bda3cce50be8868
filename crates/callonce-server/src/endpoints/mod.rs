use axum::Router;
use axum::middleware;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::request_cache::attach_cache;
use crate::service::RequestService;

mod error;
mod metrics;
mod teams;
mod users;

pub use error::ResponseError;
use metrics::MetricsLayer;

use teams::get_team;
use users::get_user;

pub async fn healthcheck() -> &'static str {
    crate::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: RequestService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(middleware::from_fn_with_state(service.clone(), attach_cache));

    Router::new()
        .route("/users/:id", get(get_user))
        .route("/teams/:id", get(get_team))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use callonce_test::Server;
    use reqwest::StatusCode;
    use serde_json::{Value, json};

    use crate::config::{Config, DirectoryConfig};

    use super::*;

    fn test_service() -> RequestService {
        RequestService::create(&Config {
            directory: DirectoryConfig {
                latency: Duration::from_millis(20),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn get_json(server: &Server, path: &str) -> (StatusCode, Value) {
        let response = reqwest::get(server.url(path)).await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_healthcheck() {
        callonce_test::setup();

        let server = Server::with_router(create_app(test_service()));
        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_user_fanout_is_coalesced() {
        callonce_test::setup();

        let service = test_service();
        let server = Server::with_router(create_app(service.clone()));

        let (status, body) = get_json(&server, "/users/1?fanout=8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "Alice");
        assert_eq!(body["loads"], 8);
        assert_eq!(body["cache"], json!({"hits": 0, "misses": 1, "dedups": 7}));
        assert_eq!(service.directory().fetches(), 1);

        // Every request gets its own cache.
        let (status, _) = get_json(&server, "/users/1?fanout=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(service.directory().fetches(), 2);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        callonce_test::setup();

        let service = test_service();
        let server = Server::with_router(create_app(service.clone()));

        let (status, body) = get_json(&server, "/users/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "user `404` does not exist");
        assert_eq!(service.directory().fetches(), 1);
    }

    #[tokio::test]
    async fn test_invalid_fanout() {
        callonce_test::setup();

        let server = Server::with_router(create_app(test_service()));

        let (status, body) = get_json(&server, "/users/1?fanout=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "fanout must be between 1 and 64");
    }

    #[tokio::test]
    async fn test_unavailable_directory() {
        callonce_test::setup();

        let service = test_service();
        let server = Server::with_router(create_app(service.clone()));

        let (status, body) = get_json(&server, "/users/unavailable-1?fanout=3").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["detail"], "failed to load from the directory");
        assert_eq!(
            body["causes"],
            json!(["directory is unavailable for `unavailable-1`"])
        );
        assert_eq!(service.directory().fetches(), 1);
    }

    #[tokio::test]
    async fn test_team_members_and_owner() {
        callonce_test::setup();

        let service = test_service();
        let server = Server::with_router(create_app(service.clone()));

        let (status, body) = get_json(&server, "/teams/core").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Core");
        assert_eq!(body["owner"]["id"], "1");
        assert_eq!(body["members"].as_array().unwrap().len(), 3);
        assert_eq!(body["cache"], json!({"hits": 1, "misses": 4, "dedups": 1}));

        // The team and three distinct members, the owner is reused from the members.
        assert_eq!(service.directory().fetches(), 4);
    }

    #[tokio::test]
    async fn test_unknown_team() {
        callonce_test::setup();

        let server = Server::with_router(create_app(test_service()));

        let (status, _) = get_json(&server, "/teams/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
