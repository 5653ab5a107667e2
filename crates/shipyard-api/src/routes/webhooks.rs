//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use shipyard_core::ResourceId;
use shipyard_core::event::RepositoryEvent;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    event: String,
    runs: Vec<ResourceId>,
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let event_type = header("X-GitHub-Event").unwrap_or("unknown").to_string();
    let delivery = header("X-GitHub-Delivery").unwrap_or("-");
    let signature = header("X-Hub-Signature-256");

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let repository = payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|n| n.as_str());

    info!(
        event = %event_type,
        delivery = %delivery,
        repo = ?repository,
        "Received GitHub webhook"
    );

    // The payload is untrusted until the signature checks out, so only
    // configured repositories get that far.
    let Some(repository) = repository.filter(|r| state.is_configured(r)) else {
        warn!(repo = ?repository, delivery = %delivery, "Webhook for unconfigured repository");
        return Err(ApiError::NotFound(format!(
            "repository {} is not configured",
            repository.unwrap_or("<none>")
        )));
    };

    if let Some(secret) = state.webhook_secret(repository) {
        if !verify_github_signature(secret, &body, signature) {
            warn!(repo = ?repository, delivery = %delivery, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    let event = match event_type.as_str() {
        "ping" => {
            info!(repo = %repository, "Ping event received - webhook is configured correctly");
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    event: event_type.clone(),
                    runs: Vec::new(),
                }),
            ));
        }
        "push" => RepositoryEvent::from_github_push(&payload),
        "pull_request" => RepositoryEvent::from_github_pull_request(&payload),
        _ => {
            info!(event = %event_type, "Unhandled event type");
            None
        }
    };

    let runs = match event {
        Some(event) => {
            info!(
                repo = %event.repository,
                git_ref = %event.git_ref,
                sha = %event.sha,
                "Dispatching repository event"
            );
            state.scheduler.dispatch(event).await?
        }
        None => Vec::new(),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            event: event_type,
            runs,
        }),
    ))
}

/// Verify GitHub webhook signature.
pub fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::router;
    use crate::testing::{WEBHOOK_SECRET, body_json, state};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use shipyard_config::parse_workflow;
    use tower::ServiceExt;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn push_payload(repository: &str, git_ref: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": git_ref,
            "after": "4f2c1d9e8b7a6f5e4d3c2b1a0f9e8d7c6b5a4f3e",
            "repository": {
                "full_name": repository,
                "clone_url": format!("https://github.com/{}.git", repository),
            },
            "pusher": { "name": "adeebshihadeh" },
            "head_commit": { "message": "tools: bump plotjuggler" },
            "commits": [
                { "added": [], "modified": ["tools/plotjuggler/juggle.py"], "removed": [] }
            ],
        }))
        .unwrap()
    }

    fn webhook(event: &str, body: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut request = Request::post("/webhooks/github")
            .header("X-GitHub-Event", event)
            .header("X-GitHub-Delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958")
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            request = request.header("X-Hub-Signature-256", signature);
        }
        request.body(Body::from(body)).unwrap()
    }

    #[test]
    fn test_verify_signature() {
        // Example from GitHub's webhook documentation.
        let signature = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify_github_signature(
            WEBHOOK_SECRET,
            b"Hello, World!",
            Some(signature)
        ));
        assert!(!verify_github_signature("wrong", b"Hello, World!", Some(signature)));
        assert!(!verify_github_signature(WEBHOOK_SECRET, b"Hello, World!", None));
        assert!(!verify_github_signature(WEBHOOK_SECRET, b"Hello, World!", Some("sha1=abc")));
        assert!(!verify_github_signature(WEBHOOK_SECRET, b"Hello, World!", Some("sha256=zz")));
    }

    #[tokio::test]
    async fn test_signed_push_queues_run() {
        let state = state(true).await;
        let app = router(state.clone());
        let body = push_payload("commaai/openpilot", "refs/heads/master");
        let signature = sign(WEBHOOK_SECRET, &body);

        let response = app.oneshot(webhook("push", body, Some(signature))).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        let runs = body["runs"].as_array().unwrap();
        assert_eq!(runs.len(), 1);

        let run_id: ResourceId = runs[0].as_str().unwrap().parse().unwrap();
        let run = state.scheduler.store().get(run_id).await.unwrap();
        assert_eq!(run.workflow, "tools");
        assert_eq!(run.event.changed_files, vec!["tools/plotjuggler/juggle.py"]);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let state = state(true).await;
        let body = push_payload("commaai/openpilot", "refs/heads/master");

        let forged = sign("not the secret", &body);
        let response = router(state.clone())
            .oneshot(webhook("push", body.clone(), Some(forged)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(response).await["error"].is_string());

        let response = router(state.clone())
            .oneshot(webhook("push", body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert!(state.scheduler.store().list(&Default::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_repository_is_rejected() {
        let state = state(true).await;
        // Matches any repository, so only the repository check keeps it out.
        let lint = parse_workflow(
            r#"
            workflow "lint"
            on "push"
            job "lint" {
                image "alpine"
                run "echo lint"
            }
            "#,
        )
        .unwrap();
        state.scheduler.register(lint).await.unwrap();

        let body = push_payload("someone/openpilot", "refs/heads/master");
        let response = router(state.clone())
            .oneshot(webhook("push", body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = serde_json::to_vec(&json!({ "ref": "refs/heads/master" })).unwrap();
        let response = router(state.clone())
            .oneshot(webhook("push", body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(state.scheduler.store().list(&Default::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_configured_repository_without_secret_accepts_unsigned() {
        let state = state(true).await;
        let panda = parse_workflow(
            r#"
            workflow "panda"
            repository "commaai/panda"
            on "push" branches="master"
            job "build" {
                image "alpine"
                run "echo build"
            }
            "#,
        )
        .unwrap();
        state.scheduler.register(panda).await.unwrap();

        let body = push_payload("commaai/panda", "refs/heads/master");
        let response = router(state).oneshot(webhook("push", body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["runs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_to_other_branch_queues_nothing() {
        let app = router(state(true).await);
        let body = push_payload("commaai/openpilot", "refs/heads/feature");
        let signature = sign(WEBHOOK_SECRET, &body);
        let response = app.oneshot(webhook("push", body, Some(signature))).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(body_json(response).await["runs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_request_queues_run() {
        let app = router(state(true).await);
        let body = serde_json::to_vec(&json!({
            "action": "opened",
            "number": 31337,
            "repository": { "full_name": "commaai/openpilot" },
            "pull_request": {
                "number": 31337,
                "title": "sim: faster startup",
                "user": { "login": "contributor" },
                "base": { "ref": "master" },
                "head": {
                    "ref": "faster-sim",
                    "sha": "0123456789abcdef",
                    "repo": { "clone_url": "https://github.com/contributor/openpilot.git" }
                }
            }
        }))
        .unwrap();
        let signature = sign(WEBHOOK_SECRET, &body);

        let response = app
            .oneshot(webhook("pull_request", body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["runs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_events() {
        let state = state(true).await;
        let body = serde_json::to_vec(&json!({
            "zen": "Keep it logically awesome.",
            "repository": { "full_name": "commaai/openpilot" }
        }))
        .unwrap();
        let signature = sign(WEBHOOK_SECRET, &body);

        let response = router(state.clone())
            .oneshot(webhook("ping", body.clone(), Some(signature.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(state)
            .oneshot(webhook("issues", body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let app = router(state(true).await);
        let response = app
            .oneshot(webhook("push", b"{not json".to_vec(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
