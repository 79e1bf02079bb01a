use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::Trigger;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tokens::{SweepReport, TokenManagerError, TokenStatus};

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenStatus>, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let status = state
        .tokens()
        .status(&caller.organization_id)
        .await
        .map_err(token_problem)?;
    Ok(Json(status))
}

/// Returns the consent URL for the caller's organization.
pub async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let url = state
        .tokens()
        .begin_connect(&caller)
        .await
        .map_err(token_problem)?;
    Ok(Json(json!({ "authorizeUrl": url.as_str() })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth redirect target. Unauthenticated; `state` must be one issued by [`connect`].
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    if let Some(error) = query.error {
        warn!(stage = "token", %error, "instagram authorization denied");
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "authorization_denied",
            query.error_description.unwrap_or(error),
        ));
    }
    let (Some(code), Some(login_state)) = (query.code, query.state) else {
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_callback",
            "code and state are required",
        ));
    };

    let account = state
        .tokens()
        .complete_connect(&login_state, &code)
        .await
        .map_err(token_problem)?;
    Ok(Json(json!({
        "connected": true,
        "username": account.username,
        "tokenExpiryDate": account.token_expires_at,
    })))
}

pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let expires_at = state
        .tokens()
        .refresh(&caller.organization_id)
        .await
        .map_err(token_problem)?;
    Ok(Json(json!({ "tokenExpiryDate": expires_at })))
}

pub async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let caller = state.authenticator().caller(&headers, state.now())?;
    let removed = state
        .tokens()
        .disconnect(&caller)
        .await
        .map_err(token_problem)?;
    Ok(Json(json!({ "disconnected": true, "tokenRemoved": removed })))
}

/// Token sweep trigger. The scheduler sweeps every organization; a user only their own.
pub async fn check_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ProblemResponse> {
    let scope = match state.authenticator().trigger(&headers, state.now())? {
        Trigger::Cron => None,
        Trigger::User(caller) => Some(caller.organization_id),
    };
    let report = state
        .tokens()
        .sweep(scope.as_deref())
        .await
        .map_err(token_problem)?;
    Ok(Json(report))
}

pub(crate) fn token_problem(err: TokenManagerError) -> ProblemResponse {
    match err {
        TokenManagerError::OrganizationNotFound => ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "organization_not_found",
            err.to_string(),
        ),
        TokenManagerError::NotConnected => {
            ProblemResponse::new(StatusCode::NOT_FOUND, "not_connected", err.to_string())
        }
        TokenManagerError::NotOwner => {
            ProblemResponse::new(StatusCode::FORBIDDEN, "not_owner", err.to_string())
        }
        TokenManagerError::RefreshInProgress => {
            ProblemResponse::new(StatusCode::CONFLICT, "refresh_in_progress", err.to_string())
        }
        TokenManagerError::AccountInUse => {
            ProblemResponse::new(StatusCode::CONFLICT, "account_in_use", err.to_string())
        }
        TokenManagerError::UnknownState => {
            warn!(stage = "token", "instagram callback with unknown state");
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_state", err.to_string())
        }
        TokenManagerError::StateExpired => {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "state_expired", err.to_string())
        }
        TokenManagerError::Refresh(_) => ProblemResponse::new(
            StatusCode::BAD_GATEWAY,
            "token_refresh_failed",
            "the provider rejected the token refresh",
        ),
        TokenManagerError::Exchange(_)
        | TokenManagerError::Graph(_)
        | TokenManagerError::MissingAccountId => {
            warn!(stage = "token", error = %err, "instagram connect failed");
            ProblemResponse::new(
                StatusCode::BAD_GATEWAY,
                "oauth_exchange_failed",
                "the provider did not complete the connection",
            )
        }
        other => ProblemResponse::internal("token", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use chrono::Duration;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use tower::ServiceExt;
    use url::Url;

    use crate::router::{app_router, test_support};

    async fn call(state: AppState, method: &str, uri: &str, bearer: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(bearer) = bearer {
            request = request.header("Authorization", format!("Bearer {bearer}"));
        }
        let response = app_router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn status_never_exposes_token() {
        let state = test_support::setup_state().await;
        test_support::seed_token(state.storage(), "org-1", state.now() + Duration::days(20)).await;
        let token = test_support::caller_token("owner-1", "org-1");

        let (status, body) = call(state, "GET", "/instagram/status", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isConnected"], true);
        assert_eq!(body["isTokenExpired"], false);
        assert!(body.get("tokenExpiryDate").is_some());
        assert!(!body.to_string().contains("stored-token"));
    }

    fn issued_state(body: &Value) -> String {
        let url = Url::parse(body["authorizeUrl"].as_str().expect("url")).expect("parse");
        url.query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .expect("state param")
    }

    async fn mock_exchange(server: &MockServer) -> httpmock::Mock<'_> {
        let exchange = server
            .mock_async(|when, then| {
                when.method(POST).path("/graph/oauth/access_token");
                then.status(200)
                    .json_body(json!({ "access_token": "short", "user_id": "ig-new" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/graph/access_token");
                then.status(200).json_body(json!({
                    "access_token": "long",
                    "token_type": "bearer",
                    "expires_in": 5184000
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/graph/me");
                then.status(200)
                    .json_body(json!({ "user_id": "ig-new", "username": "venue" }));
            })
            .await;
        exchange
    }

    #[tokio::test]
    async fn connect_issues_random_state_bound_to_caller() {
        let state = test_support::setup_state().await;
        let token = test_support::caller_token("owner-1", "org-1");

        let (status, body) = call(state.clone(), "GET", "/instagram/connect", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["authorizeUrl"]
            .as_str()
            .expect("url")
            .contains("response_type=code"));
        let issued = issued_state(&body);
        assert_ne!(issued, "org-1");
        assert_eq!(issued.len(), 43);

        let (_, again) = call(state.clone(), "GET", "/instagram/connect", Some(&token)).await;
        assert_ne!(issued_state(&again), issued);

        let login = state
            .storage()
            .login_states()
            .consume(&issued)
            .await
            .expect("consume")
            .expect("stored");
        assert_eq!(login.organization_id, "org-1");
        assert_eq!(login.user_id, "owner-1");
    }

    #[tokio::test]
    async fn callback_rejects_forged_and_replayed_state() {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server).await;
        let config = test_support::test_config(&server.url("/graph/"), "http://127.0.0.1:9/");
        let state = test_support::setup_state_with(&config).await;
        test_support::seed_organization(state.storage(), "org-2", "owner-2", None).await;

        // An organization id is not a valid state.
        let (status, body) = call(
            state.clone(),
            "GET",
            "/instagram/callback?code=attacker-code&state=org-2",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_state");
        exchange.assert_hits_async(0).await;

        let token = test_support::caller_token("owner-2", "org-2");
        let (_, body) = call(state.clone(), "GET", "/instagram/connect", Some(&token)).await;
        let issued = issued_state(&body);
        let uri = format!("/instagram/callback?code=auth-code&state={issued}");

        let (status, body) = call(state.clone(), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], true);
        assert_eq!(body["username"], "venue");

        let (status, body) = call(state.clone(), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_state");
        exchange.assert_hits_async(1).await;

        let stored = state.storage().tokens().fetch("org-2").await.expect("fetch").expect("token");
        assert_eq!(stored.instagram_user_id, "ig-new");
        assert!(state.storage().tokens().fetch("org-1").await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn callback_refuses_expired_state() {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server).await;
        let config = test_support::test_config(&server.url("/graph/"), "http://127.0.0.1:9/");
        let issued_at = test_support::now_secs();
        let state = test_support::setup_state_with(&config)
            .await
            .with_clock(test_support::fixed_clock(issued_at));
        let token = test_support::caller_token("owner-1", "org-1");
        let (_, body) = call(state.clone(), "GET", "/instagram/connect", Some(&token)).await;
        let issued = issued_state(&body);

        let later = state.with_clock(test_support::fixed_clock(issued_at + Duration::minutes(11)));
        let (status, body) = call(
            later,
            "GET",
            &format!("/instagram/callback?code=auth-code&state={issued}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "state_expired");
        exchange.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn disconnect_by_non_owner_is_forbidden() {
        let state = test_support::setup_state().await;
        test_support::seed_token(state.storage(), "org-1", state.now() + Duration::days(20)).await;
        let member = test_support::caller_token("member-7", "org-1");

        let (status, body) = call(state.clone(), "POST", "/instagram/disconnect", Some(&member)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["type"], "not_owner");

        let owner = test_support::caller_token("owner-1", "org-1");
        let (status, body) = call(state.clone(), "POST", "/instagram/disconnect", Some(&owner)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tokenRemoved"], true);

        let organization = state
            .storage()
            .organizations()
            .fetch("org-1")
            .await
            .expect("fetch")
            .expect("organization");
        assert!(organization.instagram_user_id.is_none());
        assert!(state.storage().tokens().fetch("org-1").await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn token_sweep_scopes_users_to_their_organization() {
        let state = test_support::setup_state().await;
        test_support::seed_organization(state.storage(), "org-2", "owner-2", None).await;
        let far = state.now() + Duration::days(45);
        test_support::seed_token(state.storage(), "org-1", far).await;
        test_support::seed_token(state.storage(), "org-2", far).await;
        let token = test_support::caller_token("owner-1", "org-1");

        let (status, body) = call(state.clone(), "POST", "/internal/tokens/check", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checked"], 1);

        let (status, body) = call(
            state.clone(),
            "POST",
            "/internal/tokens/check",
            Some(test_support::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checked"], 2);

        let (status, _) = call(state, "POST", "/internal/tokens/check", Some("nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn callback_reports_denied_authorization() {
        let state = test_support::setup_state().await;
        let (status, body) = call(
            state,
            "GET",
            "/instagram/callback?error=access_denied&error_description=user+denied",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "authorization_denied");
    }
}
