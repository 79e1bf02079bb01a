use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use url::Url;

use storypulse_core::{notify, retry::RetryPolicy, token};
use storypulse_instagram::{GraphClient, GraphError, InstagramOAuthClient, OAuthError};
use storypulse_storage::{
    Database, InstagramToken, LoginStateError, NewInstagramToken, NewLoginState,
    NotificationStoreError, OrganizationError, TokenStoreError,
};

use crate::auth::Caller;
use crate::notifications::Notifier;
use crate::router::Clock;

/// Scopes requested during the Instagram login flow.
pub const OAUTH_SCOPES: &[&str] = &[
    "instagram_business_basic",
    "instagram_business_manage_messages",
];

/// Window in which an issued OAuth `state` can be redeemed by the callback.
const LOGIN_STATE_TTL_MINUTES: i64 = 10;
const LOGIN_STATE_BYTES: usize = 32;

/// Tracks per-organization credential health and renews tokens before they lapse.
#[derive(Clone)]
pub struct TokenManager {
    storage: Database,
    oauth: InstagramOAuthClient,
    graph: GraphClient,
    notifier: Notifier,
    redirect_uri: Url,
    policy: RetryPolicy,
    clock: Clock,
}

/// Caller-facing connection state. The token itself is never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub is_connected: bool,
    pub is_token_expired: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub token_expiry_date: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAccount {
    pub instagram_user_id: String,
    pub username: Option<String>,
    pub token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: u64,
    pub notifications_sent: u64,
    pub refreshed: u64,
    pub refresh_failed: u64,
}

#[derive(Debug, Error)]
pub enum TokenManagerError {
    #[error("organization not found")]
    OrganizationNotFound,
    #[error("organization has no Instagram connection")]
    NotConnected,
    #[error("caller does not own the organization")]
    NotOwner,
    #[error("a refresh is already running for this organization")]
    RefreshInProgress,
    #[error("token refresh failed: {0}")]
    Refresh(#[source] OAuthError),
    #[error("oauth exchange failed: {0}")]
    Exchange(#[source] OAuthError),
    #[error("account lookup failed: {0}")]
    Graph(#[from] GraphError),
    #[error("provider did not report an account id")]
    MissingAccountId,
    #[error("instagram account is already connected to another organization")]
    AccountInUse,
    #[error("oauth state was never issued or was already used")]
    UnknownState,
    #[error("oauth state has expired")]
    StateExpired,
    #[error("failed to build authorize url: {0}")]
    AuthorizeUrl(#[source] OAuthError),
    #[error("login state store error: {0}")]
    LoginState(LoginStateError),
    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),
    #[error(transparent)]
    Notification(#[from] NotificationStoreError),
    #[error("organization store error: {0}")]
    Organization(OrganizationError),
}

impl From<OrganizationError> for TokenManagerError {
    fn from(err: OrganizationError) -> Self {
        match err {
            OrganizationError::InstagramAccountInUse => Self::AccountInUse,
            other => Self::Organization(other),
        }
    }
}

impl From<LoginStateError> for TokenManagerError {
    fn from(err: LoginStateError) -> Self {
        match err {
            LoginStateError::MissingOrganization => Self::OrganizationNotFound,
            other => Self::LoginState(other),
        }
    }
}

impl TokenManager {
    pub fn new(
        storage: Database,
        oauth: InstagramOAuthClient,
        graph: GraphClient,
        notifier: Notifier,
        redirect_uri: Url,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            oauth,
            graph,
            notifier,
            redirect_uri,
            policy,
            clock: std::sync::Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Starts the login flow for the caller's organization.
    ///
    /// The consent URL carries a random `state` stored against the caller; the callback
    /// must present it once, before it expires, to bind the resulting token.
    pub async fn begin_connect(&self, caller: &Caller) -> Result<Url, TokenManagerError> {
        let now = self.now();
        let state = generate_login_state();
        let login_states = self.storage.login_states();

        let purged = login_states.purge_expired(now).await?;
        login_states
            .insert(&NewLoginState {
                state: &state,
                organization_id: &caller.organization_id,
                user_id: &caller.user_id,
                created_at: now,
                expires_at: now + chrono::Duration::minutes(LOGIN_STATE_TTL_MINUTES),
            })
            .await?;
        info!(
            stage = "token",
            organization_id = %caller.organization_id,
            user_id = %caller.user_id,
            purged,
            "instagram login started"
        );

        self.oauth
            .authorize_url(self.redirect_uri.as_str(), &state, OAUTH_SCOPES)
            .map_err(TokenManagerError::AuthorizeUrl)
    }

    /// Handles the OAuth redirect. The organization comes from the stored `state`, never
    /// from the request, and the state is spent whether or not the exchange succeeds.
    pub async fn complete_connect(
        &self,
        state: &str,
        code: &str,
    ) -> Result<ConnectedAccount, TokenManagerError> {
        let login = self
            .storage
            .login_states()
            .consume(state)
            .await?
            .ok_or(TokenManagerError::UnknownState)?;
        if login.is_expired(self.now()) {
            warn!(
                stage = "token",
                organization_id = %login.organization_id,
                user_id = %login.user_id,
                "instagram login state expired"
            );
            return Err(TokenManagerError::StateExpired);
        }
        self.connect(&login.organization_id, code).await
    }

    pub async fn days_until_expiry(
        &self,
        organization_id: &str,
    ) -> Result<Option<i64>, TokenManagerError> {
        let stored = self.storage.tokens().fetch(organization_id).await?;
        Ok(stored.and_then(|t| token::days_until_expiry(t.token_expires_at, self.now())))
    }

    pub async fn needs_refresh(&self, organization_id: &str) -> Result<bool, TokenManagerError> {
        let stored = self.storage.tokens().fetch(organization_id).await?;
        Ok(stored
            .map(|t| token::needs_refresh(t.token_expires_at, self.now()))
            .unwrap_or(false))
    }

    pub async fn status(&self, organization_id: &str) -> Result<TokenStatus, TokenManagerError> {
        let now = self.now();
        let organization = self
            .storage
            .organizations()
            .fetch(organization_id)
            .await?
            .ok_or(TokenManagerError::OrganizationNotFound)?;
        let stored = self.storage.tokens().fetch(organization_id).await?;

        let expiry = stored.as_ref().and_then(|t| t.token_expires_at);
        Ok(TokenStatus {
            is_connected: stored.is_some(),
            is_token_expired: stored.is_some() && token::is_expired(expiry, now),
            last_sync: organization.last_sync_at,
            username: organization.instagram_username,
            token_expiry_date: expiry,
            days_until_expiry: token::days_until_expiry(expiry, now),
        })
    }

    /// Code → short-lived → long-lived token, then caches the account identity on the
    /// organization.
    async fn connect(
        &self,
        organization_id: &str,
        code: &str,
    ) -> Result<ConnectedAccount, TokenManagerError> {
        if self
            .storage
            .organizations()
            .fetch(organization_id)
            .await?
            .is_none()
        {
            return Err(TokenManagerError::OrganizationNotFound);
        }

        let short = self
            .oauth
            .exchange_code(code, self.redirect_uri.as_str())
            .await
            .map_err(TokenManagerError::Exchange)?;
        let long = self
            .oauth
            .exchange_long_lived(&short.access_token)
            .await
            .map_err(TokenManagerError::Exchange)?;
        let me = self.graph.me(&long.access_token).await?;

        let now = self.now();
        let instagram_user_id = me
            .account_id()
            .map(str::to_string)
            .or_else(|| (!short.user_id.is_empty()).then(|| short.user_id.clone()))
            .ok_or(TokenManagerError::MissingAccountId)?;
        let token_expires_at = long.expires_at(now);

        self.storage
            .organizations()
            .update_instagram_identity(
                organization_id,
                &instagram_user_id,
                me.username.as_deref(),
                now,
            )
            .await?;
        self.storage
            .tokens()
            .upsert(
                &NewInstagramToken {
                    organization_id,
                    access_token: &long.access_token,
                    token_expires_at: Some(token_expires_at),
                    instagram_user_id: &instagram_user_id,
                },
                now,
            )
            .await?;

        info!(
            stage = "token",
            %organization_id,
            %instagram_user_id,
            expires_at = %token_expires_at.to_rfc3339(),
            "instagram account connected"
        );
        Ok(ConnectedAccount {
            instagram_user_id,
            username: me.username,
            token_expires_at,
        })
    }

    /// Renews the long-lived token. At most one refresh runs per organization; a failure
    /// keeps the existing token and raises a high-priority notification.
    pub async fn refresh(&self, organization_id: &str) -> Result<DateTime<Utc>, TokenManagerError> {
        let now = self.now();
        let repo = self.storage.tokens();
        let stored = repo
            .fetch(organization_id)
            .await?
            .ok_or(TokenManagerError::NotConnected)?;

        let stale_before = now - self.policy.max_delay;
        if !repo.try_begin_refresh(organization_id, now, stale_before).await? {
            counter!("token_refresh_total", "result" => "in_progress").increment(1);
            return Err(TokenManagerError::RefreshInProgress);
        }

        match self.oauth.refresh_long_lived(&stored.access_token).await {
            Ok(refreshed) => {
                let expires_at = refreshed.expires_at(now);
                repo.complete_refresh(
                    organization_id,
                    &refreshed.access_token,
                    Some(expires_at),
                    now,
                )
                .await?;
                self.storage
                    .organizations()
                    .touch_last_sync(organization_id, now)
                    .await?;
                counter!("token_refresh_total", "result" => "success").increment(1);
                info!(
                    stage = "token",
                    %organization_id,
                    expires_at = %expires_at.to_rfc3339(),
                    "instagram token refreshed"
                );
                Ok(expires_at)
            }
            Err(err) => {
                let reason = refresh_failure_reason(&err);
                repo.fail_refresh(organization_id, &err.to_string(), now).await?;
                counter!("token_refresh_total", "result" => "failure").increment(1);
                warn!(
                    stage = "token",
                    %organization_id,
                    error = %err,
                    "instagram token refresh failed"
                );
                self.notifier
                    .emit(
                        &notify::for_refresh_failure(
                            organization_id,
                            stored.token_expires_at,
                            &reason,
                        ),
                        now,
                    )
                    .await?;
                Err(TokenManagerError::Refresh(err))
            }
        }
    }

    /// Token for a dependent call. An expired token gets exactly one refresh attempt.
    pub async fn access_token_for(
        &self,
        organization_id: &str,
    ) -> Result<String, TokenManagerError> {
        let stored = self
            .storage
            .tokens()
            .fetch(organization_id)
            .await?
            .ok_or(TokenManagerError::NotConnected)?;
        if !token::is_expired(stored.token_expires_at, self.now()) {
            return Ok(stored.access_token);
        }

        self.refresh(organization_id).await?;
        let refreshed = self
            .storage
            .tokens()
            .fetch(organization_id)
            .await?
            .ok_or(TokenManagerError::NotConnected)?;
        Ok(refreshed.access_token)
    }

    /// Deletes the token and cached identity. Only the organization's creator may do this.
    pub async fn disconnect(&self, caller: &Caller) -> Result<bool, TokenManagerError> {
        let organization = self
            .storage
            .organizations()
            .fetch(&caller.organization_id)
            .await?
            .ok_or(TokenManagerError::OrganizationNotFound)?;
        if !organization.is_owned_by(&caller.user_id) {
            warn!(
                stage = "token",
                organization_id = %caller.organization_id,
                user_id = %caller.user_id,
                "disconnect refused for non-owner"
            );
            return Err(TokenManagerError::NotOwner);
        }

        let removed = self
            .storage
            .organizations()
            .disconnect_instagram(&organization.id, self.now())
            .await?;
        info!(
            stage = "token",
            organization_id = %organization.id,
            removed,
            "instagram account disconnected"
        );
        Ok(removed)
    }

    /// Runs the background sweep in its own task.
    pub fn spawn(self, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(every).await;
        })
    }

    async fn run_loop(self, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep(None).await {
                error!(stage = "token", error = %err, "token sweep failed");
            }
        }
    }

    /// Checks every stored token, or only `scope`'s: raises threshold notifications and
    /// refreshes the ones inside the critical window, respecting the retry budget.
    pub async fn sweep(&self, scope: Option<&str>) -> Result<SweepReport, TokenManagerError> {
        let tokens = self.storage.tokens().list_all().await?;
        let mut report = SweepReport::default();

        for stored in tokens
            .iter()
            .filter(|stored| scope.map_or(true, |org| stored.organization_id == org))
        {
            report.checked += 1;
            match self.sweep_one(stored, &mut report).await {
                Ok(()) => {}
                Err(TokenManagerError::Refresh(_)) => report.refresh_failed += 1,
                Err(TokenManagerError::RefreshInProgress) => {}
                Err(err) => {
                    error!(
                        stage = "token",
                        organization_id = %stored.organization_id,
                        error = %err,
                        "token check failed"
                    );
                }
            }
        }

        info!(
            stage = "token",
            checked = report.checked,
            notifications_sent = report.notifications_sent,
            refreshed = report.refreshed,
            refresh_failed = report.refresh_failed,
            "token sweep completed"
        );
        Ok(report)
    }

    async fn sweep_one(
        &self,
        stored: &InstagramToken,
        report: &mut SweepReport,
    ) -> Result<(), TokenManagerError> {
        let now = self.now();
        let expiry = stored.token_expires_at;
        let window = token::expiry_window(expiry, now);
        let days_left = token::days_until_expiry(expiry, now);

        if let Some(notification) =
            notify::for_token_window(&stored.organization_id, expiry, window, days_left)
        {
            if self.notifier.emit(&notification, now).await? {
                report.notifications_sent += 1;
            }
        }

        if !token::needs_refresh(expiry, now) {
            return Ok(());
        }
        let failures = u32::try_from(stored.refresh_failures).unwrap_or(u32::MAX);
        if self.policy.is_exhausted(failures) {
            return Ok(());
        }
        if failures > 0 && !self.policy.is_due(stored.last_refresh_attempt_at, failures, now) {
            return Ok(());
        }

        self.refresh(&stored.organization_id).await?;
        report.refreshed += 1;
        Ok(())
    }
}

fn generate_login_state() -> String {
    let mut bytes = [0u8; LOGIN_STATE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn refresh_failure_reason(err: &OAuthError) -> String {
    match err {
        OAuthError::Status { status, .. } => format!("provider answered {status}"),
        OAuthError::Http(_) => "provider unreachable".to_string(),
        OAuthError::EmptyResponse | OAuthError::Url(_) => "unexpected provider response".to_string(),
    }
}
