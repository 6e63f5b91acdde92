// ABOUTME: Endpoint orchestration: PAR, authorize, consent, token, revoke, introspect
// ABOUTME: Composes the managers and enforces prompt semantics and error propagation
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Provider
//!
//! The orchestrator behind every endpoint. Handlers stay thin: they parse
//! transport details and call into here; this module owns grant
//! allow-listing, prompt semantics, session eligibility, and the
//! error-to-redirect rules.

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use crate::accounts::{AccountHooks, AccountManager, NoopAccountHooks};
use crate::clients::{fetcher::MetadataFetcher, loopback::LoopbackPolicy, ClientCredentials, ClientManager};
use crate::constants::sessions::AUTHENTICATION_MAX_AGE_SECS;
use crate::constants::tokens::{ACCESS_TOKEN_EXPIRY_SECS, INTROSPECTION_FLOOR_MS};
use crate::device::DeviceManager;
use crate::dpop::{DpopNonceManager, DpopVerifier, VerifiedDpop};
use crate::errors::{OAuthError, OAuthResult};
use crate::models::{
    AccountSession, AuthorizationParameters, ClientMetadata, IntrospectionResponse, ParResponse,
    Prompt, TokenResponse, GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN,
};
use crate::replay::ReplayManager;
use crate::requests::RequestManager;
use crate::signer::{JsonWebKeySet, Signer};
use crate::store::memory::MemoryStore;
use crate::tokens::TokenManager;

pub mod csrf;
pub mod routes;

/// Provider-level configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Issuer origin, e.g. `https://auth.example`
    pub issuer: String,
    /// Resource audience stamped on accounts created by sign-up
    pub default_audience: String,
    /// Access token lifetime
    pub access_token_expiry_secs: i64,
    /// Sessions older than this require re-authentication
    pub authentication_max_age_secs: i64,
    /// Key for device cookie signing
    pub cookie_secret: Vec<u8>,
    /// Clients trusted to skip the consent screen
    pub first_party_clients: Vec<String>,
    /// Whether loopback (development) client ids are accepted
    pub allow_loopback_clients: bool,
}

impl ProviderConfig {
    /// Sensible defaults around a required issuer
    #[must_use]
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: issuer.trim_end_matches('/').to_owned(),
            default_audience: issuer.trim_end_matches('/').to_owned(),
            access_token_expiry_secs: ACCESS_TOKEN_EXPIRY_SECS,
            authentication_max_age_secs: AUTHENTICATION_MAX_AGE_SECS,
            cookie_secret: Vec::new(),
            first_party_clients: Vec::new(),
            allow_loopback_clients: true,
        }
    }
}

/// Server metadata document (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
    pub revocation_endpoint: String,
    pub introspection_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub token_endpoint_auth_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub dpop_signing_alg_values_supported: Vec<String>,
    pub require_pushed_authorization_requests: bool,
    pub authorization_response_iss_parameter_supported: bool,
    pub client_id_metadata_document_supported: bool,
}

/// What `/oauth/authorize` decided
#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// Send the user agent to the client, carrying a code or an error
    Redirect(String),
    /// Render the interactive page
    Consent(ConsentPage),
}

/// Everything the consent page needs to render
#[derive(Debug)]
pub struct ConsentPage {
    pub request_uri: String,
    pub csrf_token: String,
    pub client: ClientMetadata,
    pub scope: Option<String>,
    pub login_hint: Option<String>,
    pub sessions: Vec<SessionView>,
    /// Set when `prompt=login` forced re-authentication
    pub force_login: bool,
}

/// A session as shown on the account picker
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub login_required: bool,
    pub consent_required: bool,
}

/// Builder assembling a provider over concrete stores
pub struct ProviderBuilder {
    config: ProviderConfig,
    hooks: Arc<dyn AccountHooks>,
    memory: Option<Arc<MemoryStore>>,
    fetcher: Option<MetadataFetcher>,
    signer: Option<Signer>,
}

impl ProviderBuilder {
    #[must_use]
    pub fn with_memory_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.memory = Some(store);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn AccountHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: MetadataFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Assemble the provider
    ///
    /// # Errors
    /// Returns an error when no store was supplied or key generation fails
    pub fn build(self) -> anyhow::Result<Provider> {
        let store = self
            .memory
            .ok_or_else(|| anyhow!("ProviderBuilder requires a store"))?;
        let config = self.config;

        let signer = Arc::new(match self.signer {
            Some(signer) => signer,
            None => Signer::generate(&config.issuer)?,
        });
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => MetadataFetcher::new()?,
        };

        let cookie_secret: Vec<u8> = if config.cookie_secret.is_empty() {
            let mut secret = vec![0u8; 32];
            SystemRandom::new()
                .fill(&mut secret)
                .map_err(|_| anyhow!("System RNG failure"))?;
            secret
        } else {
            config.cookie_secret.clone()
        };

        let replay = ReplayManager::new(store.clone());
        let devices = DeviceManager::new(store.clone(), &cookie_secret);
        let accounts = AccountManager::new(
            store.clone(),
            store.clone(),
            self.hooks,
            &config.default_audience,
        );
        let loopback = LoopbackPolicy {
            enabled: config.allow_loopback_clients,
            ..LoopbackPolicy::default()
        };
        let clients = ClientManager::new(
            fetcher,
            loopback,
            replay.clone(),
            &config.issuer,
            config.first_party_clients.clone(),
        );
        let requests = RequestManager::new(store.clone(), replay.clone());
        let tokens = TokenManager::new(
            store.clone(),
            signer.clone(),
            config.access_token_expiry_secs,
        );
        let dpop = DpopVerifier::new(replay, DpopNonceManager::generate()?);

        Ok(Provider {
            config,
            signer,
            devices,
            accounts,
            clients,
            requests,
            tokens,
            dpop,
            rng: SystemRandom::new(),
        })
    }
}

/// The authorization server core
pub struct Provider {
    config: ProviderConfig,
    signer: Arc<Signer>,
    pub devices: DeviceManager,
    pub accounts: AccountManager,
    pub clients: ClientManager,
    pub requests: RequestManager,
    pub tokens: TokenManager,
    pub dpop: DpopVerifier,
    rng: SystemRandom,
}

impl Provider {
    /// Start a builder
    #[must_use]
    pub fn builder(config: ProviderConfig) -> ProviderBuilder {
        ProviderBuilder {
            config,
            hooks: Arc::new(NoopAccountHooks),
            memory: None,
            fetcher: None,
            signer: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }

    /// `/.well-known/oauth-authorization-server`
    #[must_use]
    pub fn server_metadata(&self) -> ServerMetadata {
        let issuer = &self.config.issuer;
        ServerMetadata {
            issuer: issuer.clone(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            pushed_authorization_request_endpoint: format!("{issuer}/oauth/par"),
            revocation_endpoint: format!("{issuer}/oauth/revoke"),
            introspection_endpoint: format!("{issuer}/oauth/introspect"),
            jwks_uri: format!("{issuer}/oauth/jwks"),
            response_types_supported: vec!["code".to_owned()],
            grant_types_supported: vec![
                GRANT_AUTHORIZATION_CODE.to_owned(),
                GRANT_REFRESH_TOKEN.to_owned(),
            ],
            code_challenge_methods_supported: vec!["S256".to_owned(), "plain".to_owned()],
            token_endpoint_auth_methods_supported: vec![
                "none".to_owned(),
                "private_key_jwt".to_owned(),
            ],
            token_endpoint_auth_signing_alg_values_supported: vec![
                "RS256".to_owned(),
                "ES256".to_owned(),
            ],
            scopes_supported: vec!["atproto".to_owned()],
            dpop_signing_alg_values_supported: vec!["RS256".to_owned(), "ES256".to_owned()],
            require_pushed_authorization_requests: true,
            authorization_response_iss_parameter_supported: true,
            client_id_metadata_document_supported: true,
        }
    }

    /// `/oauth/jwks`
    ///
    /// # Errors
    /// `server_error` if key serialization fails
    pub fn jwks(&self) -> OAuthResult<JsonWebKeySet> {
        self.signer.get_jwks().map_err(OAuthError::from)
    }

    /// `POST /oauth/par` (RFC 9126)
    ///
    /// # Errors
    /// Anything, with interaction errors downgraded to `invalid_request`
    pub async fn pushed_authorization_request(
        &self,
        form: &HashMap<String, String>,
        dpop: Option<&VerifiedDpop>,
    ) -> OAuthResult<ParResponse> {
        let result = self.par_inner(form, dpop).await;
        result.map_err(OAuthError::downgrade_for_par)
    }

    async fn par_inner(
        &self,
        form: &HashMap<String, String>,
        dpop: Option<&VerifiedDpop>,
    ) -> OAuthResult<ParResponse> {
        let credentials = credentials_from_form(form)?;
        let client = self.clients.get_client(credentials.client_id()).await?;
        let (client_auth, _nonce) = self
            .clients
            .verify_credentials(&client, &credentials)
            .await?;

        if !client.allows_grant_type(GRANT_AUTHORIZATION_CODE) {
            return Err(OAuthError::UnauthorizedClient(
                "Client is not registered for the authorization_code grant".to_owned(),
            ));
        }

        let parameters = if let Some(request_object) = form.get("request") {
            let decoded = self
                .clients
                .decode_request_object(&client, request_object)
                .await?;
            let declared_client = form.get("client_id").map(String::as_str);
            if declared_client.is_some_and(|id| id != client.client_id) {
                return Err(OAuthError::InvalidRequest(
                    "client_id does not match the request object".to_owned(),
                ));
            }
            decoded.parameters
        } else {
            parameters_from_form(form)
        };

        let created = self
            .requests
            .create_authorization_request(
                &client,
                client_auth,
                parameters,
                None,
                dpop.map(|d| d.jkt.as_str()),
            )
            .await?;

        Ok(ParResponse {
            request_uri: created.uri,
            expires_in: (created.expires_at - Utc::now()).num_seconds().max(0),
        })
    }

    /// `GET /oauth/authorize`
    ///
    /// Once the request record is loaded its `redirect_uri` is validated, so
    /// every later failure is wrapped into a redirect back to the client.
    ///
    /// # Errors
    /// Direct errors only before the redirect target is known
    pub async fn authorize(
        &self,
        device_id: &str,
        client_id: &str,
        request_uri: &str,
    ) -> OAuthResult<AuthorizeOutcome> {
        let client = self.clients.get_client(client_id).await?;
        let record = self
            .requests
            .get_for_authorize(request_uri, device_id, client_id)
            .await?;
        let parameters = record.parameters.clone();

        match self
            .decide_interaction(device_id, &client, &record.uri, &parameters)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_interaction_error() => {
                // The redirect target is validated: notify the client
                // instead of rendering an error page.
                self.requests.delete(request_uri).await?;
                Ok(AuthorizeOutcome::Redirect(error_redirect(
                    &self.config.issuer,
                    &parameters,
                    &err,
                )))
            }
            Err(err) => Err(err),
        }
    }

    async fn decide_interaction(
        &self,
        device_id: &str,
        client: &ClientMetadata,
        request_uri: &str,
        parameters: &AuthorizationParameters,
    ) -> OAuthResult<AuthorizeOutcome> {
        let sessions = self.accounts.list_sessions(device_id).await?;
        let views: Vec<SessionView> = sessions
            .iter()
            .map(|session| self.session_view(client, session))
            .collect();
        let prompt = parameters.parsed_prompt();
        let hint = parameters.login_hint.as_deref();

        let matching: Vec<&SessionView> = views
            .iter()
            .filter(|view| match hint {
                Some(hint) => {
                    view.sub == hint || view.username.as_deref() == Some(hint)
                }
                None => true,
            })
            .collect();

        match prompt {
            Some(Prompt::None) => {
                let usable: Vec<&&SessionView> = matching
                    .iter()
                    .filter(|v| !v.login_required && !v.consent_required)
                    .collect();
                match usable.as_slice() {
                    [single] => {
                        let sub = single.sub.clone();
                        return self
                            .complete_authorization(device_id, client, request_uri, &sub)
                            .await
                            .map(AuthorizeOutcome::Redirect);
                    }
                    [] => {
                        if matching.iter().any(|v| !v.login_required) {
                            return Err(OAuthError::ConsentRequired);
                        }
                        return Err(OAuthError::LoginRequired);
                    }
                    _ => return Err(OAuthError::AccountSelectionRequired),
                }
            }
            Some(Prompt::Login) => {
                return Ok(AuthorizeOutcome::Consent(self.consent_page(
                    client.clone(),
                    request_uri,
                    parameters,
                    Vec::new(),
                    true,
                )?));
            }
            Some(Prompt::Consent) | Some(Prompt::SelectAccount) => {
                // Never auto-select, even on a unique hint match
            }
            None => {
                // Default: a unique hint match with nothing left to ask
                // short-circuits straight to the redirect
                if hint.is_some() {
                    if let [single] = matching.as_slice() {
                        if !single.login_required && !single.consent_required {
                            let sub = single.sub.clone();
                            return self
                                .complete_authorization(device_id, client, request_uri, &sub)
                                .await
                                .map(AuthorizeOutcome::Redirect);
                        }
                    }
                }
            }
        }

        Ok(AuthorizeOutcome::Consent(self.consent_page(
            client.clone(),
            request_uri,
            parameters,
            views,
            false,
        )?))
    }

    fn session_view(&self, client: &ClientMetadata, session: &AccountSession) -> SessionView {
        let age = Utc::now() - session.info.authenticated_at;
        let login_required =
            age >= Duration::seconds(self.config.authentication_max_age_secs);
        // TODO: track consented scopes per client; any prior consent
        // currently grants all requested scopes.
        let consent_required = !(client.is_first_party
            || session
                .info
                .authorized_clients
                .iter()
                .any(|c| c == &client.client_id));
        SessionView {
            sub: session.account.sub.clone(),
            username: session.account.preferred_username.clone(),
            login_required,
            consent_required,
        }
    }

    fn consent_page(
        &self,
        client: ClientMetadata,
        request_uri: &str,
        parameters: &AuthorizationParameters,
        sessions: Vec<SessionView>,
        force_login: bool,
    ) -> OAuthResult<ConsentPage> {
        let mut bytes = [0u8; 24];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| anyhow!("System RNG failure"))
            .map_err(OAuthError::from)?;
        Ok(ConsentPage {
            request_uri: request_uri.to_owned(),
            csrf_token: URL_SAFE_NO_PAD.encode(bytes),
            scope: parameters.scope.clone(),
            login_hint: parameters.login_hint.clone(),
            client,
            sessions,
            force_login,
        })
    }

    /// `GET /oauth/authorize/accept`
    ///
    /// The selected `sub` needs a session on this device that is fresh
    /// enough; the `remember` flag is deliberately not consulted, so a
    /// signed-in user can authorize again within the max-age window.
    ///
    /// # Errors
    /// `invalid_grant` / `access_denied` folded into a redirect when the
    /// target is known
    pub async fn accept(
        &self,
        device_id: &str,
        client_id: &str,
        request_uri: &str,
        account_sub: &str,
    ) -> OAuthResult<String> {
        let client = self.clients.get_client(client_id).await?;
        let record = self.requests.get_bound(request_uri, device_id).await?;
        if record.client_id != client.client_id {
            return Err(OAuthError::InvalidGrant(
                "request_uri was issued to another client".to_owned(),
            ));
        }
        let parameters = record.parameters.clone();

        let session = self
            .accounts
            .get_session(device_id, account_sub)
            .await?
            .ok_or(OAuthError::LoginRequired)?;
        let age = Utc::now() - session.info.authenticated_at;
        if age >= Duration::seconds(self.config.authentication_max_age_secs) {
            self.requests.delete(request_uri).await?;
            return Ok(error_redirect(
                &self.config.issuer,
                &parameters,
                &OAuthError::LoginRequired,
            ));
        }

        self.accounts
            .add_authorized_client(device_id, account_sub, &client.client_id)
            .await?;
        self.complete_authorization(device_id, &client, request_uri, account_sub)
            .await
    }

    async fn complete_authorization(
        &self,
        device_id: &str,
        client: &ClientMetadata,
        request_uri: &str,
        sub: &str,
    ) -> OAuthResult<String> {
        let record = self.requests.get_bound(request_uri, device_id).await?;
        let code = self
            .requests
            .set_authorized(request_uri, device_id, sub)
            .await?;
        tracing::info!(
            client_id = %client.client_id,
            sub,
            "authorization granted"
        );
        Ok(success_redirect(
            &self.config.issuer,
            &record.parameters,
            &code,
        ))
    }

    /// `GET /oauth/authorize/reject`
    ///
    /// # Errors
    /// `invalid_grant` when the request is not pending on this device
    pub async fn reject(
        &self,
        device_id: &str,
        request_uri: &str,
    ) -> OAuthResult<String> {
        let record = self.requests.get_bound(request_uri, device_id).await?;
        self.requests.delete(request_uri).await?;
        tracing::info!(client_id = %record.client_id, "authorization rejected");
        Ok(error_redirect(
            &self.config.issuer,
            &record.parameters,
            &OAuthError::AccessDenied("The user rejected the request".to_owned()),
        ))
    }

    /// `POST /oauth/token`
    ///
    /// # Errors
    /// Standard token-endpoint errors (§5.2 of RFC 6749)
    pub async fn token(
        &self,
        form: &HashMap<String, String>,
        dpop: Option<&VerifiedDpop>,
    ) -> OAuthResult<TokenResponse> {
        let credentials = credentials_from_form(form)?;
        let client = self.clients.get_client(credentials.client_id()).await?;
        let (client_auth, _nonce) = self
            .clients
            .verify_credentials(&client, &credentials)
            .await?;

        let grant_type = form
            .get("grant_type")
            .map(String::as_str)
            .ok_or_else(|| OAuthError::validation("grant_type", "body"))?;
        // Allow-listed twice: against the server's metadata and against the
        // client's own registration
        if !matches!(grant_type, GRANT_AUTHORIZATION_CODE | GRANT_REFRESH_TOKEN) {
            return Err(OAuthError::UnsupportedGrantType(format!(
                "Unsupported grant_type: {grant_type}"
            )));
        }
        if !client.allows_grant_type(grant_type) {
            return Err(OAuthError::UnauthorizedClient(format!(
                "Client is not registered for grant_type {grant_type}"
            )));
        }

        let dpop_jkt = dpop.map(|d| d.jkt.as_str());
        match grant_type {
            GRANT_AUTHORIZATION_CODE => {
                let code = form
                    .get("code")
                    .map(String::as_str)
                    .ok_or_else(|| OAuthError::validation("code", "body"))?;
                let code_verifier = form.get("code_verifier").map(String::as_str);

                let record = match self
                    .requests
                    .find_code(&client, &client_auth, code)
                    .await
                {
                    Ok(record) => record,
                    Err(err) => {
                        // A failed redemption burns everything the code
                        // already produced.
                        self.tokens.revoke_by_code(code).await?;
                        return Err(err);
                    }
                };
                let sub = record.sub.clone().ok_or_else(|| {
                    OAuthError::ServerError("Authorized request without sub".to_owned())
                })?;
                let account = self
                    .accounts
                    .get_account(&sub)
                    .await?
                    .ok_or_else(|| OAuthError::InvalidGrant("Unknown account".to_owned()))?;

                self.tokens
                    .create(&client, &client_auth, &account, &record, code_verifier, dpop_jkt)
                    .await
            }
            _ => {
                let refresh_token = form
                    .get("refresh_token")
                    .map(String::as_str)
                    .ok_or_else(|| OAuthError::validation("refresh_token", "body"))?;
                self.tokens
                    .refresh(&client, &client_auth, refresh_token, dpop_jkt)
                    .await
            }
        }
    }

    /// `POST /oauth/revoke` (RFC 7009): always succeeds
    pub async fn revoke(&self, token: &str) {
        if let Err(err) = self.tokens.revoke(token).await {
            tracing::warn!("revocation failed internally: {err}");
        }
    }

    /// `POST /oauth/introspect` (RFC 7662)
    ///
    /// Requires client authentication; any failure whatsoever reads as
    /// `{active: false}` after the timing floor.
    pub async fn introspect(&self, form: &HashMap<String, String>) -> IntrospectionResponse {
        let started = Instant::now();
        let inner = async {
            let credentials = credentials_from_form(form).ok()?;
            let client = self
                .clients
                .get_client(credentials.client_id())
                .await
                .ok()?;
            let (client_auth, _nonce) = self
                .clients
                .verify_credentials(&client, &credentials)
                .await
                .ok()?;
            let token = form.get("token")?;
            Some(
                self.tokens
                    .client_token_info(&client, &client_auth, token)
                    .await,
            )
        };
        match inner.await {
            Some(info) => info,
            None => {
                let floor = StdDuration::from_millis(INTROSPECTION_FLOOR_MS);
                let elapsed = started.elapsed();
                if elapsed < floor {
                    tokio::time::sleep(floor - elapsed).await;
                }
                IntrospectionResponse::inactive()
            }
        }
    }
}

fn credentials_from_form(form: &HashMap<String, String>) -> OAuthResult<ClientCredentials> {
    ClientCredentials::from_form(
        form.get("client_id").map(String::as_str),
        form.get("client_assertion_type").map(String::as_str),
        form.get("client_assertion").map(String::as_str),
    )
}

fn parameters_from_form(form: &HashMap<String, String>) -> AuthorizationParameters {
    let get = |key: &str| form.get(key).filter(|v| !v.is_empty()).cloned();
    AuthorizationParameters {
        response_type: get("response_type"),
        redirect_uri: get("redirect_uri"),
        scope: get("scope"),
        state: get("state"),
        code_challenge: get("code_challenge"),
        code_challenge_method: get("code_challenge_method"),
        login_hint: get("login_hint"),
        prompt: get("prompt"),
        response_mode: get("response_mode"),
        dpop_jkt: get("dpop_jkt"),
    }
}

/// Redirect to the client with a code (RFC 9207 adds `iss`)
fn success_redirect(issuer: &str, parameters: &AuthorizationParameters, code: &str) -> String {
    let mut params = vec![("iss", issuer.to_owned()), ("code", code.to_owned())];
    if let Some(state) = &parameters.state {
        params.push(("state", state.clone()));
    }
    build_redirect(parameters, &params)
}

/// Redirect to the client with an error, preserving `state`
fn error_redirect(
    issuer: &str,
    parameters: &AuthorizationParameters,
    err: &OAuthError,
) -> String {
    let body = err.to_body();
    let mut params = vec![
        ("iss", issuer.to_owned()),
        ("error", body.error),
    ];
    if let Some(description) = body.error_description {
        params.push(("error_description", description));
    }
    if let Some(state) = &parameters.state {
        params.push(("state", state.clone()));
    }
    build_redirect(parameters, &params)
}

fn build_redirect(parameters: &AuthorizationParameters, params: &[(&str, String)]) -> String {
    let redirect_uri = parameters.redirect_uri.as_deref().unwrap_or_default();
    let separator = match parameters.response_mode.as_deref() {
        Some("fragment") => '#',
        _ => {
            if redirect_uri.contains('?') {
                '&'
            } else {
                '?'
            }
        }
    };
    let encoded: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect();
    format!("{redirect_uri}{separator}{}", encoded.join("&"))
}
