use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Secret;
use prometheus::IntCounter;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{types::TokenResponse, VpsieError};
use crate::util::{clock::Clock, Error};

/// Production API endpoint used when the credentials secret does not
/// override it.
pub const DEFAULT_API_URL: &str = "https://api.vpsie.com";

/// Path of the two-leg client-credential exchange.
pub const TOKEN_PATH: &str = "/auth/from/api";

/// Tokens are refreshed pre-emptively once expiry is this close.
const REFRESH_BUFFER_SECONDS: i64 = 300;

/// Client credentials read from the `vpsie-secret` Secret.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub url: String,
}

impl Credentials {
    /// Extracts credentials from the well-known secret. `clientId` and
    /// `clientSecret` are required; `url` falls back to the production
    /// endpoint.
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let read = |key: &str| -> Option<String> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
                .or_else(|| {
                    secret
                        .string_data
                        .as_ref()
                        .and_then(|data| data.get(key).cloned())
                })
        };
        let client_id = read("clientId")
            .ok_or_else(|| Error::UserInputError("secret is missing key clientId".to_owned()))?;
        let client_secret = read("clientSecret").ok_or_else(|| {
            Error::UserInputError("secret is missing key clientSecret".to_owned())
        })?;
        let url = read("url").unwrap_or_else(|| DEFAULT_API_URL.to_owned());
        Ok(Credentials {
            client_id,
            client_secret,
            url: url.trim_end_matches('/').to_owned(),
        })
    }
}

/// An issued token together with its expiry.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub token: String,
    pub expires: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

/// The credential-exchange leg, abstracted so tests can count and fake
/// token issuance without a network.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, credentials: &Credentials) -> Result<TokenGrant, VpsieError>;
}

/// Form-encoded exchange against the provider's auth endpoint.
pub struct HttpTokenExchange {
    http: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new(http: reqwest::Client) -> Self {
        HttpTokenExchange { http }
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<TokenGrant, VpsieError> {
        let url = format!("{}{}", credentials.url, TOKEN_PATH);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("clientId", credentials.client_id.as_str()),
                ("clientSecret", credentials.client_secret.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VpsieError::from_status(status.as_u16(), message));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| VpsieError::Network(format!("decoding token response: {}", e)))?;
        let expires = body
            .access_token
            .expires
            .parse::<DateTime<Utc>>()
            .map_err(|e| VpsieError::Network(format!("invalid token expiry: {}", e)))?;
        Ok(TokenGrant {
            token: body.access_token.token,
            expires,
            refresh_token: body.refresh_token,
        })
    }
}

/// Tracks the current token and its expiry. Reads are cheap; a refresh
/// holds the writer half of the lock exclusively, and waiters re-check
/// freshness after acquiring it so that N concurrent callers trigger at
/// most one exchange.
pub struct TokenManager {
    exchange: Arc<dyn TokenExchange>,
    credentials: parking_lot::RwLock<Credentials>,
    state: RwLock<Option<TokenGrant>>,
    clock: Arc<dyn Clock>,
    refresh_counter: IntCounter,
}

impl TokenManager {
    pub fn new(
        exchange: Arc<dyn TokenExchange>,
        credentials: Credentials,
        clock: Arc<dyn Clock>,
        refresh_counter: IntCounter,
    ) -> Self {
        TokenManager {
            exchange,
            credentials: parking_lot::RwLock::new(credentials),
            state: RwLock::new(None),
            clock,
            refresh_counter,
        }
    }

    /// Swaps in rotated credentials. The current token stays valid until
    /// its natural expiry; the next refresh uses the new credentials.
    pub fn rotate_credentials(&self, credentials: Credentials) {
        *self.credentials.write() = credentials;
    }

    fn is_fresh(&self, grant: &TokenGrant) -> bool {
        self.clock.now() + ChronoDuration::seconds(REFRESH_BUFFER_SECONDS) < grant.expires
    }

    /// Returns a token that is valid for at least the refresh buffer,
    /// exchanging credentials if the cached one is missing or close to
    /// expiry.
    pub async fn bearer(&self) -> Result<String, VpsieError> {
        {
            let state = self.state.read().await;
            if let Some(grant) = state.as_ref() {
                if self.is_fresh(grant) {
                    return Ok(grant.token.clone());
                }
            }
        }
        let mut state = self.state.write().await;
        if let Some(grant) = state.as_ref() {
            if self.is_fresh(grant) {
                return Ok(grant.token.clone());
            }
        }
        let credentials = self.credentials.read().clone();
        let grant = self.exchange.exchange(&credentials).await?;
        self.refresh_counter.inc();
        let token = grant.token.clone();
        *state = Some(grant);
        Ok(token)
    }

    /// Reactive refresh after a 401. The stale token observed by the
    /// caller is passed in so that concurrent 401s collapse into a
    /// single exchange: whoever loses the race to the writer lock finds
    /// a newer token already installed and reuses it.
    pub async fn refresh_after_unauthorized(&self, stale: &str) -> Result<String, VpsieError> {
        let mut state = self.state.write().await;
        if let Some(grant) = state.as_ref() {
            if grant.token != stale {
                return Ok(grant.token.clone());
            }
        }
        let credentials = self.credentials.read().clone();
        let grant = self.exchange.exchange(&credentials).await?;
        self.refresh_counter.inc();
        let token = grant.token.clone();
        *state = Some(grant);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchange {
        calls: AtomicUsize,
        lifetime: ChronoDuration,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl TokenExchange for CountingExchange {
        async fn exchange(&self, _credentials: &Credentials) -> Result<TokenGrant, VpsieError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // Hold the writer long enough for contending callers to queue.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(TokenGrant {
                token: format!("token-{}", call),
                expires: self.clock.now() + self.lifetime,
                refresh_token: Some("refresh".to_owned()),
            })
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            client_id: "id".to_owned(),
            client_secret: "secret".to_owned(),
            url: DEFAULT_API_URL.to_owned(),
        }
    }

    fn manager(clock: Arc<ManualClock>, lifetime_minutes: i64) -> (Arc<TokenManager>, Arc<CountingExchange>) {
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
            lifetime: ChronoDuration::minutes(lifetime_minutes),
            clock: clock.clone(),
        });
        let manager = Arc::new(TokenManager::new(
            exchange.clone(),
            credentials(),
            clock,
            IntCounter::new("cloud_api_token_refresh_total", "refreshes").unwrap(),
        ));
        (manager, exchange)
    }

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()))
    }

    #[tokio::test]
    async fn concurrent_callers_trigger_one_exchange() {
        let (manager, exchange) = manager(manual_clock(), 60);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.bearer().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-0");
        }
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_refreshes_preemptively_inside_buffer() {
        let clock = manual_clock();
        let (manager, exchange) = manager(clock.clone(), 60);
        assert_eq!(manager.bearer().await.unwrap(), "token-0");
        // Still fresh well before the buffer.
        clock.advance(ChronoDuration::minutes(30));
        assert_eq!(manager.bearer().await.unwrap(), "token-0");
        // Within five minutes of expiry the token is considered stale.
        clock.advance(ChronoDuration::minutes(26));
        assert_eq!(manager.bearer().await.unwrap(), "token-1");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_refresh_collapses_concurrent_retries() {
        let (manager, exchange) = manager(manual_clock(), 60);
        let stale = manager.bearer().await.unwrap();
        let a = manager.refresh_after_unauthorized(&stale);
        let b = manager.refresh_after_unauthorized(&stale);
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "token-1");
        assert_eq!(b.unwrap(), "token-1");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }
}
