//! Bearer-token cache for the aggregator provider.
//!
//! Tokens are valid for hours; fetching one per request would hammer the
//! auth endpoint and risk rate limits. The cache hands out the stored
//! token while it is comfortably inside its lifetime and collapses
//! concurrent refreshes into a single in-flight bootstrap call whose
//! result (token or error) every waiting caller shares.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::payments::gateway::GatewayError;

/// Refresh this long before actual expiry to absorb clock skew and
/// request latency.
const SAFETY_MARGIN_SECS: i64 = 15;

/// Applied when the auth endpoint returns an unparseable expiry.
const DEFAULT_TTL_HOURS: i64 = 4;

/// Time source seam so tests can drive expiry without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Raw result of one bootstrap call. `expires_at` is `None` when the
/// provider sent an expiry we could not parse.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Performs the actual bootstrap fetch. Implemented by the provider;
/// faked in tests.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn fetch_token(&self) -> Result<IssuedToken, GatewayError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

type InFlight = Shared<BoxFuture<'static, Result<CachedToken, GatewayError>>>;

#[derive(Default)]
struct CacheState {
    cached: Option<CachedToken>,
    in_flight: Option<InFlight>,
}

/// One instance per provider configuration; holds at most one token and
/// at most one in-flight refresh.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached token while still fresh; otherwise joins (or starts) the
    /// single in-flight bootstrap call.
    pub async fn get_token(&self) -> Result<String, GatewayError> {
        let refresh = {
            let mut state = self.state.lock().await;

            if let Some(cached) = &state.cached {
                if self.clock.now() < cached.expires_at - Duration::seconds(SAFETY_MARGIN_SECS) {
                    return Ok(cached.token.clone());
                }
            }

            match &state.in_flight {
                Some(existing) => existing.clone(),
                None => {
                    debug!("token cache miss, starting bootstrap fetch");
                    let source = Arc::clone(&self.source);
                    let clock = Arc::clone(&self.clock);
                    let refresh = async move {
                        let issued = source.fetch_token().await?;
                        let expires_at = issued
                            .expires_at
                            .unwrap_or_else(|| clock.now() + Duration::hours(DEFAULT_TTL_HOURS));
                        Ok(CachedToken {
                            token: issued.token,
                            expires_at,
                        })
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        let result = refresh.clone().await;

        let mut state = self.state.lock().await;
        // Late waiters must not clobber a refresh started after this one.
        if state
            .in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&refresh))
        {
            state.in_flight = None;
            if let Ok(cached) = &result {
                state.cached = Some(cached.clone());
            }
        }
        result.map(|cached| cached.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ManualClock {
        now: std::sync::Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now: std::sync::Mutex::new(start),
            })
        }

        fn advance(&self, d: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        ttl_secs: i64,
        fail: bool,
    }

    impl CountingSource {
        fn new(ttl_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ttl_secs,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // Keep the fetch in flight long enough for callers to pile up.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail {
                return Err(GatewayError::Network("auth endpoint down".to_string()));
            }
            Ok(IssuedToken {
                token: format!("token-{call}"),
                expires_at: Some(Utc::now() + Duration::seconds(self.ttl_secs)),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_fetch() {
        let source = CountingSource::new(3600);
        let cache = Arc::new(TokenCache::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "token-0"));
    }

    #[tokio::test]
    async fn concurrent_misses_share_the_failure() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            ttl_secs: 3600,
            fail: true,
        });
        let cache = Arc::new(TokenCache::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(GatewayError::Network(_))));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_token_is_reused_without_fetching() {
        let source = CountingSource::new(3600);
        let cache = TokenCache::new(source.clone());

        let first = cache.get_token().await.unwrap();
        let second = cache.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_refreshes_inside_safety_margin() {
        let clock = ManualClock::new(Utc::now());
        let source = Arc::new(ExpiryRelativeSource {
            calls: AtomicUsize::new(0),
            clock: clock.clone(),
        });
        let cache = TokenCache::with_clock(source.clone(), clock.clone());

        cache.get_token().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Still comfortably fresh.
        clock.advance(Duration::seconds(30));
        cache.get_token().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Inside the 15s margin of the 60s expiry.
        clock.advance(Duration::seconds(20));
        cache.get_token().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    struct ExpiryRelativeSource {
        calls: AtomicUsize,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl TokenSource for ExpiryRelativeSource {
        async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedToken {
                token: format!("token-{call}"),
                expires_at: Some(self.clock.now() + Duration::seconds(60)),
            })
        }
    }

    #[tokio::test]
    async fn unparseable_expiry_falls_back_to_default_ttl() {
        struct NoExpirySource;

        #[async_trait]
        impl TokenSource for NoExpirySource {
            async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
                Ok(IssuedToken {
                    token: "opaque".to_string(),
                    expires_at: None,
                })
            }
        }

        let clock = ManualClock::new(Utc::now());
        let cache = TokenCache::with_clock(Arc::new(NoExpirySource), clock.clone());

        cache.get_token().await.unwrap();
        let state = cache.state.lock().await;
        let cached = state.cached.as_ref().unwrap();
        assert_eq!(cached.expires_at, clock.now() + Duration::hours(4));
    }
}
