//! Bearer tokens for the REST API, fetched eagerly and refreshed in the background.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};

use crate::{
    Error,
    bounded_queue::{BoundedTaskQueue, QueueError, TaskHandle},
};

/// How often [`AccessTokenCache`] refreshes its token unless told otherwise.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(60);

/// Capacity of the queue created by [`AccessTokenCache::start`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AccessTokenError {
    #[snafu(display("failed to fetch initial access token: {source}"))]
    InitialFetch { source: Error },

    #[snafu(display("failed to schedule access token refresh: {source}"))]
    ScheduleRefresh { source: QueueError },
}

/// Supplies the bearer token attached to every request.
pub trait AccessToken: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// A token that never changes, e.g. one read from the environment.
#[derive(Clone)]
pub struct StaticAccessToken(String);

impl StaticAccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticAccessToken(..)")
    }
}

impl AccessToken for StaticAccessToken {
    fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Obtains fresh tokens, e.g. from a credentials provider.
#[async_trait]
pub trait AccessTokenSource: Send + Sync + 'static {
    async fn fetch_access_token(&self) -> Result<String, Error>;
}

/// Caches the token of an [`AccessTokenSource`], refreshing it at a fixed rate on a
/// [`BoundedTaskQueue`]. A failed refresh is logged and the previous token is kept.
///
/// Dropping the cache stops the refresh.
pub struct AccessTokenCache {
    token: Arc<RwLock<String>>,
    refresh: TaskHandle<()>,
}

impl AccessTokenCache {
    /// Fetches the first token and schedules the refresh on a queue of its own.
    pub async fn start<S: AccessTokenSource>(source: S) -> Result<Self, AccessTokenError> {
        let queue = BoundedTaskQueue::new(DEFAULT_QUEUE_CAPACITY).context(ScheduleRefreshSnafu)?;
        Self::start_on(source, &queue, DEFAULT_REFRESH_PERIOD).await
    }

    pub async fn start_on<S: AccessTokenSource>(
        source: S,
        queue: &BoundedTaskQueue,
        refresh_period: Duration,
    ) -> Result<Self, AccessTokenError> {
        let initial = source
            .fetch_access_token()
            .await
            .context(InitialFetchSnafu)?;
        let token = Arc::new(RwLock::new(initial));

        let source = Arc::new(source);
        let cached = Arc::clone(&token);
        let refresh = queue
            .schedule_at_fixed_rate(refresh_period, refresh_period, move || {
                refresh_access_token(Arc::clone(&source), Arc::clone(&cached))
            })
            .context(ScheduleRefreshSnafu)?;

        debug!(refresh_period_secs = refresh_period.as_secs(), "Access token cache started");
        Ok(Self { token, refresh })
    }
}

async fn refresh_access_token<S: AccessTokenSource>(source: Arc<S>, cached: Arc<RwLock<String>>) {
    match source.fetch_access_token().await {
        Ok(token) => {
            *cached.write().unwrap_or_else(PoisonError::into_inner) = token;
            trace!("Access token refreshed");
        }
        Err(error) => error!(%error, "Failed to fetch access token"),
    }
}

impl AccessToken for AccessTokenCache {
    fn access_token(&self) -> Option<String> {
        Some(
            self.token
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }
}

impl fmt::Debug for AccessTokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenCache").finish_non_exhaustive()
    }
}

impl Drop for AccessTokenCache {
    fn drop(&mut self) {
        self.refresh.cancel();
    }
}
