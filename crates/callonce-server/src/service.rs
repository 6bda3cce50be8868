use std::sync::{Arc, LazyLock};

use callonce::{CacheScope, CallError, Key, Lookup};

use crate::config::Config;
use crate::directory::{Directory, DirectoryError, Team, User};

/// Users, addressed as `id:{id}` or `email:{email}`.
static USER: LazyLock<Key<Option<User>>> = LazyLock::new(|| Key::new("user"));
static TEAM: LazyLock<Key<Option<Team>>> = LazyLock::new(|| Key::new("team"));

pub type LoadError = CallError<DirectoryError>;

/// The shared state of all request handlers.
#[derive(Clone, Debug)]
pub struct RequestService {
    inner: Arc<RequestServiceInner>,
}

#[derive(Debug)]
struct RequestServiceInner {
    directory: Arc<Directory>,
    log_cache_events: bool,
}

impl RequestService {
    pub fn create(config: &Config) -> Self {
        let inner = RequestServiceInner {
            directory: Arc::new(Directory::new(&config.directory)),
            log_cache_events: config.log_cache_events,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.inner.directory
    }

    pub fn log_cache_events(&self) -> bool {
        self.inner.log_cache_events
    }

    /// Loads a user by id, at most once per request.
    pub async fn load_user(
        &self,
        scope: &impl CacheScope,
        id: &str,
    ) -> Result<Option<User>, LoadError> {
        let directory = Arc::clone(&self.inner.directory);
        let owned = id.to_owned();
        let compute = || async move { directory.fetch_user(&owned).await };

        callonce::get(scope, compute, &[USER.lookup(format!("id:{id}"))]).await
    }

    /// Loads a user by email, at most once per request.
    ///
    /// `candidates` are ids of users already known to have this email. If one of them was loaded
    /// before, it is reused and becomes addressable by its email as well.
    pub async fn load_user_by_email(
        &self,
        scope: &impl CacheScope,
        email: &str,
        candidates: impl IntoIterator<Item = &str>,
    ) -> Result<Option<User>, LoadError> {
        let directory = Arc::clone(&self.inner.directory);
        let owned = email.to_owned();
        let compute = || async move { directory.fetch_user_by_email(&owned).await };

        let lookups: Vec<Lookup<'_, _>> = std::iter::once(format!("email:{email}"))
            .chain(candidates.into_iter().map(|id| format!("id:{id}")))
            .map(|identifier| USER.lookup(identifier))
            .collect();

        callonce::get(scope, compute, &lookups).await
    }

    /// Loads a team by id, at most once per request.
    pub async fn load_team(
        &self,
        scope: &impl CacheScope,
        id: &str,
    ) -> Result<Option<Team>, LoadError> {
        let directory = Arc::clone(&self.inner.directory);
        let owned = id.to_owned();
        let compute = || async move { directory.fetch_team(&owned).await };

        callonce::get(scope, compute, &[TEAM.lookup(id)]).await
    }
}
