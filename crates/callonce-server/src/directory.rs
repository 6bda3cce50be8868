//! A simulated upstream directory of users and teams.
//!
//! Every fetch sleeps for the configured latency and is counted, so that the effect of request
//! scoped caching is observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::{DirectoryConfig, TeamRecord, UserRecord};

/// Identifiers starting with this prefix simulate an unreachable upstream.
const UNAVAILABLE_PREFIX: &str = "unavailable";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub members: Vec<String>,
}

/// An error fetching from the directory.
///
/// These errors are transient and never cached.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory is unavailable for `{0}`")]
    Unavailable(String),
}

impl From<&UserRecord> for User {
    fn from(record: &UserRecord) -> Self {
        User {
            id: record.id.clone(),
            name: record.name.clone(),
            email: record.email.clone(),
        }
    }
}

impl From<&TeamRecord> for Team {
    fn from(record: &TeamRecord) -> Self {
        Team {
            id: record.id.clone(),
            name: record.name.clone(),
            owner: record.owner.clone(),
            members: record.members.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Directory {
    latency: Duration,
    users: HashMap<String, User>,
    teams: HashMap<String, Team>,
    fetches: AtomicUsize,
}

impl Directory {
    pub fn new(config: &DirectoryConfig) -> Self {
        Directory {
            latency: config.latency,
            users: config
                .users
                .iter()
                .map(|record| (record.id.clone(), record.into()))
                .collect(),
            teams: config
                .teams
                .iter()
                .map(|record| (record.id.clone(), record.into()))
                .collect(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// The total number of fetches this directory has served.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn fetch(&self, identifier: &str) -> Result<(), DirectoryError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        metric!(counter("directory.fetches") += 1);
        tracing::debug!(identifier, "fetching from directory");

        tokio::time::sleep(self.latency).await;

        if identifier.starts_with(UNAVAILABLE_PREFIX) {
            return Err(DirectoryError::Unavailable(identifier.to_owned()));
        }
        Ok(())
    }

    pub async fn fetch_user(&self, id: &str) -> Result<Option<User>, DirectoryError> {
        self.fetch(id).await?;
        Ok(self.users.get(id).cloned())
    }

    pub async fn fetch_user_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError> {
        self.fetch(email).await?;
        Ok(self.users.values().find(|user| user.email == email).cloned())
    }

    pub async fn fetch_team(&self, id: &str) -> Result<Option<Team>, DirectoryError> {
        self.fetch(id).await?;
        Ok(self.teams.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        Directory::new(&DirectoryConfig {
            latency: Duration::ZERO,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_fetch_user() {
        let directory = directory();

        let alice = directory.fetch_user("1").await.unwrap().unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(directory.fetch_user("404").await, Ok(None));

        let bob = directory.fetch_user_by_email("bob@example.com").await;
        assert_eq!(bob.unwrap().map(|user| user.id), Some("2".to_owned()));

        assert_eq!(directory.fetches(), 3);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let directory = directory();

        let result = directory.fetch_team("unavailable-team").await;
        assert_eq!(
            result,
            Err(DirectoryError::Unavailable("unavailable-team".to_owned()))
        );
        assert_eq!(directory.fetches(), 1);
    }
}
