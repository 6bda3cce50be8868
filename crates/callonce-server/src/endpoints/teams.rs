use std::collections::HashSet;

use axum::Json;
use axum::extract::{Extension, Path, State};
use futures::future::try_join_all;
use serde::Serialize;

use crate::directory::User;
use crate::endpoints::ResponseError;
use crate::request_cache::{CacheStats, RequestCache};
use crate::service::RequestService;

#[derive(Debug, Serialize)]
pub struct TeamResponse {
    id: String,
    name: String,
    owner: Option<User>,
    members: Vec<User>,
    cache: CacheStats,
}

/// Resolves a team together with its members and its owner.
///
/// All members are loaded concurrently, so repeated members share a single upstream fetch. The
/// owner is looked up by email, which reuses the member record if the owner is also a member.
pub async fn get_team(
    State(service): State<RequestService>,
    Extension(cache): Extension<RequestCache>,
    Path(id): Path<String>,
) -> Result<Json<TeamResponse>, ResponseError> {
    let team = service
        .load_team(&cache, &id)
        .await?
        .ok_or_else(|| ResponseError::not_found("team", &id))?;

    let loads = team
        .members
        .iter()
        .map(|member| service.load_user(&cache, member));
    let mut members: Vec<User> = try_join_all(loads).await?.into_iter().flatten().collect();

    let mut seen = HashSet::new();
    members.retain(|member| seen.insert(member.id.clone()));

    let candidates = members
        .iter()
        .filter(|member| member.email == team.owner)
        .map(|member| member.id.as_str());
    let owner = service
        .load_user_by_email(&cache, &team.owner, candidates)
        .await?;

    Ok(Json(TeamResponse {
        id: team.id,
        name: team.name,
        owner,
        members,
        cache: cache.stats(),
    }))
}
