use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::directory::User;
use crate::endpoints::ResponseError;
use crate::request_cache::{CacheStats, RequestCache};
use crate::service::RequestService;

const MAX_FANOUT: usize = 64;

fn default_fanout() -> usize {
    4
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    /// How many concurrent loads of the same user the handler issues.
    #[serde(default = "default_fanout")]
    fanout: usize,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    user: User,
    loads: usize,
    cache: CacheStats,
}

pub async fn get_user(
    State(service): State<RequestService>,
    Extension(cache): Extension<RequestCache>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserResponse>, ResponseError> {
    if query.fanout == 0 || query.fanout > MAX_FANOUT {
        return Err((StatusCode::BAD_REQUEST, "fanout must be between 1 and 64").into());
    }

    let loads = (0..query.fanout).map(|_| service.load_user(&cache, &id));
    let mut users = try_join_all(loads).await?;

    let user = users
        .pop()
        .flatten()
        .ok_or_else(|| ResponseError::not_found("user", &id))?;

    Ok(Json(UserResponse {
        user,
        loads: query.fanout,
        cache: cache.stats(),
    }))
}
