use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::chain::{CommitOutcome, CommitRequest, RestoreOutcome, RestoreRequest, VersionDetail};
use crate::live::LiveStateProvider;
use crate::model::comparison::ComparisonResult;
use crate::model::state::PluginState;
use crate::model::tag::Tag;
use crate::model::version::{Page, Version, VersionFilter, VersionPage};
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn put_live_state(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
    Json(live): Json<PluginState>,
) -> StatusCode {
    state.live.set_state(plugin_id, live).await;
    StatusCode::NO_CONTENT
}

pub async fn get_live_state(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> ApiResult<Json<PluginState>> {
    Ok(Json(state.live.current_state(&plugin_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CommitBody {
    /// State to record. When absent the live state is committed.
    pub state: Option<PluginState>,
    pub message: Option<String>,
    pub author: Option<String>,
    pub force_snapshot: bool,
    pub tag: Option<String>,
}

pub async fn create_commit(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
    Json(body): Json<CommitBody>,
) -> ApiResult<(StatusCode, Json<CommitOutcome>)> {
    let outcome = match body.state {
        Some(plugin_state) => {
            let outcome = state
                .chain
                .commit(CommitRequest {
                    plugin_id: plugin_id.clone(),
                    state: plugin_state.clone(),
                    message: body.message,
                    author: body.author,
                    force_snapshot: body.force_snapshot,
                    tag: body.tag,
                })
                .await?;
            // An explicit commit is also what the plugin runs now; later
            // restores back it up from the live registry.
            state.live.set_state(plugin_id, plugin_state).await;
            outcome
        }
        None => {
            state
                .chain
                .commit_live(
                    &plugin_id,
                    body.message,
                    body.author,
                    body.force_snapshot,
                    body.tag,
                )
                .await?
        }
    };
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub filter: Option<VersionFilter>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<VersionPage>> {
    let page = Page {
        offset: query.offset.unwrap_or(0),
        limit: query.limit,
    };
    let versions = state
        .chain
        .list_versions(&plugin_id, query.filter.unwrap_or_default(), page)
        .await?;
    Ok(Json(versions))
}

pub async fn get_version(
    State(state): State<AppState>,
    Path((plugin_id, version_id)): Path<(String, String)>,
) -> ApiResult<Json<VersionDetail>> {
    Ok(Json(state.chain.version_detail(&plugin_id, &version_id).await?))
}

pub async fn get_version_state(
    State(state): State<AppState>,
    Path((plugin_id, version_id)): Path<(String, String)>,
) -> ApiResult<Json<PluginState>> {
    Ok(Json(state.chain.reconstruct(&plugin_id, &version_id).await?))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RestoreBody {
    #[serde(default = "default_true")]
    pub create_backup: bool,
    #[serde(default)]
    pub author: Option<String>,
}

impl Default for RestoreBody {
    fn default() -> Self {
        Self {
            create_backup: true,
            author: None,
        }
    }
}

pub async fn restore_version(
    State(state): State<AppState>,
    Path((plugin_id, version_id)): Path<(String, String)>,
    body: Option<Json<RestoreBody>>,
) -> ApiResult<Json<RestoreOutcome>> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let outcome = state
        .chain
        .restore(RestoreRequest {
            plugin_id,
            target: version_id,
            create_backup: body.create_backup,
            author: body.author,
        })
        .await?;
    Ok(Json(outcome))
}

pub async fn publish_version(
    State(state): State<AppState>,
    Path((plugin_id, version_id)): Path<(String, String)>,
) -> ApiResult<Json<Version>> {
    Ok(Json(state.chain.publish(&plugin_id, &version_id).await?))
}

pub async fn unpublish_version(
    State(state): State<AppState>,
    Path((plugin_id, version_id)): Path<(String, String)>,
) -> ApiResult<Json<Version>> {
    Ok(Json(state.chain.unpublish(&plugin_id, &version_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TagQuery {
    pub author: Option<String>,
}

pub async fn put_tag(
    State(state): State<AppState>,
    Path((plugin_id, version_id, tag)): Path<(String, String, String)>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Json<Tag>> {
    let tag = state
        .chain
        .tags()
        .add(&plugin_id, &tag, &version_id, query.author)
        .await?;
    Ok(Json(tag))
}

pub async fn delete_tag(
    State(state): State<AppState>,
    Path((plugin_id, version_id, tag)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.chain.tags().remove(&plugin_id, &tag, &version_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_tags(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> ApiResult<Json<Vec<Tag>>> {
    Ok(Json(state.chain.tags().list_for_plugin(&plugin_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

pub async fn compare_versions(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<Json<ComparisonResult>> {
    let (from, to) = match (query.from, query.to) {
        (Some(from), Some(to)) => (from, to),
        _ => return Err(ApiError::bad_request("both `from` and `to` are required")),
    };
    Ok(Json(state.compare.compare(&plugin_id, &from, &to).await?))
}
