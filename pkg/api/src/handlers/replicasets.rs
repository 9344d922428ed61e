use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use crate::AppState;
use crate::error::ApiResult;
use crate::handlers::{internal, parse};
use pkg_types::meta::{Kind, ResourceKey};
use pkg_types::object::{List, Object};
use pkg_types::replicaset::ReplicaSet;
use pkg_types::validate;

fn as_replicaset(obj: Object, context: &str) -> Result<ReplicaSet, crate::error::ApiError> {
    obj.into_replicaset().ok_or_else(|| internal(context))
}

pub async fn create_replicaset(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let mut rs: ReplicaSet = parse(body)?;
    rs.metadata.namespace = ns;
    validate::validate_replicaset(&rs)?;
    let stored = as_replicaset(state.store.create(rs.into()).await?, "replicaset")?;
    info!(
        "api: created replicaset {}/{} (replicas={})",
        stored.metadata.namespace, stored.metadata.name, stored.spec.replicas
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list_replicasets(
    State(state): State<AppState>,
    Path(ns): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let items: Vec<ReplicaSet> = state
        .store
        .list(Kind::ReplicaSet, &ns, None)
        .await
        .into_iter()
        .filter_map(Object::into_replicaset)
        .collect();
    Ok(Json(List { items }))
}

pub async fn get_replicaset(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let obj = state
        .store
        .get(&ResourceKey::new(Kind::ReplicaSet, &ns, &name))
        .await?;
    Ok(Json(as_replicaset(obj, "replicaset")?))
}

pub async fn replace_replicaset(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let mut rs: ReplicaSet = parse(body)?;
    rs.metadata.namespace = ns;
    rs.metadata.name = name;
    validate::validate_replicaset(&rs)?;
    let stored = as_replicaset(state.store.update(rs.into()).await?, "replicaset")?;
    info!(
        "api: updated replicaset {}/{} (replicas={})",
        stored.metadata.namespace, stored.metadata.name, stored.spec.replicas
    );
    Ok(Json(stored))
}

pub async fn delete_replicaset(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let marked = state
        .store
        .delete(&ResourceKey::new(Kind::ReplicaSet, &ns, &name))
        .await?;
    info!("api: deleted replicaset {}/{}", ns, name);
    Ok(Json(as_replicaset(marked, "replicaset")?))
}
