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
use pkg_types::pod::Pod;
use pkg_types::validate;

fn as_pod(obj: Object, context: &str) -> Result<Pod, crate::error::ApiError> {
    obj.into_pod().ok_or_else(|| internal(context))
}

pub async fn create_pod(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let mut pod: Pod = parse(body)?;
    pod.metadata.namespace = ns;
    validate::validate_pod(&pod)?;
    let stored = as_pod(state.store.create(pod.into()).await?, "pod")?;
    info!(
        "api: created pod {}/{}",
        stored.metadata.namespace, stored.metadata.name
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list_pods(
    State(state): State<AppState>,
    Path(ns): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let items: Vec<Pod> = state
        .store
        .list(Kind::Pod, &ns, None)
        .await
        .into_iter()
        .filter_map(Object::into_pod)
        .collect();
    Ok(Json(List { items }))
}

pub async fn get_pod(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let obj = state
        .store
        .get(&ResourceKey::new(Kind::Pod, &ns, &name))
        .await?;
    Ok(Json(as_pod(obj, "pod")?))
}

pub async fn replace_pod(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let mut pod: Pod = parse(body)?;
    pod.metadata.namespace = ns;
    pod.metadata.name = name;
    validate::validate_pod(&pod)?;
    let stored = as_pod(state.store.update(pod.into()).await?, "pod")?;
    Ok(Json(stored))
}

pub async fn delete_pod(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let marked = state
        .store
        .delete(&ResourceKey::new(Kind::Pod, &ns, &name))
        .await?;
    info!("api: deleted pod {}/{}", ns, name);
    Ok(Json(as_pod(marked, "pod")?))
}
