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
use pkg_types::service::Service;
use pkg_types::validate;

fn as_service(obj: Object, context: &str) -> Result<Service, crate::error::ApiError> {
    obj.into_service().ok_or_else(|| internal(context))
}

pub async fn create_service(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let mut svc: Service = parse(body)?;
    svc.metadata.namespace = ns;
    validate::validate_service(&svc)?;
    let stored = as_service(state.store.create(svc.into()).await?, "service")?;
    info!(
        "api: created service {}/{}",
        stored.metadata.namespace, stored.metadata.name
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list_services(
    State(state): State<AppState>,
    Path(ns): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let items: Vec<Service> = state
        .store
        .list(Kind::Service, &ns, None)
        .await
        .into_iter()
        .filter_map(Object::into_service)
        .collect();
    Ok(Json(List { items }))
}

pub async fn get_service(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let obj = state
        .store
        .get(&ResourceKey::new(Kind::Service, &ns, &name))
        .await?;
    Ok(Json(as_service(obj, "service")?))
}

pub async fn replace_service(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let mut svc: Service = parse(body)?;
    svc.metadata.namespace = ns;
    svc.metadata.name = name;
    validate::validate_service(&svc)?;
    let stored = as_service(state.store.update(svc.into()).await?, "service")?;
    Ok(Json(stored))
}

pub async fn delete_service(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let marked = state
        .store
        .delete(&ResourceKey::new(Kind::Service, &ns, &name))
        .await?;
    info!("api: deleted service {}/{}", ns, name);
    Ok(Json(as_service(marked, "service")?))
}
