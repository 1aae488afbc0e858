use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    history,
    models::{HistoryEntry, QueryOutcome},
    prompts::PromptTemplate,
    service::{CustomProviderInput, ManageError, PromptInput, ProviderSummary, QueryService},
};

type ApiResult<T> = std::result::Result<T, (StatusCode, String)>;

/**
 * \brief 构造本地 HTTP API 路由。
 */
pub fn router(service: QueryService) -> Router {
    Router::new()
        .route("/api/query", post(run_query))
        .route("/api/providers", get(get_providers))
        .route("/api/providers/custom", post(save_custom_provider))
        .route("/api/providers/{id}", axum::routing::delete(delete_provider))
        .route(
            "/api/providers/{id}/credential",
            put(set_credential).delete(clear_credential),
        )
        .route("/api/providers/{id}/select", post(select_provider))
        .route("/api/prompts", get(get_prompts).post(add_prompt))
        .route(
            "/api/prompts/{id}",
            put(update_prompt).delete(delete_prompt),
        )
        .route("/api/history", get(get_history).delete(clear_history))
        .route("/api/history/export", get(export_history))
        .route("/api/health", get(health_check))
        .with_state(Arc::new(service))
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5174"
 */
pub async fn run(addr: &str, service: QueryService) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, router(service)).await?;
    Ok(())
}

type AppState = State<Arc<QueryService>>;

#[derive(Deserialize, Debug)]
struct QueryPayload {
    /** \brief Provider ID（可选，缺省使用当前选择） */
    #[serde(default, alias = "providerId")]
    provider_id: Option<String>,
    /** \brief 指令提示词 */
    #[serde(alias = "instructionPrompt")]
    prompt: String,
    /** \brief 选中的文本 */
    #[serde(alias = "selectedText", alias = "selection")]
    selected_text: String,
}

#[derive(Deserialize, Debug)]
struct CredentialPayload {
    api_key: String,
}

#[derive(Serialize, Debug)]
struct ProvidersState {
    providers: Vec<ProviderSummary>,
}

#[derive(Serialize, Debug)]
struct PromptsState {
    prompts: Vec<PromptTemplate>,
}

#[derive(Serialize, Debug)]
struct HistoryResponse {
    entries: Vec<HistoryEntry>,
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    #[serde(default)]
    q: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
}

/**
 * \brief 查询接口：始终返回 200 与 `{success, answer|error}`。
 */
async fn run_query(
    State(service): AppState,
    Json(payload): Json<QueryPayload>,
) -> Json<QueryOutcome> {
    let outcome = service
        .query(
            payload.provider_id.as_deref(),
            &payload.prompt,
            &payload.selected_text,
        )
        .await;
    Json(outcome)
}

async fn get_providers(State(service): AppState) -> ApiResult<Json<ProvidersState>> {
    let providers = service.list_providers().await.map_err(api_err)?;
    Ok(Json(ProvidersState { providers }))
}

/**
 * \brief 新增或更新自定义 Provider。
 */
async fn save_custom_provider(
    State(service): AppState,
    Json(payload): Json<CustomProviderInput>,
) -> ApiResult<Json<ProvidersState>> {
    service
        .save_custom_provider(payload)
        .await
        .map_err(api_err)?;
    get_providers(State(service)).await
}

/**
 * \brief 删除自定义 Provider。
 */
async fn delete_provider(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<ProvidersState>> {
    service.delete_provider(&id).await.map_err(api_err)?;
    get_providers(State(service)).await
}

/**
 * \brief 保存凭证；响应中只包含掩码。
 */
async fn set_credential(
    State(service): AppState,
    Path(id): Path<String>,
    Json(payload): Json<CredentialPayload>,
) -> ApiResult<Json<ProvidersState>> {
    service
        .set_credential(&id, &payload.api_key)
        .await
        .map_err(api_err)?;
    get_providers(State(service)).await
}

async fn clear_credential(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<ProvidersState>> {
    service.clear_credential(&id).await.map_err(api_err)?;
    get_providers(State(service)).await
}

/**
 * \brief 设置当前使用的 Provider。
 */
async fn select_provider(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<ProvidersState>> {
    service.select_provider(&id).await.map_err(api_err)?;
    get_providers(State(service)).await
}

/**
 * \brief 列出内置与用户提示词。
 */
async fn get_prompts(State(service): AppState) -> ApiResult<Json<PromptsState>> {
    let prompts = service.list_prompts().await.map_err(api_err)?;
    Ok(Json(PromptsState { prompts }))
}

async fn add_prompt(
    State(service): AppState,
    Json(payload): Json<PromptInput>,
) -> ApiResult<Json<PromptsState>> {
    service.add_prompt(payload).await.map_err(api_err)?;
    get_prompts(State(service)).await
}

async fn update_prompt(
    State(service): AppState,
    Path(id): Path<String>,
    Json(payload): Json<PromptInput>,
) -> ApiResult<Json<PromptsState>> {
    service.update_prompt(&id, payload).await.map_err(api_err)?;
    get_prompts(State(service)).await
}

async fn delete_prompt(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<PromptsState>> {
    service.delete_prompt(&id).await.map_err(api_err)?;
    get_prompts(State(service)).await
}

/**
 * \brief 读取历史记录，可按关键字过滤。
 */
async fn get_history(
    State(service): AppState,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let entries = service.store().history().await.map_err(api_err)?;
    let entries = history::search(&entries, q.q.as_deref().unwrap_or_default());
    Ok(Json(HistoryResponse { entries }))
}

async fn clear_history(State(service): AppState) -> ApiResult<Json<HistoryResponse>> {
    service.store().clear_history().await.map_err(api_err)?;
    Ok(Json(HistoryResponse { entries: vec![] }))
}

/**
 * \brief 导出历史记录（json 或 csv）。
 */
async fn export_history(
    State(service): AppState,
    Query(q): Query<ExportQuery>,
) -> ApiResult<Response> {
    let entries = service.store().history().await.map_err(api_err)?;
    match q.format.as_deref().unwrap_or("json") {
        "json" => {
            let body = history::export_json(&entries).map_err(api_err)?;
            Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
        }
        "csv" => Ok((
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            history::export_csv(&entries),
        )
            .into_response()),
        other => Err((
            StatusCode::BAD_REQUEST,
            format!("unsupported export format: {}", other),
        )),
    }
}

async fn health_check(State(service): AppState) -> ApiResult<Json<serde_json::Value>> {
    let selected = service.resolve_provider_id(None).await.map_err(api_err)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "selected_provider": selected,
    })))
}

fn api_err(e: anyhow::Error) -> (StatusCode, String) {
    let status = match e.downcast_ref::<ManageError>() {
        Some(ManageError::UnknownProvider(_)) | Some(ManageError::UnknownPrompt(_)) => {
            StatusCode::NOT_FOUND
        }
        Some(ManageError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, format!("{:#}", e))
}
