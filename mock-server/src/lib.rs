//! In-memory inventory service the client engine is tested against.
//!
//! Successful calls answer `200` with JSON; failures answer a plain-text
//! body so callers can surface it verbatim.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub name: String,
    pub quantity: u32,
}

#[derive(Deserialize)]
pub struct NewItem {
    pub name: String,
    #[serde(default)]
    pub quantity: u32,
}

#[derive(Deserialize)]
pub struct ItemUpdate {
    pub name: Option<String>,
    pub quantity: Option<u32>,
}

pub type Db = Arc<RwLock<HashMap<Uuid, Item>>>;

const NOT_FOUND: (StatusCode, &str) = (StatusCode::NOT_FOUND, "item not found");

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(HashMap::new()));
    Router::new()
        .route("/items", get(list_items).post(create_item))
        .route("/items/{id}", get(get_item).put(update_item).delete(delete_item))
        .route("/echo", post(echo))
        .route("/form", post(form))
        .route("/query", get(query))
        .route("/slow/{ms}", get(slow))
        .route("/close", get(close))
        .route("/fail/{code}", get(fail))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "mock server listening");
    }
    axum::serve(listener, app()).await
}

async fn list_items(State(db): State<Db>) -> Json<Vec<Item>> {
    let items = db.read().await;
    let mut items: Vec<Item> = items.values().cloned().collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    Json(items)
}

async fn create_item(State(db): State<Db>, Json(input): Json<NewItem>) -> Json<Item> {
    let item = Item {
        id: Uuid::new_v4(),
        name: input.name,
        quantity: input.quantity,
    };
    db.write().await.insert(item.id, item.clone());
    tracing::debug!(id = %item.id, "created item");
    Json(item)
}

async fn get_item(
    State(db): State<Db>,
    Path(id): Path<Uuid>,
) -> Result<Json<Item>, (StatusCode, &'static str)> {
    let items = db.read().await;
    items.get(&id).cloned().map(Json).ok_or(NOT_FOUND)
}

async fn update_item(
    State(db): State<Db>,
    Path(id): Path<Uuid>,
    Json(input): Json<ItemUpdate>,
) -> Result<Json<Item>, (StatusCode, &'static str)> {
    let mut items = db.write().await;
    let item = items.get_mut(&id).ok_or(NOT_FOUND)?;
    if let Some(name) = input.name {
        item.name = name;
    }
    if let Some(quantity) = input.quantity {
        item.quantity = quantity;
    }
    Ok(Json(item.clone()))
}

async fn delete_item(
    State(db): State<Db>,
    Path(id): Path<Uuid>,
) -> Result<Json<Item>, (StatusCode, &'static str)> {
    let mut items = db.write().await;
    items.remove(&id).map(Json).ok_or(NOT_FOUND)
}

/// Reflect the request body and content type.
async fn echo(headers: HeaderMap, body: String) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();
    ([(header::CONTENT_TYPE, content_type)], body)
}

/// Decode an urlencoded form and answer it as a JSON object.
async fn form(Form(fields): Form<BTreeMap<String, String>>) -> Json<BTreeMap<String, String>> {
    Json(fields)
}

async fn query(Query(params): Query<BTreeMap<String, String>>) -> Json<BTreeMap<String, String>> {
    Json(params)
}

async fn slow(Path(ms): Path<u64>) -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Json(json!({ "slept_ms": ms }))
}

/// Answer, then close the connection.
async fn close() -> impl IntoResponse {
    (
        [(header::CONNECTION, "close")],
        Json(json!({ "closing": true })),
    )
}

async fn fail(Path(code): Path<u16>) -> (StatusCode, String) {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, format!("failed with {code}"))
}
