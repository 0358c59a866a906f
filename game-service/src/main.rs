// Copyright (C) 2026 Venalia Project
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{
    Client as DynamoClient,
    types::{AttributeValue, Put, TransactWriteItem},
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;
use venalia_common::{
    AuditEntry, CorruptionCardsRequest, CorruptionCardsResponse, CorruptionTypesRequest,
    CorruptionTypesResponse, EXPOSURE_SCANDAL_THRESHOLD, LevelCatalog, LevelDefinition,
    OnboardPlayerRequest, PlanEvaluationRequest, PlanEvaluationResponse, PlayerId, PlayerProfile,
    PlayerProgressResponse, ResourceLedger, ScandalHeadlineRequest, ScandalHeadlineResponse,
    SubmitTurnRequest, TurnOutcomeResponse, WildcardPlanRequest, WildcardPlanResponse,
    build_audit_entry, default_catalog, resolve_turn,
};

#[derive(Clone)]
struct AppState {
    store: Arc<dyn LedgerStore>,
    narrative: Arc<dyn NarrativeGenerator>,
    catalog: Arc<LevelCatalog>,
    tuning: Arc<GameTuning>,
    player_locks: Arc<tokio::sync::Mutex<HashMap<PlayerId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AppState {
    async fn from_env() -> anyhow::Result<Self> {
        let catalog = Arc::new(load_level_catalog());
        let tuning = Arc::new(GameTuning::from_env());

        let store: Arc<dyn LedgerStore> = match DynamoLedgerStore::from_env().await {
            Some(store) => {
                info!(
                    profile_table = %store.profile_table,
                    ledger_table = %store.ledger_table,
                    audit_table = %store.audit_table,
                    "using DynamoDB ledger store"
                );
                Arc::new(store)
            }
            None => {
                info!("DynamoDB not configured, using in-memory ledger store");
                Arc::new(InMemoryLedgerStore::default())
            }
        };

        Ok(Self {
            store,
            narrative: Arc::new(HttpNarrativeGenerator::from_env()?),
            catalog,
            tuning,
            player_locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        })
    }

    /// Serializes turn submissions per player; different players proceed in
    /// parallel.
    async fn player_lock(&self, player_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.player_locks.lock().await;
        locks
            .entry(player_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone)]
struct GameTuning {
    bonus_pc_grant: i64,
    bonus_be_relief: f64,
    cover_up_inf_cost: i64,
    cover_up_be_relief: f64,
    num_corruption_types: u32,
    num_corruption_cards: u32,
}

impl Default for GameTuning {
    fn default() -> Self {
        Self {
            bonus_pc_grant: 20,
            bonus_be_relief: 5.0,
            cover_up_inf_cost: 10,
            cover_up_be_relief: 15.0,
            num_corruption_types: 10,
            num_corruption_cards: 5,
        }
    }
}

impl GameTuning {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bonus_pc_grant: env_parse("BONUS_PC_GRANT", defaults.bonus_pc_grant),
            bonus_be_relief: env_parse("BONUS_BE_RELIEF", defaults.bonus_be_relief),
            cover_up_inf_cost: env_parse("COVER_UP_INF_COST", defaults.cover_up_inf_cost),
            cover_up_be_relief: env_parse("COVER_UP_BE_RELIEF", defaults.cover_up_be_relief),
            num_corruption_types: env_parse("NUM_CORRUPTION_TYPES", defaults.num_corruption_types),
            num_corruption_cards: env_parse("NUM_CORRUPTION_CARDS", defaults.num_corruption_cards),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .unwrap_or_else(|| default.to_string())
}

fn load_level_catalog() -> LevelCatalog {
    let Ok(path) = std::env::var("LEVEL_CATALOG_PATH") else {
        return default_catalog();
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_yaml::from_str::<Vec<LevelDefinition>>(&raw) {
            Ok(levels) => match LevelCatalog::new(levels) {
                Ok(catalog) => {
                    info!(path = %path, max_level = catalog.max_level(), "loaded level catalog");
                    return catalog;
                }
                Err(error) => {
                    warn!(path = %path, error = %error, "invalid level catalog, using built-in");
                }
            },
            Err(error) => {
                warn!(path = %path, error = %error, "failed to parse level catalog, using built-in");
            }
        },
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read level catalog, using built-in");
        }
    }
    default_catalog()
}

/// Persistence seam for profiles, ledgers and the audit log. `commit_turn`
/// writes the ledger and its audit entry in one logical transaction.
#[async_trait]
trait LedgerStore: Send + Sync {
    async fn get_profile(&self, player_id: &str) -> anyhow::Result<Option<PlayerProfile>>;
    async fn save_profile(&self, profile: &PlayerProfile) -> anyhow::Result<()>;
    async fn get_ledger(&self, player_id: &str) -> anyhow::Result<Option<ResourceLedger>>;
    async fn save_ledger(&self, ledger: &ResourceLedger) -> anyhow::Result<()>;
    async fn commit_turn(&self, ledger: &ResourceLedger, entry: &AuditEntry) -> anyhow::Result<()>;
}

#[derive(Default)]
struct InMemoryLedgerStore {
    inner: RwLock<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    profiles: HashMap<PlayerId, PlayerProfile>,
    ledgers: HashMap<PlayerId, ResourceLedger>,
    audit_log: Vec<AuditEntry>,
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_profile(&self, player_id: &str) -> anyhow::Result<Option<PlayerProfile>> {
        Ok(self.inner.read().await.profiles.get(player_id).cloned())
    }

    async fn save_profile(&self, profile: &PlayerProfile) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .profiles
            .insert(profile.player_id.clone(), profile.clone());
        Ok(())
    }

    async fn get_ledger(&self, player_id: &str) -> anyhow::Result<Option<ResourceLedger>> {
        Ok(self.inner.read().await.ledgers.get(player_id).cloned())
    }

    async fn save_ledger(&self, ledger: &ResourceLedger) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .ledgers
            .insert(ledger.player_id.clone(), ledger.clone());
        Ok(())
    }

    async fn commit_turn(&self, ledger: &ResourceLedger, entry: &AuditEntry) -> anyhow::Result<()> {
        // Both writes land under one guard so no reader can observe a ledger
        // update without its audit entry.
        let mut state = self.inner.write().await;
        state
            .ledgers
            .insert(ledger.player_id.clone(), ledger.clone());
        state.audit_log.push(entry.clone());
        Ok(())
    }
}

#[derive(Clone)]
struct DynamoLedgerStore {
    client: DynamoClient,
    profile_table: String,
    ledger_table: String,
    audit_table: String,
}

impl DynamoLedgerStore {
    async fn from_env() -> Option<Self> {
        if std::env::var("DYNAMODB_ENDPOINT").is_err() && std::env::var("AWS_REGION").is_err() {
            return None;
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Some(Self {
            client: DynamoClient::new(&config),
            profile_table: env_string("PLAYER_PROFILES_TABLE", "player_profiles"),
            ledger_table: env_string("PLAYER_LEDGERS_TABLE", "player_ledgers"),
            audit_table: env_string("PLAYER_AUDIT_TABLE", "player_audit_log"),
        })
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        table: &str,
        player_id: &str,
    ) -> anyhow::Result<Option<T>> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .key("player_id", AttributeValue::S(player_id.to_string()))
            .send()
            .await
            .context(format!("dynamodb get_item failed for {table}"))?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        let doc = item
            .get("doc")
            .and_then(|attr| attr.as_s().ok())
            .ok_or_else(|| anyhow::anyhow!("item in {table} is missing the doc attribute"))?;
        Ok(Some(
            serde_json::from_str(doc).context(format!("invalid stored document in {table}"))?,
        ))
    }

    async fn put_doc<T: Serialize>(
        &self,
        table: &str,
        player_id: &str,
        value: &T,
    ) -> anyhow::Result<()> {
        let item = doc_item(player_id, serde_json::to_string(value)?);
        self.client
            .put_item()
            .table_name(table)
            .set_item(Some(item))
            .send()
            .await
            .context(format!("dynamodb put_item failed for {table}"))?;
        Ok(())
    }
}

fn doc_item(player_id: &str, doc: String) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(
        "player_id".to_string(),
        AttributeValue::S(player_id.to_string()),
    );
    item.insert("doc".to_string(), AttributeValue::S(doc));
    item
}

#[async_trait]
impl LedgerStore for DynamoLedgerStore {
    async fn get_profile(&self, player_id: &str) -> anyhow::Result<Option<PlayerProfile>> {
        self.get_doc(&self.profile_table, player_id).await
    }

    async fn save_profile(&self, profile: &PlayerProfile) -> anyhow::Result<()> {
        self.put_doc(&self.profile_table, &profile.player_id, profile)
            .await
    }

    async fn get_ledger(&self, player_id: &str) -> anyhow::Result<Option<ResourceLedger>> {
        self.get_doc(&self.ledger_table, player_id).await
    }

    async fn save_ledger(&self, ledger: &ResourceLedger) -> anyhow::Result<()> {
        self.put_doc(&self.ledger_table, &ledger.player_id, ledger)
            .await
    }

    async fn commit_turn(&self, ledger: &ResourceLedger, entry: &AuditEntry) -> anyhow::Result<()> {
        let ledger_item = doc_item(&ledger.player_id, serde_json::to_string(ledger)?);
        let mut audit_item = doc_item(&entry.player_id, serde_json::to_string(entry)?);
        audit_item.insert(
            "entry_id".to_string(),
            AttributeValue::S(entry.entry_id.clone()),
        );
        audit_item.insert(
            "created_at".to_string(),
            AttributeValue::S(entry.created_at.to_rfc3339()),
        );

        let ledger_put = Put::builder()
            .table_name(&self.ledger_table)
            .set_item(Some(ledger_item))
            .build()
            .context("failed to build ledger put")?;
        let audit_put = Put::builder()
            .table_name(&self.audit_table)
            .set_item(Some(audit_item))
            .build()
            .context("failed to build audit put")?;

        self.client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(ledger_put).build())
            .transact_items(TransactWriteItem::builder().put(audit_put).build())
            .send()
            .await
            .context("dynamodb transact_write_items failed for turn commit")?;
        Ok(())
    }
}

/// Client seam for narrative-service.
#[async_trait]
trait NarrativeGenerator: Send + Sync {
    async fn evaluate_plan(
        &self,
        request: &PlanEvaluationRequest,
    ) -> anyhow::Result<PlanEvaluationResponse>;
    async fn scandal_headline(
        &self,
        request: &ScandalHeadlineRequest,
    ) -> anyhow::Result<ScandalHeadlineResponse>;
    async fn corruption_types(
        &self,
        request: &CorruptionTypesRequest,
    ) -> anyhow::Result<CorruptionTypesResponse>;
    async fn corruption_cards(
        &self,
        request: &CorruptionCardsRequest,
    ) -> anyhow::Result<CorruptionCardsResponse>;
    async fn wildcard_plan(
        &self,
        request: &WildcardPlanRequest,
    ) -> anyhow::Result<WildcardPlanResponse>;
}

#[derive(Clone)]
struct HttpNarrativeGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNarrativeGenerator {
    fn from_env() -> anyhow::Result<Self> {
        let timeout_ms: u64 = env_parse("NARRATIVE_TIMEOUT_MS", 30_000);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build narrative http client")?;
        Ok(Self {
            client,
            base_url: env_string("NARRATIVE_BASE_URL", "http://narrative-service:8085"),
        })
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> anyhow::Result<Resp> {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context(format!("narrative request to {path} failed"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            anyhow::bail!("narrative-service {path} returned {status}: {body}");
        }
        response
            .json::<Resp>()
            .await
            .context(format!("invalid narrative response from {path}"))
    }
}

#[async_trait]
impl NarrativeGenerator for HttpNarrativeGenerator {
    async fn evaluate_plan(
        &self,
        request: &PlanEvaluationRequest,
    ) -> anyhow::Result<PlanEvaluationResponse> {
        self.post_json("internal/v1/plan-evaluations", request).await
    }

    async fn scandal_headline(
        &self,
        request: &ScandalHeadlineRequest,
    ) -> anyhow::Result<ScandalHeadlineResponse> {
        self.post_json("internal/v1/scandal-headlines", request)
            .await
    }

    async fn corruption_types(
        &self,
        request: &CorruptionTypesRequest,
    ) -> anyhow::Result<CorruptionTypesResponse> {
        self.post_json("internal/v1/corruption-types", request).await
    }

    async fn corruption_cards(
        &self,
        request: &CorruptionCardsRequest,
    ) -> anyhow::Result<CorruptionCardsResponse> {
        self.post_json("internal/v1/corruption-cards", request).await
    }

    async fn wildcard_plan(
        &self,
        request: &WildcardPlanRequest,
    ) -> anyhow::Result<WildcardPlanResponse> {
        self.post_json("internal/v1/wildcard-plans", request).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "game_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env().await?;
    let app = build_router(state);

    let bind_addr = parse_bind_addr("GAME_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "game-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/players", post(onboard_player_handler))
        .route("/api/players/{player_id}/progress", get(progress_handler))
        .route("/api/players/{player_id}/turns", post(submit_turn_handler))
        .route(
            "/api/players/{player_id}/corruption-types",
            post(corruption_types_handler),
        )
        .route(
            "/api/players/{player_id}/corruption-cards",
            post(corruption_cards_handler),
        )
        .route(
            "/api/players/{player_id}/wildcard-plan",
            post(wildcard_plan_handler),
        )
        .route("/api/players/{player_id}/bonus", post(bonus_handler))
        .route("/api/players/{player_id}/cover-up", post(cover_up_handler))
        .route(
            "/api/monetization/{player_id}/premium",
            post(simulate_premium_handler),
        )
        .route(
            "/api/monetization/{player_id}/scandal-rescue",
            post(simulate_scandal_rescue_handler),
        )
        .route(
            "/api/monetization/payment-webhook",
            post(payment_webhook_handler),
        )
        .route("/api/config", get(config_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "game-service"}))
}

async fn load_profile(state: &AppState, player_id: &str) -> Result<PlayerProfile, ApiError> {
    state
        .store
        .get_profile(player_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("player {player_id} not found")))
}

async fn load_ledger(state: &AppState, player_id: &str) -> Result<ResourceLedger, ApiError> {
    state
        .store
        .get_ledger(player_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("no ledger for player {player_id}")))
}

fn current_level(state: &AppState, ledger: &ResourceLedger) -> Result<LevelDefinition, ApiError> {
    state
        .catalog
        .lookup(ledger.level)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("no definition for level {}", ledger.level)))
}

fn progress_response(
    state: &AppState,
    profile: PlayerProfile,
    ledger: ResourceLedger,
) -> Result<Json<PlayerProgressResponse>, ApiError> {
    let level_info = current_level(state, &ledger)?;
    let next_level_info = state.catalog.lookup(ledger.level + 1).cloned();
    Ok(Json(PlayerProgressResponse {
        profile,
        ledger,
        level_info,
        next_level_info,
        max_level: state.catalog.max_level(),
    }))
}

async fn onboard_player_handler(
    State(state): State<AppState>,
    Json(request): Json<OnboardPlayerRequest>,
) -> Result<Json<PlayerProgressResponse>, ApiError> {
    let player_id = request
        .player_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if state
        .store
        .get_profile(&player_id)
        .await
        .map_err(store_failure)?
        .is_some()
    {
        return Err(ApiError::bad_request(format!(
            "player {player_id} already exists"
        )));
    }

    let profile = PlayerProfile {
        player_id: player_id.clone(),
        nickname: request
            .nickname
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Anonymous Operator".to_string()),
        language: request.language.unwrap_or_else(|| "en".to_string()),
        premium: false,
        scandal_rescue_credit: false,
        created_at: Utc::now(),
    };
    let ledger = ResourceLedger::new(player_id.clone());

    state
        .store
        .save_profile(&profile)
        .await
        .map_err(store_failure)?;
    state
        .store
        .save_ledger(&ledger)
        .await
        .map_err(store_failure)?;
    info!(player_id = %player_id, "player onboarded");

    progress_response(&state, profile, ledger)
}

async fn progress_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerProgressResponse>, ApiError> {
    let profile = load_profile(&state, &player_id).await?;
    let ledger = load_ledger(&state, &player_id).await?;
    progress_response(&state, profile, ledger)
}

async fn submit_turn_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
    Json(request): Json<SubmitTurnRequest>,
) -> Result<Json<TurnOutcomeResponse>, ApiError> {
    let lock = state.player_lock(&player_id).await;
    let _guard = lock.lock().await;

    let profile = load_profile(&state, &player_id).await?;
    let ledger = load_ledger(&state, &player_id).await?;
    let level_info = current_level(&state, &ledger)?;
    let language = request
        .language
        .clone()
        .unwrap_or_else(|| profile.language.clone());

    let evaluation = state
        .narrative
        .evaluate_plan(&PlanEvaluationRequest {
            player_id: player_id.clone(),
            role_title: level_info.title.clone(),
            action_title: request.action_title.clone(),
            action_tags: request.action_tags.clone(),
            plan_text: request.plan_text.clone(),
            language: language.clone(),
            level: ledger.level,
        })
        .await
        .map_err(|error| ApiError::bad_gateway(format!("plan evaluation failed: {error:#}")))?;

    let resolution = resolve_turn(&ledger, &state.catalog, &evaluation.judgment)
        .map_err(|error| ApiError::not_found(error.to_string()))?;
    if !resolution.defaulted_judgment_fields.is_empty() {
        warn!(
            player_id = %player_id,
            fields = ?resolution.defaulted_judgment_fields,
            "judgment fields missing or non-numeric, treated as zero"
        );
    }

    let mut staged = resolution.ledger.clone();
    staged.updated_at = Utc::now();

    // A scandal turn may only be committed with its headline; on failure the
    // whole turn aborts and the stored state stays untouched.
    let scandal_headline = if resolution.scandal_pending {
        let generated = state
            .narrative
            .scandal_headline(&ScandalHeadlineRequest {
                player_id: player_id.clone(),
                role_title: level_info.title.clone(),
                language: language.clone(),
                exposure: staged.be,
            })
            .await
            .map_err(|error| {
                warn!(player_id = %player_id, error = %error, "scandal headline generation failed, aborting turn");
                ApiError::bad_gateway(format!("scandal headline generation failed: {error:#}"))
            })?;
        Some(generated.headline)
    } else {
        None
    };

    let entry = build_audit_entry(
        &ledger,
        &staged,
        &request.action_title,
        serde_json::json!({
            "tags": request.action_tags.clone(),
            "narrated_plan": request.plan_text.clone(),
            "scandal_headline": scandal_headline.clone(),
        }),
    );
    state
        .store
        .commit_turn(&staged, &entry)
        .await
        .map_err(store_failure)?;

    info!(
        player_id = %player_id,
        level = staged.level,
        pc = staged.pc,
        inf = staged.inf,
        be = staged.be,
        ascended = resolution.ascended,
        won = resolution.won,
        scandal = resolution.scandal_pending,
        "turn resolved"
    );

    let post_level_info = current_level(&state, &staged)?;
    let next_level_info = state.catalog.lookup(staged.level + 1).cloned();
    Ok(Json(TurnOutcomeResponse {
        ledger: staged,
        level_info: post_level_info,
        next_level_info,
        deltas: resolution.deltas,
        ascended: resolution.ascended,
        won: resolution.won,
        scandal_triggered: resolution.scandal_pending,
        scandal_headline,
        evaluation: evaluation.evaluation,
        advice: evaluation.advice,
    }))
}

#[derive(Debug, Deserialize)]
struct GenerateTypesApiRequest {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    num_types: Option<u32>,
}

async fn corruption_types_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
    Json(request): Json<GenerateTypesApiRequest>,
) -> Result<Json<CorruptionTypesResponse>, ApiError> {
    let profile = load_profile(&state, &player_id).await?;
    let ledger = load_ledger(&state, &player_id).await?;
    let level_info = current_level(&state, &ledger)?;
    let response = state
        .narrative
        .corruption_types(&CorruptionTypesRequest {
            player_id,
            role_title: level_info.title,
            language: request.language.unwrap_or(profile.language),
            num_types: request
                .num_types
                .unwrap_or(state.tuning.num_corruption_types),
        })
        .await
        .map_err(|error| {
            ApiError::bad_gateway(format!("corruption type generation failed: {error:#}"))
        })?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct GenerateCardsApiRequest {
    category: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    num_cards: Option<u32>,
}

async fn corruption_cards_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
    Json(request): Json<GenerateCardsApiRequest>,
) -> Result<Json<CorruptionCardsResponse>, ApiError> {
    let profile = load_profile(&state, &player_id).await?;
    let ledger = load_ledger(&state, &player_id).await?;
    let level_info = current_level(&state, &ledger)?;
    let response = state
        .narrative
        .corruption_cards(&CorruptionCardsRequest {
            player_id,
            role_title: level_info.title,
            category: request.category,
            language: request.language.unwrap_or(profile.language),
            num_cards: request
                .num_cards
                .unwrap_or(state.tuning.num_corruption_cards),
        })
        .await
        .map_err(|error| {
            ApiError::bad_gateway(format!("corruption card generation failed: {error:#}"))
        })?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct GeneratePlanApiRequest {
    action_title: String,
    #[serde(default)]
    action_description: Option<String>,
    #[serde(default)]
    action_tags: Vec<String>,
    #[serde(default)]
    language: Option<String>,
}

/// Improvises a plan for a drawn action when the player does not want to
/// write one.
async fn wildcard_plan_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
    Json(request): Json<GeneratePlanApiRequest>,
) -> Result<Json<WildcardPlanResponse>, ApiError> {
    let profile = load_profile(&state, &player_id).await?;
    let response = state
        .narrative
        .wildcard_plan(&WildcardPlanRequest {
            player_id,
            action_title: request.action_title,
            action_description: request.action_description,
            action_tags: request.action_tags,
            language: request.language.unwrap_or(profile.language),
        })
        .await
        .map_err(|error| {
            ApiError::bad_gateway(format!("wildcard plan generation failed: {error:#}"))
        })?;
    Ok(Json(response))
}

/// Rewarded-ad style grant: progress up to the level cap, a little exposure
/// relief. No audit entry and no ascension check.
async fn bonus_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerProgressResponse>, ApiError> {
    let lock = state.player_lock(&player_id).await;
    let _guard = lock.lock().await;

    let profile = load_profile(&state, &player_id).await?;
    let mut ledger = load_ledger(&state, &player_id).await?;
    let level_info = current_level(&state, &ledger)?;

    ledger.apply_gain(
        state.tuning.bonus_pc_grant,
        0,
        -state.tuning.bonus_be_relief,
        level_info.pc_required_for_ascension,
    );
    ledger.updated_at = Utc::now();
    state
        .store
        .save_ledger(&ledger)
        .await
        .map_err(store_failure)?;
    info!(player_id = %player_id, pc = ledger.pc, be = ledger.be, "bonus granted");

    progress_response(&state, profile, ledger)
}

async fn cover_up_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerProgressResponse>, ApiError> {
    let lock = state.player_lock(&player_id).await;
    let _guard = lock.lock().await;

    let mut profile = load_profile(&state, &player_id).await?;
    let mut ledger = load_ledger(&state, &player_id).await?;
    let level_info = current_level(&state, &ledger)?;

    if profile.scandal_rescue_credit {
        // A purchased rescue stands in for the influence cost, once.
        profile.scandal_rescue_credit = false;
        ledger.apply_gain(
            0,
            0,
            -state.tuning.cover_up_be_relief,
            level_info.pc_required_for_ascension,
        );
        ledger.updated_at = Utc::now();
        // Relief lands before the credit is burned: a failure in between
        // leaves the player with the credit, not without the relief.
        state
            .store
            .save_ledger(&ledger)
            .await
            .map_err(store_failure)?;
        state
            .store
            .save_profile(&profile)
            .await
            .map_err(store_failure)?;
        info!(player_id = %player_id, be = ledger.be, "cover-up via rescue credit");
        return progress_response(&state, profile, ledger);
    }

    if ledger.inf < state.tuning.cover_up_inf_cost {
        return Err(ApiError::bad_request("INSUFFICIENT_INFLUENCE"));
    }
    ledger.apply_gain(
        0,
        -state.tuning.cover_up_inf_cost,
        -state.tuning.cover_up_be_relief,
        level_info.pc_required_for_ascension,
    );
    ledger.updated_at = Utc::now();
    state
        .store
        .save_ledger(&ledger)
        .await
        .map_err(store_failure)?;
    info!(player_id = %player_id, inf = ledger.inf, be = ledger.be, "cover-up applied");

    progress_response(&state, profile, ledger)
}

#[derive(Debug, Serialize)]
struct EntitlementResponse {
    player_id: PlayerId,
    premium: bool,
    scandal_rescue_credit: bool,
}

async fn simulate_premium_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let mut profile = load_profile(&state, &player_id).await?;
    if profile.premium {
        return Err(ApiError::bad_request(format!(
            "player {player_id} is already premium"
        )));
    }
    profile.premium = true;
    state
        .store
        .save_profile(&profile)
        .await
        .map_err(store_failure)?;
    info!(player_id = %player_id, "premium entitlement granted");
    Ok(Json(EntitlementResponse {
        player_id: profile.player_id,
        premium: profile.premium,
        scandal_rescue_credit: profile.scandal_rescue_credit,
    }))
}

async fn simulate_scandal_rescue_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let mut profile = load_profile(&state, &player_id).await?;
    profile.scandal_rescue_credit = true;
    state
        .store
        .save_profile(&profile)
        .await
        .map_err(store_failure)?;
    info!(player_id = %player_id, "scandal rescue credit granted");
    Ok(Json(EntitlementResponse {
        player_id: profile.player_id,
        premium: profile.premium,
        scandal_rescue_credit: profile.scandal_rescue_credit,
    }))
}

#[derive(Debug, Deserialize)]
struct PaymentWebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<PaymentWebhookData>,
}

#[derive(Debug, Default, Deserialize)]
struct PaymentWebhookData {
    #[serde(default)]
    object: Option<PaymentWebhookObject>,
}

#[derive(Debug, Deserialize)]
struct PaymentWebhookObject {
    #[serde(default)]
    client_reference_id: Option<String>,
}

/// Payment-provider callback. Always acknowledged so the provider does not
/// retry forever; signature verification lives in the provider integration.
async fn payment_webhook_handler(
    State(state): State<AppState>,
    Json(event): Json<PaymentWebhookEvent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if event.event_type == "checkout.session.completed" {
        let player_id = event
            .data
            .and_then(|data| data.object)
            .and_then(|object| object.client_reference_id);
        match player_id {
            Some(player_id) => match state
                .store
                .get_profile(&player_id)
                .await
                .map_err(store_failure)?
            {
                Some(mut profile) => {
                    profile.premium = true;
                    state
                        .store
                        .save_profile(&profile)
                        .await
                        .map_err(store_failure)?;
                    info!(player_id = %player_id, "premium activated via payment webhook");
                }
                None => {
                    warn!(player_id = %player_id, "payment webhook for unknown player");
                }
            },
            None => {
                warn!("payment webhook without client_reference_id");
            }
        }
    } else {
        info!(event_type = %event.event_type, "ignoring unhandled payment event");
    }
    Ok(Json(serde_json::json!({"received": true})))
}

#[derive(Debug, Serialize)]
struct GameConfigResponse {
    max_level: u32,
    levels: Vec<LevelDefinition>,
    scandal_threshold: f64,
    bonus_pc_grant: i64,
    bonus_be_relief: f64,
    cover_up_inf_cost: i64,
    cover_up_be_relief: f64,
}

async fn config_handler(State(state): State<AppState>) -> Json<GameConfigResponse> {
    Json(GameConfigResponse {
        max_level: state.catalog.max_level(),
        levels: state.catalog.definitions().to_vec(),
        scandal_threshold: EXPOSURE_SCANDAL_THRESHOLD,
        bonus_pc_grant: state.tuning.bonus_pc_grant,
        bonus_be_relief: state.tuning.bonus_be_relief,
        cover_up_inf_cost: state.tuning.cover_up_inf_cost,
        cover_up_be_relief: state.tuning.cover_up_be_relief,
    })
}

fn store_failure(error: anyhow::Error) -> ApiError {
    ApiError::unavailable(format!("persistence failure: {error:#}"))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use venalia_common::TurnJudgment;

    struct ScriptedNarrative {
        judgment: TurnJudgment,
        evaluation: String,
        advice: String,
        headline: String,
        fail_headline: bool,
        headline_calls: Mutex<u32>,
    }

    impl ScriptedNarrative {
        fn new(judgment: TurnJudgment) -> Self {
            Self {
                judgment,
                evaluation: "A serviceable scheme.".to_string(),
                advice: "Spread the money wider next time.".to_string(),
                headline: "COUNCILOR CAUGHT WITH BAGS OF CASH".to_string(),
                fail_headline: false,
                headline_calls: Mutex::new(0),
            }
        }

        fn failing_headlines(judgment: TurnJudgment) -> Self {
            Self {
                fail_headline: true,
                ..Self::new(judgment)
            }
        }

        fn headline_call_count(&self) -> u32 {
            *self.headline_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl NarrativeGenerator for ScriptedNarrative {
        async fn evaluate_plan(
            &self,
            _request: &PlanEvaluationRequest,
        ) -> anyhow::Result<PlanEvaluationResponse> {
            Ok(PlanEvaluationResponse {
                judgment: self.judgment,
                evaluation: self.evaluation.clone(),
                advice: self.advice.clone(),
            })
        }

        async fn scandal_headline(
            &self,
            _request: &ScandalHeadlineRequest,
        ) -> anyhow::Result<ScandalHeadlineResponse> {
            *self.headline_calls.lock().unwrap() += 1;
            if self.fail_headline {
                anyhow::bail!("narrative backend unavailable");
            }
            Ok(ScandalHeadlineResponse {
                headline: self.headline.clone(),
            })
        }

        async fn corruption_types(
            &self,
            request: &CorruptionTypesRequest,
        ) -> anyhow::Result<CorruptionTypesResponse> {
            Ok(CorruptionTypesResponse {
                categories: (0..request.num_types)
                    .map(|index| format!("Category {index}"))
                    .collect(),
            })
        }

        async fn corruption_cards(
            &self,
            _request: &CorruptionCardsRequest,
        ) -> anyhow::Result<CorruptionCardsResponse> {
            Ok(CorruptionCardsResponse { cards: Vec::new() })
        }

        async fn wildcard_plan(
            &self,
            request: &WildcardPlanRequest,
        ) -> anyhow::Result<WildcardPlanResponse> {
            Ok(WildcardPlanResponse {
                plan: format!("Improvised: {}", request.action_title),
            })
        }
    }

    /// In-memory store whose profile saves can be switched to fail.
    struct ProfileSaveFailingStore {
        inner: InMemoryLedgerStore,
        fail_profile_saves: std::sync::atomic::AtomicBool,
    }

    impl ProfileSaveFailingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryLedgerStore::default(),
                fail_profile_saves: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl LedgerStore for ProfileSaveFailingStore {
        async fn get_profile(&self, player_id: &str) -> anyhow::Result<Option<PlayerProfile>> {
            self.inner.get_profile(player_id).await
        }

        async fn save_profile(&self, profile: &PlayerProfile) -> anyhow::Result<()> {
            if self
                .fail_profile_saves
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                anyhow::bail!("profile table unavailable");
            }
            self.inner.save_profile(profile).await
        }

        async fn get_ledger(&self, player_id: &str) -> anyhow::Result<Option<ResourceLedger>> {
            self.inner.get_ledger(player_id).await
        }

        async fn save_ledger(&self, ledger: &ResourceLedger) -> anyhow::Result<()> {
            self.inner.save_ledger(ledger).await
        }

        async fn commit_turn(
            &self,
            ledger: &ResourceLedger,
            entry: &AuditEntry,
        ) -> anyhow::Result<()> {
            self.inner.commit_turn(ledger, entry).await
        }
    }

    fn test_catalog() -> LevelCatalog {
        LevelCatalog::new(vec![
            LevelDefinition {
                level_number: 1,
                title: "City Councilor".to_string(),
                pc_required_for_ascension: 100,
                pc_gain_factor: 1.5,
                inf_gain_factor: 1.0,
            },
            LevelDefinition {
                level_number: 2,
                title: "Mayor".to_string(),
                pc_required_for_ascension: 250,
                pc_gain_factor: 1.2,
                inf_gain_factor: 1.0,
            },
        ])
        .unwrap()
    }

    fn judgment(pc: f64, be: f64, inf: f64) -> TurnJudgment {
        TurnJudgment {
            progress_gain_score: Some(pc),
            exposure_risk_score: Some(be),
            influence_gain_score: Some(inf),
        }
    }

    fn app_state(
        narrative: ScriptedNarrative,
    ) -> (AppState, Arc<InMemoryLedgerStore>, Arc<ScriptedNarrative>) {
        let store = Arc::new(InMemoryLedgerStore::default());
        let narrative = Arc::new(narrative);
        let state = AppState {
            store: store.clone(),
            narrative: narrative.clone(),
            catalog: Arc::new(test_catalog()),
            tuning: Arc::new(GameTuning::default()),
            player_locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };
        (state, store, narrative)
    }

    async fn onboard(state: &AppState, player_id: &str) {
        onboard_player_handler(
            State(state.clone()),
            Json(OnboardPlayerRequest {
                player_id: Some(player_id.to_string()),
                nickname: None,
                language: None,
            }),
        )
        .await
        .unwrap();
    }

    async fn seed_ledger(store: &InMemoryLedgerStore, ledger: &ResourceLedger) {
        store.save_ledger(ledger).await.unwrap();
    }

    fn turn_request() -> SubmitTurnRequest {
        SubmitTurnRequest {
            action_title: "Rig the paving contract".to_string(),
            action_tags: vec!["bribe".to_string(), "contract".to_string()],
            plan_text: "Steer the contract to a friendly firm for a cut.".to_string(),
            language: None,
        }
    }

    #[tokio::test]
    async fn onboarding_creates_a_fresh_ledger() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        let Json(response) = onboard_player_handler(
            State(state.clone()),
            Json(OnboardPlayerRequest {
                player_id: Some("p1".to_string()),
                nickname: Some("Don Tito".to_string()),
                language: Some("es".to_string()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.profile.nickname, "Don Tito");
        assert!(!response.profile.premium);
        assert_eq!(response.ledger.pc, 0);
        assert_eq!(response.ledger.inf, 0);
        assert_eq!(response.ledger.be, 0.0);
        assert_eq!(response.ledger.level, 1);
        assert_eq!(response.level_info.title, "City Councilor");
        assert_eq!(response.next_level_info.as_ref().unwrap().title, "Mayor");
        assert_eq!(response.max_level, 2);
    }

    #[tokio::test]
    async fn onboarding_rejects_duplicate_players() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let error = onboard_player_handler(
            State(state.clone()),
            Json(OnboardPlayerRequest {
                player_id: Some("p1".to_string()),
                nickname: None,
                language: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn progress_for_unknown_player_is_not_found() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        let error = progress_handler(State(state.clone()), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn turn_applies_the_economy_and_ascends_at_the_threshold() {
        let (state, store, _) = app_state(ScriptedNarrative::new(judgment(10.0, 5.0, 3.0)));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.pc = 90;
        seeded.inf = 20;
        seeded.be = 30.0;
        seed_ledger(&store, &seeded).await;

        let Json(outcome) = submit_turn_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(turn_request()),
        )
        .await
        .unwrap();

        assert!(outcome.ascended);
        assert!(!outcome.won);
        assert!(!outcome.scandal_triggered);
        assert_eq!(outcome.ledger.level, 2);
        assert_eq!(outcome.ledger.pc, 100);
        assert_eq!(outcome.ledger.inf, 5);
        assert!((outcome.ledger.be - 38.0).abs() < 1e-9);
        assert_eq!(outcome.deltas.pc_gain, 18);
        assert_eq!(outcome.level_info.title, "Mayor");
        assert_eq!(outcome.evaluation, "A serviceable scheme.");

        let audit = store.inner.read().await.audit_log.clone();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].pc_change, 10);
        assert_eq!(audit[0].inf_change, -15);
        assert!((audit[0].be_change - 8.0).abs() < 1e-9);
        assert_eq!(audit[0].action_title, "Rig the paving contract");
    }

    #[tokio::test]
    async fn quiet_turns_never_ask_for_a_headline() {
        let (state, _, narrative) = app_state(ScriptedNarrative::new(judgment(1.0, 1.0, 0.0)));
        onboard(&state, "p1").await;
        submit_turn_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(turn_request()),
        )
        .await
        .unwrap();
        assert_eq!(narrative.headline_call_count(), 0);
    }

    #[tokio::test]
    async fn failed_headline_aborts_the_turn_without_persisting() {
        let (state, store, narrative) =
            app_state(ScriptedNarrative::failing_headlines(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.be = 90.0;
        seed_ledger(&store, &seeded).await;

        let error = submit_turn_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(turn_request()),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(narrative.headline_call_count(), 1);
        let stored = store.get_ledger("p1").await.unwrap().unwrap();
        assert_eq!(stored, seeded);
        assert!(store.inner.read().await.audit_log.is_empty());
    }

    #[tokio::test]
    async fn scandal_turn_commits_with_its_headline() {
        let (state, store, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.be = 90.0;
        seed_ledger(&store, &seeded).await;

        let Json(outcome) = submit_turn_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(turn_request()),
        )
        .await
        .unwrap();

        assert!(outcome.scandal_triggered);
        assert_eq!(
            outcome.scandal_headline.as_deref(),
            Some("COUNCILOR CAUGHT WITH BAGS OF CASH")
        );
        assert!((outcome.ledger.be - 89.0).abs() < 1e-9);
        let audit = store.inner.read().await.audit_log.clone();
        assert_eq!(audit.len(), 1);
        assert_eq!(
            audit[0].details["scandal_headline"],
            serde_json::json!("COUNCILOR CAUGHT WITH BAGS OF CASH")
        );
    }

    #[tokio::test]
    async fn winning_at_the_top_level_sticks() {
        let (state, store, _) = app_state(ScriptedNarrative::new(judgment(10.0, 0.0, 0.0)));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.level = 2;
        seeded.pc = 249;
        seed_ledger(&store, &seeded).await;

        let Json(outcome) = submit_turn_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(turn_request()),
        )
        .await
        .unwrap();
        assert!(outcome.won);
        assert!(outcome.ledger.has_won);
        assert!(!outcome.ascended);
        assert_eq!(outcome.ledger.level, 2);

        let stored = store.get_ledger("p1").await.unwrap().unwrap();
        assert!(stored.has_won);
    }

    #[tokio::test]
    async fn bonus_grant_respects_the_level_cap() {
        let (state, store, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.pc = 95;
        seeded.be = 10.0;
        seed_ledger(&store, &seeded).await;

        let Json(response) = bonus_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap();
        assert_eq!(response.ledger.pc, 100);
        assert_eq!(response.ledger.be, 5.0);
        // No ascension and no audit entry from a bonus.
        assert_eq!(response.ledger.level, 1);
        assert!(store.inner.read().await.audit_log.is_empty());
    }

    #[tokio::test]
    async fn cover_up_spends_influence_for_exposure_relief() {
        let (state, store, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.inf = 20;
        seeded.be = 50.0;
        seed_ledger(&store, &seeded).await;

        let Json(response) = cover_up_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap();
        assert_eq!(response.ledger.inf, 10);
        assert_eq!(response.ledger.be, 35.0);
    }

    #[tokio::test]
    async fn cover_up_rejects_insufficient_influence() {
        let (state, store, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.inf = 5;
        seeded.be = 50.0;
        seed_ledger(&store, &seeded).await;

        let error = cover_up_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        let stored = store.get_ledger("p1").await.unwrap().unwrap();
        assert_eq!(stored.be, 50.0);
    }

    #[tokio::test]
    async fn cover_up_consumes_a_rescue_credit_instead_of_influence() {
        let (state, store, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        simulate_scandal_rescue_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap();
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.inf = 0;
        seeded.be = 50.0;
        seed_ledger(&store, &seeded).await;

        let Json(response) = cover_up_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap();
        assert_eq!(response.ledger.inf, 0);
        assert_eq!(response.ledger.be, 35.0);
        assert!(!response.profile.scandal_rescue_credit);
        let profile = store.get_profile("p1").await.unwrap().unwrap();
        assert!(!profile.scandal_rescue_credit);
    }

    #[tokio::test]
    async fn cover_up_keeps_the_credit_when_the_profile_save_fails() {
        let store = Arc::new(ProfileSaveFailingStore::new());
        let state = AppState {
            store: store.clone(),
            narrative: Arc::new(ScriptedNarrative::new(TurnJudgment::default())),
            catalog: Arc::new(test_catalog()),
            tuning: Arc::new(GameTuning::default()),
            player_locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };
        onboard(&state, "p1").await;
        simulate_scandal_rescue_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap();
        let mut seeded = ResourceLedger::new("p1".to_string());
        seeded.be = 50.0;
        store.inner.save_ledger(&seeded).await.unwrap();
        store
            .fail_profile_saves
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let error = cover_up_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);

        // The relief was persisted and the credit survives for a retry.
        let profile = store.inner.get_profile("p1").await.unwrap().unwrap();
        assert!(profile.scandal_rescue_credit);
        let ledger = store.inner.get_ledger("p1").await.unwrap().unwrap();
        assert_eq!(ledger.be, 35.0);
    }

    #[tokio::test]
    async fn wildcard_plan_passthrough_requires_a_known_player() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;

        let Json(response) = wildcard_plan_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(GeneratePlanApiRequest {
                action_title: "Envelope diplomacy".to_string(),
                action_description: Some("Grease the inspection".to_string()),
                action_tags: vec!["bribe".to_string()],
                language: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.plan, "Improvised: Envelope diplomacy");

        let error = wildcard_plan_handler(
            State(state.clone()),
            Path("ghost".to_string()),
            Json(GeneratePlanApiRequest {
                action_title: "Envelope diplomacy".to_string(),
                action_description: None,
                action_tags: Vec::new(),
                language: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn payment_webhook_flips_the_premium_flag() {
        let (state, store, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;

        let event: PaymentWebhookEvent = serde_json::from_value(serde_json::json!({
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "p1"}}
        }))
        .unwrap();
        let Json(ack) = payment_webhook_handler(State(state.clone()), Json(event))
            .await
            .unwrap();
        assert_eq!(ack, serde_json::json!({"received": true}));
        assert!(store.get_profile("p1").await.unwrap().unwrap().premium);
    }

    #[tokio::test]
    async fn payment_webhook_acknowledges_unknown_players() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        let event: PaymentWebhookEvent = serde_json::from_value(serde_json::json!({
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "ghost"}}
        }))
        .unwrap();
        let Json(ack) = payment_webhook_handler(State(state.clone()), Json(event))
            .await
            .unwrap();
        assert_eq!(ack, serde_json::json!({"received": true}));
    }

    #[tokio::test]
    async fn premium_cannot_be_granted_twice() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        simulate_premium_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap();
        let error = simulate_premium_handler(State(state.clone()), Path("p1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn corruption_types_use_the_tuned_default_count() {
        let (state, _, _) = app_state(ScriptedNarrative::new(TurnJudgment::default()));
        onboard(&state, "p1").await;
        let Json(response) = corruption_types_handler(
            State(state.clone()),
            Path("p1".to_string()),
            Json(GenerateTypesApiRequest {
                language: None,
                num_types: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.categories.len(), 10);
    }
}
