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
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use venalia_common::{
    CorruptionCard, CorruptionCardsRequest, CorruptionCardsResponse, CorruptionTypesRequest,
    CorruptionTypesResponse, PlanEvaluationRequest, PlanEvaluationResponse, PlayerId,
    ScandalHeadlineRequest, ScandalHeadlineResponse, TurnJudgment, WildcardPlanRequest,
    WildcardPlanResponse, render_template,
};

const FALLBACK_HEADLINE: &str = "LOCAL POLITICIAN DENIES EVERYTHING, CONVINCES NO ONE";

const CARD_IMAGE_POOL: &[&str] = &[
    "/images/cards/briefcase.png",
    "/images/cards/envelope.png",
    "/images/cards/handshake.png",
    "/images/cards/ledger.png",
    "/images/cards/limousine.png",
    "/images/cards/offshore.png",
    "/images/cards/podium.png",
    "/images/cards/shredder.png",
];

#[derive(Clone)]
struct AppState {
    backend: Arc<dyn ChatBackend>,
    prompts: Arc<PromptLibrary>,
    retry: RetryPolicy,
    // Categories already served per player, to steer the model away from
    // repeats.
    category_history: Arc<tokio::sync::Mutex<HashMap<PlayerId, Vec<String>>>>,
}

impl AppState {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            backend: Arc::new(HttpChatBackend::from_env()?),
            prompts: Arc::new(load_prompt_library()),
            retry: RetryPolicy::from_env(),
            category_history: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    fn from_env() -> Self {
        Self {
            max_attempts: env_parse("LLM_MAX_RETRIES", 3u32).max(1),
            delay: Duration::from_millis(env_parse("LLM_RETRY_DELAY_MS", 1000u64)),
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

#[derive(Debug, Clone)]
struct ChatPrompt {
    system: String,
    user: String,
    json_response: bool,
}

/// Seam over the chat-completion provider.
#[async_trait]
trait ChatBackend: Send + Sync {
    async fn complete(&self, prompt: &ChatPrompt) -> anyhow::Result<String>;
}

struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl HttpChatBackend {
    fn from_env() -> anyhow::Result<Self> {
        let timeout_ms: u64 = env_parse("LLM_TIMEOUT_MS", 30_000);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build llm http client")?;
        Ok(Self {
            client,
            base_url: env_string("LLM_BASE_URL", "https://api.groq.com/openai/v1"),
            api_key: std::env::var("LLM_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            model: env_string("LLM_MODEL", "llama-3.3-70b-versatile"),
            temperature: env_parse("LLM_TEMPERATURE", 0.7),
            max_tokens: env_parse("LLM_MAX_TOKENS", 1024u32),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn complete(&self, prompt: &ChatPrompt) -> anyhow::Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .context("LLM_API_KEY is not configured")?;

        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });
        if prompt.json_response {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            anyhow::bail!("chat completion returned {status}: {body}");
        }

        let payload: Value = response
            .json()
            .await
            .context("invalid chat completion payload")?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("chat completion payload has no message content")
    }
}

#[derive(Debug, Clone)]
struct PromptPair {
    system: String,
    user: String,
}

#[derive(Debug, Clone)]
struct PromptLibrary {
    plan_evaluator: PromptPair,
    scandal_headline: PromptPair,
    category_generator: PromptPair,
    card_generator: PromptPair,
    wildcard_plan: PromptPair,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self {
            plan_evaluator: PromptPair {
                system: "You are the cynical judge of a satirical political corruption game. \
                         Score the player's scheme for effectiveness, exposure risk and \
                         influence gained, each 0-10. Respond in JSON: {\"evaluation\": \
                         {\"summary\": str, \"progress_gain\": {\"score\": number}, \
                         \"exposure_risk\": {\"score\": number}, \"influence_gain\": \
                         {\"score\": number}}, \"advice\": {\"text\": str}}. Write prose in \
                         {{language}}."
                    .to_string(),
                user: "The player holds the office of {{role}} (level {{level}}). Chosen \
                       action: {{action}} (tags: {{tags}}). Their plan: {{plan}}"
                    .to_string(),
            },
            scandal_headline: PromptPair {
                system: "You write savage tabloid headlines for a satirical corruption game. \
                         Respond in JSON: {\"headline\": str}, in {{language}}, all caps, one \
                         sentence."
                    .to_string(),
                user: "A scandal has just broken around the {{role}}. Public exposure level: \
                       {{exposure}} out of 100."
                    .to_string(),
            },
            category_generator: PromptPair {
                system: "You invent corruption categories for a satirical political game. \
                         Respond in JSON: {\"categories\": [str]}, names in {{language}}, each \
                         at most four words."
                    .to_string(),
                user: "Propose {{num_types}} corruption categories fitting a {{role}}. Avoid \
                       repeating any of: {{previous}}."
                    .to_string(),
            },
            card_generator: PromptPair {
                system: "You design corruption action cards for a satirical political game. \
                         Respond in JSON: {\"cards\": [{\"title\": str, \"description\": str, \
                         \"required_tags\": [str]}]}, text in {{language}}."
                    .to_string(),
                user: "Create {{num_cards}} cards in the category \"{{category}}\" suited to a \
                       {{role}}."
                    .to_string(),
            },
            wildcard_plan: PromptPair {
                system: "You improvise reckless corruption plans for a satirical political \
                         game. Reply with only the plan text, first person, two to four \
                         sentences, in {{language}}."
                    .to_string(),
                user: "The player drew the action \"{{action}}\" ({{description}}; tags: \
                       {{tags}}). Write the wildcard plan they blurt out."
                    .to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PromptPairFile {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default, alias = "user_prompt_template")]
    user_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PromptLibraryFile {
    #[serde(default)]
    plan_evaluator: PromptPairFile,
    #[serde(default)]
    scandal_headline: PromptPairFile,
    #[serde(default)]
    category_generator: PromptPairFile,
    #[serde(default)]
    card_generator: PromptPairFile,
    #[serde(default)]
    wildcard_plan: PromptPairFile,
}

fn load_prompt_library() -> PromptLibrary {
    let mut library = PromptLibrary::default();
    let Ok(path) = std::env::var("PROMPT_LIBRARY_PATH") else {
        return library;
    };
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read prompt library, using built-ins");
            return library;
        }
    };
    let parsed = match serde_yaml::from_str::<PromptLibraryFile>(&raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse prompt library, using built-ins");
            return library;
        }
    };
    apply_override(&mut library.plan_evaluator, parsed.plan_evaluator);
    apply_override(&mut library.scandal_headline, parsed.scandal_headline);
    apply_override(&mut library.category_generator, parsed.category_generator);
    apply_override(&mut library.card_generator, parsed.card_generator);
    apply_override(&mut library.wildcard_plan, parsed.wildcard_plan);
    info!(path = %path, "loaded prompt library overrides");
    library
}

fn apply_override(target: &mut PromptPair, file: PromptPairFile) {
    if let Some(system) = normalize_optional_string(file.system_prompt) {
        target.system = system;
    }
    if let Some(user) = normalize_optional_string(file.user_prompt) {
        target.user = user;
    }
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "narrative_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env()?;
    let app = build_router(state);

    let bind_addr = parse_bind_addr("NARRATIVE_SERVICE_BIND", "0.0.0.0:8085")?;
    info!(%bind_addr, "narrative-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/internal/v1/plan-evaluations",
            post(plan_evaluations_handler),
        )
        .route(
            "/internal/v1/scandal-headlines",
            post(scandal_headlines_handler),
        )
        .route(
            "/internal/v1/corruption-types",
            post(corruption_types_handler),
        )
        .route(
            "/internal/v1/corruption-cards",
            post(corruption_cards_handler),
        )
        .route("/internal/v1/wildcard-plans", post(wildcard_plans_handler))
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
    Json(serde_json::json!({"ok": true, "service": "narrative-service"}))
}

/// One chat round with retries around both the call and the JSON parse.
async fn generate_json(state: &AppState, label: &str, prompt: &ChatPrompt) -> anyhow::Result<Value> {
    let mut last_error = None;
    for attempt in 1..=state.retry.max_attempts {
        match state.backend.complete(prompt).await {
            Ok(content) => match parse_json_payload(&content) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!(label, attempt, error = %error, "model returned unusable payload");
                    last_error = Some(error);
                }
            },
            Err(error) => {
                warn!(label, attempt, error = %error, "chat completion attempt failed");
                last_error = Some(error);
            }
        }
        if attempt < state.retry.max_attempts {
            tokio::time::sleep(state.retry.delay).await;
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made"))).context(format!(
        "{label} failed after {} attempts",
        state.retry.max_attempts
    ))
}

/// Free-text variant of [`generate_json`]: retries until the model produces
/// a non-empty reply.
async fn generate_text(state: &AppState, label: &str, prompt: &ChatPrompt) -> anyhow::Result<String> {
    let mut last_error = None;
    for attempt in 1..=state.retry.max_attempts {
        match state.backend.complete(prompt).await {
            Ok(content) => {
                let trimmed = content.trim();
                if !trimmed.is_empty() {
                    return Ok(trimmed.to_string());
                }
                warn!(label, attempt, "model returned an empty reply");
                last_error = Some(anyhow::anyhow!("model returned an empty reply"));
            }
            Err(error) => {
                warn!(label, attempt, error = %error, "chat completion attempt failed");
                last_error = Some(error);
            }
        }
        if attempt < state.retry.max_attempts {
            tokio::time::sleep(state.retry.delay).await;
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made"))).context(format!(
        "{label} failed after {} attempts",
        state.retry.max_attempts
    ))
}

/// Models sometimes wrap JSON in markdown fences despite instructions.
fn parse_json_payload(content: &str) -> anyhow::Result<Value> {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();
    serde_json::from_str(trimmed).context("model response is not valid JSON")
}

/// Accepts a bare number, a `{"score"| "value" | "valor": ..}` object, or a
/// numeric string. Anything else is reported as missing and defaults
/// downstream.
fn extract_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Object(map) => ["score", "value", "valor"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(extract_score),
        _ => None,
    }
}

fn parse_evaluation(payload: &Value) -> PlanEvaluationResponse {
    let evaluation = payload.get("evaluation").unwrap_or(payload);
    let judgment = TurnJudgment {
        progress_gain_score: evaluation.get("progress_gain").and_then(extract_score),
        exposure_risk_score: evaluation.get("exposure_risk").and_then(extract_score),
        influence_gain_score: evaluation.get("influence_gain").and_then(extract_score),
    };
    let summary = evaluation
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let advice = payload
        .get("advice")
        .map(|advice| {
            advice
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| advice.as_str())
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default();
    PlanEvaluationResponse {
        judgment,
        evaluation: summary,
        advice,
    }
}

async fn plan_evaluations_handler(
    State(state): State<AppState>,
    Json(request): Json<PlanEvaluationRequest>,
) -> Result<Json<PlanEvaluationResponse>, ApiError> {
    let tags = request.action_tags.join(", ");
    let level = request.level.to_string();
    let vars: &[(&str, &str)] = &[
        ("role", &request.role_title),
        ("level", &level),
        ("action", &request.action_title),
        ("tags", &tags),
        ("plan", &request.plan_text),
        ("language", &request.language),
    ];
    let prompt = ChatPrompt {
        system: render_template(&state.prompts.plan_evaluator.system, vars),
        user: render_template(&state.prompts.plan_evaluator.user, vars),
        json_response: true,
    };

    let payload = generate_json(&state, "plan evaluation", &prompt)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("{error:#}")))?;
    let response = parse_evaluation(&payload);
    info!(
        player_id = %request.player_id,
        progress = ?response.judgment.progress_gain_score,
        exposure = ?response.judgment.exposure_risk_score,
        influence = ?response.judgment.influence_gain_score,
        "plan evaluated"
    );
    Ok(Json(response))
}

async fn scandal_headlines_handler(
    State(state): State<AppState>,
    Json(request): Json<ScandalHeadlineRequest>,
) -> Result<Json<ScandalHeadlineResponse>, ApiError> {
    let exposure = format!("{:.1}", request.exposure);
    let vars: &[(&str, &str)] = &[
        ("role", &request.role_title),
        ("exposure", &exposure),
        ("language", &request.language),
    ];
    let prompt = ChatPrompt {
        system: render_template(&state.prompts.scandal_headline.system, vars),
        user: render_template(&state.prompts.scandal_headline.user, vars),
        json_response: true,
    };

    let payload = generate_json(&state, "scandal headline", &prompt)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("{error:#}")))?;
    let headline = payload
        .get("headline")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|headline| !headline.is_empty())
        .unwrap_or(FALLBACK_HEADLINE)
        .to_string();
    info!(player_id = %request.player_id, headline = %headline, "scandal headline generated");
    Ok(Json(ScandalHeadlineResponse { headline }))
}

async fn corruption_types_handler(
    State(state): State<AppState>,
    Json(request): Json<CorruptionTypesRequest>,
) -> Result<Json<CorruptionTypesResponse>, ApiError> {
    let previous = {
        let history = state.category_history.lock().await;
        history.get(&request.player_id).cloned().unwrap_or_default()
    };
    let previous_list = if previous.is_empty() {
        "none".to_string()
    } else {
        previous.join(", ")
    };
    let num_types = request.num_types.to_string();
    let vars: &[(&str, &str)] = &[
        ("role", &request.role_title),
        ("num_types", &num_types),
        ("previous", &previous_list),
        ("language", &request.language),
    ];
    let prompt = ChatPrompt {
        system: render_template(&state.prompts.category_generator.system, vars),
        user: render_template(&state.prompts.category_generator.user, vars),
        json_response: true,
    };

    let payload = generate_json(&state, "corruption types", &prompt)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("{error:#}")))?;
    let generated = string_array(payload.get("categories").unwrap_or(&payload));

    // The prompt already discourages repeats; drop any that slip through,
    // whether against earlier rounds or within this reply.
    let mut seen: Vec<String> = previous.iter().map(|s| s.to_ascii_lowercase()).collect();
    let mut categories: Vec<String> = generated
        .into_iter()
        .filter(|category| {
            let lowered = category.to_ascii_lowercase();
            if seen.contains(&lowered) {
                false
            } else {
                seen.push(lowered);
                true
            }
        })
        .collect();
    categories.truncate(request.num_types as usize);

    {
        let mut history = state.category_history.lock().await;
        history
            .entry(request.player_id.clone())
            .or_default()
            .extend(categories.iter().cloned());
    }
    info!(player_id = %request.player_id, count = categories.len(), "corruption types generated");
    Ok(Json(CorruptionTypesResponse { categories }))
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

async fn corruption_cards_handler(
    State(state): State<AppState>,
    Json(request): Json<CorruptionCardsRequest>,
) -> Result<Json<CorruptionCardsResponse>, ApiError> {
    let num_cards = request.num_cards.to_string();
    let vars: &[(&str, &str)] = &[
        ("role", &request.role_title),
        ("category", &request.category),
        ("num_cards", &num_cards),
        ("language", &request.language),
    ];
    let prompt = ChatPrompt {
        system: render_template(&state.prompts.card_generator.system, vars),
        user: render_template(&state.prompts.card_generator.user, vars),
        json_response: true,
    };

    let payload = generate_json(&state, "corruption cards", &prompt)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("{error:#}")))?;
    let mut cards: Vec<CorruptionCard> = payload
        .get("cards")
        .cloned()
        .map(|cards| serde_json::from_value(cards).unwrap_or_default())
        .unwrap_or_default();
    cards.truncate(request.num_cards as usize);

    let mut rng = rand::rng();
    for card in &mut cards {
        if card.image_url.is_none() {
            let slug = CARD_IMAGE_POOL[rng.random_range(0..CARD_IMAGE_POOL.len())];
            card.image_url = Some(slug.to_string());
        }
    }
    info!(
        player_id = %request.player_id,
        category = %request.category,
        count = cards.len(),
        "corruption cards generated"
    );
    Ok(Json(CorruptionCardsResponse { cards }))
}

async fn wildcard_plans_handler(
    State(state): State<AppState>,
    Json(request): Json<WildcardPlanRequest>,
) -> Result<Json<WildcardPlanResponse>, ApiError> {
    let tags = request.action_tags.join(", ");
    let description = request.action_description.as_deref().unwrap_or("N/A");
    let vars: &[(&str, &str)] = &[
        ("action", &request.action_title),
        ("description", description),
        ("tags", &tags),
        ("language", &request.language),
    ];
    let prompt = ChatPrompt {
        system: render_template(&state.prompts.wildcard_plan.system, vars),
        user: render_template(&state.prompts.wildcard_plan.user, vars),
        json_response: false,
    };

    let plan = generate_text(&state, "wildcard plan", &prompt)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("{error:#}")))?;
    info!(player_id = %request.player_id, action = %request.action_title, "wildcard plan generated");
    Ok(Json(WildcardPlanResponse { plan }))
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
