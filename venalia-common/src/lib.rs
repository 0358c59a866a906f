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

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const INFLUENCE_MAX: i64 = 100;
pub const EXPOSURE_MAX: f64 = 100.0;
/// Post-decay exposure at or above this value triggers a public scandal.
pub const EXPOSURE_SCANDAL_THRESHOLD: f64 = 85.0;
pub const EXPOSURE_PASSIVE_DECAY: f64 = 1.0;
/// Fraction of influence retained when ascending to the next level.
pub const ASCENSION_INFLUENCE_RETENTION: f64 = 0.20;
pub const STARTING_LEVEL: u32 = 1;

pub type PlayerId = String;

/// Mutable per-player resources. Every operation clamps before returning,
/// so a ledger is never observable outside its bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLedger {
    pub player_id: PlayerId,
    /// Progress capital, capped at the current level's ascension threshold.
    pub pc: i64,
    /// Influence in [0, 100]; integer after every operation.
    pub inf: i64,
    /// Exposure in [0, 100]; fractional values persist across turns.
    pub be: f64,
    pub level: u32,
    /// One-way: set by the win check, never cleared.
    pub has_won: bool,
    pub updated_at: DateTime<Utc>,
}

impl ResourceLedger {
    pub fn new(player_id: impl Into<PlayerId>) -> Self {
        Self {
            player_id: player_id.into(),
            pc: 0,
            inf: 0,
            be: 0.0,
            level: STARTING_LEVEL,
            has_won: false,
            updated_at: Utc::now(),
        }
    }

    /// Add the three deltas, then clamp: pc to [0, level_cap], influence to
    /// [0, 100], exposure to [0, 100].
    pub fn apply_gain(&mut self, pc_delta: i64, inf_delta: i64, be_delta: f64, level_cap: i64) {
        self.pc = (self.pc + pc_delta).clamp(0, level_cap.max(0));
        self.inf = (self.inf + inf_delta).clamp(0, INFLUENCE_MAX);
        self.be = (self.be + be_delta).clamp(0.0, EXPOSURE_MAX);
    }

    /// Fixed end-of-turn exposure decay, floored at zero. Runs once per
    /// successful resolution, after gains.
    pub fn apply_passive_decay(&mut self) {
        self.be = (self.be - EXPOSURE_PASSIVE_DECAY).max(0.0);
    }

    /// Move to `new_level` and reduce influence by 80%, rounded.
    pub fn apply_ascension(&mut self, new_level: u32) {
        self.level = new_level;
        self.inf = (self.inf as f64 * ASCENSION_INFLUENCE_RETENTION).round() as i64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelDefinition {
    pub level_number: u32,
    pub title: String,
    pub pc_required_for_ascension: i64,
    pub pc_gain_factor: f64,
    /// Present in the catalog shape but not applied by any formula. Game
    /// design has not decided whether it should feed the influence gain, so
    /// it is validated, carried and ignored.
    #[serde(default = "default_inf_gain_factor")]
    pub inf_gain_factor: f64,
}

fn default_inf_gain_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    Empty,
    NonContiguous { expected: u32, found: u32 },
    InvalidThreshold { level: u32 },
    InvalidFactor { level: u32 },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "level catalog is empty"),
            Self::NonContiguous { expected, found } => {
                write!(f, "level numbers must be contiguous from 1: expected {expected}, found {found}")
            }
            Self::InvalidThreshold { level } => {
                write!(f, "level {level} has a non-positive ascension threshold")
            }
            Self::InvalidFactor { level } => {
                write!(f, "level {level} has an invalid gain factor")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Static, ordered table of level definitions. Built once at startup and
/// treated as immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct LevelCatalog {
    levels: Vec<LevelDefinition>,
}

impl LevelCatalog {
    pub fn new(mut levels: Vec<LevelDefinition>) -> Result<Self, CatalogError> {
        if levels.is_empty() {
            return Err(CatalogError::Empty);
        }
        levels.sort_by_key(|level| level.level_number);
        for (index, level) in levels.iter().enumerate() {
            let expected = index as u32 + 1;
            if level.level_number != expected {
                return Err(CatalogError::NonContiguous {
                    expected,
                    found: level.level_number,
                });
            }
            if level.pc_required_for_ascension <= 0 {
                return Err(CatalogError::InvalidThreshold {
                    level: level.level_number,
                });
            }
            if !level.pc_gain_factor.is_finite()
                || level.pc_gain_factor <= 0.0
                || !level.inf_gain_factor.is_finite()
                || level.inf_gain_factor < 0.0
            {
                return Err(CatalogError::InvalidFactor {
                    level: level.level_number,
                });
            }
        }
        Ok(Self { levels })
    }

    pub fn lookup(&self, level_number: u32) -> Option<&LevelDefinition> {
        if level_number == 0 {
            return None;
        }
        self.levels.get(level_number as usize - 1)
    }

    /// Highest defined level number; reaching its threshold is the win
    /// condition.
    pub fn max_level(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn definitions(&self) -> &[LevelDefinition] {
        &self.levels
    }
}

/// The built-in career ladder, used when no catalog file is configured.
pub fn default_catalog() -> LevelCatalog {
    let levels = vec![
        level_def(1, "City Councilor", 100, 1.0),
        level_def(2, "Mayor", 250, 1.2),
        level_def(3, "Provincial Deputy", 500, 1.5),
        level_def(4, "Governor", 900, 1.8),
        level_def(5, "Minister of Public Works", 1400, 2.2),
        level_def(6, "President", 2000, 2.6),
    ];
    LevelCatalog::new(levels).expect("built-in catalog is valid")
}

fn level_def(level_number: u32, title: &str, required: i64, factor: f64) -> LevelDefinition {
    LevelDefinition {
        level_number,
        title: title.to_string(),
        pc_required_for_ascension: required,
        pc_gain_factor: factor,
        inf_gain_factor: 1.0,
    }
}

/// Numeric judgment for one turn, as produced by the plan evaluator.
/// Scores are nominally 0-10; missing or non-finite values count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnJudgment {
    #[serde(default)]
    pub progress_gain_score: Option<f64>,
    #[serde(default)]
    pub exposure_risk_score: Option<f64>,
    #[serde(default)]
    pub influence_gain_score: Option<f64>,
}

impl TurnJudgment {
    pub fn progress_gain(&self) -> f64 {
        effective_score(self.progress_gain_score)
    }

    pub fn exposure_risk(&self) -> f64 {
        effective_score(self.exposure_risk_score)
    }

    pub fn influence_gain(&self) -> f64 {
        effective_score(self.influence_gain_score)
    }

    /// Names of the fields that will be treated as zero, for logging.
    pub fn defaulted_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.progress_gain_score.filter(|v| v.is_finite()).is_none() {
            fields.push("progress_gain_score");
        }
        if self.exposure_risk_score.filter(|v| v.is_finite()).is_none() {
            fields.push("exposure_risk_score");
        }
        if self.influence_gain_score.filter(|v| v.is_finite()).is_none() {
            fields.push("influence_gain_score");
        }
        fields
    }
}

fn effective_score(score: Option<f64>) -> f64 {
    score.filter(|value| value.is_finite()).unwrap_or(0.0)
}

/// Raw per-turn gains before the ledger clamps them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnDeltas {
    pub pc_gain: i64,
    pub inf_gain: i64,
    pub be_gain: f64,
}

/// Pure gain formulas. Influence amplifies progress conversion and dampens
/// exposure growth; the exposure gain is intentionally not rounded.
pub fn compute_turn_deltas(
    ledger: &ResourceLedger,
    level: &LevelDefinition,
    judgment: &TurnJudgment,
) -> TurnDeltas {
    let influence_ratio = ledger.inf as f64 / 100.0;
    let pc_gain =
        (judgment.progress_gain() * level.pc_gain_factor * (1.0 + influence_ratio)).round() as i64;
    let be_gain = judgment.exposure_risk() * (2.0 - influence_ratio);
    let inf_gain = judgment.influence_gain().round() as i64;
    TurnDeltas {
        pc_gain,
        inf_gain,
        be_gain,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// The ledger references a level the catalog does not define.
    UnknownLevel(u32),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownLevel(level) => write!(f, "no definition for level {level}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Outcome of the pure resolution step. `ledger` is the staged post-turn
/// state; nothing has been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResolution {
    pub ledger: ResourceLedger,
    pub deltas: TurnDeltas,
    pub ascended: bool,
    pub won: bool,
    /// A scandal headline must be generated before this resolution may be
    /// committed.
    pub scandal_pending: bool,
    pub defaulted_judgment_fields: Vec<&'static str>,
}

/// Resolve one turn: compute deltas, apply gains and passive decay, evaluate
/// ascension and the win condition, and flag a pending scandal. Inputs are
/// untouched; the caller owns the commit.
pub fn resolve_turn(
    ledger: &ResourceLedger,
    catalog: &LevelCatalog,
    judgment: &TurnJudgment,
) -> Result<TurnResolution, ResolveError> {
    let level = catalog
        .lookup(ledger.level)
        .ok_or(ResolveError::UnknownLevel(ledger.level))?;

    let deltas = compute_turn_deltas(ledger, level, judgment);

    let mut staged = ledger.clone();
    staged.apply_gain(
        deltas.pc_gain,
        deltas.inf_gain,
        deltas.be_gain,
        level.pc_required_for_ascension,
    );
    staged.apply_passive_decay();

    let mut ascended = false;
    if staged.pc >= level.pc_required_for_ascension {
        let next_level = ledger.level + 1;
        if catalog.lookup(next_level).is_some() {
            staged.apply_ascension(next_level);
            ascended = true;
        }
        // At the max level the player stays put with full progress.
    }

    if staged.level == catalog.max_level() {
        let final_level = catalog
            .lookup(staged.level)
            .ok_or(ResolveError::UnknownLevel(staged.level))?;
        if staged.pc >= final_level.pc_required_for_ascension {
            staged.has_won = true;
        }
    }

    let scandal_pending = staged.be >= EXPOSURE_SCANDAL_THRESHOLD;

    Ok(TurnResolution {
        won: staged.has_won,
        ledger: staged,
        deltas,
        ascended,
        scandal_pending,
        defaulted_judgment_fields: judgment.defaulted_fields(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TurnPlayed,
}

/// Append-only record of one resolved turn. Written in the same logical
/// transaction as the ledger save; never read back by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub player_id: PlayerId,
    pub event_type: AuditEventType,
    pub level: u32,
    pub pc_change: i64,
    pub inf_change: i64,
    pub be_change: f64,
    pub pc_current: i64,
    pub inf_current: i64,
    pub be_current: f64,
    pub action_title: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub fn build_audit_entry(
    before: &ResourceLedger,
    after: &ResourceLedger,
    action_title: &str,
    details: serde_json::Value,
) -> AuditEntry {
    AuditEntry {
        entry_id: Uuid::new_v4().to_string(),
        player_id: after.player_id.clone(),
        event_type: AuditEventType::TurnPlayed,
        level: after.level,
        pc_change: after.pc - before.pc,
        inf_change: after.inf - before.inf,
        be_change: after.be - before.be,
        pc_current: after.pc,
        inf_current: after.inf,
        be_current: after.be,
        action_title: action_title.to_string(),
        details,
        created_at: Utc::now(),
    }
}

/// Replace `{{name}}` placeholders with values from `vars`. Placeholders
/// without a value become "N/A".
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let re = Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap();
    re.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    })
    .into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: PlayerId,
    pub nickname: String,
    pub language: String,
    pub premium: bool,
    pub scandal_rescue_credit: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardPlayerRequest {
    #[serde(default)]
    pub player_id: Option<PlayerId>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProgressResponse {
    pub profile: PlayerProfile,
    pub ledger: ResourceLedger,
    pub level_info: LevelDefinition,
    pub next_level_info: Option<LevelDefinition>,
    pub max_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTurnRequest {
    pub action_title: String,
    #[serde(default)]
    pub action_tags: Vec<String>,
    pub plan_text: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcomeResponse {
    pub ledger: ResourceLedger,
    pub level_info: LevelDefinition,
    pub next_level_info: Option<LevelDefinition>,
    pub deltas: TurnDeltas,
    pub ascended: bool,
    pub won: bool,
    pub scandal_triggered: bool,
    pub scandal_headline: Option<String>,
    pub evaluation: String,
    pub advice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvaluationRequest {
    pub player_id: PlayerId,
    pub role_title: String,
    pub action_title: String,
    #[serde(default)]
    pub action_tags: Vec<String>,
    pub plan_text: String,
    pub language: String,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvaluationResponse {
    pub judgment: TurnJudgment,
    pub evaluation: String,
    pub advice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScandalHeadlineRequest {
    pub player_id: PlayerId,
    pub role_title: String,
    pub language: String,
    pub exposure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScandalHeadlineResponse {
    pub headline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardPlanRequest {
    pub player_id: PlayerId,
    pub action_title: String,
    #[serde(default)]
    pub action_description: Option<String>,
    #[serde(default)]
    pub action_tags: Vec<String>,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardPlanResponse {
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionTypesRequest {
    pub player_id: PlayerId,
    pub role_title: String,
    pub language: String,
    pub num_types: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionTypesResponse {
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionCardsRequest {
    pub player_id: PlayerId,
    pub role_title: String,
    pub category: String,
    pub language: String,
    pub num_cards: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptionCard {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionCardsResponse {
    pub cards: Vec<CorruptionCard>,
}
