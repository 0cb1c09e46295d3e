//! Log history and statistics endpoints

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{LevelFilter, LogCategory, LogRecord};

use super::{ApiError, ApiState};
use crate::actors::event_bus::{self, BusStats};
use crate::logs::history::RecordQuery;
use crate::logs::tailer::TailerStatus;

const DEFAULT_RECENT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
    /// Comma separated levels, e.g. `ERROR,CRITICAL`
    pub level: Option<String>,
    pub category: Option<String>,
    pub keyword: Option<String>,
    /// RFC 3339 bounds on the record timestamp, both inclusive.
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub logs: Vec<LogRecord>,
    pub count: usize,
}

pub async fn get_recent(
    State(state): State<ApiState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, ApiError> {
    let capacity = state.app_state.config().bus.history_capacity;
    let limit = query.limit.unwrap_or(DEFAULT_RECENT).clamp(1, capacity.max(1));
    let levels = query
        .level
        .as_deref()
        .map(LevelFilter::parse_csv)
        .unwrap_or_default();
    let category = query
        .category
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .and_then(|c| c.parse::<LogCategory>().ok());

    let logs = event_bus::history(
        state.app_state.bus(),
        RecordQuery {
            limit,
            up_to: None,
            levels,
            category,
            keyword: query.keyword,
            since: query.since,
            until: query.until,
        },
    )
    .await?;

    Ok(Json(RecentResponse {
        count: logs.len(),
        logs,
    }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub bus: BusStats,
    pub rejected_lines: u64,
    pub subscriber_count: usize,
    pub tailer: TailerStatus,
}

pub async fn get_stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let bus = event_bus::stats(state.app_state.bus()).await?;
    Ok(Json(StatsResponse {
        subscriber_count: bus.subscribers.len(),
        bus,
        rejected_lines: state.app_state.publisher().rejected_lines(),
        tailer: state.app_state.tailer_status(),
    }))
}
