use crate::academic_year::academic_year_of;
use crate::config::Config;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::results::{
    load_assessment, ModuleScope, ResultAggregator, ResultsError, SqliteStore,
    StoreCollectionProvider, StoreError,
};
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<ResultsError> for HandlerErr {
    fn from(e: ResultsError) -> Self {
        match e {
            ResultsError::Unbound => HandlerErr::new("unbound", e.to_string()),
            ResultsError::CollectionNotFound(ref id) => HandlerErr {
                code: "not_found",
                message: e.to_string(),
                details: Some(json!({ "collectionId": id })),
            },
            ResultsError::AcademicYear { .. } => HandlerErr::new("bad_params", e.to_string()),
            ResultsError::Store(inner) => inner.into(),
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing integer {}", key)))
}

/// Assessment ids are UUIDs; anything else cannot name a stored assessment.
/// The id is passed on exactly as sent, since the store compares text.
fn get_required_uuid(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    uuid::Uuid::parse_str(&raw)
        .map_err(|_| HandlerErr::new("bad_params", format!("{} must be a UUID", key)))?;
    Ok(raw)
}

/// `academicYear`: integer, null/absent/"ALL" for every year, or "current".
fn parse_academic_year(
    params: &serde_json::Value,
    start_month: u32,
) -> Result<Option<i32>, HandlerErr> {
    match params.get("academicYear") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) if v.is_string() => {
            let t = v.as_str().unwrap_or("").trim();
            if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                Ok(None)
            } else if t.eq_ignore_ascii_case("current") {
                Ok(Some(academic_year_of(Local::now().naive_local(), start_month)))
            } else {
                Err(HandlerErr::new(
                    "bad_params",
                    "academicYear must be an integer, 'current' or 'ALL'",
                ))
            }
        }
        Some(v) => {
            let year = v
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| HandlerErr::new("bad_params", "academicYear must be an integer"))?;
            Ok(Some(year))
        }
    }
}

/// Loads the requested assessment, binds an aggregator scoped to `moduleId`
/// and runs `f` against it. An assessment of another module is not found.
fn with_bound<T>(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
    f: impl FnOnce(&ResultAggregator<'_>) -> Result<T, ResultsError>,
) -> Result<T, HandlerErr> {
    let module_id = get_required_i64(params, "moduleId")?;
    let assessment_id = get_required_uuid(params, "assessmentId")?;

    let store = SqliteStore::new(conn, config.table_prefix.clone());
    let provider = StoreCollectionProvider::new(&store);
    let Some(assessment) = load_assessment(&store, &assessment_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "assessment not found".to_string(),
            details: Some(json!({ "assessmentId": assessment_id })),
        });
    };

    let mut aggregator = ResultAggregator::new(&store, &provider, module_id, config.start_month());
    if assessment.module_id != aggregator.module_id() {
        return Err(HandlerErr {
            code: "not_found",
            message: "assessment not found in module".to_string(),
            details: Some(json!({ "assessmentId": assessment_id, "moduleId": module_id })),
        });
    }
    aggregator.bind(Arc::new(assessment))?;
    Ok(f(&aggregator)?)
}

fn results_responses(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_bound(conn, config, params, |agg| {
        let assessment = agg.bound_assessment()?;
        let responses = agg.list_responses()?;
        Ok(json!({
            "assessmentId": assessment.id,
            "responses": responses
        }))
    })
}

fn results_response_count(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_bound(conn, config, params, |agg| {
        Ok(json!({ "count": agg.response_count()? }))
    })
}

fn results_responded_users(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_bound(conn, config, params, |agg| {
        Ok(json!({ "userIds": agg.responded_user_ids()? }))
    })
}

fn results_group_response_count(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    with_bound(conn, config, params, |agg| {
        // null (not 0) when the group is outside the assessment's collection.
        Ok(json!({
            "groupId": group_id,
            "count": agg.response_count_for_group(&group_id)?
        }))
    })
}

fn results_group_summary(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_bound(conn, config, params, |agg| {
        let collection = agg.bound_collection()?;
        Ok(json!({
            "collectionId": collection.id,
            "collectionName": collection.name,
            "groups": agg.group_response_counts()?
        }))
    })
}

fn results_non_responders(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_bound(conn, config, params, |agg| {
        Ok(json!({ "userIds": agg.non_responders()? }))
    })
}

fn results_user_has_responded(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_i64(params, "userId")?;
    with_bound(conn, config, params, |agg| {
        let assessment = agg.bound_assessment()?;
        Ok(json!({
            "userId": user_id,
            "responded": agg.has_user_responded(user_id, &assessment.id)?
        }))
    })
}

struct ModuleQuery {
    module_id: i64,
    user_id: i64,
    academic_year: Option<i32>,
}

fn parse_module_query(config: &Config, params: &serde_json::Value) -> Result<ModuleQuery, HandlerErr> {
    Ok(ModuleQuery {
        module_id: get_required_i64(params, "moduleId")?,
        user_id: get_required_i64(params, "userId")?,
        academic_year: parse_academic_year(params, config.start_month())?,
    })
}

/// Runs `f` against the module named by the request, echoing the academic
/// year the counts were restricted to (null for every year).
fn with_module<T: serde::Serialize>(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
    key: &str,
    f: impl FnOnce(&ModuleScope<'_>, &ModuleQuery) -> Result<T, ResultsError>,
) -> Result<serde_json::Value, HandlerErr> {
    let q = parse_module_query(config, params)?;
    let store = SqliteStore::new(conn, config.table_prefix.clone());
    let scope = ModuleScope::new(&store, q.module_id, config.start_month());
    let year = scope.window(q.academic_year)?.map(|w| w.year);
    let value = f(&scope, &q)?;
    Ok(json!({
        "moduleId": q.module_id,
        "academicYear": year,
        key: value
    }))
}

fn results_response_counts_by_assessment(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_module(conn, config, params, "counts", |scope, q| {
        scope.response_counts(q.user_id, q.academic_year)
    })
}

fn results_member_counts_by_assessment(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_module(conn, config, params, "counts", |scope, q| {
        scope.member_counts(q.user_id, q.academic_year)
    })
}

fn results_module_overview(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    with_module(conn, config, params, "assessments", |scope, q| {
        scope.overview(q.user_id, q.academic_year)
    })
}

type ResultsHandler =
    fn(&Connection, &Config, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

fn dispatch(state: &AppState, req: &Request, handler: ResultsHandler) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match handler(conn, &state.config, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => {
            if error.code == "db_query_failed" {
                warn!(method = %req.method, error = %error.message, "statistics unavailable");
            }
            error.response(&req.id)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: ResultsHandler = match req.method.as_str() {
        "results.responses" => results_responses,
        "results.responseCount" => results_response_count,
        "results.respondedUsers" => results_responded_users,
        "results.groupResponseCount" => results_group_response_count,
        "results.groupSummary" => results_group_summary,
        "results.nonResponders" => results_non_responders,
        "results.userHasResponded" => results_user_has_responded,
        "results.responseCountsByAssessment" => results_response_counts_by_assessment,
        "results.memberCountsByAssessment" => results_member_counts_by_assessment,
        "results.moduleOverview" => results_module_overview,
        "results.assessmentsTakenByUser" => {
            return Some(err(
                &req.id,
                "not_implemented",
                "results.assessmentsTakenByUser is not implemented",
                None,
            ));
        }
        _ => return None,
    };
    Some(dispatch(state, req, handler))
}
