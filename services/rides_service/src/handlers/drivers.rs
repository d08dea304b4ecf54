use super::{make_in_clause, now_iso, require_identity};
use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::notify::{self, events};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use sqlx::Row;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use uuid::Uuid;

const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

pub const USER_COLUMNS: &str =
    "id,name,phone,role,driver_approved,driver_rating,total_rides,balance_cents";

fn require_admin_secret(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state
        .admin_api_secret
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return Err(ApiError::forbidden("admin operations not enabled"));
    };

    let provided = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if provided.is_empty() || provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(ApiError::forbidden("admin operations not enabled"));
    }
    Ok(())
}

fn user_out_from_row(row: &sqlx::postgres::PgRow) -> UserOut {
    let approved: i32 = row.try_get("driver_approved").unwrap_or(0);
    UserOut {
        id: row.try_get("id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        phone: row.try_get("phone").unwrap_or(None),
        role: row
            .try_get("role")
            .unwrap_or_else(|_| user_role::PASSENGER.to_string()),
        driver_approved: approved != 0,
        driver_rating: row.try_get("driver_rating").unwrap_or(0.0),
        total_rides: row.try_get("total_rides").unwrap_or(0),
        balance_cents: row.try_get("balance_cents").unwrap_or(0),
    }
}

pub(crate) async fn fetch_user(state: &AppState, user_id: &str) -> ApiResult<Option<UserOut>> {
    let users = state.table("users");
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM {users} WHERE id=$1"))
        .bind(user_id.trim())
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db user lookup failed");
            ApiError::internal("database error")
        })?;
    Ok(row.map(|r| user_out_from_row(&r)))
}

pub(crate) async fn fetch_driver_summaries(
    state: &AppState,
    driver_ids: &[String],
) -> ApiResult<HashMap<String, DriverSummaryOut>> {
    let ids: Vec<String> = driver_ids
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let users = state.table("users");
    let sql = format!(
        "SELECT id,name,driver_rating,total_rides FROM {users} WHERE id IN {}",
        make_in_clause(1, ids.len())
    );
    let mut q = sqlx::query(&sql);
    for id in &ids {
        q = q.bind(id);
    }
    let rows = q.fetch_all(&state.pool).await.map_err(|e| {
        tracing::error!(error = %e, "db driver summaries fetch failed");
        ApiError::internal("database error")
    })?;
    let mut out = HashMap::new();
    for r in rows {
        let id: String = r.try_get("id").unwrap_or_default();
        out.insert(
            id.clone(),
            DriverSummaryOut {
                id,
                name: r.try_get("name").unwrap_or_default(),
                driver_rating: r.try_get("driver_rating").unwrap_or(0.0),
                total_rides: r.try_get("total_rides").unwrap_or(0),
            },
        );
    }
    Ok(out)
}

pub async fn create_user(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<CreateUserReq>,
) -> ApiResult<axum::Json<UserOut>> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("name required"));
    }
    if name.len() > 120 {
        return Err(ApiError::bad_request("name too long"));
    }
    let role = body.role.trim().to_lowercase();
    if !matches!(role.as_str(), user_role::DRIVER | user_role::PASSENGER) {
        return Err(ApiError::bad_request("role must be driver or passenger"));
    }
    let phone = body
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    if let Some(p) = phone.as_deref() {
        if p.len() > 32 {
            return Err(ApiError::bad_request("phone too long"));
        }
    }

    let id = Uuid::new_v4().to_string();
    let users = state.table("users");
    let sql = format!(
        "INSERT INTO {users} (id,name,phone,role,driver_approved,driver_rating,total_rides,balance_cents,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"
    );
    sqlx::query(&sql)
        .bind(&id)
        .bind(&name)
        .bind(&phone)
        .bind(&role)
        .bind(0i32)
        .bind(0.0f64)
        .bind(0i32)
        .bind(0i64)
        .bind(now_iso())
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db create_user failed");
            ApiError::internal("database error")
        })?;

    Ok(axum::Json(UserOut {
        id,
        name,
        phone,
        role,
        driver_approved: false,
        driver_rating: 0.0,
        total_rides: 0,
        balance_cents: 0,
    }))
}

pub async fn get_user(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<UserOut>> {
    let identity = require_identity(&headers)?;
    if identity != user_id.trim() {
        return Err(ApiError::forbidden("not your resource"));
    }
    let user = fetch_user(&state, user_id.trim())
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(axum::Json(user))
}

pub async fn approve_driver(
    Path(driver_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<UserOut>> {
    set_driver_approved(&state, &headers, driver_id.trim(), true).await
}

pub async fn reject_driver(
    Path(driver_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<UserOut>> {
    set_driver_approved(&state, &headers, driver_id.trim(), false).await
}

async fn set_driver_approved(
    state: &AppState,
    headers: &HeaderMap,
    driver_id: &str,
    approved: bool,
) -> ApiResult<axum::Json<UserOut>> {
    require_admin_secret(state, headers)?;

    let user = fetch_user(state, driver_id)
        .await?
        .ok_or_else(|| ApiError::not_found("driver not found"))?;
    if user.role != user_role::DRIVER {
        return Err(ApiError::bad_request("user is not a driver"));
    }

    let users = state.table("users");
    let sql = format!("UPDATE {users} SET driver_approved=$1 WHERE id=$2");
    sqlx::query(&sql)
        .bind(if approved { 1i32 } else { 0i32 })
        .bind(driver_id)
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db set_driver_approved failed");
            ApiError::internal("database error")
        })?;

    notify::send_event(
        state,
        events::DRIVER_APPROVAL,
        serde_json::json!({
            "driver_id": driver_id,
            "approved": approved,
        }),
    );

    Ok(axum::Json(UserOut {
        driver_approved: approved,
        ..user
    }))
}
