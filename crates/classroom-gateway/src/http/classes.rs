//! The minimum class CRUD needed to drive the lifecycle hooks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, NaiveTime, Utc};
use classroom_core::{Class, ClassField, ClassStatus, ClassroomError, Review};
use classroom_lifecycle::ClassStore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClassRequest {
    pub title: String,
    pub instructor_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration: u32,
    #[serde(default)]
    pub attendees: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClassRequest {
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub duration: Option<u32>,
    pub attendees: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub student_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub student_id: String,
    pub rating: u8,
    pub comment: Option<String>,
}

/// POST /classes
pub async fn create_class(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateClassRequest>,
) -> Result<(StatusCode, Json<Class>), ApiError> {
    validate(&req.title, req.duration)?;
    let mut class = Class::new(
        &req.title,
        &req.instructor_id,
        req.date,
        req.start_time,
        req.duration,
    );
    class.attendees = req.attendees;
    state.classes.save(&class).await?;
    info!(class_id = %class.id, starts_at = %class.starts_at(), "class created");

    state.lifecycle.on_class_created(&class);
    Ok((StatusCode::CREATED, Json(class)))
}

/// GET /classes/{id}
pub async fn get_class(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Class>, ApiError> {
    Ok(Json(load(&state, &id).await?))
}

/// PATCH /classes/{id}
pub async fn update_class(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateClassRequest>,
) -> Result<Json<Class>, ApiError> {
    let mut class = load(&state, &id).await?;
    let changed = apply_update(&mut class, req);
    validate(&class.title, class.duration)?;
    if changed.is_empty() {
        return Ok(Json(class));
    }
    class.updated_at = Utc::now();
    if !state.classes.update_details(&class)? {
        return Err(ClassroomError::ClassNotFound { id }.into());
    }
    // status and joins may have moved since the read
    let class = load(&state, &id).await?;
    info!(class_id = %id, ?changed, "class updated");

    state.lifecycle.on_class_updated(&class, &changed);
    Ok(Json(class))
}

/// DELETE /classes/{id}
pub async fn delete_class(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.classes.delete(&id)?;
    info!(class_id = %id, "class deleted");
    // job cleanup runs in the background; the response does not wait for it
    drop(state.lifecycle.on_class_deleted(&id));
    Ok(Json(json!({ "deleted": id })))
}

/// POST /classes/{id}/start
pub async fn start_class(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Class>, ApiError> {
    let mut class = load(&state, &id).await?;
    class.transition(ClassStatus::Live)?;
    class.actual_start_time = Some(Utc::now());
    class.updated_at = Utc::now();
    if !state.classes.save_transition(&class, ClassStatus::Scheduled).await? {
        return Err(moved_on(&state, &id, ClassStatus::Live).await);
    }
    info!(class_id = %id, "class started by instructor");
    Ok(Json(class))
}

/// POST /classes/{id}/end
pub async fn end_class(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Class>, ApiError> {
    let mut class = load(&state, &id).await?;
    class.transition(ClassStatus::Completed)?;
    class.actual_end_time = Some(Utc::now());
    class.updated_at = Utc::now();
    if !state.classes.save_transition(&class, ClassStatus::Live).await? {
        return Err(moved_on(&state, &id, ClassStatus::Completed).await);
    }
    let class = load(&state, &id).await?;
    info!(class_id = %id, "class ended by instructor");

    state.lifecycle.on_class_manually_ended(&id);
    Ok(Json(class))
}

/// POST /classes/{id}/join
pub async fn join_class(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<Class>, ApiError> {
    if !state.classes.record_join(&id, &req.student_id)? {
        let class = load(&state, &id).await?;
        return Err(ApiError::conflict(
            "CLASS_NOT_LIVE",
            format!("class {id} is {}", class.status),
        ));
    }
    Ok(Json(load(&state, &id).await?))
}

/// POST /classes/{id}/reviews
pub async fn add_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<(StatusCode, Json<Review>), ApiError> {
    if !(1..=5).contains(&req.rating) {
        return Err(ClassroomError::InvalidInput("rating must be between 1 and 5".into()).into());
    }
    load(&state, &id).await?;
    let review = Review {
        id: Uuid::new_v4().to_string(),
        class_id: id,
        student_id: req.student_id,
        rating: req.rating,
        comment: req.comment,
        created_at: Utc::now(),
    };
    state.reviews.insert(&review)?;
    Ok((StatusCode::CREATED, Json(review)))
}

async fn load(state: &AppState, id: &str) -> Result<Class, ApiError> {
    state
        .classes
        .find_by_id(id)
        .await?
        .ok_or_else(|| ClassroomError::ClassNotFound { id: id.to_string() }.into())
}

/// Error for a compare-and-set that lost: the class was deleted or another
/// writer already moved it past the status this request expected.
async fn moved_on(state: &AppState, id: &str, to: ClassStatus) -> ApiError {
    match load(state, id).await {
        Ok(current) => ClassroomError::InvalidTransition {
            from: current.status,
            to,
        }
        .into(),
        Err(e) => e,
    }
}

fn validate(title: &str, duration: u32) -> Result<(), ClassroomError> {
    if title.trim().is_empty() {
        return Err(ClassroomError::InvalidInput("title must not be empty".into()));
    }
    if duration == 0 {
        return Err(ClassroomError::InvalidInput(
            "duration must be at least one minute".into(),
        ));
    }
    Ok(())
}

/// Apply the present fields and report the ones whose value actually changed.
fn apply_update(class: &mut Class, req: UpdateClassRequest) -> Vec<ClassField> {
    let mut changed = Vec::new();
    if let Some(title) = req.title.filter(|t| *t != class.title) {
        class.title = title;
        changed.push(ClassField::Title);
    }
    if let Some(date) = req.date.filter(|d| *d != class.date) {
        class.date = date;
        changed.push(ClassField::Date);
    }
    if let Some(start) = req.start_time.filter(|t| *t != class.start_time) {
        class.start_time = start;
        changed.push(ClassField::StartTime);
    }
    if let Some(duration) = req.duration.filter(|d| *d != class.duration) {
        class.duration = duration;
        changed.push(ClassField::Duration);
    }
    if let Some(attendees) = req.attendees.filter(|a| *a != class.attendees) {
        class.attendees = attendees;
        changed.push(ClassField::Attendees);
    }
    changed
}
