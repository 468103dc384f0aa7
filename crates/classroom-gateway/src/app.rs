use axum::{
    routing::{get, post, put},
    Router,
};
use classroom_core::config::ClassroomConfig;
use classroom_lifecycle::{LifecycleOrchestrator, SqliteClassStore, SqliteReviewStore};
use classroom_scheduler::{JobAdmin, Scheduler, SchedulingHealth};
use std::sync::Arc;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ClassroomConfig,
    pub scheduler: Scheduler,
    pub health: Arc<SchedulingHealth>,
    pub jobs: JobAdmin,
    pub lifecycle: LifecycleOrchestrator,
    pub classes: Arc<SqliteClassStore>,
    pub reviews: Arc<SqliteReviewStore>,
}

impl AppState {
    pub fn new(
        config: ClassroomConfig,
        scheduler: Scheduler,
        health: Arc<SchedulingHealth>,
        lifecycle: LifecycleOrchestrator,
        classes: Arc<SqliteClassStore>,
        reviews: Arc<SqliteReviewStore>,
    ) -> Self {
        Self {
            jobs: JobAdmin::new(scheduler.clone(), Arc::clone(&health)),
            config,
            scheduler,
            health,
            lifecycle,
            classes,
            reviews,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{classes, health, jobs};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/stats", get(jobs::job_stats))
        .route("/jobs/class/{class_id}", get(jobs::list_class_jobs))
        .route("/jobs/{id}", axum::routing::delete(jobs::cancel_job))
        .route("/jobs/{id}/reschedule", put(jobs::reschedule_job))
        .route("/jobs/{id}/disable", post(jobs::disable_job))
        .route("/jobs/{id}/enable", post(jobs::enable_job))
        .route("/classes", post(classes::create_class))
        .route(
            "/classes/{id}",
            get(classes::get_class)
                .patch(classes::update_class)
                .delete(classes::delete_class),
        )
        .route("/classes/{id}/start", post(classes::start_class))
        .route("/classes/{id}/end", post(classes::end_class))
        .route("/classes/{id}/join", post(classes::join_class))
        .route("/classes/{id}/reviews", post(classes::add_review))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
