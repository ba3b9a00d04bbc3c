//! Router assembly

pub mod agents;
pub mod executions;
pub mod internal;
pub mod mcp_keys;
pub mod permissions;
pub mod schedules;
pub mod token;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws;

/// Build the full control-plane router
pub fn build(state: AppState) -> Router {
    let agents = Router::new()
        .route("/", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/:name",
            get(agents::get_agent).delete(agents::delete_agent),
        )
        .route("/:name/start", post(agents::start_agent))
        .route("/:name/stop", post(agents::stop_agent))
        .route("/:name/stats", get(agents::agent_stats))
        .route("/:name/autonomy", post(agents::set_autonomy))
        .route(
            "/:name/read-only",
            get(agents::get_read_only).post(agents::set_read_only),
        )
        .route("/:name/task", post(executions::submit_task))
        .route("/:name/chat", post(executions::submit_task))
        .route("/:name/queue", get(executions::queue_status))
        .route("/:name/queue/clear", post(executions::clear_queue))
        .route("/:name/queue/release", post(executions::force_release))
        .route("/:name/executions", get(executions::list_executions))
        .route(
            "/:name/executions/running",
            get(executions::running_execution),
        )
        .route("/:name/executions/:id", get(executions::get_execution))
        .route(
            "/:name/executions/:id/log",
            get(executions::get_execution_log),
        )
        .route(
            "/:name/executions/:id/terminate",
            post(executions::terminate_execution),
        )
        .route("/:name/activities", get(executions::list_activities))
        .route(
            "/:name/activities/current",
            get(executions::current_activities),
        )
        .route(
            "/:name/permissions",
            get(permissions::get_permissions).put(permissions::set_permissions),
        )
        .route(
            "/:name/permissions/:target",
            post(permissions::grant_permission).delete(permissions::revoke_permission),
        )
        .route(
            "/:name/schedules",
            get(schedules::list_schedules).post(schedules::create_schedule),
        )
        .route(
            "/:name/schedules/:id",
            get(schedules::get_schedule)
                .put(schedules::update_schedule)
                .delete(schedules::delete_schedule),
        )
        .route("/:name/schedules/:id/enable", post(schedules::enable_schedule))
        .route(
            "/:name/schedules/:id/disable",
            post(schedules::disable_schedule),
        )
        .route(
            "/:name/schedules/:id/trigger",
            post(schedules::trigger_schedule),
        )
        .route(
            "/:name/schedules/:id/executions",
            get(schedules::schedule_executions),
        )
        .route("/:name/credentials/export", post(agents::export_credentials))
        .route("/:name/credentials/import", post(agents::import_credentials))
        .route(
            "/:name/relay/*tail",
            get(agents::relay_get).post(agents::relay_post),
        );

    let mcp = Router::new()
        .route("/keys", get(mcp_keys::list_keys).post(mcp_keys::create_key))
        .route("/keys/:id/revoke", post(mcp_keys::revoke_key))
        .route("/validate", post(mcp_keys::validate_key));

    let internal = Router::new()
        .route("/activities/track", post(internal::track_activity))
        .route(
            "/activities/:id/complete",
            post(internal::complete_activity),
        );

    Router::new()
        .nest("/api/agents", agents)
        .nest("/api/mcp", mcp)
        .nest("/internal", internal)
        .route("/api/token", post(token::issue_token))
        .route("/api/system/stats", get(agents::all_stats))
        .route("/api/scheduler/status", get(schedules::scheduler_status))
        .route("/ws/activity", get(ws::activity_stream))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod router_tests;
