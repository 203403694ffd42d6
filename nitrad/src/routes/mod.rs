use axum::extract::Extension;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod device;
pub mod install;
pub mod inspect;
pub mod maintenance;
pub mod proxy;
pub mod userconfig;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/nitra/config", get(proxy::config))
        .route("/nitra/test", get(proxy::test))
        .route("/nitra/check-versions", get(inspect::check_versions))
        .route("/nitra/auth/subscription-check", post(proxy::subscription_check))
        .route("/nitra/workflows", get(proxy::workflows))
        .route("/nitra/workflows/:workflow_id", get(proxy::workflow_detail))
        .route("/nitra/models", get(proxy::models))
        .route("/nitra/custom-nodes", get(proxy::custom_nodes))
        .route("/nitra/workflows-metadata", get(proxy::workflows_metadata))
        .route("/nitra/models-metadata", get(proxy::models_metadata))
        .route("/nitra/node-mappings", get(proxy::node_mappings))
        .route("/nitra/contact", post(proxy::contact))
        .route("/nitra/status/update", get(proxy::status_update))
        .route("/nitra/execute/script", post(install::execute_script))
        .route("/nitra/execute/cancel", post(install::execute_cancel))
        .route("/nitra/install/workflow", post(install::install_workflow))
        .route("/nitra/install/models", post(install::install_models))
        .route("/nitra/install/package", post(install::install_package))
        .route("/nitra/models/check-existing", get(inspect::check_existing_models))
        .route(
            "/nitra/custom-nodes/check-installed",
            get(inspect::check_installed_custom_nodes),
        )
        .route("/nitra/queue/status", get(maintenance::queue_status))
        .route("/nitra/queue/reset", get(maintenance::queue_reset))
        .route("/nitra/check-nitra-updates", get(maintenance::check_nitra_updates))
        .route("/nitra/update-nitra", post(maintenance::update_nitra))
        .route("/nitra/update-comfyui", post(maintenance::update_comfyui))
        .route("/nitra/restart", get(maintenance::restart))
        .route("/nitra/user-config", get(userconfig::get_config).post(userconfig::save_config))
        .route("/nitra/device/identity", get(device::identity))
        .route("/nitra/device/registrations", get(device::registrations))
        .route("/nitra/device/register", post(device::register))
        .route("/nitra/debug/device-status", get(device::debug_status))
        .route("/nitra/telemetry/login", post(device::telemetry_login))
        .layer(Extension(state))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([
                    AUTHORIZATION,
                    CONTENT_TYPE,
                    HeaderName::from_static("x-user-email"),
                    HeaderName::from_static("x-user-id"),
                ])
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
}
