use axum::routing::get;
use axum::Router;

use crate::handlers::admin;
use crate::state::AppState;

/// Routes mounted at `/admin/dispatch`.
///
/// ```text
/// GET    /stats           -> dispatch_stats
/// GET    /dead-letters    -> dead_letters
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(admin::dispatch_stats))
        .route("/dead-letters", get(admin::dead_letters))
}
