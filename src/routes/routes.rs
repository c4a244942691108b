//! Defines every HTTP route of the media service.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Buckets**
//!   - `GET    /buckets/{bucket}?prefix=`: list objects as JSON
//!   - `PUT    /buckets/{bucket}`: create bucket
//!   - `DELETE /buckets/{bucket}`: delete bucket
//!
//! - **Objects**
//!   - `PUT    /objects/{bucket}/{*key}`: upload object (emits a finalize event)
//!   - `GET    /objects/{bucket}/{*key}`: download object (signed or authorized)
//!   - `HEAD   /objects/{bucket}/{*key}`: retrieve metadata only
//!   - `PATCH  /objects/{bucket}/{*key}`: set the public flag
//!   - `DELETE /objects/{bucket}/{*key}`: soft-delete object
//!   - `GET    /sign/{bucket}/{*key}`: issue a signed read URL
//!
//! - **Documents**
//!   - `PUT/GET /documents/{collection}/{id}`
//!
//! - **Optimizer**
//!   - `POST /optimizer/bulk`, `GET /optimizer/stats`, `POST /optimizer/finalize`
//!
//! - **Edge cache**
//!   - `GET /web/{*path}`: web client served through the cache controller
//!   - `POST /edge/refresh`: refetch the critical assets
//!
//! The wildcard `*key` allows nested keys like `images/trips/dahab.jpg`.

use crate::{
    handlers::{
        document_handlers::{get_document, put_document},
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, list_objects,
            set_object_public, sign_object, upload_object,
        },
        optimizer_handlers::{bulk_optimize, optimization_stats, run_finalize},
        web_handlers::{refresh_edge, web_asset, web_root},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router. Handlers pull the pieces of [`AppState`] they need.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Object-level routes
        .route(
            "/objects/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .patch(set_object_public)
                .delete(delete_object),
        )
        .route("/sign/{bucket}/{*key}", get(sign_object))
        // Bucket-level routes
        .route(
            "/buckets/{bucket}",
            get(list_objects).put(create_bucket).delete(delete_bucket),
        )
        .route(
            "/documents/{collection}/{id}",
            put(put_document).get(get_document),
        )
        .route("/optimizer/bulk", post(bulk_optimize))
        .route("/optimizer/stats", get(optimization_stats))
        .route("/optimizer/finalize", post(run_finalize))
        .route("/web", get(web_root))
        .route("/web/", get(web_root))
        .route("/web/{*path}", get(web_asset))
        .route("/edge/refresh", post(refresh_edge))
}
