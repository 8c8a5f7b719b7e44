//! In-memory stand-in for the qdbapi service.
//!
//! Every action is a `POST /db/{dbid}` with the action name in the
//! `QUICKBASE-ACTION` header and an XML body. Replies are XML envelopes,
//! except for the rendering actions which answer with HTML or CSV.

pub mod state;
pub mod wire;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio::{net::TcpListener, sync::RwLock};

pub use state::{
    Backend, Fault, Payload, DEMO_APP, DEMO_APP_DBID, DEMO_PASSWORD, DEMO_TASKS_DBID, DEMO_USER, OTHER_PASSWORD,
    OTHER_USER,
};
use wire::{envelope, ApiRequest};

pub type Db = Arc<RwLock<Backend>>;

/// Router over a fresh seeded backend.
pub fn app() -> Router {
    router(Arc::new(RwLock::new(Backend::seeded())))
}

/// Router over shared state, so callers can inspect it afterwards.
pub fn router(db: Db) -> Router {
    Router::new().route("/db/{dbid}", post(dispatch)).with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    serve(listener, Arc::new(RwLock::new(Backend::seeded()))).await
}

pub async fn serve(listener: TcpListener, db: Db) -> Result<(), std::io::Error> {
    axum::serve(listener, router(db)).await
}

async fn dispatch(State(db): State<Db>, Path(dbid): Path<String>, headers: HeaderMap, body: String) -> Response {
    let action = headers
        .get("QUICKBASE-ACTION")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let request = match ApiRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(%action, %dbid, error = %e, "unparseable request");
            return xml_reply(envelope(&action, 11, "Unparseable XML", Some(&e), None, ""));
        }
    };

    let outcome = db.write().await.handle(&action, &dbid, &request);
    let udata = request.udata.as_deref();
    match outcome {
        Ok(Payload::Xml(payload)) => {
            tracing::debug!(%action, %dbid, "ok");
            xml_reply(envelope(&action, 0, "No error", None, udata, &payload))
        }
        Ok(Payload::Document { content_type, body }) => {
            tracing::debug!(%action, %dbid, content_type, "document");
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(fault) => {
            tracing::debug!(%action, %dbid, code = fault.code, text = %fault.text, "fault");
            xml_reply(envelope(
                &action,
                fault.code,
                &fault.text,
                fault.detail.as_deref(),
                udata,
                "",
            ))
        }
    }
}

fn xml_reply(body: Result<String, String>) -> Response {
    match body {
        Ok(body) => ([(header::CONTENT_TYPE, "text/xml")], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "cannot encode reply");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}
