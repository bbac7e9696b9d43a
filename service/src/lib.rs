// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The remote service adapter: a JSON request/response envelope over a single `POST /rpc`
//! endpoint, driving a [`MemFs`] for batch and streaming callers.
//!
//! Requests are `{method, params}`; responses are `{data}` on success or
//! `{error: {code, message}}` with a code from the closed set in [`ErrorCode`]. Streaming
//! transfers run inside server-issued sessions that expire after an idle interval and are
//! reclaimed by a background sweep.

mod error;
mod methods;
mod sessions;
pub mod tools;

use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use fs::MemFs;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};

pub use crate::error::{ErrorCode, ServiceError, WireError};
pub use crate::sessions::{SessionRegistry, DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_TIMEOUT};

#[derive(Clone, Copy, Debug)]
pub struct ServiceOptions {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub chunk_size: usize,
}

impl Default for ServiceOptions {
    fn default() -> ServiceOptions {
        ServiceOptions {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: Duration::from_secs(30),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ServiceState {
    pub(crate) fs: MemFs,
    pub(crate) sessions: SessionRegistry,
    pub(crate) chunk_size: usize,
}

/// The request envelope. `params` defaults to null for parameterless methods.
#[derive(Deserialize)]
struct Envelope {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Builds the service router with default options and starts the session sweeper.
pub fn router(fs: MemFs) -> Router {
    router_with_options(fs, ServiceOptions::default())
}

pub fn router_with_options(fs: MemFs, options: ServiceOptions) -> Router {
    let state = ServiceState {
        fs,
        sessions: SessionRegistry::new(options.idle_timeout),
        chunk_size: options.chunk_size,
    };

    // The sweep is what actually enforces session expiry for clients that vanish.
    let sweeper = state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(options.sweep_interval);
        loop {
            interval.tick().await;
            sweeper.sweep_expired();
        }
    });

    // Unknown paths fall through to axum's 404; non-POST on /rpc gets 405.
    Router::new().route("/rpc", post(rpc)).with_state(state)
}

async fn rpc(State(state): State<ServiceState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    match methods::dispatch(&state, &envelope.method, envelope.params).await {
        Ok(data) => Json(json!({ "data": data })),
        Err(e) => {
            warn!("rpc {} failed: {e}", envelope.method);
            Json(json!({ "error": WireError::from(&e) }))
        }
    }
}
