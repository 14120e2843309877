//! # Lease gateway & healthcheck API
//!
//! This crate provides the http api clients report their leases to, along
//! with healthcheck and metrics. It exposes the following endpoints:
//!
//! POST   /api/by-serial/:serial
//! POST   /api/by-dn/:dn
//! GET    /api/by-serial/:serial
//! DELETE /api/by-service/:service
//! /health
//! /ping
//! /metrics
//! /metrics-text
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use credential_store::CredentialStore;
use lease_registry::{FlushCoordinator, LeaseRegistry};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, trace};

pub use crate::models::{ApiError, Health, State};

/// Default bound on a whole request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    token: CancellationToken,
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.token.cancel();
        self.task_handle.abort();
    }
}

/// Serves lease submissions, validity checks and flushes over HTTP, and
/// listens for health changes reported by the rest of the process.
#[derive(Debug)]
pub struct ExternalApi<S> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    registry: Arc<LeaseRegistry<S>>,
    flusher: Arc<FlushCoordinator<S>>,
    request_timeout: Duration,
}

impl<S: CredentialStore> ExternalApi<S> {
    /// Create a new ExternalApi instance
    pub fn new(
        addr: SocketAddr,
        registry: Arc<LeaseRegistry<S>>,
        flusher: Arc<FlushCoordinator<S>>,
    ) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            registry,
            flusher,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound every request, store calls included, by `request_timeout`
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    fn router(&self) -> Router {
        Router::new()
            .route(
                "/api/by-serial/:serial",
                routing::post(handlers::submit_by_serial::<S>)
                    .get(handlers::check_validity::<S>),
            )
            .route("/api/by-dn/:dn", routing::post(handlers::submit_by_dn::<S>))
            .route(
                "/api/by-service/:service",
                routing::delete(handlers::flush::<S>),
            )
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .layer(Extension(self.state.clone()))
            .layer(Extension(Arc::clone(&self.registry)))
            .layer(Extension(Arc::clone(&self.flusher)))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(self.request_timeout))
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(addr: SocketAddr, app: Router, token: CancellationToken) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        debug!("external API shut down");
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes. The task ends when `token` is cancelled or the listener fails.
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let addr = self.addr;
        let app = self.router();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            tokio::select! {
                res = ExternalApi::<S>::run(addr, app, token) => {
                    if let Err(err) = res {
                        error!(?err, "external API exited with error");
                    }
                }
                res = self.listen_status() => {
                    if let Err(err) = res {
                        error!(?err, "health task returning, this should not happen");
                    }
                }
            }
        })
    }

    /// Start the `ExternalApi`, stopping it when the guard drops
    pub fn serve(self) -> ExternalApiGuard {
        let token = CancellationToken::new();
        ExternalApiGuard {
            task_handle: self.start(token.clone()),
            token,
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use axum::{
        Form,
        body::Body,
        extract::{Extension, Path, rejection::FormRejection},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use credential_store::{CredentialStore, Identity, SerialNumber};
    use gateway_core::metrics::{RESPONSE_COUNT, update_uptime};
    use lease_registry::{
        FlushCoordinator, LeaseForm, LeaseRegistry, Outcome, ValidationError,
        form::{dn_identity, serial_identity},
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use crate::models::{ApiResult, Health, ServerResult, State};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    /// validate everything before the store is touched
    async fn submit<S: CredentialStore>(
        registry: &LeaseRegistry<S>,
        identity: Result<Identity, ValidationError>,
        form: Result<Form<LeaseForm>, FormRejection>,
    ) -> ApiResult<(StatusCode, &'static str)> {
        let identity = identity?;
        let Form(form) = form?;
        let report = form.validate()?;

        let outcome = registry.submit(identity, &report).await?;
        match outcome {
            Outcome::Updated => RESPONSE_COUNT.updated.inc(),
            Outcome::Migrated { .. } => RESPONSE_COUNT.migrated.inc(),
            Outcome::NotFound => RESPONSE_COUNT.not_found.inc(),
        }
        Ok(if outcome.is_applied() {
            (StatusCode::OK, "Client lease info updated")
        } else {
            (StatusCode::NOT_FOUND, "Client not found")
        })
    }

    pub(crate) async fn submit_by_serial<S: CredentialStore>(
        Extension(registry): Extension<Arc<LeaseRegistry<S>>>,
        Path(serial): Path<String>,
        form: Result<Form<LeaseForm>, FormRejection>,
    ) -> ApiResult<impl IntoResponse> {
        submit(&registry, serial_identity(&serial), form).await
    }

    /// `dn` arrives percent-decoded
    pub(crate) async fn submit_by_dn<S: CredentialStore>(
        Extension(registry): Extension<Arc<LeaseRegistry<S>>>,
        Path(dn): Path<String>,
        form: Result<Form<LeaseForm>, FormRejection>,
    ) -> ApiResult<impl IntoResponse> {
        submit(&registry, dn_identity(&dn), form).await
    }

    pub(crate) async fn check_validity<S: CredentialStore>(
        Extension(registry): Extension<Arc<LeaseRegistry<S>>>,
        Path(serial): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        let serial = SerialNumber::from_decimal(&serial).map_err(ValidationError::from)?;
        Ok(if registry.check_validity(&serial).await? {
            RESPONSE_COUNT.valid.inc();
            (StatusCode::OK, "Certificate valid")
        } else {
            RESPONSE_COUNT.not_found.inc();
            (StatusCode::NOT_FOUND, "Certificate not found or not valid")
        })
    }

    pub(crate) async fn flush<S: CredentialStore>(
        Extension(flusher): Extension<Arc<FlushCoordinator<S>>>,
        Path(service): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        let count = flusher.flush(&service).await?;
        RESPONSE_COUNT.flushed.inc();
        Ok(format!("Leases flushed: {count}"))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        update_uptime();
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        update_uptime();
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::{extract::rejection::FormRejection, http::StatusCode, response::IntoResponse};
    use gateway_core::metrics::RESPONSE_COUNT;
    use lease_registry::{RegistryError, ValidationError};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};
    use tracing::debug;

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Failure of a lease endpoint, rendered as a plain text body
    #[derive(Debug)]
    pub enum ApiError {
        /// malformed client input, 400
        Invalid(String),
        /// the store did not answer in time, 503
        Unavailable(String),
        /// the store failed, 500
        Store(anyhow::Error),
    }

    /// return lease endpoint result
    pub type ApiResult<T> = Result<T, ApiError>;

    impl From<ValidationError> for ApiError {
        fn from(err: ValidationError) -> Self {
            Self::Invalid(err.to_string())
        }
    }

    impl From<FormRejection> for ApiError {
        fn from(err: FormRejection) -> Self {
            Self::Invalid(err.body_text())
        }
    }

    impl<E> From<RegistryError<E>> for ApiError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        fn from(err: RegistryError<E>) -> Self {
            match err {
                RegistryError::Timeout(after) => Self::Unavailable(format!(
                    "credential store did not answer within {after:?}"
                )),
                RegistryError::Store(err) => Self::Store(err.into()),
            }
        }
    }

    impl IntoResponse for ApiError {
        fn into_response(self) -> axum::response::Response {
            match self {
                ApiError::Invalid(msg) => {
                    RESPONSE_COUNT.invalid.inc();
                    debug!(%msg, "rejected lease request");
                    (StatusCode::BAD_REQUEST, msg).into_response()
                }
                ApiError::Unavailable(msg) => {
                    RESPONSE_COUNT.unavailable.inc();
                    (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
                }
                ApiError::Store(err) => {
                    RESPONSE_COUNT.error.inc();
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("credential store error: {err:#}"),
                    )
                        .into_response()
                }
            }
        }
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
