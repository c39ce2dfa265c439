//! Session orchestrator
//!
//! Owns the reconnect cycle:
//!
//! ```text
//! Idle -> Authenticating -> Negotiating -> Streaming -> Terminated
//!              ^                 ^                          |
//!              |                 +--------------------------+
//!              +---------- (token expired / rejected) ------+
//! ```
//!
//! The media server closes every connection after a short while, so
//! Terminated is the normal outcome of Streaming. The orchestrator only
//! stops when cancelled or when it hits an error no retry can fix.

use crate::config::SessionConfig;
use crate::media::{MediaSession, TerminationReason};
use crate::negotiator::{RelayNegotiator, RelayTarget};
use crate::reconnect::{jittered, pause, ReconnectError, ReconnectManager};
use crate::session::{SessionId, SessionIdGenerator, StreamSession};
use crate::sink::StreamSink;
use chrono::Utc;
use ezviz_auth::{AuthError, AuthSession, CloudApi, Credentials, ServerAddress};
use ezviz_proto::PacketCodec;
use std::io;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Authenticating,
    Negotiating,
    Streaming { session_id: SessionId },
    Terminated { session_id: SessionId },
    Halted,
}

/// Errors that stop the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Authentication failed permanently: {0}")]
    Fatal(#[from] AuthError),

    #[error("Downstream sink closed: {0}")]
    SinkClosed(io::Error),

    #[error("Gave up after {0} failed authentication retries")]
    RetriesExhausted(usize),

    #[error("Media task failed: {0}")]
    TaskFailed(String),
}

/// Totals reported when the orchestrator stops cleanly
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub logins: u64,
    pub sessions: u64,
    pub bytes_emitted: u64,
}

/// Login session plus the directory server it resolved for our camera
#[derive(Debug, Clone)]
struct Authenticated {
    session: AuthSession,
    directory: ServerAddress,
}

type StateObserver = Box<dyn FnMut(&OrchestratorState) + Send>;

/// Drives authentication, negotiation and streaming for one camera
pub struct Orchestrator<A, S> {
    api: A,
    credentials: Credentials,
    config: SessionConfig,
    sink: Option<S>,
    session_ids: SessionIdGenerator,
    observer: Option<StateObserver>,
    state: OrchestratorState,
    negotiator: RelayNegotiator,
    media: MediaSession,
}

impl<A, S> Orchestrator<A, S>
where
    A: CloudApi,
    S: StreamSink,
{
    pub fn new(api: A, credentials: Credentials, config: SessionConfig, sink: S) -> Self {
        let codec = PacketCodec::new().with_max_payload(config.max_payload);
        let negotiator = RelayNegotiator::new(config.connect_timeout, config.negotiation_timeout)
            .with_codec(codec);
        let media = MediaSession::new(config.connect_timeout, config.idle_timeout).with_codec(codec);

        Self {
            api,
            credentials,
            config,
            sink: Some(sink),
            session_ids: SessionIdGenerator::new(),
            observer: None,
            state: OrchestratorState::Idle,
            negotiator,
            media,
        }
    }

    /// Call `observer` on every state change
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&OrchestratorState) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_session_ids(mut self, session_ids: SessionIdGenerator) -> Self {
        self.session_ids = session_ids;
        self
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Run until `cancel` fires or a fatal error occurs
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary, OrchestratorError> {
        let mut auth_backoff = ReconnectManager::new(self.config.auth_backoff.clone());
        let mut negotiation_backoff = ReconnectManager::new(self.config.negotiation_backoff.clone());
        let mut authenticated: Option<Authenticated> = None;
        let mut target: Option<RelayTarget> = None;
        let mut attempt_number: u64 = 1;
        let mut media_failed = false;
        let mut summary = RunSummary::default();

        info!(
            "Starting stream for camera {} ({})",
            self.credentials.serial, self.credentials.region
        );

        loop {
            match self.state.clone() {
                OrchestratorState::Idle => self.transition(OrchestratorState::Authenticating),

                OrchestratorState::Authenticating => {
                    summary.logins += 1;
                    let result = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = authenticate(&self.api, &self.credentials) => Some(result),
                    };
                    let Some(result) = result else {
                        return Ok(self.stop(summary));
                    };

                    match result {
                        Ok(auth) => {
                            auth_backoff.reset();
                            authenticated = Some(auth);
                            self.transition(OrchestratorState::Negotiating);
                        }
                        Err(e) if e.is_fatal() => {
                            error!("Authentication failed: {}", e);
                            self.transition(OrchestratorState::Halted);
                            return Err(OrchestratorError::Fatal(e));
                        }
                        Err(e) => {
                            warn!(
                                "Authentication attempt {} failed: {}",
                                auth_backoff.attempt() + 1,
                                e
                            );
                            match auth_backoff.wait(&cancel).await {
                                Ok(()) => {}
                                Err(ReconnectError::Cancelled) => return Ok(self.stop(summary)),
                                Err(ReconnectError::MaxAttemptsReached) => {
                                    self.transition(OrchestratorState::Halted);
                                    return Err(OrchestratorError::RetriesExhausted(
                                        auth_backoff.attempt(),
                                    ));
                                }
                            }
                        }
                    }
                }

                OrchestratorState::Negotiating => {
                    let Some(auth) = authenticated.clone().filter(|a| !self.is_expired(a)) else {
                        if authenticated.take().is_some() {
                            info!("Session token expired, logging in again");
                        }
                        self.transition(OrchestratorState::Authenticating);
                        continue;
                    };

                    let result = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = negotiate(
                            &self.api,
                            &self.negotiator,
                            &self.credentials,
                            &auth,
                        ) => Some(result),
                    };
                    let Some(result) = result else {
                        return Ok(self.stop(summary));
                    };

                    match result {
                        Ok(relay) => {
                            target = Some(relay);
                            let session_id = self.session_ids.next_id();
                            self.transition(OrchestratorState::Streaming { session_id });
                        }
                        Err(NegotiateFailure::Auth(e)) if e.is_fatal() => {
                            error!("Relay credentials refused: {}", e);
                            self.transition(OrchestratorState::Halted);
                            return Err(OrchestratorError::Fatal(e));
                        }
                        Err(failure) if failure.needs_reauth() => {
                            warn!("Session rejected during negotiation: {}", failure);
                            authenticated = None;
                            negotiation_backoff.reset();
                            self.transition(OrchestratorState::Authenticating);
                        }
                        Err(failure) => {
                            warn!(
                                "Negotiation attempt {} failed: {}",
                                negotiation_backoff.attempt() + 1,
                                failure
                            );
                            match negotiation_backoff.wait(&cancel).await {
                                Ok(()) => {}
                                Err(ReconnectError::Cancelled) => return Ok(self.stop(summary)),
                                Err(ReconnectError::MaxAttemptsReached) => {
                                    // The directory server may have moved
                                    warn!("Negotiation keeps failing, logging in again");
                                    authenticated = None;
                                    negotiation_backoff.reset();
                                    self.transition(OrchestratorState::Authenticating);
                                }
                            }
                        }
                    }
                }

                OrchestratorState::Streaming { session_id } => {
                    let Some(relay) = target.take() else {
                        self.transition(OrchestratorState::Negotiating);
                        continue;
                    };

                    let (session, reason) =
                        self.stream(relay, session_id, attempt_number, &cancel).await?;

                    summary.sessions += 1;
                    summary.bytes_emitted += session.bytes_emitted;
                    info!(
                        "Session {} ended after {} bytes in {} packets: {}",
                        session_id, session.bytes_emitted, session.packets_emitted, reason
                    );

                    // Sessions that die before any video are paced like
                    // negotiation failures
                    media_failed = session.bytes_emitted == 0
                        && matches!(
                            reason,
                            TerminationReason::ConnectFailed(_)
                                | TerminationReason::ServerError { .. }
                                | TerminationReason::Io(_)
                        );
                    if session.bytes_emitted > 0 {
                        negotiation_backoff.reset();
                    }

                    match reason {
                        TerminationReason::Cancelled => return Ok(self.stop(summary)),
                        TerminationReason::SinkClosed(e) => {
                            error!("Downstream closed, stopping: {}", e);
                            self.transition(OrchestratorState::Halted);
                            return Err(OrchestratorError::SinkClosed(e));
                        }
                        TerminationReason::ServerError { code: 401 | 403 } => {
                            authenticated = None;
                        }
                        _ => {}
                    }

                    self.transition(OrchestratorState::Terminated { session_id });
                }

                OrchestratorState::Terminated { session_id } => {
                    attempt_number += 1;

                    if media_failed {
                        warn!(
                            "Session {} failed before any video ({} in a row)",
                            session_id,
                            negotiation_backoff.attempt() + 1
                        );
                        match negotiation_backoff.wait(&cancel).await {
                            Ok(()) => {}
                            Err(ReconnectError::Cancelled) => return Ok(self.stop(summary)),
                            Err(ReconnectError::MaxAttemptsReached) => {
                                warn!("Media server keeps failing, logging in again");
                                authenticated = None;
                                negotiation_backoff.reset();
                            }
                        }
                    } else {
                        let delay =
                            jittered(self.config.reconnect_delay, self.config.reconnect_jitter);
                        debug!(
                            "Reconnecting in {}ms (attempt {})",
                            delay.as_millis(),
                            attempt_number
                        );
                        if pause(delay, &cancel).await.is_err() {
                            return Ok(self.stop(summary));
                        }
                    }

                    match &authenticated {
                        Some(auth) if !self.is_expired(auth) => {
                            self.transition(OrchestratorState::Negotiating)
                        }
                        _ => self.transition(OrchestratorState::Authenticating),
                    }
                }

                OrchestratorState::Halted => {
                    return Err(OrchestratorError::TaskFailed(
                        "orchestrator already halted".into(),
                    ))
                }
            }
        }
    }

    /// Run one media session on its own task. The sink moves into the task
    /// and comes back with the result.
    async fn stream(
        &mut self,
        relay: RelayTarget,
        session_id: SessionId,
        attempt_number: u64,
        cancel: &CancellationToken,
    ) -> Result<(StreamSession, TerminationReason), OrchestratorError> {
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| OrchestratorError::TaskFailed("sink unavailable".into()))?;
        let media = self.media.clone();
        let task_cancel = cancel.child_token();

        info!(
            "Session {} streaming from {} (attempt {})",
            session_id, relay.media_server, attempt_number
        );

        let handle = tokio::spawn(async move {
            let mut session = StreamSession::new(session_id, attempt_number);

            if let Err(e) = sink.session_started(&session) {
                return (sink, session, TerminationReason::SinkClosed(e));
            }

            let reason = media
                .run(relay, &task_cancel, |chunk| {
                    let len = chunk.len();
                    sink.write_chunk(&session, chunk)?;
                    session.record_chunk(len);
                    Ok(())
                })
                .await;

            if let Err(e) = sink.session_ended(&session, &reason) {
                if !matches!(reason, TerminationReason::SinkClosed(_)) {
                    return (sink, session, TerminationReason::SinkClosed(e));
                }
            }

            (sink, session, reason)
        });

        match handle.await {
            Ok((sink, session, reason)) => {
                self.sink = Some(sink);
                Ok((session, reason))
            }
            Err(e) => {
                error!("Media task for session {} failed: {}", session_id, e);
                self.transition(OrchestratorState::Halted);
                Err(OrchestratorError::TaskFailed(e.to_string()))
            }
        }
    }

    fn is_expired(&self, auth: &Authenticated) -> bool {
        let max_age = chrono::Duration::from_std(self.config.max_token_age)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        auth.session.is_expired(Utc::now(), max_age)
    }

    fn transition(&mut self, state: OrchestratorState) {
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(observer) = self.observer.as_mut() {
            observer(&self.state);
        }
    }

    fn stop(&mut self, summary: RunSummary) -> RunSummary {
        info!(
            "Stopped after {} sessions ({} bytes)",
            summary.sessions, summary.bytes_emitted
        );
        self.transition(OrchestratorState::Idle);
        summary
    }
}

async fn authenticate<A: CloudApi>(
    api: &A,
    credentials: &Credentials,
) -> Result<Authenticated, AuthError> {
    let session = api.login(credentials).await?;
    let directory = api
        .resolve_directory_server(&session, credentials.region, &credentials.serial)
        .await?;
    debug!("Directory server is {}", directory);

    Ok(Authenticated { session, directory })
}

async fn negotiate<A: CloudApi>(
    api: &A,
    negotiator: &RelayNegotiator,
    credentials: &Credentials,
    auth: &Authenticated,
) -> Result<RelayTarget, NegotiateFailure> {
    let relay_token = api
        .fetch_relay_credentials(&auth.session, &credentials.serial)
        .await
        .map_err(NegotiateFailure::Auth)?;

    negotiator
        .negotiate(&auth.directory, &relay_token, &credentials.serial)
        .await
        .map_err(NegotiateFailure::Relay)
}

/// Failure in either half of the negotiating state
#[derive(Debug, Error)]
enum NegotiateFailure {
    #[error("{0}")]
    Auth(AuthError),

    #[error("{0}")]
    Relay(crate::negotiator::NegotiationError),
}

impl NegotiateFailure {
    fn needs_reauth(&self) -> bool {
        match self {
            NegotiateFailure::Auth(e) => e.is_session_expired(),
            NegotiateFailure::Relay(e) => e.is_auth_rejection(),
        }
    }
}
