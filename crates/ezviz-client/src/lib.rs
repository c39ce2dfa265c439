//! EZVIZ cloud relay client
//!
//! Negotiates a relay session for one camera and streams its raw video
//! through a [`StreamSink`], reconnecting every time the media server drops
//! the connection.
//!
//! # Example
//!
//! ```no_run
//! use ezviz_auth::{AuthClient, Credentials, Region};
//! use ezviz_client::{ChannelSink, Orchestrator, SessionConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::default();
//! let api = AuthClient::new(config.request_timeout, config.connect_timeout)?;
//! let credentials = Credentials::new("me@example.com", "secret", "BD1234567", Region::Europe);
//! let (sink, mut events) = ChannelSink::new();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! Orchestrator::new(api, credentials, config, sink)
//!     .run(CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod media;
pub mod negotiator;
pub mod orchestrator;
pub mod reconnect;
pub mod session;
pub mod sink;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use media::{MediaSession, TerminationReason};
pub use negotiator::{NegotiationError, RelayNegotiator, RelayTarget};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorState, RunSummary};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use session::{SessionId, SessionIdGenerator, StreamSession};
pub use sink::{spawn_pipe_writer, spawn_segment_writer, ChannelSink, SinkEvent, StreamSink};
