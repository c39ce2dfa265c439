//! EZVIZ cloud API authentication
//!
//! Logs into the vendor cloud, discovers the relay directory server for a
//! camera and fetches the short-lived tokens the relay tier requires.

pub mod client;
pub mod credentials;
pub mod error;
pub mod session;

pub use client::{AuthClient, CloudApi, DeviceInfo};
pub use credentials::{Credentials, Region};
pub use error::AuthError;
pub use session::AuthSession;

pub use ezviz_proto::ServerAddress;
