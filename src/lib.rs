//! Async client for HomeSide heating controllers
//!
//! Talks the EXOsocket protocol over a persistent WebSocket session,
//! optionally authenticated and encrypted, and exposes the controller's
//! addressable variables through a declarative catalogue:
//!
//! - [`registry::VariableRegistry`] loads and validates the catalogue
//! - [`protocol::HomesideSession`] owns the socket, handshake and framing
//! - [`coordinator::UpdateCoordinator`] polls one variable group each
//! - [`combine::combine`] folds raw values into logical values
//! - [`gateway::WriteGateway`] validates writes before they hit the wire
//!
//! ```no_run
//! use homeside_client::config::HomesideConfig;
//! use homeside_client::coordinator::UpdateCoordinator;
//! use homeside_client::gateway::WriteGateway;
//! use homeside_client::protocol::HomesideSession;
//! use homeside_client::registry::{PollGroup, VariableRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> homeside_client::error::Result<()> {
//! let config = HomesideConfig::new("192.168.1.50").with_credentials("op", "secret");
//! let registry = Arc::new(VariableRegistry::load_file("variables.json")?);
//! let session = Arc::new(HomesideSession::new(config.clone()));
//! session.connect().await?;
//!
//! let fast = UpdateCoordinator::new(
//!     PollGroup::Fast,
//!     config.poll_intervals.for_group(PollGroup::Fast),
//!     registry.clone(),
//!     session.clone(),
//! );
//! let _poller = fast.spawn();
//!
//! let gateway = WriteGateway::new(registry, session);
//! gateway.submit("room_setpoint", 21.5).await?;
//! # Ok(())
//! # }
//! ```

pub mod combine;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use combine::{combine, CombinedState, CombinedValue};
pub use config::HomesideConfig;
pub use coordinator::UpdateCoordinator;
pub use error::{HomesideError, Result};
pub use gateway::WriteGateway;
pub use protocol::{HomesideSession, ProtocolSession, RawValue, SessionState};
pub use registry::{Address, PollGroup, VariableDefinition, VariableRegistry};
