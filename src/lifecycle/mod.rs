//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Existing pairs run to close → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT (interactive sessions) → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One root shutdown broadcast owned by the supervisor
//! - Every background loop selects on its own receiver
//! - Firewall teardown is bounded (supervisor enforces a deadline)

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
