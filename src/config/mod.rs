//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (JSON, flat or {"login": …, "game": …} sectioned)
//!     → loader.rs (discover, parse, pick profile section)
//!     → merge with per-profile defaults (zero/empty = use default)
//!     → validation.rs (semantic checks)
//!     → ProfileConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require restart
//! - A missing config file is not an error: profile defaults apply
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_profile, ConfigError};
pub use schema::{Profile, ProfileConfig};
