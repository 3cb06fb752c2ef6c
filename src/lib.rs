//! Admission-limiting TCP reverse proxy for a game's login and game services.
//!
//! Two single-backend proxies (one per profile) absorb floods and reconnect
//! storms while keeping legitimate players connected.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──▶ proxy (accept loop) ──▶ limiter (admission) ──▶ backend
//!                   │                      │
//!                   │ drain gate           │ tempblock events
//!                   ▼                      ▼
//!             overload controller    firewall manager (batched OS bans)
//!                   ▲                      ▲
//!                   └──── supervisor ──────┘
//!                   (wiring, metrics, events, shutdown)
//! ```
//!
//! Data flow: accepted socket → limiter decision → reject (close, maybe
//! queue a firewall ban) or accept (bidirectional copy pair, released on
//! close). The overload controller samples limiter stats and flips the
//! drain gate the accept loop checks; the firewall manager turns repeated
//! tempblocks into kernel-level drops.

// Core subsystems
pub mod config;
pub mod limiter;
pub mod proxy;

// Protection layers
pub mod firewall;
pub mod overload;

// Cross-cutting concerns
pub mod lifecycle;
pub mod supervisor;
