#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`NetworkGuardError`)
//! - [`config`]: Guard configuration (`NetworkGuardConfig`, builder)
//! - [`runtime`]: Container runtime abstraction (`RuntimeClient` trait, `BollardRuntimeClient`)
//! - [`directory`]: Shared container directory (`ContainerDirectory`)
//! - [`tracker`]: Event normalization (`StateTracker`)
//! - [`ports`]: DNAT label parsing and mark selection (`PortIntent`)
//! - [`warmup`]: Reverse-path warm-up (`Prober` trait, `NetProber`)
//! - [`rules`]: Firewall rules (`FirewallRule`, `RuleExecutor` trait, `IptablesExecutor`)
//! - [`reconciler`]: Transition handling (`PolicyReconciler`)
//! - [`guard`]: Main orchestrator (`NetworkGuard`, `NetworkGuardBuilder`)
//!
//! # Architecture
//!
//! ```text
//! RuntimeClient --events--> StateTracker --mpsc--> PolicyReconciler
//!                                |                      |
//!                         ContainerDirectory       warm_up() -> RuleExecutor
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod guard;
pub mod ports;
pub mod reconciler;
pub mod rules;
pub mod runtime;
pub mod tracker;
pub mod warmup;

// --- Public API Re-exports ---

// Guard (main orchestrator)
pub use guard::{NetworkGuard, NetworkGuardBuilder};

// Configuration
pub use config::{NetworkGuardConfig, NetworkGuardConfigBuilder};

// Error
pub use error::NetworkGuardError;

// Runtime API
pub use runtime::{
    BollardRuntimeClient, ContainerFilters, EventFilters, RuntimeClient, RuntimeContainer,
    RuntimeEndpoint, RuntimeEvent,
};

// State tracking
pub use directory::ContainerDirectory;
pub use tracker::{StateTracker, TrackerStats};

// Policy
pub use ports::{ParsedPorts, PortIntent, mark_intents, parse_ports};
pub use reconciler::{PolicyReconciler, ReconcilerStats};
pub use rules::{FirewallRule, IptablesExecutor, RuleAction, RuleExecutor};
pub use warmup::{NetProber, ProbeTarget, Prober, WarmupOutcome, WarmupPolicy, warm_up};
