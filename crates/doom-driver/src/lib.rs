//! Turn-based remote control of a game session.
//!
//! - [`config`]: layered configuration (defaults, `DOOM_*` env, TOML, flags)
//! - [`state_machine`]: per-turn states and the transition log
//! - [`session`]: turn records, bounded history and the owned process
//! - [`controller`]: the loop tying capture, publishing and strategies together
//! - [`wiring`]: builds the production collaborators from a config

pub mod config;
pub mod controller;
pub mod session;
pub mod state_machine;
pub mod wiring;

pub use config::{ConfigError, DriverConfig};
pub use controller::{
    Collaborators, ControllerSettings, SessionError, SessionOutcome, SessionReport, TurnController,
};
pub use session::{Session, Turn, TurnHistory};
pub use state_machine::{StateMachine, TurnState};
