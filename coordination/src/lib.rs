//! Turn coordination for a remotely controlled game session.
//!
//! This library provides the pieces a driver composes into one turn loop:
//! - [`channel`]: durable key/value exchange between the driver and its
//!   out-of-process peers (operators, pipeline steps, workers)
//! - [`strategy`]: manual, scripted and model-driven sources for the next action
//! - [`actions`]: the static action vocabulary
//! - [`decision`]: clients for the external decision service
//! - [`process`] and [`pipeline`]: thin wrappers around the display server,
//!   the game, the input injector, the clip recorder and the publishing agent
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use coordination::channel::{ExchangeKey, FileStore, PollPolicy, SyncChannel};
//!
//! # async fn demo() -> Result<(), coordination::channel::ChannelError> {
//! let channel = SyncChannel::new(Arc::new(FileStore::new("/tmp/doom-channel")));
//! let key = ExchangeKey::for_turn("action", 3)?;
//! let choice = channel
//!     .consume(&key, PollPolicy::new(Duration::from_secs(600), Duration::from_secs(1)))
//!     .await?;
//! # let _ = choice;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod channel;
pub mod decision;
pub mod pipeline;
pub mod process;
pub mod strategy;

pub use actions::{Action, ActionSpec, ActionTable};
pub use channel::{ChannelError, ExchangeKey, PollPolicy, RetryPolicy, SyncChannel};
pub use strategy::{InputStrategy, Mode, Resolution, StrategyError, TurnContext};
