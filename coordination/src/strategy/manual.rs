//! Operator-driven resolution.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ControlSignal, InputStrategy, Mode, Resolution, StrategyError, TurnContext};
use crate::actions::ActionTable;
use crate::channel::{key, ChannelError, ExchangeKey, PollPolicy, SyncChannel};
use crate::pipeline::PresentationSurface;

/// Presents the action menu, then waits on `action_<turn>` and
/// `control_<turn>` until one of them arrives. A control record written
/// alongside the selection is claimed with it.
pub struct ManualStrategy {
    actions: Arc<ActionTable>,
    channel: SyncChannel,
    surface: Arc<dyn PresentationSurface>,
    poll: PollPolicy,
}

impl ManualStrategy {
    pub fn new(
        actions: Arc<ActionTable>,
        channel: SyncChannel,
        surface: Arc<dyn PresentationSurface>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            actions,
            channel,
            surface,
            poll,
        }
    }
}

#[async_trait]
impl InputStrategy for ManualStrategy {
    fn mode(&self) -> Mode {
        Mode::Manual
    }

    async fn resolve(&mut self, ctx: TurnContext<'_>) -> Result<Resolution, StrategyError> {
        let turn = ctx.turn;
        let action_key = ExchangeKey::for_turn(key::ACTION, turn).map_err(ChannelError::from)?;
        let control_key = ExchangeKey::for_turn(key::CONTROL, turn).map_err(ChannelError::from)?;
        let keys = [action_key, control_key];

        self.surface
            .present_choice(turn, &self.channel.qualify(&keys[0]), self.actions.specs())
            .await?;
        tracing::info!(turn, key = %keys[0], "Waiting for operator selection");

        let deadline = Instant::now() + self.poll.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = PollPolicy::new(remaining, self.poll.interval);
            let (idx, raw) = match self.channel.consume_any(&keys, poll).await {
                Ok(found) => found,
                Err(ChannelError::Timeout { .. }) => {
                    return Err(StrategyError::Timeout {
                        turn,
                        waited: self.poll.timeout,
                    })
                }
                Err(e) => return Err(e.into()),
            };

            if idx == 0 {
                let action = self.actions.lookup(&raw).ok_or_else(|| {
                    StrategyError::InvalidSelection {
                        turn,
                        value: raw.clone(),
                    }
                })?;
                let label = self
                    .actions
                    .spec(action)
                    .map(|s| s.label.clone())
                    .unwrap_or_else(|| action.to_string());
                tracing::info!(turn, %action, "Operator selected action");
                let signal = match self.channel.try_consume(&keys[1]).await? {
                    Some(raw) => ControlSignal::parse(&raw),
                    None => ControlSignal::Continue,
                };
                if signal != ControlSignal::Continue {
                    tracing::info!(turn, %signal, "Control signal sent with the selection");
                }
                return Ok(
                    Resolution::chosen(action, format!("Operator chose {label}")).with_signal(signal)
                );
            }

            match ControlSignal::parse(&raw) {
                ControlSignal::End => {
                    tracing::info!(turn, "Operator ended the session");
                    return Ok(Resolution::signalled(
                        ControlSignal::End,
                        "Operator ended the session",
                    ));
                }
                ControlSignal::SwitchTo(mode) if mode != Mode::Manual => {
                    tracing::info!(turn, %mode, "Operator requested mode switch");
                    return Ok(Resolution::signalled(
                        ControlSignal::SwitchTo(mode),
                        format!("Operator switched to {mode}"),
                    ));
                }
                // Continue, or a switch to the mode we are already in.
                _ => tracing::debug!(turn, "Control signal without effect, still waiting"),
            }
        }
    }
}
