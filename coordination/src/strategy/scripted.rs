//! Random play.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{InputStrategy, Mode, Resolution, StrategyError, TurnContext};
use crate::actions::{ActionSpec, ActionTable};
use crate::pipeline::PresentationSurface;

/// Every this many turns the pick is limited to turning actions, so a random
/// walk stuck facing a wall eventually looks elsewhere.
pub const TURN_BIAS_PERIOD: u64 = 8;

pub struct ScriptedStrategy {
    actions: Arc<ActionTable>,
    rng: StdRng,
    surface: Option<Arc<dyn PresentationSurface>>,
}

impl ScriptedStrategy {
    /// A fixed `seed` makes the sequence of picks reproducible.
    pub fn new(actions: Arc<ActionTable>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            actions,
            rng,
            surface: None,
        }
    }

    /// Announce each pick on `surface`.
    pub fn with_surface(mut self, surface: Arc<dyn PresentationSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    fn pick(&mut self, turn: u64) -> Option<ActionSpec> {
        let biased = turn > 0 && turn % TURN_BIAS_PERIOD == 0;
        let candidates: Vec<&ActionSpec> = if biased {
            let turning = self.actions.turning();
            if turning.is_empty() {
                self.actions.specs().iter().collect()
            } else {
                turning
            }
        } else {
            self.actions.specs().iter().collect()
        };
        candidates.choose(&mut self.rng).map(|s| (*s).clone())
    }
}

#[async_trait]
impl InputStrategy for ScriptedStrategy {
    fn mode(&self) -> Mode {
        Mode::Scripted
    }

    async fn resolve(&mut self, ctx: TurnContext<'_>) -> Result<Resolution, StrategyError> {
        let spec = self.pick(ctx.turn).ok_or_else(|| {
            StrategyError::NotConfigured(Mode::Scripted, "action table is empty".to_string())
        })?;
        let rationale = format!("Random move: {}", spec.label.to_lowercase());
        tracing::info!(turn = ctx.turn, action = %spec.action, "Scripted pick");

        if let Some(surface) = &self.surface {
            surface
                .announce(ctx.turn, &format!("{} {}", spec.glyph, rationale))
                .await?;
        }
        Ok(Resolution::chosen(spec.action, rationale))
    }
}
