//! Model-driven resolution.

use std::sync::Arc;

use async_trait::async_trait;

use super::{InputStrategy, Mode, Resolution, StrategyError, TurnContext};
use crate::actions::ActionTable;
use crate::decision::{build_instruction, parse_decision, DecisionError, DecisionService};
use crate::pipeline::PresentationSurface;

/// Shows the latest artifact to a [`DecisionService`] and plays its answer.
///
/// There is no fallback: an unusable reply ends the session.
pub struct ModelStrategy {
    actions: Arc<ActionTable>,
    service: Arc<dyn DecisionService>,
    instruction: String,
    surface: Option<Arc<dyn PresentationSurface>>,
}

impl ModelStrategy {
    pub fn new(actions: Arc<ActionTable>, service: Arc<dyn DecisionService>) -> Self {
        let instruction = build_instruction(&actions);
        Self {
            actions,
            service,
            instruction,
            surface: None,
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn PresentationSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }
}

#[async_trait]
impl InputStrategy for ModelStrategy {
    fn mode(&self) -> Mode {
        Mode::ModelDriven
    }

    async fn resolve(&mut self, ctx: TurnContext<'_>) -> Result<Resolution, StrategyError> {
        let turn = ctx.turn;
        let artifact = ctx.artifact.ok_or(StrategyError::MissingArtifact(turn))?;

        let raw = self
            .service
            .submit(&artifact.path, &self.instruction)
            .await
            .map_err(|e| match e {
                DecisionError::Timeout(waited) => StrategyError::Timeout { turn, waited },
                source => StrategyError::DecisionService { turn, source },
            })?;

        let (action, rationale) = match parse_decision(&raw, &self.actions) {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::error!(turn, %reason, "Decision service reply rejected");
                return Err(StrategyError::InvalidModelResponse { turn, reason, raw });
            }
        };
        tracing::info!(turn, %action, %rationale, "Model decision");

        if let Some(surface) = &self.surface {
            let headline = format!("{} {}", self.actions.glyph(action), rationale);
            surface.announce(turn, &headline).await?;
        }
        Ok(Resolution::chosen(action, rationale))
    }
}
