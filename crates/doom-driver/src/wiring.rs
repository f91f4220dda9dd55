//! Builds the channel and collaborators a [`DriverConfig`] describes.

use std::sync::Arc;

use coordination::channel::{AgentMetadataStore, ExchangeStore, FileStore, SyncChannel};
use coordination::decision::{ChatDecisionService, CommandDecisionService, DecisionService};
use coordination::pipeline::{AgentPipeline, ClipRecorder, PublishTarget};
use coordination::process::{DisplayProcess, XdotoolInjector};

use crate::config::{ChannelBackend, ConfigError, DecisionBackend, DriverConfig, SurfaceKind};
use crate::controller::Collaborators;

/// Page the local surface appends captions to.
pub const LOCAL_PAGE: &str = "index.html";

pub fn build_store(config: &DriverConfig) -> Arc<dyn ExchangeStore> {
    match &config.channel {
        ChannelBackend::Dir { path } => Arc::new(FileStore::new(path.clone())),
        ChannelBackend::AgentMetadata { bin } => Arc::new(AgentMetadataStore::with_binary(bin)),
    }
}

pub fn build_channel(config: &DriverConfig) -> Result<SyncChannel, ConfigError> {
    let channel = SyncChannel::new(build_store(config)).with_retry(config.retry_policy());
    match &config.namespace {
        Some(ns) => channel
            .with_namespace(ns.clone())
            .map_err(|e| ConfigError::InvalidConfiguration(e.to_string())),
        None => Ok(channel),
    }
}

pub fn build_decision_service(
    config: &DriverConfig,
) -> Result<Option<Arc<dyn DecisionService>>, ConfigError> {
    let invalid = |e: coordination::decision::DecisionError| {
        ConfigError::InvalidConfiguration(format!("decision service: {e}"))
    };
    let service: Arc<dyn DecisionService> = match &config.decision {
        None => return Ok(None),
        Some(DecisionBackend::Http {
            url,
            model,
            api_key_env,
        }) => {
            let api_key = api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .filter(|k| !k.is_empty());
            Arc::new(
                ChatDecisionService::new(url, model.clone(), api_key, config.model_timeout())
                    .map_err(invalid)?,
            )
        }
        Some(DecisionBackend::Command { template }) => Arc::new(
            CommandDecisionService::new(template, config.model_timeout()).map_err(invalid)?,
        ),
    };
    Ok(Some(service))
}

pub fn build_collaborators(config: &DriverConfig) -> Result<Collaborators, ConfigError> {
    let mut recorder = ClipRecorder::new(config.display.clone(), config.output_dir.clone());
    recorder.geometry = config.geometry.clone();
    recorder.framerate = config.framerate;

    let target = match config.surface {
        SurfaceKind::Buildkite => PublishTarget::Agent {
            bin: config.agent_bin.clone(),
        },
        SurfaceKind::Local => PublishTarget::LocalPage {
            page: config.output_dir.join(LOCAL_PAGE),
        },
    };
    let pipeline = Arc::new(AgentPipeline::new(recorder, target));

    Ok(Collaborators {
        process: Arc::new(DisplayProcess::new(config.launch_config())),
        injector: Arc::new(XdotoolInjector::new(config.display.clone())),
        pipeline: pipeline.clone(),
        surface: pipeline,
        decision: build_decision_service(config)?,
    })
}
