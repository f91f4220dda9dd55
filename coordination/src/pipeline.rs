//! Capture, transcode and publish collaborators.
//!
//! The turn loop only sees two narrow traits:
//!
//! - [`CapturePipeline`]: record a clip of the live display, turn it into a
//!   publishable artifact, publish it with a caption.
//! - [`PresentationSurface`]: show an operator the menu for a turn (or a
//!   note about an automated choice). Selections never come back through
//!   this trait; they arrive on the synchronization channel.
//!
//! [`AgentPipeline`] implements both on top of `ffmpeg` and either the CI
//! agent (`artifact upload`, `annotate`, `pipeline upload`) or a local HTML
//! page.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::actions::ActionSpec;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Capture for turn {turn} failed: {message}")]
    Capture { turn: u64, message: String },

    #[error("Clip for turn {turn} missing at {path}")]
    MissingClip { turn: u64, path: PathBuf },

    #[error("Publish of '{artifact}' failed: {message}")]
    Publish { artifact: String, message: String },

    #[error("Presentation for turn {turn} failed: {message}")]
    Present { turn: u64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw recording of one turn, before transcoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawClip {
    pub turn: u64,
    pub path: PathBuf,
}

/// A published (or publishable) capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub turn: u64,
    /// Name the artifact is published under.
    pub name: String,
    /// Local file backing the artifact.
    pub path: PathBuf,
}

#[async_trait]
pub trait CapturePipeline: Send + Sync {
    async fn capture_clip(&self, turn: u64, duration: Duration) -> Result<RawClip, PipelineError>;
    async fn to_artifact(&self, clip: RawClip) -> Result<ArtifactRef, PipelineError>;
    async fn publish(&self, artifact: &ArtifactRef, caption_html: &str) -> Result<(), PipelineError>;

    /// Caption markup for `artifact` as this pipeline publishes it.
    fn caption(&self, artifact: &ArtifactRef, headline: &str) -> String {
        caption_html(artifact, headline, false)
    }
}

#[async_trait]
pub trait PresentationSurface: Send + Sync {
    /// Ask the operator to pick one of `options`; the answer must be written
    /// under `response_key`.
    async fn present_choice(
        &self,
        turn: u64,
        response_key: &str,
        options: &[ActionSpec],
    ) -> Result<(), PipelineError>;

    /// Show an automated decision (no response expected).
    async fn announce(&self, turn: u64, headline: &str) -> Result<(), PipelineError>;
}

/// Caption markup around a published artifact.
pub fn caption_html(artifact: &ArtifactRef, headline: &str, local: bool) -> String {
    let src = if local {
        artifact.name.clone()
    } else {
        format!("artifact://{}", artifact.name)
    };
    format!(
        r#"<div class="center"><img class="block mx-auto" width="640" height="480" src="{src}"><h2 class="mt2 center">{}</h2></div>"#,
        escape_html(headline)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `ffmpeg` x11grab recorder producing looping APNG clips.
#[derive(Debug, Clone)]
pub struct ClipRecorder {
    pub bin: String,
    pub display: String,
    pub geometry: String,
    pub framerate: u32,
    pub output_dir: PathBuf,
}

impl ClipRecorder {
    pub fn new(display: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: "ffmpeg".to_string(),
            display: display.into(),
            geometry: "320x240".to_string(),
            framerate: 15,
            output_dir: output_dir.into(),
        }
    }

    fn clip_path(&self, turn: u64) -> PathBuf {
        self.output_dir.join(format!("{turn}.apng"))
    }

    async fn record(&self, turn: u64, duration: Duration) -> Result<RawClip, PipelineError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.clip_path(turn);
        let output = Command::new(&self.bin)
            .args(["-y", "-t"])
            .arg(format!("{:.2}", duration.as_secs_f64()))
            .args(["-video_size", &self.geometry])
            .args(["-framerate", &self.framerate.to_string()])
            .args(["-f", "x11grab", "-i", &self.display])
            .args(["-plays", "0"])
            .arg(&path)
            .args(["-loglevel", "warning"])
            .output()
            .await
            .map_err(|e| PipelineError::Capture {
                turn,
                message: format!("failed to run {}: {e}", self.bin),
            })?;
        if !output.status.success() {
            return Err(PipelineError::Capture {
                turn,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(RawClip { turn, path })
    }
}

/// Where captions and menus go.
#[derive(Debug, Clone)]
pub enum PublishTarget {
    /// The CI agent's artifact, annotation and pipeline-upload commands.
    Agent { bin: String },
    /// An HTML page next to the clips; menus are logged.
    LocalPage { page: PathBuf },
}

/// `ffmpeg` recording plus a [`PublishTarget`].
#[derive(Debug, Clone)]
pub struct AgentPipeline {
    recorder: ClipRecorder,
    target: PublishTarget,
}

impl AgentPipeline {
    pub fn new(recorder: ClipRecorder, target: PublishTarget) -> Self {
        Self { recorder, target }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, PublishTarget::LocalPage { .. })
    }

    async fn agent_cmd(
        bin: &str,
        args: &[&str],
        stdin: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<(), String> {
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to run {bin}: {e}"))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| format!("failed to write stdin: {e}"))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("{bin} did not finish: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl CapturePipeline for AgentPipeline {
    async fn capture_clip(&self, turn: u64, duration: Duration) -> Result<RawClip, PipelineError> {
        self.recorder.record(turn, duration).await
    }

    /// Renamed to `.png`: the first frame of an APNG is a valid PNG, so
    /// viewers (and vision models) that ignore animation still read it.
    async fn to_artifact(&self, clip: RawClip) -> Result<ArtifactRef, PipelineError> {
        if !tokio::fs::try_exists(&clip.path).await.unwrap_or(false) {
            return Err(PipelineError::MissingClip {
                turn: clip.turn,
                path: clip.path,
            });
        }
        let name = format!("{}.png", clip.turn);
        let path = clip.path.with_file_name(&name);
        tokio::fs::rename(&clip.path, &path).await?;
        Ok(ArtifactRef {
            turn: clip.turn,
            name,
            path,
        })
    }

    async fn publish(&self, artifact: &ArtifactRef, caption_html: &str) -> Result<(), PipelineError> {
        let failed = |message: String| PipelineError::Publish {
            artifact: artifact.name.clone(),
            message,
        };
        match &self.target {
            PublishTarget::Agent { bin } => {
                Self::agent_cmd(
                    bin,
                    &["artifact", "upload", &artifact.name],
                    None,
                    Some(&self.recorder.output_dir),
                )
                .await
                .map_err(failed)?;
                Self::agent_cmd(
                    bin,
                    &["annotate", "--style", "info", "--context", "session"],
                    Some(caption_html),
                    None,
                )
                .await
                .map_err(failed)?;
            }
            PublishTarget::LocalPage { page } => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(page)
                    .await?;
                file.write_all(caption_html.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
        }
        tracing::info!(artifact = %artifact.name, turn = artifact.turn, "Artifact published");
        Ok(())
    }

    fn caption(&self, artifact: &ArtifactRef, headline: &str) -> String {
        caption_html(artifact, headline, self.is_local())
    }
}

#[async_trait]
impl PresentationSurface for AgentPipeline {
    async fn present_choice(
        &self,
        turn: u64,
        response_key: &str,
        options: &[ActionSpec],
    ) -> Result<(), PipelineError> {
        match &self.target {
            PublishTarget::Agent { bin } => {
                let doc = input_step(turn, response_key, options);
                Self::agent_cmd(bin, &["pipeline", "upload"], Some(&doc.to_string()), None)
                    .await
                    .map_err(|message| PipelineError::Present { turn, message })
            }
            PublishTarget::LocalPage { .. } => {
                let menu: Vec<String> = options
                    .iter()
                    .map(|o| format!("{} {} = {}", o.glyph, o.label, o.key))
                    .collect();
                tracing::info!(
                    turn,
                    key = response_key,
                    "Waiting for operator: write one of [{}] under '{}'",
                    menu.join(", "),
                    response_key
                );
                Ok(())
            }
        }
    }

    async fn announce(&self, turn: u64, headline: &str) -> Result<(), PipelineError> {
        match &self.target {
            PublishTarget::Agent { bin } => {
                let doc = note_step(turn, headline);
                Self::agent_cmd(bin, &["pipeline", "upload"], Some(&doc.to_string()), None)
                    .await
                    .map_err(|message| PipelineError::Present { turn, message })
            }
            PublishTarget::LocalPage { .. } => {
                tracing::info!(turn, "{headline}");
                Ok(())
            }
        }
    }
}

/// Pipeline document with one blocking input step.
fn input_step(turn: u64, response_key: &str, options: &[ActionSpec]) -> serde_json::Value {
    let options: Vec<serde_json::Value> = options
        .iter()
        .map(|o| json!({ "label": format!("{} {}", o.glyph, o.label), "value": o.key }))
        .collect();
    json!({
        "steps": [{
            "input": format!("Move {turn}"),
            "key": format!("input_{turn}"),
            "fields": [{
                "select": "Move",
                "key": response_key,
                "required": true,
                "options": options,
            }]
        }]
    })
}

/// Pipeline document with one no-op step carrying a headline.
fn note_step(turn: u64, headline: &str) -> serde_json::Value {
    let quoted = shlex::try_quote(headline)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| "'(unprintable)'".to_string());
    json!({
        "steps": [{
            "label": headline,
            "key": format!("note_{turn}"),
            "command": format!("echo {quoted}"),
        }]
    })
}
