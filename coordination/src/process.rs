//! Controlled-process lifecycle and input injection.
//!
//! The game runs under a virtual display server. The lifecycle starts both,
//! freezes and thaws the game with job-control signals, and tears both down
//! at session end. A target that has already exited is reported as
//! [`ProcessError::NotFound`], which callers treat as success for
//! `pause`/`terminate`.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::actions::ActionSpec;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process {0} not found")]
    NotFound(u32),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command template '{0}'")]
    InvalidCommand(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque reference to a started game process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {}", self.pid)
    }
}

/// Start, freeze, thaw and stop the controlled process.
///
/// Calls are synchronous: signalling is a single syscall-sized command, and
/// `terminate` must be callable from `Drop`.
pub trait ProcessLifecycle: Send + Sync {
    fn start(&self, level: &str) -> Result<ProcessHandle, ProcessError>;
    fn pause(&self, handle: &ProcessHandle) -> Result<(), ProcessError>;
    fn resume(&self, handle: &ProcessHandle) -> Result<(), ProcessError>;
    fn terminate(&self, handle: &ProcessHandle) -> Result<(), ProcessError>;
}

/// Launch settings for the display server and the game.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// X display the server listens on and the game draws to.
    pub display: String,
    /// Screen geometry, `WIDTHxHEIGHT`.
    pub geometry: String,
    /// Display server command template; empty to reuse an existing display.
    pub server_command: String,
    /// Game command template. `{level}`, `{display}` and `{geometry}` are
    /// substituted before splitting.
    pub game_command: String,
    /// Pause between starting the server and the game.
    pub server_settle: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            display: ":1".to_string(),
            geometry: "320x240".to_string(),
            server_command: "Xvfb {display} -screen 0 {geometry}x24".to_string(),
            game_command: "/usr/games/chocolate-doom -geometry {geometry} \
                           -iwad /usr/share/games/doom/DOOM1.WAD -warp 1 {level}"
                .to_string(),
            server_settle: Duration::from_secs(2),
        }
    }
}

impl LaunchConfig {
    /// Substitute placeholders and split into argv.
    pub fn argv(&self, template: &str, level: &str) -> Result<Vec<String>, ProcessError> {
        let line = template
            .replace("{level}", level)
            .replace("{display}", &self.display)
            .replace("{geometry}", &self.geometry);
        match shlex::split(&line) {
            Some(argv) if !argv.is_empty() => Ok(argv),
            _ => Err(ProcessError::InvalidCommand(template.to_string())),
        }
    }
}

/// `kill` with a fixed locale, so its diagnostics are stable.
fn kill_command(signal: &str, pid: u32) -> Command {
    let mut cmd = Command::new("kill");
    cmd.args(["-s", signal, &pid.to_string()])
        .env("LC_ALL", "C")
        .env("LANG", "C");
    cmd
}

fn is_alive(pid: u32) -> bool {
    kill_command("0", pid)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(true)
}

/// Run `kill -s <signal> <pid>`, mapping a vanished target to `NotFound`.
fn send_signal(pid: u32, signal: &str) -> Result<(), ProcessError> {
    let output = kill_command(signal, pid).output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such process") || !is_alive(pid) {
        Err(ProcessError::NotFound(pid))
    } else {
        Err(ProcessError::CommandFailed(format!(
            "kill -s {signal} {pid}: {}",
            stderr.trim()
        )))
    }
}

/// Display server plus game, controlled with SIGSTOP/SIGCONT.
pub struct DisplayProcess {
    config: LaunchConfig,
    /// Children per game pid: the game first, then the server.
    children: Mutex<HashMap<u32, Vec<Child>>>,
}

impl DisplayProcess {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(&self, argv: &[String]) -> Result<Child, ProcessError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProcessError::InvalidCommand(String::new()))?;
        Command::new(program)
            .args(args)
            .env("DISPLAY", &self.config.display)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: argv.join(" "),
                source,
            })
    }
}

impl ProcessLifecycle for DisplayProcess {
    fn start(&self, level: &str) -> Result<ProcessHandle, ProcessError> {
        let mut server = None;
        if !self.config.server_command.trim().is_empty() {
            let argv = self.config.argv(&self.config.server_command, level)?;
            let child = self.spawn(&argv)?;
            tracing::info!(pid = child.id(), display = %self.config.display, "Display server started");
            server = Some(child);
            std::thread::sleep(self.config.server_settle);
        }

        let argv = self.config.argv(&self.config.game_command, level)?;
        let game = match self.spawn(&argv) {
            Ok(game) => game,
            Err(e) => {
                if let Some(mut server) = server {
                    let _ = server.kill();
                    let _ = server.wait();
                }
                return Err(e);
            }
        };
        let handle = ProcessHandle::new(game.id());
        tracing::info!(pid = handle.pid(), level, "Game process started");

        let mut group = vec![game];
        group.extend(server);
        self.children
            .lock()
            .map_err(|_| ProcessError::CommandFailed("process table lock poisoned".into()))?
            .insert(handle.pid(), group);
        Ok(handle)
    }

    fn pause(&self, handle: &ProcessHandle) -> Result<(), ProcessError> {
        send_signal(handle.pid(), "STOP")
    }

    fn resume(&self, handle: &ProcessHandle) -> Result<(), ProcessError> {
        send_signal(handle.pid(), "CONT")
    }

    fn terminate(&self, handle: &ProcessHandle) -> Result<(), ProcessError> {
        let group = self
            .children
            .lock()
            .map_err(|_| ProcessError::CommandFailed("process table lock poisoned".into()))?
            .remove(&handle.pid());
        let Some(group) = group else {
            return Err(ProcessError::NotFound(handle.pid()));
        };
        // SIGKILL also ends a stopped process; SIGTERM would stay pending.
        for mut child in group {
            let pid = child.id();
            if let Err(e) = child.kill() {
                tracing::debug!(pid, error = %e, "Child already exited");
            }
            child.wait()?;
        }
        tracing::info!(pid = handle.pid(), "Game process terminated");
        Ok(())
    }
}

/// Swallow `NotFound` from a lifecycle call, logging it.
pub fn tolerate_missing(
    result: Result<(), ProcessError>,
    operation: &str,
) -> Result<(), ProcessError> {
    match result {
        Err(ProcessError::NotFound(pid)) => {
            tracing::warn!(pid, operation, "Process already gone, ignoring");
            Ok(())
        }
        other => other,
    }
}

/// Delivers one action's raw token to the display.
#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn deliver(&self, spec: &ActionSpec) -> Result<(), ProcessError>;
}

/// `xdotool key --delay <ms> <token>` against the configured display.
#[derive(Debug, Clone)]
pub struct XdotoolInjector {
    bin: String,
    display: String,
}

impl XdotoolInjector {
    pub fn new(display: impl Into<String>) -> Self {
        Self {
            bin: "xdotool".to_string(),
            display: display.into(),
        }
    }

    pub fn with_binary(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }
}

#[async_trait]
impl InputInjector for XdotoolInjector {
    async fn deliver(&self, spec: &ActionSpec) -> Result<(), ProcessError> {
        let output = tokio::process::Command::new(&self.bin)
            .args([
                "key",
                "--delay",
                &spec.key_delay_ms.to_string(),
                spec.token.as_str(),
            ])
            .env("DISPLAY", &self.display)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProcessError::CommandFailed(format!(
                "{} key {}: {}",
                self.bin,
                spec.token,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(token = %spec.token, "Input delivered");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper_config() -> LaunchConfig {
        LaunchConfig {
            display: ":99".to_string(),
            geometry: "320x240".to_string(),
            server_command: String::new(),
            game_command: "sleep 30".to_string(),
            server_settle: Duration::from_millis(0),
        }
    }

    #[test]
    fn test_argv_substitutes_placeholders() {
        let config = LaunchConfig::default();
        let argv = config.argv(&config.game_command, "3").unwrap();
        assert_eq!(argv[0], "/usr/games/chocolate-doom");
        assert!(argv.contains(&"320x240".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("3"));

        let server = config.argv(&config.server_command, "3").unwrap();
        assert_eq!(server, vec!["Xvfb", ":1", "-screen", "0", "320x240x24"]);
    }

    #[test]
    fn test_argv_rejects_empty_or_unbalanced() {
        let config = LaunchConfig::default();
        assert!(config.argv("", "1").is_err());
        assert!(config.argv("game \"unterminated", "1").is_err());
    }

    #[test]
    fn test_lifecycle_against_real_process() {
        let process = DisplayProcess::new(sleeper_config());
        let handle = process.start("1").unwrap();

        process.pause(&handle).unwrap();
        process.resume(&handle).unwrap();
        process.pause(&handle).unwrap();
        // Terminating a stopped process must still reap it.
        process.terminate(&handle).unwrap();

        assert!(matches!(
            process.terminate(&handle),
            Err(ProcessError::NotFound(_))
        ));
        assert!(matches!(
            process.pause(&handle),
            Err(ProcessError::NotFound(_))
        ));
    }

    #[test]
    fn test_kill_runs_in_c_locale() {
        let cmd = kill_command("STOP", 42);
        let envs: Vec<_> = cmd
            .get_envs()
            .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
            .collect();
        assert!(envs.contains(&("LC_ALL".into(), Some("C".into()))));
        assert!(envs.contains(&("LANG".into(), Some("C".into()))));
    }

    #[test]
    fn test_signal_to_reaped_child_is_not_found() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!is_alive(pid));
        assert!(matches!(
            send_signal(pid, "STOP"),
            Err(ProcessError::NotFound(p)) if p == pid
        ));
    }

    #[test]
    fn test_tolerate_missing_swallows_not_found_only() {
        assert!(tolerate_missing(Err(ProcessError::NotFound(7)), "pause").is_ok());
        assert!(tolerate_missing(
            Err(ProcessError::CommandFailed("boom".into())),
            "pause"
        )
        .is_err());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let mut config = sleeper_config();
        config.game_command = "/nonexistent/game-binary".to_string();
        let process = DisplayProcess::new(config);
        assert!(matches!(
            process.start("1"),
            Err(ProcessError::Spawn { .. })
        ));
    }
}
