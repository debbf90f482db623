//! Local server processes
//!
//! Starts the oTree dev server and the llama.cpp server as child processes.
//! A [`ManagedServer`] kills its child when dropped, so servers stop on every
//! exit path of the run.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::HostError;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long to wait for the oTree dev server to answer
pub const OTREE_START_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to wait for llama.cpp to load its model
pub const LLAMACPP_START_TIMEOUT: Duration = Duration::from_secs(120);

/// A child process stopped on drop
pub struct ManagedServer {
    name: String,
    child: Child,
}

impl ManagedServer {
    fn spawn(name: &str, command: &mut Command) -> Result<Self, HostError> {
        let child = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HostError::ServerStart {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        info!("Started {} (pid {})", name, child.id());
        Ok(Self {
            name: name.to_string(),
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the process is still alive
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the process now
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.child.kill() {
            warn!("Failed to stop {}: {}", self.name, e);
            return;
        }
        let _ = self.child.wait();
        info!("Stopped {}", self.name);
    }
}

impl Drop for ManagedServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Port of a URL, falling back to the scheme default
pub fn url_port(url: &str) -> Option<u16> {
    reqwest::Url::parse(url).ok()?.port_or_known_default()
}

/// Whether anything answers at `url`
pub fn is_reachable(url: &str) -> bool {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build();
    match client {
        Ok(client) => client.get(url).send().is_ok(),
        Err(_) => false,
    }
}

/// Whether a llama.cpp server reports healthy
pub fn health_ok(server_url: &str) -> bool {
    let url = format!("{}/health", server_url.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build();
    match client.and_then(|c| c.get(&url).send()) {
        Ok(response) => response.status().as_u16() == 200,
        Err(e) => {
            debug!("llama.cpp health check failed: {}", e);
            false
        }
    }
}

/// Poll `check` until it succeeds, the server dies, or `timeout` passes
pub fn wait_until<F>(server: &mut ManagedServer, timeout: Duration, check: F) -> Result<(), HostError>
where
    F: Fn() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return Ok(());
        }
        if !server.is_running() {
            return Err(HostError::ServerStart {
                name: server.name().to_string(),
                reason: "process exited during startup".to_string(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }

    Err(HostError::ServerStart {
        name: server.name().to_string(),
        reason: format!("not ready after {}s", timeout.as_secs()),
    })
}

/// Start `otree devserver` in the project directory and wait for it
pub fn start_otree(project: &Path, otree_url: &str) -> Result<ManagedServer, HostError> {
    let port = url_port(otree_url).unwrap_or(8000);
    let mut server = ManagedServer::spawn(
        "oTree server",
        Command::new("otree")
            .arg("devserver")
            .arg(port.to_string())
            .current_dir(project),
    )?;

    wait_until(&mut server, OTREE_START_TIMEOUT, || is_reachable(otree_url))?;
    info!("oTree server ready at {}", otree_url);
    Ok(server)
}

/// llama.cpp launch options
#[derive(Debug, Clone)]
pub struct LlamaCppOptions<'a> {
    pub server_path: &'a Path,
    pub model_path: &'a Path,
    pub server_url: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlamaCppOptions<'_> {
    fn command(&self) -> Command {
        let port = url_port(self.server_url).unwrap_or(8080);
        let mut command = Command::new(self.server_path);
        command
            .arg("-m")
            .arg(self.model_path)
            .arg("--port")
            .arg(port.to_string())
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .arg("--temp")
            .arg(self.temperature.to_string());
        command
    }
}

/// Start a llama.cpp server unless one is already healthy
///
/// Returns `None` when an existing server is reused.
pub fn ensure_llamacpp(options: &LlamaCppOptions<'_>) -> Result<Option<ManagedServer>, HostError> {
    if health_ok(options.server_url) {
        info!("llama.cpp server already running at {}", options.server_url);
        return Ok(None);
    }

    let mut server = ManagedServer::spawn("llama.cpp server", &mut options.command())?;
    wait_until(&mut server, LLAMACPP_START_TIMEOUT, || health_ok(options.server_url))?;
    Ok(Some(server))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_port() {
        assert_eq!(url_port("http://localhost:8000"), Some(8000));
        assert_eq!(url_port("http://example.org"), Some(80));
        assert_eq!(url_port("not a url"), None);
    }

    #[test]
    fn test_llamacpp_command() {
        let options = LlamaCppOptions {
            server_path: Path::new("/opt/llama-server"),
            model_path: Path::new("/models/tiny.gguf"),
            server_url: "http://localhost:8081",
            max_tokens: 256,
            temperature: 0.8,
        };
        let command = options.command();
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.get_program(), "/opt/llama-server");
        assert_eq!(args, vec!["-m", "/models/tiny.gguf", "--port", "8081", "-n", "256", "--temp", "0.8"]);
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let err = ManagedServer::spawn("ghost", &mut Command::new("/nonexistent/ghost-server"))
            .err()
            .unwrap();
        assert!(matches!(err, HostError::ServerStart { .. }));
    }
}
