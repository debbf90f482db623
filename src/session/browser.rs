//! Opening the session monitor in the user's browser

use std::process::{Command, ExitStatus};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

pub const BROWSER_ATTEMPTS: usize = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Commands to try, in order, for the current platform
fn launchers(url: &str) -> Vec<Command> {
    let mut commands = Vec::new();
    if cfg!(target_os = "macos") {
        let mut chrome = Command::new("open");
        chrome.args(["-a", "Google Chrome", url]);
        commands.push(chrome);
        let mut default = Command::new("open");
        default.arg(url);
        commands.push(default);
    } else if cfg!(target_os = "windows") {
        let mut start = Command::new("cmd");
        start.args(["/C", "start", "", url]);
        commands.push(start);
    } else {
        let mut xdg = Command::new("xdg-open");
        xdg.arg(url);
        commands.push(xdg);
    }
    commands
}

fn launch(mut command: Command) -> std::io::Result<ExitStatus> {
    command.status()
}

/// Open `url`, retrying a few times before giving up
pub fn open_browser(url: &str, attempts: usize) -> bool {
    for attempt in 1..=attempts {
        for command in launchers(url) {
            let program = command.get_program().to_string_lossy().to_string();
            match launch(command) {
                Ok(status) if status.success() => {
                    info!("Opened browser with URL: {}", url);
                    return true;
                }
                Ok(status) => warn!("{} exited with {}", program, status),
                Err(e) => warn!("Could not run {}: {}", program, e),
            }
        }

        warn!("Browser opening attempt {}/{} failed", attempt, attempts);
        if attempt < attempts {
            thread::sleep(RETRY_DELAY);
        }
    }

    error!("Failed to open browser after {} attempts", attempts);
    false
}
