use crate::{PreviewError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const COMPANION_BIN: &str = "idb_companion";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const TERM_GRACE: Duration = Duration::from_secs(2);

/// A running `idb_companion` subprocess: either a headless boot holder or
/// the frame/input endpoint for a booted device.
#[derive(Debug)]
pub struct Companion {
    port: Option<u16>,
    done: watch::Receiver<Option<String>>,
    stop_tx: mpsc::Sender<()>,
}

/// Verifies the companion binary is on PATH. Called once at startup.
pub fn check_companion() -> Result<()> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let found = std::env::split_paths(&path).any(|dir| dir.join(COMPANION_BIN).is_file());
    if found {
        Ok(())
    } else {
        Err(PreviewError::ToolchainMissing(format!(
            "{} not found on PATH (install via: brew install facebook/fb/idb-companion)",
            COMPANION_BIN
        )))
    }
}

impl Companion {
    /// Boots `udid` headlessly and holds it booted for the process
    /// lifetime. Resolves once the companion reports `"state":"Booted"`;
    /// EOF first is a `BootFailed`.
    pub async fn boot_headless(udid: &str, device_set: &Path) -> Result<Companion> {
        let mut args = vec![
            "--boot".to_string(),
            udid.to_string(),
            "--headless".to_string(),
            "1".to_string(),
        ];
        push_device_set(&mut args, device_set);
        Self::spawn_scanning(COMPANION_BIN, args, udid, |line| {
            parse_boot_state(line).then_some(None)
        })
        .await
        .map_err(|e| match e {
            PreviewError::CompanionNotReady(msg) => PreviewError::BootFailed(format!(
                "companion did not report Booted state: {}",
                msg
            )),
            other => other,
        })
    }

    /// Starts the frame/input companion for a booted device. Resolves once
    /// the startup line reports a non-zero `grpc_port`.
    pub async fn start(udid: &str, device_set: &Path) -> Result<Companion> {
        let mut args = vec![
            "--udid".to_string(),
            udid.to_string(),
            "--grpc-port".to_string(),
            "0".to_string(),
        ];
        push_device_set(&mut args, device_set);
        Self::spawn_scanning(COMPANION_BIN, args, udid, |line| {
            parse_companion_port(line).map(Some)
        })
        .await
    }

    /// Spawns `program args`, scans stdout lines through `ready` until it
    /// yields, then hands the child to a monitor task. Log lines before
    /// readiness are reported on stderr and skipped.
    async fn spawn_scanning(
        program: &str,
        args: Vec<String>,
        udid: &str,
        ready: impl Fn(&str) -> Option<Option<u16>>,
    ) -> Result<Companion> {
        let mut child = Command::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PreviewError::ToolchainMissing(format!(
                    "{} not found (install via: brew install facebook/fb/idb-companion): {}",
                    program, e
                ))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PreviewError::CompanionNotReady("no stdout pipe".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut port = None;
        let mut first = true;
        loop {
            let next = if first {
                first = false;
                match timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
                    Ok(read) => read,
                    Err(_) => {
                        let _ = child.kill().await;
                        return Err(PreviewError::CompanionNotReady(format!(
                            "no output within {:?}",
                            HANDSHAKE_TIMEOUT
                        )));
                    }
                }
            } else {
                lines.next_line().await
            };
            match next {
                Ok(Some(line)) => match ready(&line) {
                    Some(p) => {
                        port = p;
                        break;
                    }
                    None => eprintln!("[Companion:{}] {}", udid, line.trim_end()),
                },
                Ok(None) | Err(_) => {
                    let _ = child.kill().await;
                    return Err(PreviewError::CompanionNotReady(
                        "companion exited without a usable startup line (did not output a port)"
                            .into(),
                    ));
                }
            }
        }

        let (done_tx, done_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(monitor(child, lines, udid.to_string(), done_tx, stop_rx));

        Ok(Companion {
            port,
            done: done_rx,
            stop_tx,
        })
    }

    /// The gRPC port from the startup handshake; None for boot holders.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Resolves to the exit description once the subprocess is gone.
    /// Callers must observe this to detect involuntary termination.
    pub fn done(&self) -> watch::Receiver<Option<String>> {
        self.done.clone()
    }

    /// Requests termination: SIGTERM, escalating to SIGKILL after 2 s.
    /// Idempotent; completion is observable via `done()`.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Waits for the subprocess to exit, returning its exit description.
    pub async fn wait(&mut self) -> String {
        loop {
            if let Some(desc) = self.done.borrow().clone() {
                return desc;
            }
            if self.done.changed().await.is_err() {
                return "companion monitor gone".into();
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    mut lines: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    udid: String,
    done_tx: watch::Sender<Option<String>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let description = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => eprintln!("[Companion:{}] {}", udid, line.trim_end()),
                // EOF: the process is exiting; collect its status.
                Ok(None) | Err(_) => {
                    break match child.wait().await {
                        Ok(status) => exit_description(status),
                        Err(e) => format!("wait failed: {}", e),
                    };
                }
            },
            _ = stop_rx.recv() => {
                if let Some(pid) = child.id() {
                    let _ = Command::new("kill")
                        .args(["-TERM", &pid.to_string()])
                        .output()
                        .await;
                }
                match timeout(TERM_GRACE, child.wait()).await {
                    Ok(Ok(status)) => break exit_description(status),
                    Ok(Err(e)) => break format!("wait failed: {}", e),
                    Err(_) => {
                        let _ = child.kill().await;
                        break match child.wait().await {
                            Ok(status) => exit_description(status),
                            Err(e) => format!("wait failed: {}", e),
                        };
                    }
                }
            }
        }
    };
    let _ = done_tx.send(Some(description));
}

fn push_device_set(args: &mut Vec<String>, device_set: &Path) {
    if !device_set.as_os_str().is_empty() {
        args.push("--device-set-path".to_string());
        args.push(device_set.display().to_string());
    }
}

fn exit_description(status: std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let name = match signal {
                9 => "killed",
                15 => "terminated",
                2 => "interrupt",
                _ => return format!("signal: {}", signal),
            };
            return format!("signal: {}", name);
        }
    }
    match status.code() {
        Some(code) => format!("exit status: {}", code),
        None => "exit status: unknown".to_string(),
    }
}

/// Extracts the gRPC port from a companion startup line. Returns None for
/// log lines, malformed JSON, and a zero port.
pub fn parse_companion_port(line: &str) -> Option<u16> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let port = value.get("grpc_port")?.as_u64()?;
    if port == 0 || port > u16::MAX as u64 {
        return None;
    }
    Some(port as u16)
}

fn parse_boot_state(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line.trim())
        .ok()
        .and_then(|v| v.get("state").and_then(|s| s.as_str()).map(String::from))
        .is_some_and(|state| state == "Booted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_companion_port_table() {
        for (line, want) in [
            (r#"{"grpc_swift_port":10882,"grpc_port":10882}"#, Some(10882)),
            (r#"{"grpc_port":9999}"#, Some(9999)),
            (r#"{"grpc_port":0}"#, None),
            (r#"{}"#, None),
            ("IDB Companion Built at Aug 12 2022", None),
            ("", None),
            ("Providing targets across Simulator and Device sets.", None),
        ] {
            assert_eq!(parse_companion_port(line), want, "line {:?}", line);
        }
    }

    #[test]
    fn parse_boot_state_table() {
        assert!(parse_boot_state(r#"{"state":"Booted","udid":"ABCD-1234"}"#));
        assert!(!parse_boot_state(r#"{"state":"Creating"}"#));
        assert!(!parse_boot_state("not json"));
    }

    async fn fake_companion(script: &str) -> Result<Companion> {
        Companion::spawn_scanning(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            "TEST",
            |line| parse_companion_port(line).map(Some),
        )
        .await
    }

    #[tokio::test]
    async fn handshake_reads_port_after_log_lines() {
        let companion = fake_companion(concat!(
            "echo 'IDB Companion Built at Aug 12 2022 08:41:50'; ",
            "echo 'Providing targets across Simulator and Device sets.'; ",
            "echo '{\"grpc_swift_port\":12345,\"grpc_port\":12345}'; sleep 5",
        ))
        .await
        .unwrap();
        assert_eq!(companion.port(), Some(12345));
        companion.stop();
    }

    #[tokio::test]
    async fn handshake_without_port_fails() {
        let err = fake_companion("echo 'some log line'; echo 'another log line'")
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::CompanionNotReady(_)));
    }

    #[tokio::test]
    async fn done_resolves_on_exit() {
        let mut companion =
            fake_companion("echo '{\"grpc_port\":10882}'; exit 0").await.unwrap();
        let desc = companion.wait().await;
        assert_eq!(desc, "exit status: 0");
    }

    #[tokio::test]
    async fn stop_terminates_long_running_process() {
        let mut companion =
            fake_companion("echo '{\"grpc_port\":10882}'; sleep 60").await.unwrap();
        companion.stop();
        let desc = timeout(Duration::from_secs(5), companion.wait())
            .await
            .expect("stop should end the process promptly");
        assert!(desc.starts_with("signal:"), "got {}", desc);
    }

    #[tokio::test]
    async fn boot_headless_shape_errors_without_booted_state() {
        // Exercised through the public entry point with a missing binary
        // name to verify the ToolchainMissing path.
        let err = Companion::boot_headless("UDID", Path::new("/nonexistent-set"))
            .await
            .unwrap_err();
        // Either the binary is absent (CI) or the real companion rejects
        // the bogus device set; both are the error family we expect.
        assert!(matches!(
            err,
            PreviewError::ToolchainMissing(_) | PreviewError::BootFailed(_)
        ));
    }
}
