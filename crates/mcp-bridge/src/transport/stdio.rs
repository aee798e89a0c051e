//! Child-process stdio transport.
//!
//! Spawns `command args` with a merged environment and speaks line-delimited
//! JSON over the child's stdio. The child's stderr is forwarded to the host
//! logger so protocol bytes and diagnostics never mix. Closing the duplex
//! closes the child's stdin, waits out a grace period, then kills it.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CHANNEL_CAPACITY, Duplex};
use crate::config::ServerConfig;
use crate::error::TransportResult;
use crate::protocol::Message;

/// How long a child gets between stdin close and SIGKILL.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Host variables a child always inherits, even without `--pass-environment`.
const BASE_INHERITED_VARS: &[&str] = &["HOME", "PATH", "USER", "LOGNAME", "TMPDIR"];

/// Spawn the configured command and wire its stdio into a [`Duplex`].
///
/// `extra_env` comes from the CLI (`--env KEY VAL`); descriptor env wins over
/// it, and both win over inherited values. With `pass_environment` the whole
/// host environment is inherited; otherwise only a small base set is.
pub fn spawn(
    config: &ServerConfig,
    extra_env: &HashMap<String, String>,
    pass_environment: bool,
) -> TransportResult<Duplex> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !pass_environment {
        cmd.env_clear();
        for key in BASE_INHERITED_VARS {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
    }
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    let server = config.name.clone();
    tracing::debug!(server = %server, command = %config.command, "spawned stdio server");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

    if let Some(stderr) = stderr {
        let server = server.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(server = %server, "stderr: {line}");
            }
        });
    }

    if let Some(stdout) = stdout {
        let server = server.clone();
        tokio::spawn(read_lines(stdout, in_tx, server));
    }

    if let Some(stdin) = stdin {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(write_lines(stdin, out_rx, cancel, server));
    }

    tokio::spawn(supervise_exit(child, cancel.clone(), server));

    Ok(Duplex::from_parts(out_tx, in_rx, cancel))
}

/// Pump parsed messages from the child's stdout. Malformed lines are logged
/// and dropped; EOF ends the inbound stream.
async fn read_lines(
    stdout: tokio::process::ChildStdout,
    in_tx: mpsc::Sender<Message>,
    server: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match Message::parse(trimmed) {
                    Ok(message) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "dropping unparseable frame");
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server, "stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        }
    }
}

/// Serialize outbound messages onto the child's stdin, one JSON line each.
/// Ends on cancellation (dropping stdin, which is the shutdown signal) or
/// when the sender side hangs up.
async fn write_lines(
    mut stdin: tokio::process::ChildStdin,
    mut out_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    server: String,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            msg = out_rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        let line = match message.to_json() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to serialize frame");
                continue;
            }
        };
        if let Err(e) = write_frame(&mut stdin, &line).await {
            tracing::warn!(server = %server, error = %e, "stdin write failed");
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn write_frame(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Wait for cancellation, then give the child a grace period after stdin
/// closes before killing it.
async fn supervise_exit(mut child: Child, cancel: CancellationToken, server: String) {
    let early_exit = tokio::select! {
        () = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };
    match early_exit {
        Some(Ok(status)) => {
            tracing::info!(server = %server, %status, "child exited");
            cancel.cancel();
        }
        Some(Err(e)) => {
            tracing::warn!(server = %server, error = %e, "child wait failed");
            cancel.cancel();
        }
        // Cancelled: stdin is closing; grant the grace period, then kill.
        None => match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %server, %status, "child exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %server, error = %e, "waiting for child failed");
            }
            Err(_) => {
                tracing::warn!(server = %server, "child ignored stdin close, killing");
                let _ = child.kill().await;
            }
        },
    }
}

/// Duplex over this process's own stdin/stdout, for client-proxy mode where
/// the bridge itself plays a stdio MCP server.
#[must_use]
pub fn current_process() -> Duplex {
    let cancel = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Message::parse(trimmed) {
                Ok(message) => {
                    if in_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparseable frame from stdin");
                }
            }
        }
    });

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            let message = tokio::select! {
                () = writer_cancel.cancelled() => break,
                msg = out_rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            let Ok(line) = message.to_json() else { continue };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    Duplex::from_parts(out_tx, in_rx, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    fn cat_config() -> ServerConfig {
        ServerConfig {
            name: "cat".into(),
            command: "cat".into(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn echoes_frames_through_cat() {
        let mut duplex = spawn(&cat_config(), &HashMap::new(), false).unwrap();
        let sent: Message = Request::new(1, "ping", None).into();
        duplex.send(sent.clone()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), duplex.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(got, sent);
        duplex.close();
    }

    #[tokio::test]
    async fn exit_closes_inbound() {
        let config = ServerConfig {
            name: "true".into(),
            command: "true".into(),
            ..ServerConfig::default()
        };
        let mut duplex = spawn(&config, &HashMap::new(), false).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), duplex.recv())
            .await
            .expect("timed out");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let config = ServerConfig {
            name: "missing".into(),
            command: "definitely-not-a-real-binary-xyz".into(),
            ..ServerConfig::default()
        };
        assert!(spawn(&config, &HashMap::new(), false).is_err());
    }
}
