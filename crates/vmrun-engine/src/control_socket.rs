//! Local control socket server (§4.9): accepts `stop` / `request-stop` /
//! `suspend` commands over a Unix domain socket inside the VM Directory and
//! maps each onto the same [`LifecycleEvent`] the signal handlers post.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc::Sender;
use vmrun_core::LifecycleEvent;

fn parse_command(line: &str) -> Option<LifecycleEvent> {
    match line.trim() {
        "stop" => Some(LifecycleEvent::Stop),
        "request-stop" => Some(LifecycleEvent::RequestGuestStop),
        "suspend" => Some(LifecycleEvent::Suspend),
        _ => None,
    }
}

/// Binds the control socket at `path` and serves connections until the
/// listener itself fails or the task is aborted by the caller. One
/// connection is handled at a time; further connections queue in the
/// kernel's accept backlog (§4.9's "serialized" requirement) rather than
/// being handled concurrently.
///
/// Socket failures are reported to the caller once (at bind time); failures
/// on an individual connection are logged and do not tear down the server
/// or the VM, per §4.9.
pub async fn serve(path: &std::path::Path, events: Sender<LifecycleEvent>) -> std::io::Result<()> {
    // A stale socket file from a previous crashed instance would otherwise
    // make bind() fail with AddrInUse.
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path)?;
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "control socket accept failed");
                continue;
            }
        };

        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(event) => {
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        tracing::warn!(command = %line, "unrecognized control socket command");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "control socket connection error");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[test]
    fn parses_all_three_recognized_commands() {
        assert_eq!(parse_command("stop"), Some(LifecycleEvent::Stop));
        assert_eq!(
            parse_command("request-stop"),
            Some(LifecycleEvent::RequestGuestStop)
        );
        assert_eq!(parse_command("suspend"), Some(LifecycleEvent::Suspend));
        assert_eq!(parse_command("bogus"), None);
    }

    #[tokio::test]
    async fn stop_command_is_forwarded_as_an_event() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("sock");
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        let serve_path = sock_path.clone();
        let server = tokio::spawn(async move { serve(&serve_path, tx).await });

        // Give the listener a moment to bind.
        for _ in 0..50 {
            if sock_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&sock_path).await.unwrap();
        stream.write_all(b"stop\n").await.unwrap();
        drop(stream);

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, LifecycleEvent::Stop);

        server.abort();
    }
}
