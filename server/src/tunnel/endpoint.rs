//! Launching the tunnel binary and scraping its public endpoint.
//!
//! The tunnel binary announces the hostname it was assigned somewhere in its
//! stderr log. [`acquire`] spawns one process, scans stderr line by line until
//! a hostname matching [`EndpointMatcher`] shows up, and hands back the live
//! child together with that URL.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

use super::TunnelError;
use crate::process::terminate;

/// Stderr lines kept for the error message when startup fails.
const TAIL_LINES: usize = 5;

/// Finds `https://<label>.<suffix>` in a log line.
#[derive(Debug, Clone)]
pub struct EndpointMatcher {
    re: Regex,
}

impl EndpointMatcher {
    /// Matcher for hostnames directly under `suffix` (e.g. `trycloudflare.com`).
    pub fn new(suffix: &str) -> Result<Self, TunnelError> {
        let pattern = format!(r"https://[a-z0-9-]+\.{}\b", regex::escape(suffix));
        let re = Regex::new(&pattern)
            .map_err(|e| TunnelError::Config(format!("bad endpoint suffix {suffix:?}: {e}")))?;
        Ok(Self { re })
    }

    #[must_use]
    pub fn find<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.re.find(line).map(|m| m.as_str())
    }
}

/// Everything needed to start one tunnel process.
#[derive(Debug, Clone)]
pub struct TunnelLaunch {
    pub binary: PathBuf,
    pub local_port: u16,
    pub matcher: EndpointMatcher,
    pub startup_timeout: Duration,
    pub terminate_grace: Duration,
}

impl TunnelLaunch {
    /// `tunnel --url http://127.0.0.1:<port> --no-autoupdate`
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        vec![
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://127.0.0.1:{}", self.local_port),
            "--no-autoupdate".to_string(),
        ]
    }
}

/// A running tunnel process with a known public endpoint.
#[derive(Debug)]
pub struct TunnelProcess {
    pub child: Child,
    pub url: String,
}

impl TunnelProcess {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawn the tunnel binary and wait for it to print its public endpoint.
///
/// On success stderr keeps being drained in the background (at debug level)
/// so the process never blocks on a full pipe. On failure the child has been
/// stopped before this returns.
pub async fn acquire(launch: &TunnelLaunch) -> Result<TunnelProcess, TunnelError> {
    let mut child = Command::new(&launch.binary)
        .args(launch.args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TunnelError::Spawn)?;

    let Some(stderr) = child.stderr.take() else {
        terminate(&mut child, launch.terminate_grace).await;
        return Err(TunnelError::StartupFailed("stderr pipe unavailable".into()));
    };
    let mut lines = LogLines::new(stderr);
    let mut tail = VecDeque::with_capacity(TAIL_LINES);

    let scan = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(url) = launch.matcher.find(&line) {
                        return Some(url.to_string());
                    }
                    debug!("Tunnel: {line}");
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => return None,
                Err(e) => {
                    debug!("Tunnel: stderr read failed: {e}");
                    return None;
                }
            }
        }
    };

    match tokio::time::timeout(launch.startup_timeout, scan).await {
        Ok(Some(url)) => {
            info!("Tunnel: endpoint {url} (pid {:?})", child.id());
            tokio::spawn(drain(lines));
            Ok(TunnelProcess { child, url })
        }
        Ok(None) => {
            let status = terminate(&mut child, launch.terminate_grace).await;
            let mut detail = match status {
                Some(status) => format!("tunnel process exited ({status})"),
                None => "tunnel process closed stderr".to_string(),
            };
            if !tail.is_empty() {
                detail.push_str(": ");
                detail.push_str(&Vec::from(tail).join(" | "));
            }
            Err(TunnelError::StartupFailed(detail))
        }
        Err(_) => {
            terminate(&mut child, launch.terminate_grace).await;
            Err(TunnelError::StartupTimeout(launch.startup_timeout))
        }
    }
}

async fn drain(mut lines: LogLines<ChildStderr>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("Tunnel: {line}"),
            Ok(None) => break,
            Err(e) => {
                debug!("Tunnel: stderr read failed: {e}");
                break;
            }
        }
    }
}

/// Line reader that tolerates non-UTF-8 output; invalid bytes are replaced
/// rather than ending the stream.
struct LogLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LogLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// `Ok(None)` only at EOF.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(&['\n', '\r'][..]).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> EndpointMatcher {
        EndpointMatcher::new("trycloudflare.com").unwrap()
    }

    #[test]
    fn test_finds_endpoint_in_banner() {
        let line = "2026-01-01T00:00:00Z INF |  https://quiet-river-42.trycloudflare.com                    |";
        assert_eq!(
            matcher().find(line),
            Some("https://quiet-river-42.trycloudflare.com")
        );
    }

    #[test]
    fn test_ignores_other_urls() {
        let m = matcher();
        assert_eq!(m.find("INF Requesting new quick Tunnel on trycloudflare.com..."), None);
        assert_eq!(m.find("see http://abc.trycloudflare.com"), None);
        assert_eq!(m.find("see https://abc.example.com"), None);
        assert_eq!(m.find("https://abc.trycloudflare.community"), None);
        assert_eq!(m.find("https://a.b.trycloudflare.com"), None);
    }

    #[test]
    fn test_suffix_is_literal() {
        let m = EndpointMatcher::new("tunnel.example.org").unwrap();
        assert_eq!(m.find("https://x.tunnelXexampleXorg"), None);
        assert_eq!(m.find("url=https://x-1.tunnel.example.org"), Some("https://x-1.tunnel.example.org"));
    }

    #[test]
    fn test_launch_args() {
        let launch = TunnelLaunch {
            binary: "cloudflared".into(),
            local_port: 8787,
            matcher: matcher(),
            startup_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(5),
        };
        assert_eq!(
            launch.args(),
            ["tunnel", "--url", "http://127.0.0.1:8787", "--no-autoupdate"]
        );
    }

    #[tokio::test]
    async fn test_log_lines_survive_invalid_utf8() {
        let input: &[u8] = b"INF caf\xe9 edge\r\nhttps://abc.trycloudflare.com\nlast";
        let mut lines = LogLines::new(input);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "INF caf\u{fffd} edge");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "https://abc.trycloudflare.com"
        );
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "last");
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[cfg(unix)]
    mod spawn {
        use super::*;
        use crate::routes::test_support::script;

        fn launch(binary: PathBuf, startup_timeout: Duration) -> TunnelLaunch {
            TunnelLaunch {
                binary,
                local_port: 9000,
                matcher: matcher(),
                startup_timeout,
                terminate_grace: Duration::from_millis(500),
            }
        }

        #[tokio::test]
        async fn test_acquire_reads_endpoint_from_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let args = dir.path().join("args");
            let bin = script(
                dir.path(),
                "cloudflared",
                &format!(
                    "echo \"$@\" > '{}'\n\
                     echo 'INF Starting tunnel' >&2\n\
                     echo 'INF |  https://abc-123.trycloudflare.com  |' >&2\n\
                     exec sleep 30",
                    args.display()
                ),
            );

            let mut process = acquire(&launch(bin, Duration::from_secs(5))).await.unwrap();
            assert_eq!(process.url, "https://abc-123.trycloudflare.com");
            assert!(process.child.try_wait().unwrap().is_none());
            assert_eq!(
                std::fs::read_to_string(&args).unwrap().trim(),
                "tunnel --url http://127.0.0.1:9000 --no-autoupdate"
            );
            terminate(&mut process.child, Duration::from_millis(500)).await;
        }

        #[tokio::test]
        async fn test_acquire_skips_invalid_utf8_before_endpoint() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                "cloudflared",
                "printf 'INF caf\\351 edge\\n' >&2\n\
                 echo 'INF |  https://abc-123.trycloudflare.com  |' >&2\n\
                 exec sleep 30",
            );

            let mut process = acquire(&launch(bin, Duration::from_secs(5))).await.unwrap();
            assert_eq!(process.url, "https://abc-123.trycloudflare.com");
            terminate(&mut process.child, Duration::from_millis(500)).await;
        }

        #[tokio::test]
        async fn test_invalid_utf8_after_endpoint_keeps_tunnel_alive() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                "cloudflared",
                "echo 'INF |  https://abc-123.trycloudflare.com  |' >&2\n\
                 printf 'INF caf\\351\\n' >&2\n\
                 while true; do echo 'INF still here' >&2; sleep 0.1; done",
            );

            let mut process = acquire(&launch(bin, Duration::from_secs(5))).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(process.child.try_wait().unwrap().is_none());
            terminate(&mut process.child, Duration::from_millis(500)).await;
        }

        #[tokio::test]
        async fn test_acquire_times_out_without_endpoint() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "cloudflared", "echo 'INF waiting' >&2\nexec sleep 30");
            let err = acquire(&launch(bin, Duration::from_millis(300)))
                .await
                .unwrap_err();
            assert!(matches!(err, TunnelError::StartupTimeout(_)), "{err}");
        }

        #[tokio::test]
        async fn test_acquire_reports_early_exit() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                "cloudflared",
                "echo 'ERR failed to dial edge' >&2\nexit 1",
            );
            let err = acquire(&launch(bin, Duration::from_secs(5)))
                .await
                .unwrap_err();
            match err {
                TunnelError::StartupFailed(detail) => {
                    assert!(detail.contains("failed to dial edge"), "{detail}");
                }
                other => panic!("expected StartupFailed, got {other}"),
            }
        }

        #[tokio::test]
        async fn test_acquire_missing_binary() {
            let dir = tempfile::tempdir().unwrap();
            let err = acquire(&launch(dir.path().join("nope"), Duration::from_secs(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, TunnelError::Spawn(_)));
        }
    }
}
