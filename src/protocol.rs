//! Login handshake with the content fetcher, driven from its output stream.
//!
//! Output is scanned line by line, and the unterminated tail is scanned too
//! because prompts are written without a newline. Each recognised marker is an
//! event fed to [`transition`]; every state waits at most `timeout`.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::FetchError;

/// Asks the operator for a one-time login code. `None` means cancelled.
///
/// Called on a blocking thread. Cancelling the fetch abandons the wait for an
/// answer, but the call itself runs until it returns: a prompt reading stdin
/// keeps its thread until a line arrives, so the process should exit rather
/// than wait for the runtime to shut down.
pub trait CodePrompt: Send + Sync {
    fn request_code(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Success,
    TwoFactor,
    Password,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Marker(Marker),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingResponse,
    AwaitingCode,
}

impl State {
    fn describe(self) -> &'static str {
        match self {
            State::AwaitingResponse => "awaiting login response",
            State::AwaitingCode => "awaiting code confirmation",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Succeed,
    Fail(FetchErrorKind),
    SendPassword,
    RequestCode,
}

/// Failure kinds reachable through the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    ConnectionError,
    InvalidCode,
}

impl From<FetchErrorKind> for FetchError {
    fn from(kind: FetchErrorKind) -> Self {
        match kind {
            FetchErrorKind::ConnectionError => FetchError::ConnectionError,
            FetchErrorKind::InvalidCode => FetchError::InvalidCode,
        }
    }
}

/// The handshake transition table. Returns the next state and what to do.
pub fn transition(state: State, event: Event) -> (State, Action) {
    use Action::*;
    use State::*;
    match (state, event) {
        (_, Event::Marker(Marker::Success)) => (state, Succeed),
        (_, Event::Eof) => (state, Fail(FetchErrorKind::ConnectionError)),
        (_, Event::Marker(Marker::Password)) => (AwaitingResponse, SendPassword),
        (AwaitingResponse, Event::Marker(Marker::TwoFactor)) => (AwaitingCode, RequestCode),
        (AwaitingCode, Event::Marker(Marker::TwoFactor)) => {
            (AwaitingCode, Fail(FetchErrorKind::InvalidCode))
        }
    }
}

struct Patterns {
    success: Regex,
    two_factor: Regex,
    password: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        success: Regex::new(r"result: OK").unwrap(),
        two_factor: Regex::new(r"(?i)please enter .*code.*:\s*$").unwrap(),
        password: Regex::new(r"(?i)enter account password for .*:\s*$").unwrap(),
    })
}

fn match_marker(text: &str) -> Option<Marker> {
    let p = patterns();
    if p.success.is_match(text) {
        Some(Marker::Success)
    } else if p.two_factor.is_match(text) {
        Some(Marker::TwoFactor)
    } else if p.password.is_match(text) {
        Some(Marker::Password)
    } else {
        None
    }
}

/// Splits raw output into lines, mirrors each one to the log and reports markers.
#[derive(Default)]
pub struct MarkerScanner {
    pending: Vec<u8>,
}

impl MarkerScanner {
    /// Consume a chunk of output and return the markers it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Marker> {
        let mut found = Vec::new();
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            tracing::info!(target: "fetcher", "{}", line);
            found.extend(match_marker(line));
        }

        // Prompts never end with a newline; check the tail and consume it on a hit.
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            if let Some(marker) = match_marker(&tail) {
                tracing::info!(target: "fetcher", "{}", tail.trim_end());
                self.pending.clear();
                found.push(marker);
            }
        }

        found
    }

    /// Flush whatever partial line is left at end of stream.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            tracing::info!(target: "fetcher", "{}", tail.trim_end());
            self.pending.clear();
        }
    }
}

/// Drives one fetcher session over its stdout/stdin.
pub struct Handshake<R, W> {
    reader: R,
    writer: W,
    scanner: MarkerScanner,
    events: VecDeque<Event>,
    timeout: Duration,
    password: String,
    prompt: Arc<dyn CodePrompt>,
}

impl<R, W> Handshake<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, timeout: Duration, password: String, prompt: Arc<dyn CodePrompt>) -> Self {
        Self {
            reader,
            writer,
            scanner: MarkerScanner::default(),
            events: VecDeque::new(),
            timeout,
            password,
            prompt,
        }
    }

    /// Run the handshake until the success marker or a failure.
    pub async fn login(&mut self) -> Result<(), FetchError> {
        let mut state = State::AwaitingResponse;
        let mut deadline = Instant::now() + self.timeout;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.next_event()).await {
                Ok(event) => event?,
                Err(_) => {
                    return Err(FetchError::Timeout {
                        state: state.describe(),
                        secs: self.timeout.as_secs(),
                    })
                }
            };

            let (next, action) = transition(state, event);
            tracing::debug!(?state, ?event, ?next, ?action, "Fetcher transition");
            state = next;

            match action {
                Action::Succeed => return Ok(()),
                Action::Fail(kind) => return Err(kind.into()),
                Action::SendPassword => {
                    tracing::info!("Fetcher asked for the password again, resending");
                    let password = self.password.clone();
                    self.send_line(&password).await?;
                }
                Action::RequestCode => {
                    tracing::info!("Two-factor code required");
                    let prompt = Arc::clone(&self.prompt);
                    // Dropping this future detaches the blocking call.
                    let code = tokio::task::spawn_blocking(move || prompt.request_code())
                        .await
                        .map_err(|e| FetchError::Io(std::io::Error::other(e)))?;
                    match code.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()) {
                        Some(code) => self.send_line(&code).await?,
                        None => {
                            tracing::warn!("Two-factor prompt cancelled");
                            return Err(FetchError::InvalidCode);
                        }
                    }
                }
            }

            deadline = Instant::now() + self.timeout;
        }
    }

    /// Keep mirroring output until the stream closes. Not time-bounded.
    pub async fn drain(&mut self) -> Result<(), FetchError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                self.scanner.finish();
                return Ok(());
            }
            // Markers after login are informational only.
            self.scanner.feed(&buf[..n]);
        }
    }

    async fn next_event(&mut self) -> Result<Event, FetchError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                self.scanner.finish();
                return Ok(Event::Eof);
            }
            self.events
                .extend(self.scanner.feed(&buf[..n]).into_iter().map(Event::Marker));
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), FetchError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    struct ScriptedPrompt {
        code: Option<&'static str>,
        asked: Mutex<u32>,
    }

    impl CodePrompt for ScriptedPrompt {
        fn request_code(&self) -> Option<String> {
            *self.asked.lock().unwrap() += 1;
            self.code.map(str::to_string)
        }
    }

    fn prompt(code: Option<&'static str>) -> Arc<ScriptedPrompt> {
        Arc::new(ScriptedPrompt {
            code,
            asked: Mutex::new(0),
        })
    }

    /// A handshake wired to in-memory pipes. Returns the fetcher side's
    /// (stdout writer, stdin reader).
    fn session(
        prompt: Arc<ScriptedPrompt>,
        timeout: Duration,
    ) -> (Handshake<DuplexStream, DuplexStream>, DuplexStream, BufReader<DuplexStream>) {
        let (stdout_ours, stdout_theirs) = duplex(4096);
        let (stdin_ours, stdin_theirs) = duplex(4096);
        let hs = Handshake::new(stdout_ours, stdin_ours, timeout, "hunter2".to_string(), prompt);
        (hs, stdout_theirs, BufReader::new(stdin_theirs))
    }

    #[test]
    fn test_transition_table() {
        use State::*;
        assert_eq!(
            transition(AwaitingResponse, Event::Marker(Marker::Success)).1,
            Action::Succeed
        );
        assert_eq!(
            transition(AwaitingResponse, Event::Eof).1,
            Action::Fail(FetchErrorKind::ConnectionError)
        );
        assert_eq!(
            transition(AwaitingResponse, Event::Marker(Marker::TwoFactor)),
            (AwaitingCode, Action::RequestCode)
        );
        assert_eq!(
            transition(AwaitingCode, Event::Marker(Marker::TwoFactor)).1,
            Action::Fail(FetchErrorKind::InvalidCode)
        );
        assert_eq!(
            transition(AwaitingCode, Event::Marker(Marker::Password)),
            (AwaitingResponse, Action::SendPassword)
        );
    }

    #[test]
    fn test_scanner_splits_lines_and_prompts() {
        let mut scanner = MarkerScanner::default();
        assert!(scanner.feed(b"Connecting to Steam3...").is_empty());
        assert!(scanner.feed(b" Done!\nLogging in\r\n").is_empty());
        assert_eq!(
            scanner.feed(b"Please enter your 2 factor auth code from your authenticator app: "),
            vec![Marker::TwoFactor]
        );
        assert_eq!(
            scanner.feed(b"Got session token!\nresult: OK\n"),
            vec![Marker::Success]
        );
        assert_eq!(
            scanner.feed(b"Enter account password for \"user\": "),
            vec![Marker::Password]
        );
    }

    #[tokio::test]
    async fn test_plain_success() {
        let (mut hs, mut out, _stdin) = session(prompt(None), Duration::from_secs(5));
        out.write_all(b"Logging in...\nresult: OK\nDownloading depot 1\n").await.unwrap();
        drop(out);
        hs.login().await.unwrap();
        hs.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_connection_error() {
        let (mut hs, mut out, _stdin) = session(prompt(None), Duration::from_secs(5));
        out.write_all(b"Logging in...\nFailed to authenticate\n").await.unwrap();
        drop(out);
        assert!(matches!(hs.login().await, Err(FetchError::ConnectionError)));
    }

    #[tokio::test]
    async fn test_two_factor_correct_code() {
        let p = prompt(Some("ABCDE"));
        let (mut hs, mut out, mut stdin) = session(p.clone(), Duration::from_secs(5));

        let fetcher = tokio::spawn(async move {
            out.write_all(b"Please enter your 2 factor auth code from your authenticator app: ")
                .await
                .unwrap();
            let mut line = String::new();
            stdin.read_line(&mut line).await.unwrap();
            assert_eq!(line, "ABCDE\n");
            out.write_all(b"\nresult: OK\n").await.unwrap();
        });

        hs.login().await.unwrap();
        fetcher.await.unwrap();
        assert_eq!(*p.asked.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_two_factor_cancelled() {
        let p = prompt(None);
        let (mut hs, mut out, _stdin) = session(p.clone(), Duration::from_secs(5));
        out.write_all(b"Please enter the authentication code sent to your email address: ")
            .await
            .unwrap();
        assert!(matches!(hs.login().await, Err(FetchError::InvalidCode)));
        assert_eq!(*p.asked.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_two_factor_wrong_code() {
        let p = prompt(Some("WRONG"));
        let (mut hs, mut out, mut stdin) = session(p.clone(), Duration::from_secs(5));

        let fetcher = tokio::spawn(async move {
            out.write_all(b"Please enter your 2 factor auth code from your authenticator app: ")
                .await
                .unwrap();
            let mut line = String::new();
            stdin.read_line(&mut line).await.unwrap();
            out.write_all(b"\nPlease enter your 2 factor auth code from your authenticator app: ")
                .await
                .unwrap();
            out
        });

        assert!(matches!(hs.login().await, Err(FetchError::InvalidCode)));
        let _ = fetcher.await.unwrap();
        assert_eq!(*p.asked.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_password_is_resent() {
        let (mut hs, mut out, mut stdin) = session(prompt(None), Duration::from_secs(5));

        let fetcher = tokio::spawn(async move {
            out.write_all(b"Enter account password for \"user\": ").await.unwrap();
            let mut line = String::new();
            stdin.read_line(&mut line).await.unwrap();
            assert_eq!(line, "hunter2\n");
            out.write_all(b"\nresult: OK\n").await.unwrap();
        });

        hs.login().await.unwrap();
        fetcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (mut hs, mut out, _stdin) = session(prompt(None), Duration::from_secs(15));
        out.write_all(b"Connecting...\n").await.unwrap();
        match hs.login().await {
            Err(FetchError::Timeout { state, secs }) => {
                assert_eq!(state, "awaiting login response");
                assert_eq!(secs, 15);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        drop(out);
    }
}
