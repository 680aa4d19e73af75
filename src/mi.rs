//! Debugger machine-interface (MI) support for the device bridge.
//!
//! On physical devices the test binary is started by a bridge tool that
//! installs the app and then hands control to a debugger speaking the
//! GDB/MI text protocol on the bridge's stdout. Two things make this awkward:
//!
//! - Before the debugger starts, stdout carries the bridge's own progress
//!   output. The only signal that the debugger is up is a line of exactly
//!   25 dashes. [`MarkerSniffer`] scans the raw bytes for it.
//! - After the marker, output is line-framed MI records. [`LineSplitter`]
//!   reassembles lines across reads and [`parse_record`] classifies them.
//!
//! [`MiSession`] is the small state machine driving the debugger: ignore
//! signals, continue the target, and exit once the target stops.
//!
//! ```text
//!   (gdb) ──► 1-interpreter-exec console "handle all nostop noprint"
//!   1^done ──► 2-exec-continue
//!   2^running      (target attached)
//!   *stopped ──► 3-gdb-exit
//!   3^exit         (debugger gone)
//! ```
//!
//! The marker heuristic is fragile: a change in the bridge banner silently
//! breaks attachment, which surfaces as a connect timeout.

use tracing::{debug, warn};

/// Number of consecutive dashes announcing the debugger backend.
pub const MARKER_DASHES: usize = 25;

/// Prompt printed by the debugger when it is ready for a command.
pub const PROMPT: &str = "(gdb)";

/// Undoes the C-style escaping of MI stream payloads.
///
/// `\b`, `\n`, `\t`, `\f` and `\r` become control characters; any other
/// escaped character (including `\"` and `\\`) stands for itself.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(match c {
                'b' => '\u{8}',
                'n' => '\n',
                't' => '\t',
                'f' => '\u{c}',
                'r' => '\r',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Outcome of feeding a chunk of bytes to the [`MarkerSniffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// The whole chunk is bridge output; the marker has not been seen.
    Searching,
    /// The marker ends at this offset: bytes before it are bridge output,
    /// bytes from it on belong to the debugger.
    Found(usize),
    /// The byte budget ran out without seeing the marker.
    Exhausted,
}

/// Scans raw bridge output for the debugger start marker.
#[derive(Debug)]
pub struct MarkerSniffer {
    dashes: usize,
    consumed: usize,
    budget: usize,
    found: bool,
}

impl MarkerSniffer {
    /// Creates a sniffer that gives up after `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            dashes: 0,
            consumed: 0,
            budget,
            found: false,
        }
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Sniff {
        if self.found {
            return Sniff::Found(0);
        }
        for (i, &b) in chunk.iter().enumerate() {
            if b == b'-' {
                self.dashes += 1;
            } else if self.dashes == MARKER_DASHES && b == b'\n' {
                self.found = true;
                self.consumed += i + 1;
                return Sniff::Found(i + 1);
            } else {
                self.dashes = 0;
            }
        }
        self.consumed += chunk.len();
        if self.consumed > self.budget {
            Sniff::Exhausted
        } else {
            Sniff::Searching
        }
    }
}

/// Reassembles newline-terminated lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the complete lines contained in `chunk` plus earlier leftovers.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Returns an unterminated trailing line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = std::mem::take(&mut self.pending);
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}

/// Which of the three MI output streams a stream record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `~` debugger console output.
    Console,
    /// `@` output of the program being debugged.
    Target,
    /// `&` debugger internal log.
    Log,
}

/// Class of a `^` result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    Other(String),
}

impl ResultClass {
    fn parse(s: &str) -> Self {
        match s {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            "exit" => ResultClass::Exit,
            other => ResultClass::Other(other.to_string()),
        }
    }
}

/// One line of MI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiRecord {
    Prompt,
    Stream {
        kind: StreamKind,
        text: String,
    },
    Result {
        token: Option<u32>,
        class: ResultClass,
        results: String,
    },
    /// `*` exec, `+` status and `=` notify records.
    Async {
        token: Option<u32>,
        class: String,
        results: String,
    },
    /// Anything that is not MI syntax.
    Other(String),
}

/// Classifies a single MI output line.
pub fn parse_record(line: &str) -> MiRecord {
    let line = line.trim_end();
    if line.trim() == PROMPT {
        return MiRecord::Prompt;
    }

    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    let token = if digits > 0 {
        line[..digits].parse().ok()
    } else {
        None
    };
    let rest = &line[digits..];

    let Some(marker) = rest.chars().next() else {
        return MiRecord::Other(line.to_string());
    };
    let body = &rest[marker.len_utf8()..];

    match marker {
        '~' | '@' | '&' if token.is_none() => {
            let kind = match marker {
                '~' => StreamKind::Console,
                '@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            let inner = body
                .strip_prefix('"')
                .and_then(|b| b.strip_suffix('"'))
                .unwrap_or(body);
            MiRecord::Stream {
                kind,
                text: unescape(inner),
            }
        }
        '^' => {
            let (class, results) = split_class(body);
            MiRecord::Result {
                token,
                class: ResultClass::parse(class),
                results: results.to_string(),
            }
        }
        '*' | '+' | '=' => {
            let (class, results) = split_class(body);
            MiRecord::Async {
                token,
                class: class.to_string(),
                results: results.to_string(),
            }
        }
        _ => MiRecord::Other(line.to_string()),
    }
}

fn split_class(body: &str) -> (&str, &str) {
    match body.split_once(',') {
        Some((class, results)) => (class, results),
        None => (body, ""),
    }
}

/// A command to write to the debugger's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiCommand {
    pub token: u32,
    pub text: String,
}

impl MiCommand {
    /// The wire form: token, command text, newline.
    pub fn to_line(&self) -> String {
        format!("{}{}\n", self.token, self.text)
    }
}

/// What the session wants its driver to do after a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiAction {
    /// Write this command to the debugger.
    Send(MiCommand),
    /// Program output to forward to the output sink.
    TargetOutput(String),
    /// The target is running under the debugger.
    Attached,
    /// A command failed.
    Error(String),
    /// The debugger has exited.
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingPrompt,
    IgnoringSignals(u32),
    Continuing(u32),
    Running,
    Exiting(u32),
    Exited,
}

/// Drives the debugger from prompt to target exit.
#[derive(Debug)]
pub struct MiSession {
    state: SessionState,
    next_token: u32,
}

impl Default for MiSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MiSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingPrompt,
            next_token: 1,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Exiting(_))
    }

    pub fn is_exited(&self) -> bool {
        self.state == SessionState::Exited
    }

    fn command(&mut self, text: &str) -> MiCommand {
        let token = self.next_token;
        self.next_token += 1;
        MiCommand {
            token,
            text: text.to_string(),
        }
    }

    /// Builds an out-of-band exit command, regardless of the current state.
    pub fn exit_command(&mut self) -> MiCommand {
        let cmd = self.command("-gdb-exit");
        if self.state != SessionState::Exited {
            self.state = SessionState::Exiting(cmd.token);
        }
        cmd
    }

    /// Advances the session with one record and returns the resulting actions.
    pub fn on_record(&mut self, record: &MiRecord) -> Vec<MiAction> {
        let mut actions = Vec::new();
        match (record, self.state) {
            (MiRecord::Prompt, SessionState::AwaitingPrompt) => {
                let cmd = self.command("-interpreter-exec console \"handle all nostop noprint\"");
                self.state = SessionState::IgnoringSignals(cmd.token);
                actions.push(MiAction::Send(cmd));
            }
            (MiRecord::Prompt, _) => {}
            (
                MiRecord::Stream {
                    kind: StreamKind::Target,
                    text,
                },
                _,
            ) => actions.push(MiAction::TargetOutput(text.clone())),
            (MiRecord::Stream { kind, text }, _) => {
                debug!("debugger {:?}: {}", kind, text.trim_end());
            }
            (
                MiRecord::Result {
                    token: Some(token),
                    class,
                    results,
                },
                SessionState::IgnoringSignals(pending),
            ) if *token == pending => {
                if *class == ResultClass::Error {
                    warn!("Failed to disable signal handling: {}", results);
                }
                let cmd = self.command("-exec-continue");
                self.state = SessionState::Continuing(cmd.token);
                actions.push(MiAction::Send(cmd));
            }
            (
                MiRecord::Result {
                    token: Some(token),
                    class,
                    results,
                },
                SessionState::Continuing(pending),
            ) if *token == pending => match class {
                ResultClass::Running | ResultClass::Done => {
                    self.state = SessionState::Running;
                    actions.push(MiAction::Attached);
                }
                _ => actions.push(MiAction::Error(format!(
                    "-exec-continue failed: {}",
                    results
                ))),
            },
            (MiRecord::Async { class, .. }, SessionState::Running) if class == "stopped" => {
                let cmd = self.command("-gdb-exit");
                self.state = SessionState::Exiting(cmd.token);
                actions.push(MiAction::Send(cmd));
            }
            (
                MiRecord::Result {
                    class: ResultClass::Exit,
                    ..
                },
                _,
            ) => {
                self.state = SessionState::Exited;
                actions.push(MiAction::Exited);
            }
            (
                MiRecord::Result {
                    class: ResultClass::Error,
                    results,
                    ..
                },
                _,
            ) => actions.push(MiAction::Error(results.clone())),
            (MiRecord::Other(line), _) => debug!("debugger: {}", line),
            _ => {}
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_control_characters() {
        assert_eq!(unescape("line1\\nline2\\tend"), "line1\nline2\tend");
        assert_eq!(unescape("a\\bb\\fc\\rd"), "a\u{8}b\u{c}c\rd");
        assert_eq!(unescape("say \\\"hi\\\" \\\\ bye"), "say \"hi\" \\ bye");
    }

    #[test]
    fn test_sniffer_finds_marker_mid_chunk() {
        let mut sniffer = MarkerSniffer::new(1024);
        let mut data = b"[ 90%] Installing\n".to_vec();
        data.extend_from_slice(&[b'-'; MARKER_DASHES]);
        data.extend_from_slice(b"\n(gdb)\n");

        match sniffer.feed(&data) {
            Sniff::Found(at) => assert_eq!(&data[at..], b"(gdb)\n"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sniffer.is_found());
    }

    #[test]
    fn test_sniffer_marker_split_across_chunks() {
        let mut sniffer = MarkerSniffer::new(1024);
        assert_eq!(sniffer.feed(b"installing ---------------"), Sniff::Searching);
        assert_eq!(sniffer.feed(b"----------"), Sniff::Searching);
        assert_eq!(sniffer.feed(b"\n^done"), Sniff::Found(1));
    }

    #[test]
    fn test_sniffer_rejects_wrong_dash_count() {
        let mut sniffer = MarkerSniffer::new(1024);
        let mut data = vec![b'-'; MARKER_DASHES + 1];
        data.push(b'\n');
        assert_eq!(sniffer.feed(&data), Sniff::Searching);
    }

    #[test]
    fn test_sniffer_budget() {
        let mut sniffer = MarkerSniffer::new(8);
        assert_eq!(sniffer.feed(b"0123"), Sniff::Searching);
        assert_eq!(sniffer.feed(b"456789"), Sniff::Exhausted);
    }

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"^do").is_empty());
        assert_eq!(splitter.push(b"ne\r\n(gdb)\n@\"x"), vec!["^done", "(gdb)"]);
        assert_eq!(splitter.finish().as_deref(), Some("@\"x"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_parse_records() {
        assert_eq!(parse_record("(gdb) "), MiRecord::Prompt);
        assert_eq!(
            parse_record("@\"hello\\n\""),
            MiRecord::Stream {
                kind: StreamKind::Target,
                text: "hello\n".to_string()
            }
        );
        assert_eq!(
            parse_record("12^error,msg=\"nope\""),
            MiRecord::Result {
                token: Some(12),
                class: ResultClass::Error,
                results: "msg=\"nope\"".to_string()
            }
        );
        assert_eq!(
            parse_record("*stopped,reason=\"exited-normally\""),
            MiRecord::Async {
                token: None,
                class: "stopped".to_string(),
                results: "reason=\"exited-normally\"".to_string()
            }
        );
        assert_eq!(
            parse_record("warning: no symbols"),
            MiRecord::Other("warning: no symbols".to_string())
        );
    }

    #[test]
    fn test_session_happy_path() {
        let mut session = MiSession::new();

        let actions = session.on_record(&MiRecord::Prompt);
        let MiAction::Send(ignore) = &actions[0] else {
            panic!("expected a command");
        };
        assert_eq!(
            ignore.to_line(),
            "1-interpreter-exec console \"handle all nostop noprint\"\n"
        );

        // A second prompt must not restart the sequence.
        assert!(session.on_record(&MiRecord::Prompt).is_empty());

        let actions = session.on_record(&parse_record("1^done"));
        assert_eq!(
            actions,
            vec![MiAction::Send(MiCommand {
                token: 2,
                text: "-exec-continue".to_string()
            })]
        );

        let actions = session.on_record(&parse_record("2^running"));
        assert_eq!(actions, vec![MiAction::Attached]);
        assert!(session.is_attached());

        let actions = session.on_record(&parse_record("@\"[robovm] tests done\\n\""));
        assert_eq!(
            actions,
            vec![MiAction::TargetOutput("[robovm] tests done\n".to_string())]
        );

        let actions = session.on_record(&parse_record("*stopped,reason=\"exited-normally\""));
        assert_eq!(
            actions,
            vec![MiAction::Send(MiCommand {
                token: 3,
                text: "-gdb-exit".to_string()
            })]
        );

        assert_eq!(session.on_record(&parse_record("3^exit")), vec![MiAction::Exited]);
        assert!(session.is_exited());
    }

    #[test]
    fn test_session_continue_failure() {
        let mut session = MiSession::new();
        session.on_record(&MiRecord::Prompt);
        session.on_record(&parse_record("1^done"));
        let actions = session.on_record(&parse_record("2^error,msg=\"no process\""));
        assert!(matches!(&actions[0], MiAction::Error(msg) if msg.contains("no process")));
        assert!(!session.is_attached());
    }
}
