//! PTY session execution
//!
//! Serves `terminal_command` frames against local pseudo-terminals using
//! portable-pty. Each session owns a blocking reader thread that chunks,
//! encodes, and forwards PTY output through the connection's outbound
//! queue; sequence numbers are assigned at the source so the operator
//! side can restore order.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, CommandBuilder, PtyPair, PtySize, PtySystem};
use tokio::sync::mpsc;

use fh_protocol::{TerminalAction, TerminalSize};

use crate::connection::ConnectionSender;

/// Read granularity for PTY output; stays below the wire chunk cap so a
/// single read never has to split
const READ_BUFFER: usize = 16 * 1024;

/// Executes terminal sessions on the local machine
pub struct PtyExecutor {
    pty_system: Box<dyn PtySystem + Send>,
    sessions: HashMap<String, PtySession>,
    default_shell: Option<String>,
    sender: ConnectionSender,
    /// Reader threads report sessions whose PTY hit EOF
    exited_tx: mpsc::UnboundedSender<String>,
}

struct PtySession {
    pair: PtyPair,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    /// Set before a deliberate close so the reader thread stays quiet
    closing: Arc<AtomicBool>,
}

impl PtyExecutor {
    /// Create an executor wired to the connection's outbound queue.
    ///
    /// Returns the receiver the runtime polls for sessions whose shell
    /// exited on its own.
    pub fn new(
        sender: ConnectionSender,
        default_shell: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        (
            Self {
                pty_system: native_pty_system(),
                sessions: HashMap::new(),
                default_shell,
                sender,
                exited_tx,
            },
            exited_rx,
        )
    }

    /// Dispatch one terminal command from the hub
    pub fn handle(&mut self, session_id: String, action: TerminalAction) {
        match action {
            TerminalAction::Init { rows, cols, shell } => {
                if let Err(reason) = self.init(&session_id, TerminalSize::new(rows, cols), shell) {
                    tracing::error!("Terminal init failed for {}: {}", session_id, reason);
                    self.sender.send_terminal_error(&session_id, &reason);
                } else {
                    self.sender.send_terminal_ready(&session_id);
                }
            }
            TerminalAction::Input { data } => {
                if let Err(reason) = self.input(&session_id, data.as_bytes()) {
                    self.sender.send_terminal_error(&session_id, &reason);
                }
            }
            TerminalAction::Resize { rows, cols } => {
                if let Err(reason) = self.resize(&session_id, TerminalSize::new(rows, cols)) {
                    self.sender.send_terminal_error(&session_id, &reason);
                }
            }
            TerminalAction::Close => {
                self.close(&session_id);
                self.sender.send_terminal_closed(&session_id);
            }
        }
    }

    /// Create a PTY running the requested shell
    fn init(
        &mut self,
        session_id: &str,
        size: TerminalSize,
        shell: Option<String>,
    ) -> Result<(), String> {
        if self.sessions.contains_key(session_id) {
            return Err("session already exists".to_string());
        }

        tracing::info!(
            "Starting terminal session {} ({}x{})",
            session_id,
            size.cols,
            size.rows
        );

        let pair = self
            .pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|_| "unsupported".to_string())?;

        let shell_path = shell
            .filter(|s| !s.is_empty())
            .or_else(|| self.default_shell.clone())
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            });

        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| format!("failed to spawn {}: {}", shell_path, e))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| format!("failed to open pty writer: {}", e))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| format!("failed to open pty reader: {}", e))?;

        let closing = Arc::new(AtomicBool::new(false));
        spawn_output_reader(
            session_id.to_string(),
            reader,
            self.sender.clone(),
            self.exited_tx.clone(),
            Arc::clone(&closing),
        );

        self.sessions.insert(
            session_id.to_string(),
            PtySession {
                pair,
                child,
                writer,
                closing,
            },
        );

        Ok(())
    }

    /// Write operator keystrokes to the PTY
    fn input(&mut self, session_id: &str, data: &[u8]) -> Result<(), String> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| "unknown_session".to_string())?;

        session
            .writer
            .write_all(data)
            .and_then(|_| session.writer.flush())
            .map_err(|e| format!("pty write failed: {}", e))
    }

    /// Apply new dimensions to the PTY
    fn resize(&mut self, session_id: &str, size: TerminalSize) -> Result<(), String> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| "unknown_session".to_string())?;

        session
            .pair
            .master
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("resize failed: {}", e))
    }

    /// Terminate the shell and drop the session
    pub fn close(&mut self, session_id: &str) {
        if let Some(mut session) = self.sessions.remove(session_id) {
            tracing::info!("Closing terminal session {}", session_id);
            session.closing.store(true, Ordering::SeqCst);
            let _ = session.child.kill();
            let _ = session.child.wait();
        }
    }

    /// Forget a session whose shell already exited (reader saw EOF)
    pub fn finish(&mut self, session_id: &str) {
        if let Some(mut session) = self.sessions.remove(session_id) {
            let _ = session.child.wait();
        }
    }

    /// Close every session (disconnect or shutdown)
    pub fn close_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.close(&id);
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Blocking reader thread: PTY bytes out as sequenced terminal_output
/// frames, terminal_closed when the shell exits on its own.
fn spawn_output_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    sender: ConnectionSender,
    exited_tx: mpsc::UnboundedSender<String>,
    closing: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_BUFFER];
        let mut seq = 0u64;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    seq = sender.send_terminal_output(&session_id, &buf[..n], seq);
                }
                Err(e) => {
                    if !closing.load(Ordering::SeqCst) {
                        tracing::debug!("PTY read on {} ended: {}", session_id, e);
                    }
                    break;
                }
            }
        }

        // A deliberate close already told both sides; only an organic
        // exit needs announcing
        if !closing.load(Ordering::SeqCst) {
            sender.send_terminal_closed_blocking(&session_id);
            let _ = exited_tx.send(session_id);
        }
    });
}
