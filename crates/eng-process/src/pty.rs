use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProcessError, Result};

/// One event emitted by a PTY-backed process, per the external interface's
/// PTY subprocess contract.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    Started { id: Uuid },
    Output { bytes: Vec<u8> },
    Exited,
    Error { message: String },
}

/// A running PTY-backed process: an event stream plus a byte-accurate
/// writer and resize control.
pub struct PtyProcess {
    pub id: Uuid,
    pub events: flume::Receiver<PtyEvent>,
    writer: flume::Sender<Vec<u8>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    _reader_thread: Option<std::thread::JoinHandle<()>>,
    _writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl PtyProcess {
    /// Spawn `cmd` inside a PTY rooted at `working_directory`. The first
    /// event on the returned channel is always `Started`.
    pub fn spawn(
        cmd: &str,
        args: &[&str],
        working_directory: &str,
        env: &[(&str, &str)],
    ) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Pty(e.to_string()))?;

        let mut command = CommandBuilder::new(cmd);
        command.cwd(working_directory);
        for arg in args {
            command.arg(*arg);
        }
        for (k, v) in env {
            command.env(*k, *v);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        drop(pair.slave);

        let id = Uuid::new_v4();
        let (event_tx, event_rx) = flume::unbounded::<PtyEvent>();
        let _ = event_tx.send(PtyEvent::Started { id });

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let read_events = event_tx.clone();
        let reader_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_events.send(PtyEvent::Output { bytes: buf[..n].to_vec() }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::Other {
                            let _ = read_events.send(PtyEvent::Error { message: e.to_string() });
                        }
                        break;
                    }
                }
            }
            let _ = read_events.send(PtyEvent::Exited);
        });

        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let writer_thread = std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
            }
        });

        debug!(%id, cmd, ?args, working_directory, "spawned pty process");

        Ok(Self {
            id,
            events: event_rx,
            writer: write_tx,
            child: Arc::new(Mutex::new(child)),
            master: Arc::new(Mutex::new(pair.master)),
            _reader_thread: Some(reader_thread),
            _writer_thread: Some(writer_thread),
        })
    }

    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("pty child lock was poisoned, recovering");
            e.into_inner()
        });
        matches!(child.try_wait(), Ok(None))
    }

    /// Kill idempotently: killing an already-exited process is not an error.
    pub fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("pty child lock was poisoned, recovering");
            e.into_inner()
        });
        match child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => child.kill().map_err(|e| ProcessError::Pty(e.to_string())),
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.writer
            .send(data.to_vec())
            .map_err(|e| ProcessError::Pty(format!("writer channel closed: {e}")))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| {
            warn!("pty master lock was poisoned, recovering");
            e.into_inner()
        });
        master
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| ProcessError::Pty(e.to_string()))
    }
}
