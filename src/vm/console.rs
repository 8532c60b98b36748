//! Serial console multiplexer for VMs.
//!
//! A single `cu -l /dev/nmdm<ctid>B -s <baud>` process is spawned on
//! the first observer and reused; its controlling PTY lets us apply
//! resize requests from any observer. Output is broadcast to every
//! observer; a late joiner gets the scrollback buffer as its first
//! message.

use crate::error::{Error, Result};
use nix::pty::{openpty, OpenptyResult, Winsize};
use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

const SCROLLBACK_CAP: usize = 16 * 1024;

/// Framing discriminator for bytes an observer sends inbound.
#[derive(Debug, Clone)]
pub enum ObserverInput {
    Stdin(Vec<u8>),
    Resize { rows: u16, cols: u16, x: u16, y: u16 },
    Kill,
}

impl ObserverInput {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (discriminator, rest) = frame
            .split_first()
            .ok_or_else(|| Error::VmOperation("empty console frame".to_string()))?;
        match discriminator {
            0 => Ok(ObserverInput::Stdin(rest.to_vec())),
            1 => {
                #[derive(serde::Deserialize)]
                struct Resize {
                    rows: u16,
                    cols: u16,
                    #[serde(default)]
                    x: u16,
                    #[serde(default)]
                    y: u16,
                }
                let r: Resize = serde_json::from_slice(rest)?;
                Ok(ObserverInput::Resize {
                    rows: r.rows,
                    cols: r.cols,
                    x: r.x,
                    y: r.y,
                })
            }
            2 => Ok(ObserverInput::Kill),
            other => Err(Error::VmOperation(format!("unknown console frame discriminator {other}"))),
        }
    }
}

struct Observer {
    tx: mpsc::Sender<Vec<u8>>,
}

struct SessionInner {
    child: Child,
    master: Option<OwnedFd>,
    scrollback: VecDeque<u8>,
    observers: HashMap<u64, Observer>,
    next_observer_id: u64,
}

/// A single VM's console session, shared by all observers.
pub struct ConsoleSession {
    inner: Arc<Mutex<SessionInner>>,
}

/// Registry of console sessions, keyed by the VM's rid.
#[derive(Default)]
pub struct ConsoleRegistry {
    sessions: Mutex<HashMap<String, ConsoleSession>>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new observer to `rid`'s console, spawning `cu` if this
    /// is the first observer. Returns the scrollback buffer and a
    /// receiver for subsequent output, plus a sender for this
    /// observer's framed input.
    ///
    /// Takes `self` via `Arc` so the spawned observer task can call back
    /// into `teardown` when it sees a `Kill` frame.
    pub async fn attach(
        self: &Arc<Self>,
        rid: &str,
        ctid: u64,
        baud: u32,
    ) -> Result<(Vec<u8>, mpsc::Receiver<Vec<u8>>, mpsc::Sender<ObserverInput>)> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(rid) {
            let session = ConsoleSession::spawn(ctid, baud).await?;
            sessions.insert(rid.to_string(), session);
        }
        let session = sessions.get(rid).unwrap();
        session.add_observer(self.clone(), rid.to_string()).await
    }

    /// Kills the process, closes the PTY, removes the session from the
    /// registry, and closes all observers.
    pub async fn teardown(&self, rid: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(rid) {
            session.kill_and_close().await;
        }
    }
}

impl ConsoleSession {
    async fn spawn(ctid: u64, baud: u32) -> Result<Self> {
        let device = format!("/dev/nmdm{ctid}B");
        let OpenptyResult { master, slave } = openpty(
            Some(&Winsize {
                ws_row: 24,
                ws_col: 80,
                ws_xpixel: 0,
                ws_ypixel: 0,
            }),
            None,
        )
        .map_err(|e| Error::VmOperation(format!("openpty failed: {e}")))?;

        set_nonblocking(master.as_raw_fd())?;

        let stdin_fd = slave.as_raw_fd();
        let stdout_fd = nix::unistd::dup(&slave)
            .map_err(|e| Error::VmOperation(format!("dup of pty slave failed: {e}")))?;

        let mut cmd = Command::new("cu");
        cmd.args(["-l", &device, "-s"]).arg(baud.to_string());
        // SAFETY: `stdin_fd` is `slave`'s fd, handed to the child and
        // closed there; `stdout_fd` is a fresh dup consumed the same way.
        unsafe {
            cmd.stdin(Stdio::from_raw_fd(stdin_fd));
            cmd.stdout(Stdio::from_raw_fd(stdout_fd.as_raw_fd()));
        }
        cmd.stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().ok();
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| Error::VmOperation(format!("failed to spawn cu: {e}")))?;
        std::mem::forget(slave);
        std::mem::forget(stdout_fd);

        let inner = SessionInner {
            child,
            master: Some(master),
            scrollback: VecDeque::with_capacity(SCROLLBACK_CAP),
            observers: HashMap::new(),
            next_observer_id: 0,
        };
        let session = Self {
            inner: Arc::new(Mutex::new(inner)),
        };
        session.spawn_reader_loop();
        Ok(session)
    }

    fn spawn_reader_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let master_fd = {
                    let guard = inner.lock().await;
                    match guard.master {
                        Some(ref fd) => fd.as_raw_fd(),
                        None => break,
                    }
                };
                let mut buf = [0u8; 4096];
                let n = match read_nonblocking(master_fd, &mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                let mut guard = inner.lock().await;
                for &b in &buf[..n] {
                    if guard.scrollback.len() >= SCROLLBACK_CAP {
                        guard.scrollback.pop_front();
                    }
                    guard.scrollback.push_back(b);
                }
                let chunk = buf[..n].to_vec();
                let mut evict = Vec::new();
                for (&id, observer) in guard.observers.iter() {
                    if observer.tx.send(chunk.clone()).await.is_err() {
                        evict.push(id);
                    }
                }
                for id in evict {
                    guard.observers.remove(&id);
                }
            }
        });
    }

    async fn add_observer(
        &self,
        registry: Arc<ConsoleRegistry>,
        rid: String,
    ) -> Result<(Vec<u8>, mpsc::Receiver<Vec<u8>>, mpsc::Sender<ObserverInput>)> {
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (in_tx, mut in_rx) = mpsc::channel::<ObserverInput>(64);

        let scrollback = {
            let mut guard = self.inner.lock().await;
            let id = guard.next_observer_id;
            guard.next_observer_id += 1;
            guard.observers.insert(id, Observer { tx: out_tx });
            guard.scrollback.iter().copied().collect::<Vec<u8>>()
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(input) = in_rx.recv().await {
                match input {
                    ObserverInput::Stdin(bytes) => {
                        let master_fd = {
                            let guard = inner.lock().await;
                            match guard.master {
                                Some(ref fd) => fd.as_raw_fd(),
                                None => break,
                            }
                        };
                        let _ = write_async(master_fd, &bytes).await;
                    }
                    ObserverInput::Resize { rows, cols, x, y } => {
                        let guard = inner.lock().await;
                        match guard.master {
                            Some(ref fd) => {
                                let _ = apply_winsize(fd.as_raw_fd(), rows, cols, x, y);
                            }
                            None => break,
                        }
                    }
                    ObserverInput::Kill => {
                        registry.teardown(&rid).await;
                        break;
                    }
                }
            }
        });

        Ok((scrollback, out_rx, in_tx))
    }

    /// Kills the child, closes the PTY master, and drops every observer's
    /// output channel so their receive loops see the session end.
    async fn kill_and_close(&self) {
        let mut guard = self.inner.lock().await;
        let _ = guard.child.kill().await;
        guard.observers.clear();
        guard.master = None;
    }
}

async fn read_nonblocking(fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::fd::BorrowedFd;
    loop {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match nix::unistd::read(&borrowed, buf) {
            Ok(n) => return Ok(n),
            Err(nix::errno::Errno::EAGAIN) => {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
        }
    }
}

async fn write_async(fd: i32, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::fd::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    nix::unistd::write(&borrowed, bytes).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

fn set_nonblocking(fd: i32) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::VmOperation(format!(
            "fcntl(F_GETFL) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::VmOperation(format!(
            "fcntl(F_SETFL) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn apply_winsize(fd: i32, rows: u16, cols: u16, x: u16, y: u16) -> Result<()> {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: x,
        ws_ypixel: y,
    };
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if ret < 0 {
        return Err(Error::VmOperation(format!(
            "TIOCSWINSZ failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stdin_frame() {
        let frame = [0u8, b'h', b'i'];
        match ObserverInput::decode(&frame).unwrap() {
            ObserverInput::Stdin(bytes) => assert_eq!(bytes, b"hi"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decodes_resize_frame() {
        let json = serde_json::to_vec(&serde_json::json!({"rows": 40, "cols": 120})).unwrap();
        let mut frame = vec![1u8];
        frame.extend(json);
        match ObserverInput::decode(&frame).unwrap() {
            ObserverInput::Resize { rows, cols, .. } => {
                assert_eq!(rows, 40);
                assert_eq!(cols, 120);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decodes_kill_frame() {
        assert!(matches!(ObserverInput::decode(&[2u8]), Ok(ObserverInput::Kill)));
    }

    #[test]
    fn rejects_unknown_discriminator() {
        assert!(ObserverInput::decode(&[9u8]).is_err());
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(ObserverInput::decode(&[]).is_err());
    }
}
