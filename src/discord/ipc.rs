//! Discord local IPC: framing, handshake and activity commands

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{BridgeError, ProtocolError, Result, TransportError};

const HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 64 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PIPE_INDEX: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl TryFrom<u32> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Frame),
            2 => Ok(Self::Close),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::FrameTooLarge(payload.len()))?;
    let mut buf = Vec::with_capacity(HEADER_LEN.saturating_add(payload.len()));
    buf.extend_from_slice(&(opcode as u32).to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn write_frame<W: Write + ?Sized>(writer: &mut W, opcode: Opcode, payload: &Value) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    let frame = encode_frame(opcode, &body)?;
    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(|e| TransportError::ShortWrite(e.to_string()))?;
    Ok(())
}

/// Reads one frame. Any short read is a transport failure.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<(Opcode, Value)> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| TransportError::ShortRead(e.to_string()))?;

    let (op_bytes, len_bytes) = header.split_at(4);
    let raw_op = u32::from_le_bytes(op_bytes.try_into().map_err(|_| BridgeError::parse("header"))?);
    let len = u32::from_le_bytes(len_bytes.try_into().map_err(|_| BridgeError::parse("header"))?);
    let len = usize::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(usize::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| TransportError::ShortRead(e.to_string()))?;

    let opcode = Opcode::try_from(raw_op)?;
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };
    Ok((opcode, payload))
}

type FrameResult = Result<(Opcode, Value)>;

/// Byte stream to the Discord client
pub trait IpcStream: Read + Write + Send {
    /// A second handle on the same stream, read by the reader thread
    fn try_clone_stream(&self) -> std::io::Result<Box<dyn IpcStream>>;

    /// Unblocks reads pending on any handle, where the platform can
    fn shutdown(&self) -> std::io::Result<()>;
}

#[cfg(unix)]
impl IpcStream for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> std::io::Result<Box<dyn IpcStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

#[cfg(windows)]
impl IpcStream for std::fs::File {
    fn try_clone_stream(&self) -> std::io::Result<Box<dyn IpcStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    // Named pipes have no half-close; reply waits are bounded instead
    fn shutdown(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Socket paths in connection order.
#[cfg(unix)]
pub fn endpoint_candidates(
    runtime_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    uid: u32,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    match (runtime_dir, home_dir) {
        (Some(dir), _) => {
            paths.extend((0..MAX_PIPE_INDEX).map(|i| dir.join(format!("discord-ipc-{i}"))));
        }
        (None, Some(home)) => {
            paths.extend((0..MAX_PIPE_INDEX).map(|i| home.join(format!(".discord-ipc-{i}"))));
        }
        (None, None) => {}
    }

    // Sandboxed clients (snap, flatpak)
    let user_run = PathBuf::from(format!("/run/user/{uid}"));
    paths.push(user_run.join("snap.discord").join("discord-ipc-0"));
    paths.push(
        user_run
            .join("app")
            .join("com.discordapp.Discord")
            .join("discord-ipc-0"),
    );
    paths
}

#[cfg(unix)]
pub fn default_endpoints() -> Vec<PathBuf> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    #[allow(unsafe_code)]
    // SAFETY: getuid has no preconditions and cannot fail
    let uid = unsafe { libc::getuid() };
    endpoint_candidates(runtime_dir, dirs::home_dir(), uid)
}

#[cfg(windows)]
pub fn default_endpoints() -> Vec<PathBuf> {
    (0..MAX_PIPE_INDEX)
        .map(|i| PathBuf::from(format!(r"\\.\pipe\discord-ipc-{i}")))
        .collect()
}

#[cfg(unix)]
fn open_endpoint(path: &std::path::Path) -> std::io::Result<Box<dyn IpcStream>> {
    let stream = std::os::unix::net::UnixStream::connect(path)?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
fn open_endpoint(path: &std::path::Path) -> std::io::Result<Box<dyn IpcStream>> {
    let pipe = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    Ok(Box::new(pipe))
}

/// Errors after which the stream can no longer be framed
fn is_fatal(e: &BridgeError) -> bool {
    e.is_disconnect()
        || matches!(
            e,
            BridgeError::Protocol(ProtocolError::FrameTooLarge(_))
                | BridgeError::Transport(TransportError::Timeout(_))
        )
}

fn read_loop(mut stream: Box<dyn IpcStream>, frames: &Sender<FrameResult>, span: &tracing::Span) {
    loop {
        let frame = read_frame(stream.as_mut());
        let fatal = frame.as_ref().err().is_some_and(is_fatal);
        if frames.send(frame).is_err() || fatal {
            break;
        }
    }
    span.in_scope(|| tracing::debug!("IPC reader stopped"));
}

/// Returns the first fatal error among frames nobody waited for.
fn drain_stale(frames: &Receiver<FrameResult>) -> Option<BridgeError> {
    while let Ok(frame) = frames.try_recv() {
        match frame {
            Err(e) if is_fatal(&e) => return Some(e),
            Err(e) => tracing::debug!("Dropping stale IPC error: {}", e),
            Ok((opcode, body)) => tracing::debug!("Dropping unsolicited {:?} frame: {}", opcode, body),
        }
    }
    None
}

/// Write half plus the frames coming off the reader thread
struct Link {
    stream: Box<dyn IpcStream>,
    frames: Receiver<FrameResult>,
}

/// Held apart from the link so `disconnect` never waits on a pending reply
struct Interrupt {
    stream: Box<dyn IpcStream>,
    frames: Sender<FrameResult>,
}

/// Connection to the local Discord client.
///
/// All methods take `&self`. A reader thread owns the blocking reads, so a
/// reply wait is bounded by `reply_timeout` and `disconnect` can cut it short.
pub struct IpcClient {
    client_id: String,
    endpoints: Vec<PathBuf>,
    link: Mutex<Option<Link>>,
    interrupt: Mutex<Option<Interrupt>>,
    connected: AtomicBool,
    reply_timeout: Duration,
    span: tracing::Span,
}

impl IpcClient {
    pub fn new(client_id: impl Into<String>, span: tracing::Span) -> Result<Self> {
        Self::with_endpoints(client_id, default_endpoints(), span)
    }

    pub fn with_endpoints(
        client_id: impl Into<String>,
        endpoints: Vec<PathBuf>,
        span: tracing::Span,
    ) -> Result<Self> {
        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(BridgeError::config("Discord client id must not be empty"));
        }

        Ok(Self {
            client_id,
            endpoints,
            link: Mutex::new(None),
            interrupt: Mutex::new(None),
            connected: AtomicBool::new(false),
            reply_timeout: IO_TIMEOUT,
            span,
        })
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Tries every endpoint in order; a rejected handshake moves on to the next one.
    pub fn connect(&self) -> Result<()> {
        let _enter = self.span.enter();
        if self.is_connected() {
            return Ok(());
        }

        let mut last_error = None;
        for path in &self.endpoints {
            let stream = match open_endpoint(path) {
                Ok(s) => s,
                Err(e) => {
                    tracing::trace!("IPC endpoint {} unavailable: {}", path.display(), e);
                    continue;
                }
            };

            tracing::debug!("Opened IPC endpoint {}", path.display());
            match self.attach(stream) {
                Ok(()) => {
                    tracing::info!("Connected to Discord via {}", path.display());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Handshake on {} failed: {}", path.display(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::ConnectFailed("no Discord IPC endpoint available".into()).into()
        }))
    }

    /// Starts the reader thread on an open stream and performs the handshake.
    fn attach(&self, stream: Box<dyn IpcStream>) -> Result<()> {
        let reader = stream.try_clone_stream()?;
        let closer = stream.try_clone_stream()?;
        let (tx, rx) = mpsc::channel();

        let reader_tx = tx.clone();
        let span = self.span.clone();
        std::thread::Builder::new()
            .name("discord-ipc-reader".to_string())
            .spawn(move || read_loop(reader, &reader_tx, &span))?;

        let mut link = Link { stream, frames: rx };
        if let Err(e) = self.handshake(&mut link) {
            let _ = closer.shutdown();
            return Err(e);
        }

        *self.link.lock() = Some(link);
        *self.interrupt.lock() = Some(Interrupt {
            stream: closer,
            frames: tx,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn receive(&self, link: &Link) -> FrameResult {
        match link.frames.recv_timeout(self.reply_timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(format!(
                "no reply from Discord within {:?}",
                self.reply_timeout
            ))
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed.into()),
        }
    }

    fn handshake(&self, link: &mut Link) -> Result<()> {
        let payload = json!({ "v": 1, "client_id": self.client_id });
        write_frame(link.stream.as_mut(), Opcode::Handshake, &payload)?;

        let (opcode, response) = self.receive(link)?;
        if opcode != Opcode::Frame {
            return Err(ProtocolError::BadHandshake(format!(
                "expected FRAME, got {opcode:?}: {response}"
            ))
            .into());
        }
        if response.get("evt").and_then(Value::as_str) != Some("READY") {
            return Err(ProtocolError::BadHandshake(response.to_string()).into());
        }
        Ok(())
    }

    /// Sends CLOSE and wakes any exchange waiting on a reply.
    pub fn disconnect(&self) {
        let interrupt = self.interrupt.lock().take();
        if let Some(mut interrupt) = interrupt {
            // Best effort, the peer may already be gone
            let _ = write_frame(interrupt.stream.as_mut(), Opcode::Close, &json!({}));
            let _ = interrupt.frames.send(Err(TransportError::Closed.into()));
            let _ = interrupt.stream.shutdown();
            self.span
                .in_scope(|| tracing::info!("Disconnected from Discord"));
        }
        self.link.lock().take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn drop_link(&self, link: &mut Option<Link>) {
        *link = None;
        if let Some(interrupt) = self.interrupt.lock().take() {
            let _ = interrupt.stream.shutdown();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Writes one frame and waits for the immediate reply.
    fn exchange(&self, opcode: Opcode, payload: &Value) -> Result<(Opcode, Value)> {
        let mut guard = self.link.lock();
        let Some(link) = guard.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };

        let result = match drain_stale(&link.frames) {
            Some(e) => Err(e),
            None => write_frame(link.stream.as_mut(), opcode, payload)
                .and_then(|()| self.receive(link)),
        };

        match result {
            Ok((Opcode::Close, body)) => {
                self.drop_link(&mut guard);
                tracing::warn!("Discord closed the connection: {}", body);
                Err(TransportError::Closed.into())
            }
            Ok(frame) => Ok(frame),
            Err(e) => {
                if is_fatal(&e) {
                    self.drop_link(&mut guard);
                }
                Err(e)
            }
        }
    }

    fn set_activity(&self, activity: Value) -> Result<()> {
        let _enter = self.span.enter();
        let nonce = chrono::Utc::now().timestamp_millis().to_string();
        let command = json!({
            "cmd": "SET_ACTIVITY",
            "nonce": nonce,
            "args": {
                "pid": std::process::id(),
                "activity": activity,
            },
        });

        let (_, response) = self.exchange(Opcode::Frame, &command)?;
        if response.get("evt").and_then(Value::as_str) == Some("ERROR") {
            let message = response
                .pointer("/data/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ProtocolError::ApplicationError(message).into());
        }
        Ok(())
    }

    pub fn send_presence(&self, activity: &Value) -> Result<()> {
        self.set_activity(activity.clone())
    }

    pub fn clear_presence(&self) -> Result<()> {
        self.set_activity(Value::Null)
    }

    /// Succeeds only when the very next frame is a PONG.
    pub fn send_ping(&self) -> Result<()> {
        let _enter = self.span.enter();
        let (opcode, _) = self.exchange(Opcode::Ping, &json!({}))?;
        if opcode != Opcode::Pong {
            tracing::warn!("Unexpected reply to ping: {:?}", opcode);
            return Err(ProtocolError::UnexpectedOpcode {
                expected: Opcode::Pong as u32,
                actual: opcode as u32,
            }
            .into());
        }
        Ok(())
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::thread;

    fn spawn_server<F>(listener: UnixListener, handler: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(UnixStream) + Send + 'static,
    {
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handler(stream);
            }
        })
    }

    fn accept_handshake(stream: &mut UnixStream) {
        let (op, body) = read_frame(stream).unwrap();
        assert_eq!(op, Opcode::Handshake);
        assert_eq!(body["v"], 1);
        assert_eq!(body["client_id"], "123");
        write_frame(stream, Opcode::Frame, &json!({"cmd": "DISPATCH", "evt": "READY"})).unwrap();
    }

    #[test]
    fn frame_header_is_little_endian() {
        let frame = encode_frame(Opcode::Ping, b"{}").unwrap();
        assert_eq!(frame, vec![3, 0, 0, 0, 2, 0, 0, 0, b'{', b'}']);
    }

    #[test]
    fn truncated_frame_is_a_short_read() {
        let mut partial: &[u8] = &[1, 0, 0, 0, 10, 0, 0, 0, b'{'];
        let err = read_frame(&mut partial).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn rejects_empty_client_id() {
        assert!(IpcClient::with_endpoints(" ", vec![], tracing::Span::none()).is_err());
    }

    #[test]
    fn unix_candidates_prefer_runtime_dir() {
        let paths = endpoint_candidates(
            Some(PathBuf::from("/run/user/1000")),
            Some(PathBuf::from("/home/me")),
            1000,
        );
        assert_eq!(paths.len(), 12);
        assert_eq!(paths[0], PathBuf::from("/run/user/1000/discord-ipc-0"));
        assert!(paths.iter().all(|p| !p.starts_with("/home/me")));
        assert_eq!(paths[9], PathBuf::from("/run/user/1000/discord-ipc-9"));
        assert_eq!(
            paths[10],
            PathBuf::from("/run/user/1000/snap.discord/discord-ipc-0")
        );
        assert_eq!(
            paths[11],
            PathBuf::from("/run/user/1000/app/com.discordapp.Discord/discord-ipc-0")
        );
    }

    #[test]
    fn unix_candidates_fall_back_to_hidden_home_sockets() {
        let paths = endpoint_candidates(None, Some(PathBuf::from("/home/me")), 1000);
        assert_eq!(paths[0], PathBuf::from("/home/me/.discord-ipc-0"));
        assert_eq!(paths.len(), 12);
    }

    #[test]
    fn failed_handshake_moves_to_next_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let bad_path = dir.path().join("discord-ipc-0");
        let good_path = dir.path().join("discord-ipc-1");

        let bad = spawn_server(UnixListener::bind(&bad_path).unwrap(), |mut s| {
            let _ = read_frame(&mut s).unwrap();
            write_frame(&mut s, Opcode::Frame, &json!({"evt": "ERROR"})).unwrap();
        });
        let good = spawn_server(UnixListener::bind(&good_path).unwrap(), |mut s| {
            accept_handshake(&mut s);
        });

        let missing = dir.path().join("nothing-here");
        let client = IpcClient::with_endpoints(
            "123",
            vec![missing, bad_path, good_path],
            tracing::Span::none(),
        )
        .unwrap();
        client.connect().unwrap();
        assert!(client.is_connected());

        bad.join().unwrap();
        good.join().unwrap();
    }

    #[test]
    fn connect_fails_when_no_endpoint_answers() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::with_endpoints(
            "123",
            vec![dir.path().join("discord-ipc-0")],
            tracing::Span::none(),
        )
        .unwrap();
        assert!(client.connect().is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn ping_requires_pong_as_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discord-ipc-0");
        let server = spawn_server(UnixListener::bind(&path).unwrap(), |mut s| {
            accept_handshake(&mut s);

            let (op, _) = read_frame(&mut s).unwrap();
            assert_eq!(op, Opcode::Ping);
            write_frame(&mut s, Opcode::Pong, &json!({})).unwrap();

            let (op, _) = read_frame(&mut s).unwrap();
            assert_eq!(op, Opcode::Ping);
            write_frame(&mut s, Opcode::Frame, &json!({"evt": "READY"})).unwrap();
        });

        let client = IpcClient::with_endpoints("123", vec![path], tracing::Span::none()).unwrap();
        client.connect().unwrap();

        assert!(client.send_ping().is_ok());
        let err = client.send_ping().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::UnexpectedOpcode { expected: 4, actual: 1 })
        ));
        // Wrong opcode is not a transport failure
        assert!(client.is_connected());

        server.join().unwrap();
    }

    #[test]
    fn set_activity_reports_application_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discord-ipc-0");
        let server = spawn_server(UnixListener::bind(&path).unwrap(), |mut s| {
            accept_handshake(&mut s);

            let (op, body) = read_frame(&mut s).unwrap();
            assert_eq!(op, Opcode::Frame);
            assert_eq!(body["cmd"], "SET_ACTIVITY");
            assert_eq!(body["args"]["activity"]["details"], "Movie");
            assert!(body["nonce"].as_str().unwrap().parse::<i64>().is_ok());
            write_frame(&mut s, Opcode::Frame, &json!({"cmd": "SET_ACTIVITY", "evt": null}))
                .unwrap();

            let (_, body) = read_frame(&mut s).unwrap();
            assert!(body["args"]["activity"].is_null());
            write_frame(
                &mut s,
                Opcode::Frame,
                &json!({"evt": "ERROR", "data": {"code": 4000, "message": "bad activity"}}),
            )
            .unwrap();
        });

        let client = IpcClient::with_endpoints("123", vec![path], tracing::Span::none()).unwrap();
        client.connect().unwrap();
        client.send_presence(&json!({"details": "Movie"})).unwrap();

        let err = client.clear_presence().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::ApplicationError(ref m)) if m == "bad activity"
        ));

        server.join().unwrap();
    }

    #[test]
    fn peer_hangup_marks_client_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discord-ipc-0");
        let server = spawn_server(UnixListener::bind(&path).unwrap(), |mut s| {
            accept_handshake(&mut s);
            drop(s);
        });

        let client = IpcClient::with_endpoints("123", vec![path], tracing::Span::none()).unwrap();
        client.connect().unwrap();
        server.join().unwrap();

        assert!(client.send_ping().is_err());
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_ping().unwrap_err(),
            BridgeError::Transport(TransportError::NotConnected)
        ));
    }
}

#[cfg(test)]
mod stalled_peer_tests {
    use super::*;
    use parking_lot::Condvar;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct PipeState {
        inbound: VecDeque<u8>,
        written: Vec<u8>,
    }

    /// Reads block until bytes are queued, and nothing can interrupt them,
    /// the way a named pipe behaves when the peer stops answering.
    #[derive(Clone, Default)]
    struct SilentPipe {
        state: Arc<(Mutex<PipeState>, Condvar)>,
    }

    impl SilentPipe {
        fn ready() -> Self {
            let pipe = Self::default();
            let ready = serde_json::to_vec(&json!({"evt": "READY"})).unwrap();
            let frame = encode_frame(Opcode::Frame, &ready).unwrap();
            pipe.state.0.lock().inbound.extend(frame);
            pipe
        }

        fn written_opcodes(&self) -> Vec<Opcode> {
            let written = self.state.0.lock().written.clone();
            let mut remaining = written.as_slice();
            let mut opcodes = Vec::new();
            while !remaining.is_empty() {
                opcodes.push(read_frame(&mut remaining).unwrap().0);
            }
            opcodes
        }
    }

    impl Read for SilentPipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let (lock, cvar) = &*self.state;
            let mut state = lock.lock();
            while state.inbound.is_empty() {
                cvar.wait(&mut state);
            }
            let n = buf.len().min(state.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for SilentPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.state.0.lock().written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl IpcStream for SilentPipe {
        fn try_clone_stream(&self) -> std::io::Result<Box<dyn IpcStream>> {
            Ok(Box::new(self.clone()))
        }

        fn shutdown(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client() -> IpcClient {
        IpcClient::with_endpoints("123", vec![], tracing::Span::none()).unwrap()
    }

    #[test]
    fn disconnect_wakes_a_pending_ping() {
        let pipe = SilentPipe::ready();
        let client = Arc::new(client());
        client.attach(Box::new(pipe.clone())).unwrap();
        assert!(client.is_connected());

        let pinger = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.send_ping())
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pipe.written_opcodes().contains(&Opcode::Ping) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        client.disconnect();
        let result = pinger.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(BridgeError::Transport(TransportError::Closed))
        ));
        assert!(!client.is_connected());
        assert_eq!(
            pipe.written_opcodes(),
            vec![Opcode::Handshake, Opcode::Ping, Opcode::Close]
        );
    }

    #[test]
    fn silent_peer_times_out_and_drops_the_link() {
        let client = client().with_reply_timeout(Duration::from_millis(100));
        client.attach(Box::new(SilentPipe::ready())).unwrap();

        let err = client.send_ping().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::Timeout(_))
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn handshake_without_reply_is_bounded() {
        let client = client().with_reply_timeout(Duration::from_millis(100));
        let started = Instant::now();
        assert!(client.attach(Box::new(SilentPipe::default())).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!client.is_connected());
    }
}
