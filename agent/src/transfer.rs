//! Direct peer-to-peer file transfers.
//!
//! A transfer is a consent-mediated TCP byte stream: the sender announces a
//! request over signaling, the receiver accepts and dials the sender's
//! well-known port, writes the 36-byte session id, and streams the payload in
//! fixed-size chunks with no further framing. Authentication at this layer is
//! by session-id possession.
//!
//! Locks are never held across I/O: every loop acquires the session map just
//! long enough to read status or bump the byte counter, then releases it
//! before touching the socket or the disk. Cancellation is observed at chunk
//! boundaries.

use crate::{
    signaler::{HubSignaler, Signaler},
    TransferError,
};
use goconnect_shared::{
    signal::{Envelope, SignalHub, SignalPayload, TransferRequest},
    unix_now, TransferDirection, TransferStatus, DIAL_TIMEOUT, PENDING_REQUEST_TTL,
    SESSION_ID_LEN, TRANSFER_CHUNK_SIZE, TRANSFER_PORT,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use uuid::Uuid;

/// Buffered snapshots per subscriber; overflow drops the update rather than
/// blocking the transfer loop.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub peer_id: String,
    /// Source path on the sender, destination path on the receiver.
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub direction: TransferDirection,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub error: Option<String>,
}

impl Session {
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            0.0
        } else {
            self.transferred_bytes as f64 / self.file_size as f64
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    StartTime,
    EndTime,
    FileSize,
    Progress,
    FileName,
}

#[derive(Clone, Debug)]
pub struct ListOptions {
    /// Keep only these statuses; empty means all.
    pub statuses: Vec<TransferStatus>,
    pub direction: Option<TransferDirection>,
    pub peer_id: Option<String>,
    pub sort: SortKey,
    pub ascending: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            direction: None,
            peer_id: None,
            sort: SortKey::StartTime,
            ascending: false,
            offset: 0,
            limit: None,
        }
    }
}

type RequestCallback = Box<dyn Fn(&TransferRequest, &str) + Send + Sync>;

struct PendingRequest {
    request: TransferRequest,
    from: String,
    timer: JoinHandle<()>,
}

struct Inner {
    device_id: String,
    signaler: Arc<dyn Signaler>,
    pending_ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    subscribers: Mutex<Vec<mpsc::Sender<Session>>>,
    on_request: Mutex<Option<RequestCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Inner {
    fn status_of(&self, id: &str) -> Option<TransferStatus> {
        self.sessions.read().get(id).map(|session| session.status)
    }

    /// Transition a session. Terminal statuses are sticky: once a session
    /// completes, fails, or is cancelled, later transitions are ignored.
    fn set_status(&self, id: &str, status: TransferStatus, error: Option<String>) {
        let snapshot = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            if session.status.is_terminal() {
                return;
            }
            session.status = status;
            if status.is_terminal() {
                session.ended_at = Some(unix_now());
                session.error = error;
            }
            session.clone()
        };
        log::debug!("transfer {}: status {}", id, snapshot.status);
        self.notify(snapshot);
    }

    fn bump_progress(&self, id: &str, bytes: u64) -> u64 {
        let snapshot = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(id) else {
                return 0;
            };
            session.transferred_bytes += bytes;
            session.clone()
        };
        let transferred = snapshot.transferred_bytes;
        self.notify(snapshot);
        transferred
    }

    fn notify(&self, snapshot: Session) {
        self.subscribers.lock().retain(|tx| {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => true,
                // Slow subscribers miss updates instead of stalling transfers.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// The per-device transfer manager: sender-side listener, receiver-side
/// dialer, session map, pending inbound requests, and subscriber fan-out.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(device_id: impl Into<String>, signaler: Arc<dyn Signaler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                signaler,
                pending_ttl: PENDING_REQUEST_TTL,
                sessions: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                on_request: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Wire a manager to an in-process signaling hub: outgoing payloads go
    /// through it, and incoming ones are pumped into [`Self::handle_signal`].
    /// Must be called within a tokio runtime.
    pub fn connect_hub(device_id: &str, hub: &SignalHub) -> Self {
        let manager = Self::new(device_id, Arc::new(HubSignaler::new(hub.clone(), device_id)));
        manager.spawn_signal_loop(hub.subscribe(device_id));
        manager
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Bind the sender-side listener and start accepting connections. Each
    /// connection gets its own task that reads the session id and streams the
    /// file. Returns the bound address (useful with port 0).
    pub async fn start(&self, bind: SocketAddr) -> Result<SocketAddr, TransferError> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        log::info!("transfer listener bound on {local_addr}");

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("transfer accept failed: {e}");
                        continue;
                    },
                };
                let Some(inner) = weak.upgrade() else { break };
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::spawn(serve_connection(inner, stream, remote));
            }
        });
        self.inner.tasks.lock().push(handle);
        Ok(local_addr)
    }

    /// Pump a stream of incoming signaling envelopes into the manager.
    pub fn spawn_signal_loop(&self, mut incoming: mpsc::Receiver<Envelope>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = incoming.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Manager { inner }.handle_signal(envelope);
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    /// React to one signaling payload addressed to this device.
    pub fn handle_signal(&self, envelope: Envelope) {
        match envelope.payload {
            SignalPayload::TransferRequest(request) => {
                self.store_pending(envelope.from, request);
            },
            SignalPayload::TransferReject { id } => {
                log::info!("peer rejected transfer {id}");
                self.inner
                    .set_status(&id, TransferStatus::Cancelled, Some("rejected by peer".to_string()));
            },
            SignalPayload::TransferCancel { id } => {
                log::info!("peer cancelled transfer {id}");
                self.inner
                    .set_status(&id, TransferStatus::Cancelled, Some("cancelled by peer".to_string()));
            },
        }
    }

    fn store_pending(&self, from: String, request: TransferRequest) {
        let id = request.id.clone();
        let ttl = self.inner.pending_ttl;
        let weak = Arc::downgrade(&self.inner);
        let expiring = id.clone();
        // Unanswered requests are silently dropped once the timer fires.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                if inner.pending.lock().remove(&expiring).is_some() {
                    log::debug!("transfer request {expiring} expired unanswered");
                }
            }
        });

        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                request: request.clone(),
                from: from.clone(),
                timer,
            },
        );
        if let Some(callback) = &*self.inner.on_request.lock() {
            callback(&request, &from);
        }
    }

    /// Register the callback invoked when a transfer request arrives.
    pub fn on_request(&self, callback: impl Fn(&TransferRequest, &str) + Send + Sync + 'static) {
        *self.inner.on_request.lock() = Some(Box::new(callback));
    }

    /// Offer a file to a peer. Validates the path, mints a session, and
    /// announces the request over signaling (best-effort).
    pub fn create_send_session(
        &self,
        peer_id: &str,
        file_path: impl AsRef<Path>,
    ) -> Result<Session, TransferError> {
        let path = file_path.as_ref();
        let metadata =
            std::fs::metadata(path).map_err(|_| TransferError::NotAFile(path.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(path.to_path_buf()));
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let session = Session {
            id: Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            file_path: path.to_path_buf(),
            file_name: file_name.clone(),
            file_size: metadata.len(),
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            direction: TransferDirection::Sender,
            started_at: unix_now(),
            ended_at: None,
            error: None,
        };
        self.inner
            .sessions
            .write()
            .insert(session.id.clone(), session.clone());

        let delivered = self.inner.signaler.send(
            peer_id,
            SignalPayload::TransferRequest(TransferRequest {
                id: session.id.clone(),
                file_name,
                file_size: session.file_size,
            }),
        );
        if !delivered {
            log::warn!("transfer request {} not delivered to {}", session.id, peer_id);
        }
        Ok(session)
    }

    /// Accept a pending inbound request, installing the mirror session. The
    /// destination's parent directory must already exist.
    pub fn create_receive_session(
        &self,
        request_id: &str,
        save_path: impl AsRef<Path>,
    ) -> Result<Session, TransferError> {
        let save_path = save_path.as_ref();
        let save_dir = match save_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !save_dir.is_dir() {
            return Err(TransferError::NoSaveDir(save_dir));
        }

        let PendingRequest {
            request,
            from,
            timer,
        } = self
            .inner
            .pending
            .lock()
            .remove(request_id)
            .ok_or(TransferError::NotFound)?;
        timer.abort();

        let session = Session {
            id: request.id,
            peer_id: from,
            file_path: save_path.to_path_buf(),
            file_name: request.file_name,
            file_size: request.file_size,
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            direction: TransferDirection::Receiver,
            started_at: unix_now(),
            ended_at: None,
            error: None,
        };
        self.inner
            .sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Dial the sender on the well-known transfer port and pull the file.
    pub fn start_download(&self, session_id: &str, sender_ip: IpAddr) -> Result<(), TransferError> {
        self.start_download_from(session_id, SocketAddr::new(sender_ip, TRANSFER_PORT))
    }

    /// Like [`Self::start_download`] with an explicit address, for setups
    /// where the sender listens off the default port.
    pub fn start_download_from(
        &self,
        session_id: &str,
        addr: SocketAddr,
    ) -> Result<(), TransferError> {
        let (id, path) = {
            let sessions = self.inner.sessions.read();
            let session = sessions.get(session_id).ok_or(TransferError::NotFound)?;
            if session.direction != TransferDirection::Receiver
                || session.status != TransferStatus::Pending
            {
                return Err(TransferError::InvalidState);
            }
            (session.id.clone(), session.file_path.clone())
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = download(&inner, &id, &path, addr).await {
                log::warn!("download {id} failed: {e}");
                inner.set_status(&id, TransferStatus::Failed, Some(e.to_string()));
            }
        });
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    /// Refuse a pending inbound request, or cancel a still-pending session
    /// minted from one. Unknown ids fail with `NotFound`.
    pub fn reject_transfer(&self, id: &str) -> Result<(), TransferError> {
        if let Some(PendingRequest { from, timer, .. }) = self.inner.pending.lock().remove(id) {
            timer.abort();
            self.inner
                .signaler
                .send(&from, SignalPayload::TransferReject { id: id.to_string() });
            return Ok(());
        }

        let peer_id = {
            let sessions = self.inner.sessions.read();
            let session = sessions.get(id).ok_or(TransferError::NotFound)?;
            (session.status == TransferStatus::Pending).then(|| session.peer_id.clone())
        };
        if let Some(peer_id) = peer_id {
            self.inner
                .set_status(id, TransferStatus::Cancelled, Some("rejected by user".to_string()));
            self.inner
                .signaler
                .send(&peer_id, SignalPayload::TransferReject { id: id.to_string() });
        }
        Ok(())
    }

    /// Cancel any non-terminal session. In-flight streams observe the change
    /// at their next chunk boundary. Terminal sessions are left untouched.
    pub fn cancel_transfer(&self, id: &str) -> Result<(), TransferError> {
        let peer_id = {
            let sessions = self.inner.sessions.read();
            let session = sessions.get(id).ok_or(TransferError::NotFound)?;
            (!session.status.is_terminal()).then(|| session.peer_id.clone())
        };
        if let Some(peer_id) = peer_id {
            self.inner
                .set_status(id, TransferStatus::Cancelled, Some("cancelled by user".to_string()));
            self.inner
                .signaler
                .send(&peer_id, SignalPayload::TransferCancel { id: id.to_string() });
        }
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Inbound requests awaiting an answer.
    pub fn pending_requests(&self) -> Vec<TransferRequest> {
        self.inner
            .pending
            .lock()
            .values()
            .map(|pending| pending.request.clone())
            .collect()
    }

    pub fn list_sessions(&self, options: &ListOptions) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|session| {
                (options.statuses.is_empty() || options.statuses.contains(&session.status))
                    && options
                        .direction
                        .map_or(true, |direction| session.direction == direction)
                    && options
                        .peer_id
                        .as_deref()
                        .map_or(true, |peer| session.peer_id == peer)
            })
            .cloned()
            .collect();

        sessions.sort_by(|a, b| {
            let ordering = match options.sort {
                SortKey::StartTime => a.started_at.cmp(&b.started_at),
                SortKey::EndTime => a.ended_at.cmp(&b.ended_at),
                SortKey::FileSize => a.file_size.cmp(&b.file_size),
                SortKey::Progress => a
                    .progress()
                    .partial_cmp(&b.progress())
                    .unwrap_or(std::cmp::Ordering::Equal),
                SortKey::FileName => a.file_name.cmp(&b.file_name),
            }
            .then_with(|| a.id.cmp(&b.id));
            if options.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });

        sessions
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Sessions still pending or in flight.
    pub fn active_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .values()
            .filter(|session| !session.status.is_terminal())
            .count()
    }

    /// Drop terminal sessions that ended before `now - older_than`.
    /// Non-terminal sessions are never removed here.
    pub fn cleanup_old(&self, older_than: Duration) -> usize {
        let cutoff = unix_now().saturating_sub(older_than.as_secs());
        let mut sessions = self.inner.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| {
            !(session.status.is_terminal()
                && session.ended_at.map_or(false, |ended| ended < cutoff))
        });
        before - sessions.len()
    }

    /// Receive a snapshot after every progress update. Slow subscribers miss
    /// intermediate snapshots; poll [`Self::get_session`] for ground truth.
    pub fn subscribe(&self) -> mpsc::Receiver<Session> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Close the listener, cancel pending-request timers, and finalize every
    /// outstanding session as cancelled.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for (_, pending) in self.inner.pending.lock().drain() {
            pending.timer.abort();
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        let outstanding: Vec<String> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|session| !session.status.is_terminal())
            .map(|session| session.id.clone())
            .collect();
        for id in outstanding {
            self.inner
                .set_status(&id, TransferStatus::Cancelled, Some("manager stopped".to_string()));
        }
        log::info!("transfer manager for {} stopped", self.inner.device_id);
    }
}

/// Sender side of one inbound connection: read the 36-byte session id, then
/// stream the file. Unknown ids and wrong-direction sessions get the
/// connection closed immediately.
async fn serve_connection(inner: Arc<Inner>, mut stream: TcpStream, remote: SocketAddr) {
    let mut id_buf = [0u8; SESSION_ID_LEN];
    if stream.read_exact(&mut id_buf).await.is_err() {
        return;
    }
    let Ok(id) = std::str::from_utf8(&id_buf) else {
        return;
    };

    let path = {
        let sessions = inner.sessions.read();
        match sessions.get(id) {
            Some(session)
                if session.direction == TransferDirection::Sender
                    && !session.status.is_terminal() =>
            {
                session.file_path.clone()
            },
            _ => {
                log::debug!("closing connection from {remote}: no sendable session {id}");
                return;
            },
        }
    };

    inner.set_status(id, TransferStatus::InProgress, None);
    if let Err(e) = stream_file(&inner, id, &path, &mut stream).await {
        log::warn!("sending {id} failed: {e}");
        inner.set_status(id, TransferStatus::Failed, Some(e.to_string()));
    }
}

async fn stream_file(
    inner: &Arc<Inner>,
    id: &str,
    path: &Path,
    stream: &mut TcpStream,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    loop {
        if inner.status_of(id) != Some(TransferStatus::InProgress) {
            log::info!("transfer {id} interrupted at chunk boundary");
            return Ok(());
        }
        let read = file.read(&mut buf).await?;
        if read == 0 {
            inner.set_status(id, TransferStatus::Completed, None);
            return Ok(());
        }
        stream.write_all(&buf[..read]).await?;
        inner.bump_progress(id, read as u64);
    }
}

/// Receiver side: dial, identify, pull chunks to disk, verify the byte count.
async fn download(
    inner: &Arc<Inner>,
    id: &str,
    path: &Path,
    addr: SocketAddr,
) -> Result<(), TransferError> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::DialTimeout(addr))??;
    stream.write_all(id.as_bytes()).await?;
    inner.set_status(id, TransferStatus::InProgress, None);

    let expected = inner
        .sessions
        .read()
        .get(id)
        .map(|session| session.file_size)
        .unwrap_or_default();
    let mut file = tokio::fs::File::create(path).await?;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];

    loop {
        if inner.status_of(id) != Some(TransferStatus::InProgress) {
            log::info!("download {id} interrupted at chunk boundary");
            return Ok(());
        }
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            let transferred = inner
                .sessions
                .read()
                .get(id)
                .map(|session| session.transferred_bytes)
                .unwrap_or_default();
            if transferred == expected {
                inner.set_status(id, TransferStatus::Completed, None);
            } else {
                inner.set_status(
                    id,
                    TransferStatus::Failed,
                    Some("incomplete transfer".to_string()),
                );
            }
            return Ok(());
        }
        file.write_all(&buf[..read]).await?;
        if inner.bump_progress(id, read as u64) >= expected {
            file.flush().await?;
            inner.set_status(id, TransferStatus::Completed, None);
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct NullSignaler;

    impl Signaler for NullSignaler {
        fn send(&self, _to: &str, _payload: SignalPayload) -> bool {
            false
        }
    }

    fn lone_manager(device_id: &str) -> Manager {
        Manager::new(device_id, Arc::new(NullSignaler))
    }

    fn request(id: &str, size: u64) -> Envelope {
        Envelope {
            from: "far-end".to_string(),
            payload: SignalPayload::TransferRequest(TransferRequest {
                id: id.to_string(),
                file_name: "payload.bin".to_string(),
                file_size: size,
            }),
        }
    }

    async fn wait_terminal(manager: &Manager, id: &str) -> Session {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(session) = manager.get_session(id) {
                    if session.status.is_terminal() {
                        return session;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transfer did not finish in time")
    }

    #[tokio::test]
    async fn test_end_to_end_transfer() -> Result<()> {
        let hub = SignalHub::new();
        let sender = Manager::connect_hub("dev-a", &hub);
        let receiver = Manager::connect_hub("dev-b", &hub);

        let (request_tx, mut request_rx) = mpsc::channel(1);
        receiver.on_request(move |request, from| {
            let _ = request_tx.try_send((request.clone(), from.to_string()));
        });

        let dir = tempfile::tempdir()?;
        let source = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data)?;

        let addr = sender.start("127.0.0.1:0".parse()?).await?;
        let session = sender.create_send_session("dev-b", &source)?;
        assert_eq!(session.status, TransferStatus::Pending);
        assert_eq!(session.file_size, 100_000);

        let (incoming, from) = request_rx.recv().await.unwrap();
        assert_eq!(from, "dev-a");
        assert_eq!(incoming.id, session.id);
        assert_eq!(incoming.file_size, 100_000);

        let destination = dir.path().join("incoming.bin");
        let mirror = receiver.create_receive_session(&incoming.id, &destination)?;
        assert_eq!(mirror.direction, TransferDirection::Receiver);

        let mut updates = receiver.subscribe();
        receiver.start_download_from(&mirror.id, addr)?;

        let finished = wait_terminal(&receiver, &mirror.id).await;
        assert_eq!(finished.status, TransferStatus::Completed);
        assert_eq!(finished.transferred_bytes, 100_000);

        let sent = wait_terminal(&sender, &session.id).await;
        assert_eq!(sent.status, TransferStatus::Completed);
        assert_eq!(sent.transferred_bytes, 100_000);

        assert_eq!(std::fs::read(&destination)?, data);

        // Subscribers saw a monotonic byte counter ending at the full size.
        let mut last = 0;
        let mut final_bytes = 0;
        while let Ok(snapshot) = updates.try_recv() {
            assert!(snapshot.transferred_bytes >= last);
            last = snapshot.transferred_bytes;
            final_bytes = snapshot.transferred_bytes;
        }
        assert_eq!(final_bytes, 100_000);

        sender.stop();
        receiver.stop();
        Ok(())
    }

    #[tokio::test]
    async fn test_reject_flow_cancels_sender_session() -> Result<()> {
        let hub = SignalHub::new();
        let sender = Manager::connect_hub("dev-a", &hub);
        let receiver = Manager::connect_hub("dev-b", &hub);

        let dir = tempfile::tempdir()?;
        let source = dir.path().join("unwanted.bin");
        std::fs::write(&source, b"some bytes")?;

        let session = sender.create_send_session("dev-b", &source)?;

        // Wait until the request lands on the receiver.
        tokio::time::timeout(Duration::from_secs(5), async {
            while receiver.pending_requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        receiver.reject_transfer(&session.id)?;
        assert!(receiver.pending_requests().is_empty());

        let rejected = wait_terminal(&sender, &session.id).await;
        assert_eq!(rejected.status, TransferStatus::Cancelled);
        assert_eq!(rejected.error.as_deref(), Some("rejected by peer"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_semantics() -> Result<()> {
        let manager = lone_manager("dev-a");
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("f.bin");
        std::fs::write(&source, b"payload")?;

        assert!(matches!(
            manager.cancel_transfer("nonexistent"),
            Err(TransferError::NotFound)
        ));

        let session = manager.create_send_session("dev-b", &source)?;
        manager.cancel_transfer(&session.id)?;
        let cancelled = manager.get_session(&session.id).unwrap();
        assert_eq!(cancelled.status, TransferStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled by user"));
        assert!(cancelled.ended_at.is_some());

        // Terminal statuses are sticky; a second cancel keeps the first reason.
        manager.cancel_transfer(&session.id)?;
        assert_eq!(
            manager.get_session(&session.id).unwrap().error.as_deref(),
            Some("cancelled by user")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_send_session_requires_regular_file() -> Result<()> {
        let manager = lone_manager("dev-a");
        let dir = tempfile::tempdir()?;

        assert!(matches!(
            manager.create_send_session("dev-b", dir.path()),
            Err(TransferError::NotAFile(_))
        ));
        assert!(matches!(
            manager.create_send_session("dev-b", dir.path().join("missing.bin")),
            Err(TransferError::NotAFile(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_receive_session_requires_save_dir() -> Result<()> {
        let manager = lone_manager("dev-a");
        manager.handle_signal(request("r1", 10));

        assert!(matches!(
            manager.create_receive_session("r1", "/definitely/not/a/dir/file.bin"),
            Err(TransferError::NoSaveDir(_))
        ));

        // The request is still pending after the failed accept.
        assert_eq!(manager.pending_requests().len(), 1);

        assert!(matches!(
            manager.create_receive_session("unknown", std::env::temp_dir().join("x.bin")),
            Err(TransferError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_session_closes_connection() -> Result<()> {
        let manager = lone_manager("dev-a");
        let addr = manager.start("127.0.0.1:0".parse()?).await?;

        let mut stream = TcpStream::connect(addr).await?;
        let bogus = Uuid::new_v4().to_string();
        stream.write_all(bogus.as_bytes()).await?;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;
        assert_eq!(read, 0);

        manager.stop();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_request_expires_after_ttl() {
        let manager = lone_manager("dev-a");
        manager.handle_signal(request("r1", 10));
        assert_eq!(manager.pending_requests().len(), 1);

        tokio::time::sleep(PENDING_REQUEST_TTL + Duration::from_secs(1)).await;
        assert!(manager.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_list_filter_sort_paginate() -> Result<()> {
        let manager = lone_manager("dev-a");

        let seed = |id: &str, peer: &str, status, direction, started, size, done| Session {
            id: id.to_string(),
            peer_id: peer.to_string(),
            file_path: PathBuf::from("/tmp/x"),
            file_name: format!("{id}.bin"),
            file_size: size,
            transferred_bytes: done,
            status,
            direction,
            started_at: started,
            ended_at: None,
            error: None,
        };
        {
            let mut sessions = manager.inner.sessions.write();
            for session in [
                seed("a", "p1", TransferStatus::Completed, TransferDirection::Sender, 100, 50, 50),
                seed("b", "p2", TransferStatus::InProgress, TransferDirection::Sender, 200, 100, 25),
                seed("c", "p1", TransferStatus::Pending, TransferDirection::Receiver, 300, 80, 0),
                seed("d", "p3", TransferStatus::Failed, TransferDirection::Receiver, 400, 10, 5),
            ] {
                sessions.insert(session.id.clone(), session);
            }
        }

        // Default sort: start time, newest first.
        let all = manager.list_sessions(&ListOptions::default());
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["d", "c", "b", "a"]);

        let senders = manager.list_sessions(&ListOptions {
            direction: Some(TransferDirection::Sender),
            ..Default::default()
        });
        assert_eq!(senders.len(), 2);

        let p1 = manager.list_sessions(&ListOptions {
            peer_id: Some("p1".to_string()),
            ..Default::default()
        });
        assert_eq!(p1.len(), 2);

        let active = manager.list_sessions(&ListOptions {
            statuses: vec![TransferStatus::Pending, TransferStatus::InProgress],
            ..Default::default()
        });
        assert_eq!(active.len(), 2);
        assert_eq!(manager.active_count(), 2);

        // Progress sort ascending: c (0.0) < b (0.25) < d (0.5) < a (1.0).
        let by_progress = manager.list_sessions(&ListOptions {
            sort: SortKey::Progress,
            ascending: true,
            ..Default::default()
        });
        let ids: Vec<_> = by_progress.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "d", "a"]);

        let page = manager.list_sessions(&ListOptions {
            offset: 1,
            limit: Some(2),
            ..Default::default()
        });
        let ids: Vec<_> = page.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_sessions() -> Result<()> {
        let manager = lone_manager("dev-a");
        {
            let mut sessions = manager.inner.sessions.write();
            let mut old_done = Session {
                id: "old".to_string(),
                peer_id: "p".to_string(),
                file_path: PathBuf::from("/tmp/x"),
                file_name: "old.bin".to_string(),
                file_size: 10,
                transferred_bytes: 10,
                status: TransferStatus::Completed,
                direction: TransferDirection::Sender,
                started_at: unix_now() - 9_000,
                ended_at: Some(unix_now() - 8_000),
                error: None,
            };
            sessions.insert(old_done.id.clone(), old_done.clone());

            old_done.id = "fresh".to_string();
            old_done.ended_at = Some(unix_now());
            sessions.insert(old_done.id.clone(), old_done.clone());

            old_done.id = "running".to_string();
            old_done.status = TransferStatus::InProgress;
            old_done.ended_at = None;
            sessions.insert(old_done.id.clone(), old_done);
        }

        assert_eq!(manager.cleanup_old(Duration::from_secs(3_600)), 1);
        assert!(manager.get_session("old").is_none());
        assert!(manager.get_session("fresh").is_some());
        assert!(manager.get_session("running").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_length_file_transfers_cleanly() -> Result<()> {
        let hub = SignalHub::new();
        let sender = Manager::connect_hub("dev-a", &hub);
        let receiver = Manager::connect_hub("dev-b", &hub);

        let dir = tempfile::tempdir()?;
        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"")?;

        let addr = sender.start("127.0.0.1:0".parse()?).await?;
        let session = sender.create_send_session("dev-b", &source)?;

        tokio::time::timeout(Duration::from_secs(5), async {
            while receiver.pending_requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        let destination = dir.path().join("empty-out.bin");
        let mirror = receiver.create_receive_session(&session.id, &destination)?;
        receiver.start_download_from(&mirror.id, addr)?;

        let finished = wait_terminal(&receiver, &mirror.id).await;
        assert_eq!(finished.status, TransferStatus::Completed);
        assert_eq!(finished.transferred_bytes, 0);
        assert_eq!(finished.progress(), 0.0);

        sender.stop();
        receiver.stop();
        Ok(())
    }
}
