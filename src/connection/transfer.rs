//! # File Transfer
//!
//! Chunked file transfer under a per-direction file ID namespace shared with
//! objects.
//!
//! ## Outgoing
//! A file is announced with a HEADER parcel carrying its declared length and
//! optional remote path, then streamed in parcel-sized fragments. Every
//! fragment carries the cumulative length sent so far and the running CRC-32
//! of all bytes so far. The sender learns the outcome through FILE-CONFIRM,
//! FILE-FAIL or FILE-ABORT.
//!
//! ## Incoming
//! Fragments are written to a temp file while length and CRC are checked.
//! On completion the temp file is moved under the file root when the sender
//! gave a safe relative path; pathless files stay where they are.
//!
//! ## Outcomes (receiving side)
//! | Situation                             | Event                       | Reply        |
//! |---------------------------------------|-----------------------------|--------------|
//! | pathless file complete                | RECEIVED (temp file)        | FILE-CONFIRM |
//! | path + root, move succeeded           | RECEIVED (destination)      | FILE-CONFIRM |
//! | path without root, or move failed     | RECEIVED (temp, with cause) | FILE-FAIL    |
//! | temp file create/write failed         | FAILED                      | FILE-FAIL    |
//! | CRC mismatch, overrun, premature end  | ABORTED                     | FILE-ABORT   |

use crate::config::MAX_FILE_LENGTH;
use crate::connection::event::{Direction, TransmissionEvent, TransmissionKind};
use crate::core::parcel::{flags, Parcel, ParcelKind, Priority};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::signal::Signal;
use bytes::Bytes;
use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

static FILE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Payload of a file HEADER parcel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileAnnouncement {
    pub(crate) remote_path: Option<String>,
}

/// Lifecycle of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Incoming,
    Receiving,
    Received,
    Confirmed,
    Aborted,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Received
                | TransferState::Confirmed
                | TransferState::Aborted
                | TransferState::Failed
        )
    }
}

/// Build the HEADER parcel announcing a file
pub fn announcement_parcel(
    file_id: u64,
    priority: Priority,
    remote_path: Option<String>,
    length: u64,
) -> Result<Parcel> {
    let body = bincode::serialize(&FileAnnouncement { remote_path })?;
    let mut parcel_flags = flags::HEADER;
    if length == 0 {
        parcel_flags |= flags::FINAL;
    }
    Ok(Parcel {
        kind: ParcelKind::File,
        priority,
        flags: parcel_flags,
        object_id: file_id,
        sequence: 0,
        extent: length,
        checksum: 0,
        payload: Bytes::from(body),
    })
}

/// Build one data fragment of a file
pub fn fragment_parcel(
    file_id: u64,
    priority: Priority,
    sequence: u32,
    cumulative: u64,
    checksum: u32,
    is_final: bool,
    payload: Bytes,
) -> Parcel {
    Parcel {
        kind: ParcelKind::File,
        priority,
        flags: if is_final { flags::FINAL } else { 0 },
        object_id: file_id,
        sequence,
        extent: cumulative,
        checksum,
        payload,
    }
}

/// Key preventing two concurrent transfers to the same target
pub(crate) fn target_slot(path: &Path, remote_path: Option<&str>) -> String {
    match remote_path {
        Some(remote) => format!("remote:{remote}"),
        None => format!("local:{}", path.display()),
    }
}

/// Resolve a sender-supplied relative path under the file root
///
/// Absolute paths and paths leaving the root are refused.
pub fn resolve_destination(root: &Path, remote_path: &str) -> Result<PathBuf> {
    let normalized = remote_path.replace('\\', "/");
    let relative = Path::new(&normalized);
    if normalized.is_empty() || relative.is_absolute() || normalized.starts_with('/') {
        return Err(ProtocolError::InsufficientStorage(
            constants::ERR_PATH_OUTSIDE_ROOT.into(),
        ));
    }

    let mut destination = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                destination.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => {
                return Err(ProtocolError::InsufficientStorage(
                    constants::ERR_PATH_OUTSIDE_ROOT.into(),
                ))
            }
        }
    }

    if depth == 0 {
        return Err(ProtocolError::InsufficientStorage(
            constants::ERR_PATH_OUTSIDE_ROOT.into(),
        ));
    }
    Ok(destination)
}

/// Bookkeeping of a file this side is sending
#[derive(Debug)]
pub(crate) struct OutgoingTransfer {
    pub(crate) file_id: u64,
    pub(crate) path: PathBuf,
    pub(crate) remote_path: Option<String>,
    pub(crate) length: u64,
    pub(crate) transmitted: u64,
    started: Instant,
    slot: String,
}

impl OutgoingTransfer {
    pub(crate) fn new(
        file_id: u64,
        path: PathBuf,
        remote_path: Option<String>,
        length: u64,
    ) -> Self {
        let slot = target_slot(&path, remote_path.as_deref());
        Self {
            file_id,
            path,
            remote_path,
            length,
            transmitted: 0,
            started: Instant::now(),
            slot,
        }
    }

    pub(crate) fn event(
        &self,
        kind: TransmissionKind,
        cause: Option<ProtocolError>,
    ) -> TransmissionEvent {
        TransmissionEvent {
            kind,
            direction: Direction::Outgoing,
            file_id: self.file_id,
            duration: self.started.elapsed(),
            transmitted: self.transmitted,
            expected: self.length,
            remote_path: self.remote_path.clone(),
            file: Some(self.path.clone()),
            has_destination: false,
            cause: cause.map(Arc::new),
        }
    }
}

/// Outgoing transfers that have not reached a terminal state
#[derive(Debug, Default)]
pub(crate) struct OutgoingTransfers {
    active: HashMap<u64, OutgoingTransfer>,
}

impl OutgoingTransfers {
    pub(crate) fn slot_busy(&self, slot: &str) -> bool {
        self.active.values().any(|t| t.slot == slot)
    }

    pub(crate) fn insert(&mut self, transfer: OutgoingTransfer) {
        self.active.insert(transfer.file_id, transfer);
    }

    pub(crate) fn get_mut(&mut self, file_id: u64) -> Option<&mut OutgoingTransfer> {
        self.active.get_mut(&file_id)
    }

    pub(crate) fn remove(&mut self, file_id: u64) -> Option<OutgoingTransfer> {
        self.active.remove(&file_id)
    }

    pub(crate) fn drain(&mut self) -> Vec<OutgoingTransfer> {
        self.active.drain().map(|(_, t)| t).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}

/// Open source file of an outgoing transfer, owned by the sender task
pub(crate) struct FileReader {
    file: File,
    digest: Digest<'static, u32>,
    position: u64,
}

impl FileReader {
    pub(crate) async fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path).await?,
            digest: FILE_CRC.digest(),
            position: 0,
        })
    }

    /// Read the next `len` bytes, returning them with the running CRC
    pub(crate) async fn read_chunk(&mut self, offset: u64, len: usize) -> io::Result<(Bytes, u32)> {
        if offset != self.position {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Chunk at {offset} requested, reader is at {}", self.position),
            ));
        }
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        self.digest.update(&buf);
        self.position += len as u64;
        Ok((Bytes::from(buf), self.digest.clone().finalize()))
    }
}

/// What the receiver must do after handling a file parcel
#[derive(Debug, Default)]
pub(crate) struct Reaction {
    pub(crate) events: Vec<TransmissionEvent>,
    pub(crate) signal: Option<Signal>,
    pub(crate) received: bool,
}

impl Reaction {
    fn event(event: TransmissionEvent) -> Self {
        Self {
            events: vec![event],
            ..Self::default()
        }
    }
}

struct IncomingTransfer {
    file_id: u64,
    remote_path: Option<String>,
    expected: u64,
    received: u64,
    temp_path: PathBuf,
    file: Option<File>,
    digest: Digest<'static, u32>,
    started: Instant,
}

impl IncomingTransfer {
    fn event(
        &self,
        kind: TransmissionKind,
        file: Option<PathBuf>,
        has_destination: bool,
        cause: Option<ProtocolError>,
    ) -> TransmissionEvent {
        TransmissionEvent {
            kind,
            direction: Direction::Incoming,
            file_id: self.file_id,
            duration: self.started.elapsed(),
            transmitted: self.received,
            expected: self.expected,
            remote_path: self.remote_path.clone(),
            file,
            has_destination,
            cause: cause.map(Arc::new),
        }
    }
}

/// Incoming transfers of one connection, owned by the receiver task
pub(crate) struct IncomingTransfers {
    temp_dir: PathBuf,
    file_root: Option<PathBuf>,
    active: HashMap<u64, IncomingTransfer>,
}

impl IncomingTransfers {
    pub(crate) fn new(temp_dir: PathBuf, file_root: Option<PathBuf>) -> Self {
        Self {
            temp_dir,
            file_root,
            active: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, file_id: u64) -> bool {
        self.active.contains_key(&file_id)
    }

    /// Handle any FILE parcel
    pub(crate) async fn on_parcel(&mut self, parcel: Parcel) -> Result<Reaction> {
        if parcel.is_header() {
            self.on_header(parcel).await
        } else {
            Ok(self.on_fragment(parcel).await)
        }
    }

    async fn on_header(&mut self, parcel: Parcel) -> Result<Reaction> {
        let file_id = parcel.object_id;
        if self.active.contains_key(&file_id) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "File {file_id} announced twice"
            )));
        }
        if parcel.extent > MAX_FILE_LENGTH {
            return Err(ProtocolError::ProtocolViolation(format!(
                "File {file_id} announced with length {}",
                parcel.extent
            )));
        }
        let announcement: FileAnnouncement = bincode::deserialize(&parcel.payload)?;

        let temp_path = self
            .temp_dir
            .join(format!("pnet-{}.part", Uuid::new_v4().simple()));
        let mut transfer = IncomingTransfer {
            file_id,
            remote_path: announcement.remote_path,
            expected: parcel.extent,
            received: 0,
            temp_path,
            file: None,
            digest: FILE_CRC.digest(),
            started: Instant::now(),
        };

        let mut reaction = Reaction::event(transfer.event(
            TransmissionKind::FileIncoming,
            Some(transfer.temp_path.clone()),
            false,
            None,
        ));

        match File::create(&transfer.temp_path).await {
            Ok(file) => transfer.file = Some(file),
            Err(e) => {
                warn!(file_id, error = %e, "Cannot create temp file for incoming transfer");
                let reason = format!("Cannot create temp file: {e}");
                reaction.events.push(transfer.event(
                    TransmissionKind::FileFailed,
                    None,
                    false,
                    Some(ProtocolError::InsufficientStorage(reason.clone())),
                ));
                reaction.signal = Some(Signal::FileFail { file_id, reason });
                return Ok(reaction);
            }
        }

        debug!(file_id, expected = transfer.expected, path = ?transfer.remote_path, "Incoming file");

        if parcel.is_final() {
            let done = self.finalize(transfer).await;
            reaction.events.extend(done.events);
            reaction.signal = done.signal;
            reaction.received = done.received;
        } else {
            self.active.insert(file_id, transfer);
        }
        Ok(reaction)
    }

    async fn on_fragment(&mut self, parcel: Parcel) -> Reaction {
        let file_id = parcel.object_id;
        let Some(mut transfer) = self.active.remove(&file_id) else {
            debug!(file_id, "Dropping fragment of unknown or ended transfer");
            return Reaction::default();
        };

        transfer.received += parcel.payload.len() as u64;
        if transfer.received > transfer.expected {
            return self
                .abort(
                    transfer,
                    ProtocolError::TransferAborted(constants::ERR_LENGTH_OVERRUN.into()),
                    true,
                )
                .await;
        }
        if parcel.extent != transfer.received {
            let received = transfer.received;
            return self
                .abort(
                    transfer,
                    ProtocolError::TransferAborted(format!(
                        "Cumulative length {} does not match {received} bytes received",
                        parcel.extent
                    )),
                    true,
                )
                .await;
        }

        transfer.digest.update(&parcel.payload);
        if transfer.digest.clone().finalize() != parcel.checksum {
            return self
                .abort(transfer, ProtocolError::ChecksumMismatch { file_id }, true)
                .await;
        }

        let written = match transfer.file.as_mut() {
            Some(file) => file.write_all(&parcel.payload).await,
            None => Err(io::Error::other("temp file not open")),
        };
        if let Err(e) = written {
            return self.fail(transfer, e).await;
        }

        if parcel.is_final() {
            if transfer.received < transfer.expected {
                return self
                    .abort(
                        transfer,
                        ProtocolError::TransferAborted(constants::ERR_PREMATURE_END.into()),
                        true,
                    )
                    .await;
            }
            return self.finalize(transfer).await;
        }

        self.active.insert(file_id, transfer);
        Reaction::default()
    }

    async fn finalize(&mut self, mut transfer: IncomingTransfer) -> Reaction {
        if let Some(mut file) = transfer.file.take() {
            if let Err(e) = file.flush().await {
                return self.fail(transfer, e).await;
            }
        }
        let file_id = transfer.file_id;

        let destination = match (&transfer.remote_path, &self.file_root) {
            (None, _) => None,
            (Some(_), None) => Some(Err(ProtocolError::InsufficientStorage(
                constants::ERR_NO_FILE_ROOT.into(),
            ))),
            (Some(remote), Some(root)) => Some(resolve_destination(root, remote)),
        };

        let mut reaction = Reaction {
            received: true,
            ..Reaction::default()
        };

        match destination {
            None => {
                reaction.events.push(transfer.event(
                    TransmissionKind::FileReceived,
                    Some(transfer.temp_path.clone()),
                    false,
                    None,
                ));
                reaction.signal = Some(Signal::FileConfirm { file_id });
            }
            Some(Ok(dest)) => match move_file(&transfer.temp_path, &dest).await {
                Ok(()) => {
                    debug!(file_id, destination = %dest.display(), "File stored");
                    reaction.events.push(transfer.event(
                        TransmissionKind::FileReceived,
                        Some(dest),
                        true,
                        None,
                    ));
                    reaction.signal = Some(Signal::FileConfirm { file_id });
                }
                Err(e) => {
                    let cause = ProtocolError::InsufficientStorage(e.to_string());
                    reaction.signal = Some(Signal::FileFail {
                        file_id,
                        reason: cause.to_string(),
                    });
                    reaction.events.push(transfer.event(
                        TransmissionKind::FileReceived,
                        Some(transfer.temp_path.clone()),
                        false,
                        Some(cause),
                    ));
                }
            },
            Some(Err(cause)) => {
                reaction.signal = Some(Signal::FileFail {
                    file_id,
                    reason: cause.to_string(),
                });
                reaction.events.push(transfer.event(
                    TransmissionKind::FileReceived,
                    Some(transfer.temp_path.clone()),
                    false,
                    Some(cause),
                ));
            }
        }
        reaction
    }

    async fn fail(&mut self, mut transfer: IncomingTransfer, error: io::Error) -> Reaction {
        warn!(file_id = transfer.file_id, error = %error, "Writing incoming file failed");
        transfer.file = None;
        discard(&transfer.temp_path).await;
        let reason = format!("Cannot write temp file: {error}");
        Reaction {
            events: vec![transfer.event(
                TransmissionKind::FileFailed,
                None,
                false,
                Some(ProtocolError::InsufficientStorage(reason.clone())),
            )],
            signal: Some(Signal::FileFail {
                file_id: transfer.file_id,
                reason,
            }),
            received: false,
        }
    }

    async fn abort(
        &mut self,
        mut transfer: IncomingTransfer,
        cause: ProtocolError,
        notify: bool,
    ) -> Reaction {
        debug!(file_id = transfer.file_id, cause = %cause, "Aborting incoming file");
        transfer.file = None;
        discard(&transfer.temp_path).await;
        let signal = notify.then(|| Signal::FileAbort {
            file_id: transfer.file_id,
            sender_side: false,
            reason: cause.to_string(),
        });
        Reaction {
            events: vec![transfer.event(TransmissionKind::FileAborted, None, false, Some(cause))],
            signal,
            received: false,
        }
    }

    /// Cancel a transfer on request of the local application
    pub(crate) async fn abort_local(&mut self, file_id: u64) -> Option<Reaction> {
        let transfer = self.active.remove(&file_id)?;
        Some(
            self.abort(
                transfer,
                ProtocolError::TransferAborted(constants::ERR_LOCAL_BREAK.into()),
                true,
            )
            .await,
        )
    }

    /// Cancel a transfer because its sender aborted it
    pub(crate) async fn abort_remote(&mut self, file_id: u64, reason: String) -> Option<Reaction> {
        let transfer = self.active.remove(&file_id)?;
        Some(
            self.abort(transfer, ProtocolError::RemoteAbort(reason), false)
                .await,
        )
    }

    /// Drop every unfinished transfer when the connection ends
    pub(crate) async fn interrupt_all(&mut self) -> Vec<TransmissionEvent> {
        let ids: Vec<u64> = self.active.keys().copied().collect();
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(transfer) = self.active.remove(&id) {
                let reaction = self
                    .abort(
                        transfer,
                        ProtocolError::TransferAborted(constants::ERR_TRANSFER_INTERRUPTED.into()),
                        false,
                    )
                    .await;
                events.extend(reaction.events);
            }
        }
        events
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temp file");
        }
    }
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Rename fails across file systems
    tokio::fs::copy(from, to).await?;
    discard(from).await;
    Ok(())
}
