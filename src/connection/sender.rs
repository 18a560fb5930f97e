//! Sender task: the only writer of a connection's socket.
//!
//! Each round takes the next unit of work from the [`SendQueue`](crate::connection::queue::SendQueue)
//! under the core lock, then writes it with the lock released. Data parcels
//! are paced by the tempo; signals go out as soon as they are queued.

use crate::connection::engine::Shared;
use crate::connection::event::TransmissionKind;
use crate::connection::queue::{AfterClose, Next};
use crate::connection::state::CloseCause;
use crate::connection::tempo::{Admission, Pacer};
use crate::connection::transfer::{announcement_parcel, fragment_parcel, FileReader};
use crate::core::codec::ParcelCodec;
use crate::core::parcel::{Parcel, Priority};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::signal::Signal;
use futures::SinkExt;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

type ParcelWriter = FramedWrite<OwnedWriteHalf, ParcelCodec>;

pub(crate) async fn run_sender(shared: Arc<Shared>, mut writer: ParcelWriter) {
    let mut pacer = Pacer::new();
    let mut readers: HashMap<u64, FileReader> = HashMap::new();
    let mut tempo_rx = shared.tempo.subscribe();

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let speed = *tempo_rx.borrow_and_update();
        let admission = pacer.admission(speed, Instant::now());

        let (next, released) = {
            let mut core = shared.lock_core();
            let admit = match admission {
                Admission::Ready => true,
                // A paused connection still drains its queue when closing
                Admission::Paused => core.queue.is_closing(),
                Admission::Wait(_) => false,
            };
            (core.queue.next(admit), core.queue.take_released())
        };
        for file_id in released {
            readers.remove(&file_id);
        }

        let outcome = match next {
            Next::Signal(signal) => write_signal(&shared, &mut writer, &signal).await,
            Next::Object { parcel, done } => {
                let written = write(&shared, &mut writer, parcel).await;
                written.map(|len| {
                    pacer.charge(len, speed, Instant::now());
                    if done {
                        shared.metrics.object_sent();
                    }
                })
            }
            Next::FileHeader {
                file_id,
                priority,
                remote_path,
                length,
            } => {
                start_file(
                    &shared,
                    &mut writer,
                    &mut readers,
                    &mut pacer,
                    speed,
                    FileStart {
                        file_id,
                        priority,
                        remote_path,
                        length,
                    },
                )
                .await
            }
            Next::FileChunk {
                file_id,
                priority,
                offset,
                len,
                sequence,
                is_final,
            } => {
                let Some(reader) = readers.get_mut(&file_id) else {
                    continue;
                };
                match reader.read_chunk(offset, len).await {
                    Ok((payload, checksum)) => {
                        let parcel = fragment_parcel(
                            file_id,
                            priority,
                            sequence,
                            offset + len as u64,
                            checksum,
                            is_final,
                            payload,
                        );
                        let written = write(&shared, &mut writer, parcel).await;
                        written.map(|wire_len| {
                            pacer.charge(wire_len, speed, Instant::now());
                            if let Some(transfer) = shared.lock_core().outgoing.get_mut(file_id) {
                                transfer.transmitted = offset + len as u64;
                            }
                            if is_final {
                                readers.remove(&file_id);
                                shared.metrics.file_sent();
                                debug!(conn = %shared.short_id, file_id, "File sent, awaiting confirmation");
                            }
                        })
                    }
                    Err(e) => {
                        readers.remove(&file_id);
                        let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                            constants::ERR_SOURCE_SHRANK.to_string()
                        } else {
                            e.to_string()
                        };
                        shared.end_outgoing(
                            file_id,
                            TransmissionKind::FileAborted,
                            Some(ProtocolError::TransferAborted(reason.clone())),
                            Some(reason),
                        );
                        Ok(())
                    }
                }
            }
            Next::Close { signal, after } => {
                if let Err(e) = write_signal(&shared, &mut writer, &signal).await {
                    shared.terminate(CloseCause::SocketError, Some(e.to_string()));
                    break;
                }
                finish_close(&shared, after).await;
                break;
            }
            Next::Blocked => {
                let sleep_for = match admission {
                    Admission::Wait(at) => Some(at),
                    _ => None,
                };
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                    _ = tempo_rx.changed() => {}
                    _ = async {
                        match sleep_for {
                            Some(at) => sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {}
                }
                continue;
            }
            Next::Idle => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
                continue;
            }
        };

        if let Err(e) = outcome {
            shared.terminate(CloseCause::SocketError, Some(e.to_string()));
            break;
        }
    }

    trace!(conn = %shared.short_id, "Sender stopped");
}

async fn write(shared: &Shared, writer: &mut ParcelWriter, parcel: Parcel) -> Result<usize> {
    let kind = parcel.kind;
    let wire_len = parcel.wire_len();
    writer.send(parcel).await?;
    shared.metrics.parcel_sent(kind, wire_len);
    Ok(wire_len)
}

async fn write_signal(shared: &Shared, writer: &mut ParcelWriter, signal: &Signal) -> Result<()> {
    trace!(conn = %shared.short_id, signal = signal.name(), "Sending signal");
    write(shared, writer, signal.to_parcel()?).await?;
    Ok(())
}

struct FileStart {
    file_id: u64,
    priority: Priority,
    remote_path: Option<String>,
    length: u64,
}

async fn start_file(
    shared: &Shared,
    writer: &mut ParcelWriter,
    readers: &mut HashMap<u64, FileReader>,
    pacer: &mut Pacer,
    speed: i64,
    start: FileStart,
) -> Result<()> {
    let file_id = start.file_id;
    let path = shared
        .lock_core()
        .outgoing
        .get_mut(file_id)
        .map(|t| t.path.clone());
    // Broken before its header went out
    let Some(path) = path else {
        return Ok(());
    };

    let reader = match FileReader::open(&path).await {
        Ok(reader) => reader,
        Err(e) => {
            let reason = e.to_string();
            shared.end_outgoing(
                file_id,
                TransmissionKind::FileAborted,
                Some(ProtocolError::Io(e)),
                Some(reason),
            );
            return Ok(());
        }
    };

    let parcel = announcement_parcel(file_id, start.priority, start.remote_path, start.length)?;
    let wire_len = write(shared, writer, parcel).await?;
    pacer.charge(wire_len, speed, Instant::now());
    debug!(conn = %shared.short_id, file_id, length = start.length, "File announced");

    if start.length == 0 {
        shared.metrics.file_sent();
    } else {
        readers.insert(file_id, reader);
    }
    Ok(())
}

async fn finish_close(shared: &Shared, after: AfterClose) {
    match after {
        AfterClose::AwaitEcho => {
            shared.mark_closed();
            let timeout = shared.params.confirm_timeout;
            tokio::select! {
                _ = shared.cancel.cancelled() => {}
                _ = sleep(timeout) => {
                    shared.terminate(
                        CloseCause::CloseTimeout,
                        Some(constants::ERR_CLOSE_TIMEOUT.into()),
                    );
                }
            }
        }
        AfterClose::Terminate { cause, message } => shared.terminate(cause, message),
    }
}
