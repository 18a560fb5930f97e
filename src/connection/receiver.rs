//! Receiver task: reads parcels, answers signals and reassembles data.
//!
//! Objects are rebuilt from their fragments by object ID and handed to the
//! delivery task once complete. Delivery holds a permit of the object
//! semaphore, so a slow listener eventually stops the reader and TCP flow
//! control pushes back on the remote.

use crate::connection::engine::{ReceiverControl, Shared};
use crate::connection::event::{ConnectionEvent, PingEcho, TransmissionKind};
use crate::connection::queue::LANES;
use crate::connection::state::CloseCause;
use crate::connection::transfer::{IncomingTransfers, Reaction};
use crate::core::codec::ParcelCodec;
use crate::core::parcel::{Parcel, ParcelKind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::signal::Signal;
use bytes::BytesMut;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

type ParcelReader = FramedRead<OwnedReadHalf, ParcelCodec>;

/// Objects a well-behaved sender can have in flight at once, one per queue lane
const MAX_ASSEMBLIES: usize = LANES;

/// Partially received object
struct Assembly {
    extent: u64,
    next_sequence: u32,
    data: BytesMut,
}

pub(crate) async fn run_receiver(
    shared: Arc<Shared>,
    mut reader: ParcelReader,
    mut control: mpsc::UnboundedReceiver<ReceiverControl>,
) {
    let mut incoming = IncomingTransfers::new(
        shared.params.temp_dir.clone(),
        shared.params.file_root_dir.clone(),
    );
    let mut objects: HashMap<u64, Assembly> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            Some(command) = control.recv() => match command {
                ReceiverControl::AbortIncoming(file_id) => {
                    if let Some(reaction) = incoming.abort_local(file_id).await {
                        apply(&shared, reaction);
                    }
                }
            },

            item = reader.next() => match item {
                None => {
                    shared.terminate(CloseCause::RemoteEof, Some(constants::ERR_REMOTE_EOF.into()));
                    break;
                }
                Some(Err(ProtocolError::Io(e))) => {
                    shared.terminate(CloseCause::SocketError, Some(e.to_string()));
                    break;
                }
                Some(Err(e)) => {
                    shared.terminate(CloseCause::ProtocolViolation, Some(e.to_string()));
                    break;
                }
                Some(Ok(parcel)) => {
                    shared.metrics.parcel_received(parcel.kind, parcel.wire_len());
                    let handled = match parcel.kind {
                        ParcelKind::Signal => handle_signal(&shared, &parcel, &mut incoming).await,
                        ParcelKind::Object => assemble_object(&shared, parcel, &mut objects).await,
                        ParcelKind::File => incoming
                            .on_parcel(parcel)
                            .await
                            .map(|reaction| apply(&shared, reaction)),
                    };
                    if let Err(e) = handled {
                        warn!(conn = %shared.short_id, error = %e, "Protocol violation from remote");
                        shared.terminate(CloseCause::ProtocolViolation, Some(e.to_string()));
                        break;
                    }
                }
            },
        }
    }

    for event in incoming.interrupt_all().await {
        shared.emit(ConnectionEvent::Transmission(event));
    }
    trace!(conn = %shared.short_id, pending_objects = objects.len(), "Receiver stopped");
}

fn apply(shared: &Shared, reaction: Reaction) {
    if reaction.received {
        shared.metrics.file_received();
    }
    for event in reaction.events {
        shared.emit(ConnectionEvent::Transmission(event));
    }
    if let Some(signal) = reaction.signal {
        shared.push_signal(signal);
    }
}

async fn handle_signal(
    shared: &Shared,
    parcel: &Parcel,
    incoming: &mut IncomingTransfers,
) -> Result<()> {
    let signal = Signal::from_parcel(parcel)?;
    trace!(conn = %shared.short_id, signal = signal.name(), "Signal received");

    match signal {
        Signal::Alive => shared.push_signal(Signal::AliveEcho),
        Signal::AliveEcho => shared.lock_core().alive_pending = None,
        Signal::Ping { ping_id } => shared.push_signal(Signal::PingEcho { ping_id }),
        Signal::PingEcho { ping_id } => {
            let sent = shared.lock_core().pings.remove(&ping_id);
            match sent {
                Some((sent, sent_at)) => shared.emit(ConnectionEvent::PingEcho(PingEcho {
                    ping_id,
                    sent_at,
                    round_trip: sent.elapsed(),
                })),
                None => debug!(conn = %shared.short_id, ping_id, "Echo for unknown ping"),
            }
        }
        Signal::Tempo { speed } => shared.on_remote_tempo(speed),
        Signal::FileAbort {
            file_id,
            sender_side: true,
            reason,
        } => {
            if let Some(reaction) = incoming.abort_remote(file_id, reason).await {
                apply(shared, reaction);
            }
        }
        Signal::FileAbort {
            file_id,
            sender_side: false,
            reason,
        } => {
            shared.end_outgoing(
                file_id,
                TransmissionKind::FileAborted,
                Some(ProtocolError::RemoteAbort(reason)),
                None,
            );
        }
        Signal::FileConfirm { file_id } => {
            shared.end_outgoing(file_id, TransmissionKind::FileConfirmed, None, None);
        }
        Signal::FileFail { file_id, reason } => {
            shared.end_outgoing(
                file_id,
                TransmissionKind::FileFailed,
                Some(ProtocolError::InsufficientStorage(reason)),
                None,
            );
        }
        Signal::Close { cause, message } => {
            debug!(conn = %shared.short_id, remote_cause = %CloseCause::from_code(cause), "Remote closed");
            shared.on_remote_close(message);
        }
        Signal::ConnectRequest { .. } | Signal::Confirm { .. } | Signal::Reject { .. } => {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{} after handshake",
                signal.name()
            )));
        }
    }
    Ok(())
}

async fn assemble_object(
    shared: &Shared,
    parcel: Parcel,
    objects: &mut HashMap<u64, Assembly>,
) -> Result<()> {
    let object_id = parcel.object_id;
    let limit = shared.params.max_serialisation_size;
    if parcel.extent > limit as u64 {
        return Err(ProtocolError::ObjectTooLarge {
            size: parcel.extent as usize,
            limit,
        });
    }

    if parcel.sequence == 0 {
        if objects.contains_key(&object_id) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Object {object_id} restarted before completion"
            )));
        }
        if objects.len() >= MAX_ASSEMBLIES {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Object {object_id} exceeds {MAX_ASSEMBLIES} partially received objects"
            )));
        }
        // The buffer grows with the data actually received
        let reserve = parcel.extent.min(shared.params.transmission_parcel_size as u64);
        objects.insert(
            object_id,
            Assembly {
                extent: parcel.extent,
                next_sequence: 0,
                data: BytesMut::with_capacity(reserve as usize),
            },
        );
    }
    let assembly = objects.get_mut(&object_id).ok_or_else(|| {
        ProtocolError::ProtocolViolation(format!("Fragment of unknown object {object_id}"))
    })?;
    if assembly.next_sequence != parcel.sequence || assembly.extent != parcel.extent {
        return Err(ProtocolError::ProtocolViolation(format!(
            "Object {object_id} fragment {} out of order",
            parcel.sequence
        )));
    }
    assembly.data.extend_from_slice(&parcel.payload);
    assembly.next_sequence += 1;
    if assembly.data.len() as u64 > assembly.extent {
        return Err(ProtocolError::ProtocolViolation(format!(
            "Object {object_id} longer than announced"
        )));
    }
    if !parcel.is_final() {
        return Ok(());
    }

    let Some(assembly) = objects.remove(&object_id) else {
        return Ok(());
    };
    if assembly.data.len() as u64 != assembly.extent {
        return Err(ProtocolError::ProtocolViolation(format!(
            "Object {object_id} shorter than announced"
        )));
    }

    let object = match shared.registry.deserialize(&assembly.data) {
        Ok(object) => object,
        Err(e) => {
            warn!(conn = %shared.short_id, object_id, error = %e, "Dropping undecodable object");
            return Ok(());
        }
    };

    let permit = tokio::select! {
        permit = Arc::clone(&shared.object_permits).acquire_owned() => permit,
        _ = shared.cancel.cancelled() => return Ok(()),
    };
    let Ok(permit) = permit else {
        return Ok(());
    };
    shared.metrics.object_received();
    shared.emit_with_permit(
        ConnectionEvent::ObjectReceived {
            id: object_id,
            object,
        },
        permit,
    );
    Ok(())
}
