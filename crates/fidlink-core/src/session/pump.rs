//! Send and receive loops

use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::{Outbound, SessionEvent, Shared};
use crate::protocol::{
    describe_device_error, CommunicationChannel, Decoded, Dispatch, ProtocolError, WireProtocol,
};

pub(crate) fn spawn_receiver<P: WireProtocol>(
    shared: Arc<Shared<P>>,
    channel: Box<dyn CommunicationChannel>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("fidlink-recv-{}", &shared.id.simple().to_string()[..8]);
    shared.set_receive_running(true);
    thread::Builder::new()
        .name(name)
        .spawn(move || receive_loop(shared, channel))
}

fn write_one<P: WireProtocol>(
    shared: &Shared<P>,
    channel: &mut dyn CommunicationChannel,
    item: &Outbound<P::Outgoing>,
) -> Result<(), ProtocolError> {
    channel.flush()?;
    match item {
        Outbound::Message(message) => shared.protocol.write(message, channel)?,
        Outbound::Raw(bytes) => channel.write_segment(bytes, 0, bytes.len())?,
    }
    channel.flush()?;
    Ok(())
}

/// Drain the outbound queue onto the transport until every sender is gone
pub(crate) fn send_loop<P: WireProtocol>(
    shared: Arc<Shared<P>>,
    mut channel: Box<dyn CommunicationChannel>,
    queue: Receiver<Outbound<P::Outgoing>>,
) {
    let limit = shared.config.io_failure_limit.max(1);
    let mut failures = 0u32;

    for item in queue.iter() {
        match write_one(&shared, channel.as_mut(), &item) {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                tracing::warn!(session = %shared.id, failures, "write failed: {e}");
                if failures == limit {
                    shared.signal_reconnect(format!("{failures} consecutive write failures: {e}"));
                }
            }
        }
    }
    tracing::debug!(session = %shared.id, "send loop stopped");
}

fn dispatch<P: WireProtocol>(shared: &Shared<P>, message: P::Incoming) {
    let protocol = &shared.protocol;
    let key = protocol.response_key(&message);
    match protocol.classify(&message) {
        Dispatch::Response => shared.store.record_response(key, message),
        Dispatch::DeviceError { key: failed, code } => {
            let error_type = protocol.key_name(failed);
            let description = describe_device_error(code);
            tracing::warn!(session = %shared.id, code, "device reported error for {error_type}: {description}");
            shared.store.record_error(failed, error_type.clone(), code);
            shared.store.record_response(key, message);
            shared.events.publish(SessionEvent::DeviceError {
                error_type,
                code,
                description: description.to_string(),
            });
        }
        Dispatch::Bulk => shared.store.record_bulk(message),
        Dispatch::Shutdown(reason) => {
            tracing::info!(session = %shared.id, "device shutting down: {reason}");
            shared.store.record_response(key, message);
            shared.events.publish(SessionEvent::DeviceShutdown { reason });
        }
    }
}

/// Hand decoder output to the store and the event bus
fn route<P: WireProtocol>(
    shared: &Shared<P>,
    decoder: &mut P::Decoder,
    decoded: Vec<Decoded<P::Incoming>>,
    discards: &mut u32,
) {
    let discard_limit = shared.config.text.max_discards.max(1);
    for item in decoded {
        match item {
            Decoded::Message(message) => {
                *discards = 0;
                shared.touch_parse();
                dispatch(shared, message);
            }
            Decoded::Discarded { raw, reason } => {
                *discards += 1;
                tracing::debug!(session = %shared.id, "discarded input ({reason}): {raw}");
                shared
                    .events
                    .publish(SessionEvent::RawMessage { raw, reason });
                if *discards >= discard_limit {
                    tracing::warn!(
                        session = %shared.id,
                        "{discards} consecutive discards, link may be desynchronized"
                    );
                    shared.protocol.reset_decoder(decoder);
                    *discards = 0;
                }
            }
        }
    }
}

/// Read bytes, feed the codec and route what it produces
fn receive_loop<P: WireProtocol>(shared: Arc<Shared<P>>, mut channel: Box<dyn CommunicationChannel>) {
    let protocol = &shared.protocol;
    let mut decoder = protocol.decoder();
    let failure_limit = shared.config.io_failure_limit.max(1);
    let mut failures = 0u32;
    let mut discards = 0u32;

    tracing::debug!(session = %shared.id, "receive loop started");
    loop {
        let stopping = shared.is_shut_down();
        if stopping && protocol.decoder_idle(&decoder) {
            break;
        }

        let raw_requested = shared.raw_requested();
        if raw_requested != shared.raw_active() {
            protocol.reset_decoder(&mut decoder);
            shared.set_raw_active(raw_requested);
        }

        match channel.read_byte() {
            Ok(Some(byte)) => {
                failures = 0;
                shared.touch_byte();
                if shared.raw_active() {
                    shared.push_raw(byte);
                    continue;
                }
                let decoded = protocol.push_byte(&mut decoder, byte);
                route(&shared, &mut decoder, decoded, &mut discards);
            }
            Ok(None) => {
                if !protocol.decoder_idle(&decoder) {
                    let decoded = protocol.flush_decoder(&mut decoder);
                    route(&shared, &mut decoder, decoded, &mut discards);
                }
                if stopping {
                    tracing::debug!(session = %shared.id, "dropping partial input at shutdown");
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(session = %shared.id, failures, "read failed: {e}");
                if failures >= failure_limit {
                    shared.signal_reconnect(format!("{failures} consecutive read failures: {e}"));
                    break;
                }
                thread::sleep(shared.config.read_timeout());
            }
        }
    }

    shared.set_receive_running(false);
    tracing::debug!(session = %shared.id, "receive loop stopped");
}
