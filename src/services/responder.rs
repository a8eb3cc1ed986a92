use super::SimpleData;
use crate::runtime::{Connection, DecodeOutcome};
use tracing::debug;

/// Answer each framed [`SimpleData`] request with its id incremented.
///
/// Frames that fail to decode get an id-0 reply so the caller always
/// receives exactly one response per request frame.
pub fn responder(name: String) -> impl Fn(&mut Connection) + Send + Sync + 'static {
    let processed = format!("data processed by {name}");
    move |conn: &mut Connection| loop {
        let reply = match conn.decode_message() {
            DecodeOutcome::Decoded { message, .. } => match message.downcast_ref::<SimpleData>() {
                Some(request) => SimpleData::new(request.id.wrapping_add(1), processed.as_str()),
                None => SimpleData::new(0, format!("bad data: unexpected {}", message.type_name())),
            },
            DecodeOutcome::UnknownType(type_name) => {
                debug!(conn_id = conn.id(), %type_name, "Unknown request type");
                SimpleData::new(0, format!("bad data: unknown type {type_name}"))
            }
            DecodeOutcome::ParseError(reason) => {
                debug!(conn_id = conn.id(), %reason, "Malformed request");
                SimpleData::new(0, format!("bad data: {reason}"))
            }
            DecodeOutcome::Incomplete => return,
        };
        conn.write_message(&reply);
    }
}

/// Swallow all input without ever replying.
pub fn silent(conn: &mut Connection) {
    conn.input_mut().clear();
}
