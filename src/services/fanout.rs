use super::SimpleData;
use crate::runtime::{Connection, RequestResult};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

const FIRST_ID: u32 = 42;
const REUSE_ID: u32 = 666;

/// Forward every request to two upstreams and report how each settled.
///
/// Once both settle, a third request goes to `first` again so the client
/// can see whether the pooled connection was reused. Input arriving in the
/// meantime is held back until the whole exchange is done.
pub fn fanout(
    first: SocketAddr,
    second: SocketAddr,
    timeout: Duration,
) -> impl Fn(&mut Connection) + Send + Sync + 'static {
    move |conn: &mut Connection| {
        conn.input_mut().clear();

        let r1 = send(conn, first, SimpleData::new(FIRST_ID, "origin msg"), timeout);
        let r2 = send(conn, second, SimpleData::new(FIRST_ID, "origin msg"), timeout);
        debug!(conn_id = conn.id(), %first, %second, "Fan-out started");

        let pending = [r1.clone(), r2.clone()];
        conn.await_results(&pending, move |conn| {
            let mut out = report(&r1, first);
            out.push_str(&report(&r2, second));
            conn.write_data(out);

            let r3 = send(conn, first, SimpleData::new(REUSE_ID, "origin msg"), timeout);
            let r1 = r1.clone();
            conn.await_results(&[r3.clone()], move |conn| {
                let mut out = report(&r3, first);
                if r1.same_sub_connection(&r3) {
                    out.push_str("subconnection reused\n");
                } else {
                    out.push_str("subconnection not reused\n");
                }
                info!(conn_id = conn.id(), reused = r1.same_sub_connection(&r3), "Fan-out complete");
                conn.write_data(out);
                conn.request_resolved();
            });
        });
    }
}

fn send(conn: &mut Connection, addr: SocketAddr, request: SimpleData, timeout: Duration) -> RequestResult {
    conn.sub_request_with_timeout(&addr.ip().to_string(), addr.port(), &request, timeout)
}

fn report(result: &RequestResult, addr: SocketAddr) -> String {
    if let Some(data) = result.message_as::<SimpleData>() {
        return format!("{}: {}\n", data.id, data.msg);
    }
    match result.rejection() {
        Some(reason) => format!("request to {addr} rejected: {reason}\n"),
        None => format!("request to {addr} returned an unexpected message\n"),
    }
}
