use crate::runtime::Connection;

/// Write every received byte back to the sender.
pub fn echo(conn: &mut Connection) {
    let data = conn.input_mut().take_all();
    conn.write_data(data);
}
