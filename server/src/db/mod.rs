use rusqlite::Connection;

pub mod client_cert;
pub mod forward;
pub mod masquerade;
pub mod server_cert;

pub use client_cert::{ArchiveClientCert, ClientCert, ClientCertContents};
pub use forward::Forward;
pub use masquerade::Masquerade;
pub use server_cert::{ArchiveServerCert, ServerCert, ServerCertContents};

/// Creates any missing tables. Run once against the freshly opened
/// connection at boot.
pub fn auto_migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&format!(
        "{};\n{};\n{};\n{};\n{};\n{};",
        server_cert::CREATE_TABLE_SQL,
        server_cert::CREATE_ARCHIVE_TABLE_SQL,
        client_cert::CREATE_TABLE_SQL,
        client_cert::CREATE_ARCHIVE_TABLE_SQL,
        forward::CREATE_TABLE_SQL,
        masquerade::CREATE_TABLE_SQL,
    ))
}

#[cfg(test)]
pub fn open_test_connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", 1).unwrap();
    auto_migrate(&conn).unwrap();
    conn
}
