use crate::ServerError;
use rusqlite::{params, Connection};
use std::ops::Deref;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS server_certs (
      id         INTEGER PRIMARY KEY,
      ifname     TEXT NOT NULL UNIQUE,    /* tunnel device name                 */
      private    TEXT NOT NULL,           /* base64 WireGuard private key       */
      public     TEXT NOT NULL,           /* derived public key                 */
      endpoint   TEXT NOT NULL,           /* public host/IP peers connect to    */
      ip         TEXT NOT NULL UNIQUE,    /* interface address in CIDR form     */
      port       INTEGER NOT NULL UNIQUE, /* WireGuard listen port              */
      config     TEXT NOT NULL,           /* rendered [Interface] block         */
      created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
    )";

pub static CREATE_ARCHIVE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS archive_server_certs (
      id         INTEGER PRIMARY KEY,
      ifname     TEXT NOT NULL,
      private    TEXT NOT NULL,
      public     TEXT NOT NULL,
      endpoint   TEXT NOT NULL,
      ip         TEXT NOT NULL,
      port       INTEGER NOT NULL,
      config     TEXT NOT NULL,
      created_at INTEGER NOT NULL,
      deleted_at INTEGER NOT NULL
    )";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertContents {
    pub ifname: String,
    pub private: String,
    pub public: String,
    pub endpoint: String,
    pub ip: String,
    pub port: u16,
    pub config: String,
}

#[derive(Debug, Clone)]
pub struct ServerCert {
    pub id: i64,
    pub contents: ServerCertContents,
}

impl Deref for ServerCert {
    type Target = ServerCertContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

/// A soft-deleted server row. Never mutated after insertion.
#[derive(Debug, Clone)]
pub struct ArchiveServerCert {
    pub deleted_at: i64,
    pub contents: ServerCertContents,
}

impl ServerCert {
    pub fn create(conn: &Connection, contents: ServerCertContents) -> Result<Self, ServerError> {
        log::info!(
            "creating server cert for interface {} ({})",
            contents.ifname,
            contents.ip
        );
        conn.execute(
            "INSERT INTO server_certs (ifname, private, public, endpoint, ip, port, config)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contents.ifname,
                contents.private,
                contents.public,
                contents.endpoint,
                contents.ip,
                contents.port,
                contents.config,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Self { id, contents })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            contents: ServerCertContents {
                ifname: row.get(1)?,
                private: row.get(2)?,
                public: row.get(3)?,
                endpoint: row.get(4)?,
                ip: row.get(5)?,
                port: row.get(6)?,
                config: row.get(7)?,
            },
        })
    }

    pub fn get_by_ifname(conn: &Connection, ifname: &str) -> Result<Self, ServerError> {
        Ok(conn.query_row(
            "SELECT id, ifname, private, public, endpoint, ip, port, config
              FROM server_certs WHERE ifname = ?1",
            params![ifname],
            Self::from_row,
        )?)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, ifname, private, public, endpoint, ip, port, config FROM server_certs",
        )?;
        let certs = stmt.query_map(params![], Self::from_row)?;
        Ok(certs.collect::<Result<_, _>>()?)
    }

    /// Archives the server row and every client row on the same interface,
    /// then deletes both live sets. The caller-provided private key must
    /// match the stored one. All statements run in one transaction.
    pub fn delete(conn: &mut Connection, private: &str, ifname: &str) -> Result<(), ServerError> {
        let tx = conn.transaction()?;

        let existing = tx.query_row(
            "SELECT id, ifname, private, public, endpoint, ip, port, config
              FROM server_certs WHERE ifname = ?1",
            params![ifname],
            Self::from_row,
        )?;
        if existing.private != private {
            return Err(ServerError::invalid(format!(
                "did not find record with correct ifname: {ifname} and private {private} in database"
            )));
        }

        tx.execute(
            "INSERT INTO archive_client_certs
              (ifname, private, public, ip, allowed_ips, config, created_at, deleted_at)
              SELECT ifname, private, public, ip, allowed_ips, config, created_at, strftime('%s', 'now')
              FROM client_certs WHERE ifname = ?1",
            params![ifname],
        )?;
        tx.execute(
            "INSERT INTO archive_server_certs
              (ifname, private, public, endpoint, ip, port, config, created_at, deleted_at)
              SELECT ifname, private, public, endpoint, ip, port, config, created_at, strftime('%s', 'now')
              FROM server_certs WHERE ifname = ?1",
            params![ifname],
        )?;
        tx.execute("DELETE FROM client_certs WHERE ifname = ?1", params![ifname])?;
        tx.execute(
            "DELETE FROM server_certs WHERE ifname = ?1 AND private = ?2",
            params![ifname, private],
        )?;

        tx.commit()?;
        Ok(())
    }
}

impl ArchiveServerCert {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            deleted_at: row.get(7)?,
            contents: ServerCertContents {
                ifname: row.get(0)?,
                private: row.get(1)?,
                public: row.get(2)?,
                endpoint: row.get(3)?,
                ip: row.get(4)?,
                port: row.get(5)?,
                config: row.get(6)?,
            },
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT ifname, private, public, endpoint, ip, port, config, deleted_at
              FROM archive_server_certs",
        )?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
