use crate::ServerError;
use rusqlite::{params, Connection};
use std::ops::Deref;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS client_certs (
      id          INTEGER PRIMARY KEY,
      ifname      TEXT NOT NULL,        /* owning tunnel device            */
      private     TEXT NOT NULL,
      public      TEXT NOT NULL,
      ip          TEXT NOT NULL UNIQUE, /* peer address in CIDR form       */
      allowed_ips TEXT NOT NULL,        /* normalised comma-separated list */
      config      TEXT NOT NULL,        /* rendered peer config            */
      created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
    )";

pub static CREATE_ARCHIVE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS archive_client_certs (
      id          INTEGER PRIMARY KEY,
      ifname      TEXT NOT NULL,
      private     TEXT NOT NULL,
      public      TEXT NOT NULL,
      ip          TEXT NOT NULL,
      allowed_ips TEXT NOT NULL,
      config      TEXT NOT NULL,
      created_at  INTEGER NOT NULL,
      deleted_at  INTEGER NOT NULL
    )";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertContents {
    pub ifname: String,
    pub private: String,
    pub public: String,
    pub ip: String,
    pub allowed_ips: String,
    pub config: String,
}

#[derive(Debug, Clone)]
pub struct ClientCert {
    pub id: i64,
    pub contents: ClientCertContents,
}

impl Deref for ClientCert {
    type Target = ClientCertContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveClientCert {
    pub deleted_at: i64,
    pub contents: ClientCertContents,
}

impl ClientCert {
    pub fn create(conn: &Connection, contents: ClientCertContents) -> Result<Self, ServerError> {
        log::info!(
            "creating client cert {} on interface {}",
            contents.ip,
            contents.ifname
        );
        conn.execute(
            "INSERT INTO client_certs (ifname, private, public, ip, allowed_ips, config)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contents.ifname,
                contents.private,
                contents.public,
                contents.ip,
                contents.allowed_ips,
                contents.config,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Self { id, contents })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            contents: ClientCertContents {
                ifname: row.get(1)?,
                private: row.get(2)?,
                public: row.get(3)?,
                ip: row.get(4)?,
                allowed_ips: row.get(5)?,
                config: row.get(6)?,
            },
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, ifname, private, public, ip, allowed_ips, config FROM client_certs",
        )?;
        let certs = stmt.query_map(params![], Self::from_row)?;
        Ok(certs.collect::<Result<_, _>>()?)
    }

    pub fn list_by_ifname(conn: &Connection, ifname: &str) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, ifname, private, public, ip, allowed_ips, config
              FROM client_certs WHERE ifname = ?1",
        )?;
        let certs = stmt.query_map(params![ifname], Self::from_row)?;
        Ok(certs.collect::<Result<_, _>>()?)
    }

    /// IPs already handed out on an interface, used by the allocator.
    pub fn ips_for_ifname(conn: &Connection, ifname: &str) -> Result<Vec<String>, ServerError> {
        let mut stmt =
            conn.prepare_cached("SELECT ip FROM client_certs WHERE ifname = ?1 ORDER BY id")?;
        let ips = stmt.query_map(params![ifname], |row| row.get(0))?;
        Ok(ips.collect::<Result<_, _>>()?)
    }

    /// Archives and deletes the peer identified by its public key, returning
    /// the removed record so the caller can clean up kernel state.
    pub fn delete(conn: &mut Connection, public: &str) -> Result<Self, ServerError> {
        let tx = conn.transaction()?;

        let cert = tx
            .query_row(
                "SELECT id, ifname, private, public, ip, allowed_ips, config
                  FROM client_certs WHERE public = ?1",
                params![public],
                Self::from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ServerError::invalid(format!("record not found for public key {public}"))
                }
                e => ServerError::Database(e),
            })?;

        tx.execute(
            "INSERT INTO archive_client_certs
              (ifname, private, public, ip, allowed_ips, config, created_at, deleted_at)
              SELECT ifname, private, public, ip, allowed_ips, config, created_at, strftime('%s', 'now')
              FROM client_certs WHERE public = ?1",
            params![public],
        )?;
        tx.execute(
            "DELETE FROM client_certs WHERE public = ?1",
            params![public],
        )?;

        tx.commit()?;
        Ok(cert)
    }
}

impl ArchiveClientCert {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            deleted_at: row.get(6)?,
            contents: ClientCertContents {
                ifname: row.get(0)?,
                private: row.get(1)?,
                public: row.get(2)?,
                ip: row.get(3)?,
                allowed_ips: row.get(4)?,
                config: row.get(5)?,
            },
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT ifname, private, public, ip, allowed_ips, config, deleted_at
              FROM archive_client_certs",
        )?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
