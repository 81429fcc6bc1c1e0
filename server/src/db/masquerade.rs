use crate::ServerError;
use rusqlite::{params, Connection};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS masquerades (
      id         INTEGER PRIMARY KEY,
      source     TEXT NOT NULL, /* CIDR whose outbound traffic is rewritten */
      ifname     TEXT NOT NULL, /* egress device                            */
      comment    TEXT NOT NULL,
      created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
    )";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masquerade {
    pub id: i64,
    pub source: String,
    pub ifname: String,
    pub comment: String,
}

impl Masquerade {
    /// At most one masquerade row per egress interface; creating a second
    /// one is a no-op.
    pub fn create(
        conn: &Connection,
        source: &str,
        ifname: &str,
        comment: &str,
    ) -> Result<(), ServerError> {
        let existing: u32 = conn.query_row(
            "SELECT COUNT(*) FROM masquerades WHERE ifname = ?1",
            params![ifname],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(());
        }

        conn.execute(
            "INSERT INTO masquerades (source, ifname, comment) VALUES (?1, ?2, ?3)",
            params![source, ifname, comment],
        )?;
        Ok(())
    }

    pub fn delete(
        conn: &Connection,
        source: &str,
        ifname: &str,
        comment: &str,
    ) -> Result<(), ServerError> {
        conn.execute(
            "DELETE FROM masquerades WHERE ifname = ?1 AND source = ?2 AND comment = ?3",
            params![ifname, source, comment],
        )?;
        Ok(())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            ifname: row.get(2)?,
            comment: row.get(3)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn
            .prepare_cached("SELECT id, source, ifname, comment FROM masquerades ORDER BY id ASC")?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
