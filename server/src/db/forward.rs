use crate::ServerError;
use ipnet::IpNet;
use rusqlite::{params, Connection};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS forwards (
      id          INTEGER PRIMARY KEY,
      source      TEXT NOT NULL,       /* CIDR                                  */
      destination TEXT NOT NULL,       /* CIDR, or comma-IP list when is_list   */
      protocol    TEXT NOT NULL,       /* tcp | udp | icmp                      */
      position    INTEGER NOT NULL,    /* 1-based dense ordinal, see create()   */
      port        TEXT NOT NULL,       /* empty or multiport spec               */
      action      TEXT NOT NULL,       /* ACCEPT | DROP                         */
      comment     TEXT NOT NULL UNIQUE,
      is_list     INTEGER NOT NULL,
      is_except   INTEGER NOT NULL,
      created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
    )";

/// One row of the position-ordered FORWARD rule book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub position: u32,
    pub port: String,
    pub action: String,
    pub comment: String,
    pub is_list: bool,
    pub except: bool,
}

impl Forward {
    /// Inserts a rule at `position`, shifting every rule at that position or
    /// later up by one. A position above 1 is only accepted once position 1
    /// exists, so the book stays a contiguous range starting at 1. Runs in a
    /// single transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        conn: &mut Connection,
        position: u32,
        port: &str,
        action: &str,
        source: &str,
        destination: &str,
        protocol: &str,
        comment: &str,
        is_list: bool,
        except: bool,
    ) -> Result<(), ServerError> {
        if source.parse::<IpNet>().is_err() {
            return Err(ServerError::invalid(format!(
                "source: {source} is not subnet with cidr example 10.0.0.0/24"
            )));
        }
        if !is_list && destination.parse::<IpNet>().is_err() {
            return Err(ServerError::invalid(format!(
                "destination: {destination} is not subnet with cidr 10.0.0.0/24"
            )));
        }

        let tx = conn.transaction()?;

        let have_first: u32 = tx.query_row(
            "SELECT COUNT(*) FROM forwards WHERE position = 1",
            params![],
            |row| row.get(0),
        )?;
        if have_first == 0 && position > 1 {
            return Err(ServerError::invalid(
                "don't have rule number 1, set position to 1",
            ));
        }

        tx.execute(
            "UPDATE forwards SET position = position + 1 WHERE position >= ?1",
            params![position],
        )?;
        tx.execute(
            "INSERT INTO forwards
              (source, destination, protocol, position, port, action, comment, is_list, is_except)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                source, destination, protocol, position, port, action, comment, is_list, except
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Removes the rule with the given comment and closes the position gap it
    /// leaves behind. Runs in a single transaction.
    pub fn delete(conn: &mut Connection, comment: &str) -> Result<(), ServerError> {
        let tx = conn.transaction()?;

        let position: u32 = tx
            .query_row(
                "SELECT position FROM forwards WHERE comment = ?1",
                params![comment],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ServerError::invalid(format!("record not found: {comment}"))
                }
                e => ServerError::Database(e),
            })?;

        tx.execute("DELETE FROM forwards WHERE comment = ?1", params![comment])?;
        tx.execute(
            "UPDATE forwards SET position = position - 1 WHERE position > ?1",
            params![position],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            destination: row.get(2)?,
            protocol: row.get(3)?,
            position: row.get(4)?,
            port: row.get(5)?,
            action: row.get(6)?,
            comment: row.get(7)?,
            is_list: row.get(8)?,
            except: row.get(9)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, source, destination, protocol, position, port, action, comment, is_list, is_except
              FROM forwards ORDER BY position ASC",
        )?;
        let rules = stmt.query_map(params![], Self::from_row)?;
        Ok(rules.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn create(conn: &mut Connection, position: u32, comment: &str) -> Result<(), ServerError> {
        Forward::create(
            conn,
            position,
            "",
            "ACCEPT",
            "10.0.0.0/24",
            "192.168.0.0/16",
            "tcp",
            comment,
            false,
            true,
        )
    }

    fn positions(conn: &Connection) -> Vec<(u32, String)> {
        Forward::list(conn)
            .unwrap()
            .into_iter()
            .map(|f| (f.position, f.comment))
            .collect()
    }

    fn assert_contiguous(conn: &Connection) {
        let got: Vec<u32> = positions(conn).into_iter().map(|(p, _)| p).collect();
        let want: Vec<u32> = (1..=got.len() as u32).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_first_rule_must_be_position_one() {
        let mut conn = db::open_test_connection();
        let err = create(&mut conn, 2, "first").unwrap_err();
        assert!(err.to_string().contains("set position to 1"));

        create(&mut conn, 1, "first").unwrap();
        create(&mut conn, 2, "second").unwrap();
    }

    #[test]
    fn test_insert_shifts_later_positions_up() {
        let mut conn = db::open_test_connection();
        create(&mut conn, 1, "a").unwrap();
        create(&mut conn, 2, "b").unwrap();
        create(&mut conn, 3, "c").unwrap();

        create(&mut conn, 2, "wedge").unwrap();

        assert_eq!(
            positions(&conn),
            vec![
                (1, "a".to_string()),
                (2, "wedge".to_string()),
                (3, "b".to_string()),
                (4, "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_delete_closes_the_gap() {
        let mut conn = db::open_test_connection();
        for (pos, comment) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            create(&mut conn, pos, comment).unwrap();
        }

        Forward::delete(&mut conn, "b").unwrap();

        assert_eq!(
            positions(&conn),
            vec![
                (1, "a".to_string()),
                (2, "c".to_string()),
                (3, "d".to_string()),
            ]
        );
    }

    #[test]
    fn test_positions_stay_contiguous_across_mixed_commands() {
        let mut conn = db::open_test_connection();
        create(&mut conn, 1, "r1").unwrap();
        assert_contiguous(&conn);
        create(&mut conn, 1, "r2").unwrap();
        assert_contiguous(&conn);
        create(&mut conn, 2, "r3").unwrap();
        assert_contiguous(&conn);
        Forward::delete(&mut conn, "r2").unwrap();
        assert_contiguous(&conn);
        create(&mut conn, 3, "r4").unwrap();
        assert_contiguous(&conn);
        Forward::delete(&mut conn, "r1").unwrap();
        assert_contiguous(&conn);
        Forward::delete(&mut conn, "r3").unwrap();
        assert_contiguous(&conn);
        Forward::delete(&mut conn, "r4").unwrap();
        assert!(positions(&conn).is_empty());
    }

    #[test]
    fn test_delete_unknown_comment() {
        let mut conn = db::open_test_connection();
        let err = Forward::delete(&mut conn, "ghost").unwrap_err();
        assert!(err.to_string().contains("record not found"));
    }

    #[test]
    fn test_source_must_be_cidr() {
        let mut conn = db::open_test_connection();
        let err = Forward::create(
            &mut conn,
            1,
            "",
            "ACCEPT",
            "not-a-subnet",
            "192.168.0.0/16",
            "tcp",
            "bad",
            false,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("is not subnet"));
    }

    #[test]
    fn test_list_destination_skips_cidr_check() {
        let mut conn = db::open_test_connection();
        Forward::create(
            &mut conn,
            1,
            "443",
            "ACCEPT",
            "10.0.0.0/24",
            "1.1.1.1,8.8.8.8",
            "tcp",
            "cdn",
            true,
            true,
        )
        .unwrap();
        assert_eq!(Forward::list(&conn).unwrap()[0].destination, "1.1.1.1,8.8.8.8");
    }
}
