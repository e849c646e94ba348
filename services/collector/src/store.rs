//! SQLite sample sink.
//!
//! One connection per session. A sequence maps to one SQLite transaction:
//! `begin` opens it, `emit` stages sample rows, `commit` records the
//! sequence row and commits, `abort` rolls everything back. Values are
//! stored joined with commas, which is lossless because the wire format
//! forbids commas inside fields.

use rusqlite::{Connection, params};
use s4pp_engine::{Sample, SampleSink, SinkError};
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sequences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    keyid TEXT NOT NULL,
    seqid INTEGER NOT NULL,
    sample_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sequence_id INTEGER NOT NULL REFERENCES sequences(id),
    seqid INTEGER NOT NULL,
    dict_idx INTEGER NOT NULL,
    name TEXT NOT NULL,
    unit TEXT NOT NULL,
    unit_divisor INTEGER NOT NULL,
    time_num INTEGER NOT NULL,
    time_div INTEGER NOT NULL,
    span INTEGER NOT NULL,
    sample_values TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS samples_by_seq ON samples(sequence_id);
";

pub struct SqliteSink {
    conn: Connection,
    keyid: String,
    /// Sample count staged in the open transaction.
    staged: u32,
    in_tx: bool,
}

impl SqliteSink {
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        // Cross-session writers contend on the database file; let SQLite
        // wait instead of failing immediately.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(SqliteSink {
            conn,
            keyid: String::new(),
            staged: 0,
            in_tx: false,
        })
    }

    /// Records which key authenticated the session; stored on each
    /// committed sequence row.
    pub fn set_keyid(&mut self, keyid: &str) {
        self.keyid = keyid.to_owned();
    }

    fn sql(&self, stmt: &str) -> Result<(), SinkError> {
        self.conn
            .execute_batch(stmt)
            .map_err(|e| SinkError(e.to_string()))
    }
}

impl SampleSink for SqliteSink {
    fn begin(&mut self, _seqid: u64) -> Result<(), SinkError> {
        self.sql("BEGIN")?;
        // Samples are staged with a placeholder sequence_id (0) and
        // re-pointed to the real sequences row in `commit`, before the
        // transaction closes; defer FK checks to COMMIT so that
        // intermediate state doesn't trip the constraint.
        self.sql("PRAGMA defer_foreign_keys = ON")?;
        self.in_tx = true;
        self.staged = 0;
        Ok(())
    }

    fn emit(&mut self, sample: &Sample) -> Result<(), SinkError> {
        self.conn
            .execute(
                "INSERT INTO samples (sequence_id, seqid, dict_idx, name, unit, unit_divisor,
                                      time_num, time_div, span, sample_values)
                 VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    sample.seqid as i64,
                    sample.idx,
                    sample.name,
                    sample.unit,
                    sample.unit_divisor,
                    sample.time_num,
                    sample.time_div,
                    sample.span,
                    sample.values.join(","),
                ],
            )
            .map_err(|e| SinkError(e.to_string()))?;
        self.staged += 1;
        Ok(())
    }

    fn commit(&mut self, seqid: u64) -> Result<(), SinkError> {
        self.conn
            .execute(
                "INSERT INTO sequences (keyid, seqid, sample_count) VALUES (?1, ?2, ?3)",
                params![self.keyid, seqid as i64, self.staged],
            )
            .map_err(|e| SinkError(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE samples SET sequence_id = last_insert_rowid()
                 WHERE sequence_id = 0 AND seqid = ?1",
                params![seqid as i64],
            )
            .map_err(|e| SinkError(e.to_string()))?;
        self.sql("COMMIT")?;
        self.in_tx = false;
        Ok(())
    }

    fn abort(&mut self, seqid: u64) {
        if self.in_tx {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(seqid, error = %e, "rollback failed");
            }
            self.in_tx = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seqid: u64, value: &str) -> Sample {
        Sample {
            seqid,
            idx: 0,
            name: "temperature".to_owned(),
            unit: "C".to_owned(),
            unit_divisor: 100,
            time_num: 1000,
            time_div: 1,
            span: 0,
            values: vec![value.to_owned()],
        }
    }

    fn open_temp() -> (tempfile::TempDir, SqliteSink) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.sqlite3");
        let sink = SqliteSink::open(path.to_str().unwrap()).unwrap();
        (dir, sink)
    }

    #[test]
    fn committed_sequence_is_durable() {
        let (_dir, mut sink) = open_temp();
        sink.set_keyid("1234");
        sink.begin(0).unwrap();
        sink.emit(&sample(0, "2561")).unwrap();
        sink.emit(&sample(0, "2562")).unwrap();
        sink.commit(0).unwrap();

        let count: u32 = sink
            .conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let (keyid, samples): (String, u32) = sink
            .conn
            .query_row(
                "SELECT keyid, sample_count FROM sequences WHERE seqid = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(keyid, "1234");
        assert_eq!(samples, 2);
    }

    #[test]
    fn aborted_sequence_leaves_no_rows() {
        let (_dir, mut sink) = open_temp();
        sink.begin(3).unwrap();
        sink.emit(&sample(3, "1")).unwrap();
        sink.abort(3);

        let count: u32 = sink
            .conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        // The sink is reusable after an abort.
        sink.begin(4).unwrap();
        sink.emit(&sample(4, "2")).unwrap();
        sink.commit(4).unwrap();
    }

    #[test]
    fn values_round_trip_through_the_comma_join() {
        let (_dir, mut sink) = open_temp();
        let mut s = sample(0, "1");
        s.values = vec!["230".to_owned(), "NaN".to_owned(), "-Inf".to_owned()];
        sink.begin(0).unwrap();
        sink.emit(&s).unwrap();
        sink.commit(0).unwrap();

        let stored: String = sink
            .conn
            .query_row("SELECT sample_values FROM samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored.split(',').collect::<Vec<_>>(), vec!["230", "NaN", "-Inf"]);
    }
}
