//! Provenance records for produced audio: which question led to which
//! spoken answer, and where the file lives. Recording is fire-and-forget;
//! it must never block or fail the caller's stream.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct AudioRecord {
    pub question: String,
    pub answer: String,
    pub audio_path: String,
    pub voice: String,
    pub elapsed_ms: u64,
    pub created_at: String,
}

impl AudioRecord {
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        audio_path: impl Into<String>,
        voice: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            audio_path: audio_path.into(),
            voice: voice.into(),
            elapsed_ms,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Sink for audio provenance. Implementations log their own failures.
pub trait ProvenanceSink: Send + Sync {
    fn record(&self, rec: AudioRecord);
}

/// SQLite-backed sink.
pub struct SqliteProvenance {
    conn: Mutex<Connection>,
}

impl SqliteProvenance {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audio_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                audio_path TEXT NOT NULL,
                voice TEXT NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, rec: &AudioRecord) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("provenance db lock poisoned");
        conn.execute(
            "INSERT INTO audio_records
                (question, answer, audio_path, voice, elapsed_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.question,
                rec.answer,
                rec.audio_path,
                rec.voice,
                rec.elapsed_ms as i64,
                rec.created_at
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    fn count(&self) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().expect("provenance db lock poisoned");
        conn.query_row("SELECT COUNT(*) FROM audio_records", [], |r| r.get(0))
    }
}

impl ProvenanceSink for SqliteProvenance {
    fn record(&self, rec: AudioRecord) {
        if let Err(err) = self.insert(&rec) {
            tracing::warn!(%err, "failed to persist audio provenance");
        }
    }
}

/// Discards every record. For deployments without a provenance store and
/// for tests.
pub struct NullSink;

impl ProvenanceSink for NullSink {
    fn record(&self, _rec: AudioRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_survive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteProvenance::open(dir.path().join("prov.db")).unwrap();
        sink.record(AudioRecord::new(
            "what is the weather",
            "It is sunny.",
            "/static/tts/a.wav",
            "v1",
            250,
        ));
        sink.record(AudioRecord::new("q2", "a2", "/static/tts/b.wav", "v1", 90));
        assert_eq!(sink.count().unwrap(), 2);
    }
}
