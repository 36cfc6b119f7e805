//! Reliable work queue: pending -> processing -> completed/failed/dead_letter, plus a
//! `scheduled` table for delayed reanalysis.
//!
//! Grounded on `signals/db_storage.rs`'s transaction style (`conn.transaction()`, prepared
//! statements, `params!`) generalized from signal storage to task-queue storage; the
//! at-least-once-plus-`completed`-dedup semantics are new logic this crate needs that the
//! teacher has no direct analogue for, built in the teacher's SQL idiom.

use crate::db::Db;
use crate::error::AppError;
use crate::models::{ScheduledContext, Task};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// Result of a single `pop()` call: nothing pending, a task ready for processing, or a
/// payload that could not be parsed and was diverted to `dead_letter` in the same transaction.
#[derive(Debug, Clone)]
pub enum PopOutcome {
    Empty,
    Task(Task),
    DeadLettered { thread_id: String, reason: String },
}

#[derive(Clone)]
pub struct Queue {
    db: Db,
}

impl Queue {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Enqueues a task. A `thread_id` already present in `completed` is dropped silently
    /// (at-least-once upstream delivery is expected; this is the dedup boundary). A
    /// `thread_id` already pending/processing/scheduled is left untouched rather than
    /// duplicated.
    pub fn enqueue(&self, task: &Task) -> Result<(), AppError> {
        let seq = self
            .db
            .next_seq()
            .map_err(AppError::QueueUnreachable)?;
        let payload = serde_json::to_string(task).map_err(|e| AppError::ParseError(e.into()))?;
        let now = Utc::now().timestamp();

        self.db
            .with_conn(|conn| {
                let already_done: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue_completed WHERE thread_id = ?1",
                    [&task.thread_id],
                    |row| row.get(0),
                )?;
                if already_done > 0 {
                    return Ok(());
                }
                conn.execute(
                    "INSERT OR IGNORE INTO queue_pending (thread_id, thread_name, payload_json, enqueued_at, seq)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task.thread_id, task.thread_name, payload, now, seq],
                )?;
                Ok(())
            })
            .map_err(AppError::QueueUnreachable)
    }

    /// Atomically moves the oldest pending task into `processing`. A payload that fails to
    /// parse as a `Task` never reaches `processing` at all - it's diverted straight to
    /// `dead_letter` in the same transaction, since nothing downstream can act on it.
    pub fn pop(&self) -> Result<PopOutcome, AppError> {
        self.db
            .with_conn(|conn| {
                let row = conn
                    .query_row(
                        "SELECT thread_id, thread_name, payload_json FROM queue_pending
                         ORDER BY seq ASC LIMIT 1",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?;

                let Some((thread_id, thread_name, payload)) = row else {
                    return Ok(PopOutcome::Empty);
                };

                let now = Utc::now().timestamp();

                let task: Task = match serde_json::from_str(&payload) {
                    Ok(task) => task,
                    Err(err) => {
                        conn.execute(
                            "DELETE FROM queue_pending WHERE thread_id = ?1",
                            [&thread_id],
                        )?;
                        conn.execute(
                            "INSERT OR REPLACE INTO queue_dead_letter (thread_id, reason, raw_payload, dead_lettered_at)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![thread_id, format!("task payload did not parse: {err}"), payload, now],
                        )?;
                        return Ok(PopOutcome::DeadLettered {
                            thread_id,
                            reason: err.to_string(),
                        });
                    }
                };

                conn.execute(
                    "INSERT INTO queue_processing (thread_id, thread_name, payload_json, enqueued_at, claimed_at, seq)
                     SELECT thread_id, thread_name, payload_json, enqueued_at, ?2, seq FROM queue_pending WHERE thread_id = ?1",
                    params![thread_id, now],
                )?;
                conn.execute(
                    "DELETE FROM queue_pending WHERE thread_id = ?1",
                    [&thread_id],
                )?;
                let _ = thread_name;
                Ok(PopOutcome::Task(task))
            })
            .map_err(AppError::QueueUnreachable)
    }

    pub fn complete(&self, thread_id: &str) -> Result<(), AppError> {
        let now = Utc::now().timestamp();
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM queue_processing WHERE thread_id = ?1",
                    [thread_id],
                )?;
                conn.execute(
                    "INSERT OR REPLACE INTO queue_completed (thread_id, completed_at) VALUES (?1, ?2)",
                    params![thread_id, now],
                )?;
                Ok(())
            })
            .map_err(AppError::QueueUnreachable)
    }

    /// Moves a processing task to `failed`, keyed by `thread_id` with its error kind and the
    /// original payload preserved for operator re-enqueue.
    pub fn fail(&self, thread_id: &str, err: &AppError) -> Result<(), AppError> {
        let now = Utc::now().timestamp();
        self.db
            .with_conn(|conn| {
                let payload: String = conn
                    .query_row(
                        "SELECT payload_json FROM queue_processing WHERE thread_id = ?1",
                        [thread_id],
                        |row| row.get(0),
                    )
                    .unwrap_or_default();
                conn.execute(
                    "DELETE FROM queue_processing WHERE thread_id = ?1",
                    [thread_id],
                )?;
                conn.execute(
                    "INSERT OR REPLACE INTO queue_failed (thread_id, error_kind, error_message, failed_at, payload_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![thread_id, err.kind(), err.to_string(), now, payload],
                )?;
                Ok(())
            })
            .map_err(AppError::QueueUnreachable)
    }

    /// Diverts an unparseable raw payload straight to `dead_letter`, skipping `processing`
    /// entirely since it never became a typed `Task`.
    pub fn dead_letter(&self, thread_id: &str, raw_payload: &str, reason: &str) -> Result<(), AppError> {
        let now = Utc::now().timestamp();
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM queue_pending WHERE thread_id = ?1",
                    [thread_id],
                )?;
                conn.execute(
                    "DELETE FROM queue_processing WHERE thread_id = ?1",
                    [thread_id],
                )?;
                conn.execute(
                    "INSERT OR REPLACE INTO queue_dead_letter (thread_id, reason, raw_payload, dead_lettered_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![thread_id, reason, raw_payload, now],
                )?;
                Ok(())
            })
            .map_err(AppError::QueueUnreachable)
    }

    /// Parks a task for delayed reanalysis at `due_at` (epoch seconds), carrying the
    /// `ScheduledContext` the next pass needs (retry count, prior tool-call summary, etc.).
    pub fn schedule(
        &self,
        task: &Task,
        due_at: i64,
        scheduled_context: &ScheduledContext,
    ) -> Result<(), AppError> {
        let seq = self.db.next_seq().map_err(AppError::QueueUnreachable)?;
        let payload = serde_json::to_string(task).map_err(|e| AppError::ParseError(e.into()))?;
        let ctx_json =
            serde_json::to_string(scheduled_context).map_err(|e| AppError::ParseError(e.into()))?;

        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO queue_scheduled
                     (thread_id, thread_name, due_at, seq, payload_json, scheduled_context_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![task.thread_id, task.thread_name, due_at, seq, payload, ctx_json],
                )?;
                Ok(())
            })
            .map_err(AppError::QueueUnreachable)
    }

    /// Releases every scheduled entry with `due_at <= now`, ascending `due_at` with
    /// insertion-order (`seq`) tiebreak, back into `pending`. Returns the tasks released.
    pub fn release_due(&self, now: i64) -> Result<Vec<Task>, AppError> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT thread_id, thread_name, payload_json, scheduled_context_json
                     FROM queue_scheduled WHERE due_at <= ?1 ORDER BY due_at ASC, seq ASC",
                )?;
                let rows = stmt
                    .query_map([now], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut released = Vec::with_capacity(rows.len());
                for (thread_id, thread_name, payload, ctx_json) in rows {
                    let mut task: Task = serde_json::from_str(&payload)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    let ctx: ScheduledContext = serde_json::from_str(&ctx_json)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    task.scheduled_context = Some(ctx);
                    let _ = &thread_name;

                    let seq = conn.query_row(
                        "UPDATE seq_counter SET next_seq = next_seq + 1 WHERE id = 1 RETURNING next_seq - 1",
                        [],
                        |row| row.get::<_, i64>(0),
                    )?;
                    let new_payload = serde_json::to_string(&task)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    conn.execute(
                        "INSERT OR REPLACE INTO queue_pending (thread_id, thread_name, payload_json, enqueued_at, seq)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![task.thread_id, task.thread_name, new_payload, now, seq],
                    )?;
                    conn.execute(
                        "DELETE FROM queue_scheduled WHERE thread_id = ?1",
                        [&task.thread_id],
                    )?;
                    released.push(task);
                }
                Ok(released)
            })
            .map_err(AppError::QueueUnreachable)
    }

    /// Moves every row left in `processing` back to `pending`. Run once at startup, before the
    /// consumer loop begins popping, so a crash mid-task never loses the task — it just
    /// reprocesses (at-least-once, not exactly-once).
    pub fn reclaim(&self) -> Result<usize, AppError> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT thread_id, thread_name, payload_json, enqueued_at, seq FROM queue_processing",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);

                let count = rows.len();
                for (thread_id, thread_name, payload, enqueued_at, seq) in rows {
                    conn.execute(
                        "INSERT OR REPLACE INTO queue_pending (thread_id, thread_name, payload_json, enqueued_at, seq)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![thread_id, thread_name, payload, enqueued_at, seq],
                    )?;
                    conn.execute(
                        "DELETE FROM queue_processing WHERE thread_id = ?1",
                        [&thread_id],
                    )?;
                }
                Ok(count)
            })
            .map_err(AppError::QueueUnreachable)
    }

    pub fn pending_depth(&self) -> Result<i64, AppError> {
        self.db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM queue_pending", [], |row| row.get(0))?)
            })
            .map_err(AppError::QueueUnreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task {
            thread_id: id.to_string(),
            thread_name: Some("thread".to_string()),
            scheduled_context: None,
        }
    }

    #[test]
    fn enqueue_pop_complete_roundtrip() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        queue.enqueue(&task("t1")).unwrap();
        assert_eq!(queue.pending_depth().unwrap(), 1);

        let popped = match queue.pop().unwrap() {
            PopOutcome::Task(task) => task,
            other => panic!("expected a task, got {other:?}"),
        };
        assert_eq!(popped.thread_id, "t1");
        assert_eq!(queue.pending_depth().unwrap(), 0);

        queue.complete("t1").unwrap();
        // Re-enqueueing a completed thread_id is a no-op.
        queue.enqueue(&task("t1")).unwrap();
        assert_eq!(queue.pending_depth().unwrap(), 0);
    }

    #[test]
    fn fifo_ordering_preserved() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        queue.enqueue(&task("a")).unwrap();
        queue.enqueue(&task("b")).unwrap();
        queue.enqueue(&task("c")).unwrap();

        assert_eq!(pop_task(&queue).thread_id, "a");
        assert_eq!(pop_task(&queue).thread_id, "b");
        assert_eq!(pop_task(&queue).thread_id, "c");
    }

    fn pop_task(queue: &Queue) -> Task {
        match queue.pop().unwrap() {
            PopOutcome::Task(task) => task,
            other => panic!("expected a task, got {other:?}"),
        }
    }

    #[test]
    fn reclaim_moves_processing_back_to_pending() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        queue.enqueue(&task("t1")).unwrap();
        queue.pop().unwrap();
        assert_eq!(queue.pending_depth().unwrap(), 0);

        let reclaimed = queue.reclaim().unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(queue.pending_depth().unwrap(), 1);
    }

    #[test]
    fn schedule_then_release_due() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        let ctx = ScheduledContext {
            retry_count: 1,
            delay_reason: Some("waiting for confirmation".to_string()),
            ..Default::default()
        };
        queue.schedule(&task("delayed"), 1000, &ctx).unwrap();

        let none_yet = queue.release_due(500).unwrap();
        assert!(none_yet.is_empty());

        let released = queue.release_due(1000).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].thread_id, "delayed");
        assert_eq!(
            released[0].scheduled_context.as_ref().unwrap().retry_count,
            1
        );
        assert_eq!(queue.pending_depth().unwrap(), 1);
    }

    #[test]
    fn dead_letter_removes_from_other_tables() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        queue.enqueue(&task("bad")).unwrap();
        queue.pop().unwrap();
        queue.dead_letter("bad", "{not json", "unparseable payload").unwrap();
        assert_eq!(queue.reclaim().unwrap(), 0);
    }

    #[test]
    fn pop_diverts_unparseable_payload_to_dead_letter() {
        let queue = Queue::new(Db::open_in_memory().unwrap());
        let now = Utc::now().timestamp();
        queue
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO queue_pending (thread_id, thread_name, payload_json, enqueued_at, seq)
                     VALUES ('corrupt', NULL, '{not json', ?1, 1)",
                    params![now],
                )?;
                Ok(())
            })
            .unwrap();

        match queue.pop().unwrap() {
            PopOutcome::DeadLettered { thread_id, .. } => assert_eq!(thread_id, "corrupt"),
            other => panic!("expected DeadLettered, got {other:?}"),
        }
        assert_eq!(queue.pending_depth().unwrap(), 0);
        assert_eq!(queue.reclaim().unwrap(), 0);
    }
}
