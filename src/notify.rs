use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

pub const ABSENCE_TITLE: &str = "You were marked absent";
pub const SUMMARY_TITLE: &str = "Attendance submitted";

#[derive(Debug, Error)]
#[error("push delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Delivery transport handed one notification at a time. Implementations
/// report failure; whether failure matters is the dispatcher's call.
pub trait PushService {
    fn send(&self, token: &str, title: &str, body: &str) -> Result<(), DeliveryError>;
}

/// Production transport: append the delivery to the push_outbox table for a
/// delivery agent to drain. seq order is dispatch order.
pub struct OutboxPush<'c> {
    conn: &'c Connection,
}

impl<'c> OutboxPush<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl PushService for OutboxPush<'_> {
    fn send(&self, token: &str, title: &str, body: &str) -> Result<(), DeliveryError> {
        self.conn
            .execute(
                "INSERT INTO push_outbox(token, title, body, queued_at) VALUES(?, ?, ?, ?)",
                (token, title, body, Utc::now().to_rfc3339()),
            )
            .map(|_| ())
            .map_err(|e| DeliveryError(e.to_string()))
    }
}

/// Best-effort notification fan-out. Every failure in here (missing token,
/// lookup failure, transport failure) is absorbed and logged; callers never
/// see an error from dispatch.
pub struct NotificationDispatcher<'c, 'p> {
    conn: &'c Connection,
    push: &'p dyn PushService,
}

impl<'c, 'p> NotificationDispatcher<'c, 'p> {
    pub fn new(conn: &'c Connection, push: &'p dyn PushService) -> Self {
        Self { conn, push }
    }

    pub fn notify_absence(&self, student_id: &str, date: &str) {
        let Some(token) = self.token_for(student_id, "student") else {
            log::debug!("no push token for student {student_id}; skipping absence notice");
            return;
        };
        let body = format!("You were marked absent on {date}.");
        if let Err(e) = self.push.send(&token, ABSENCE_TITLE, &body) {
            log::warn!("absence notice for student {student_id} dropped: {e}");
        }
    }

    pub fn notify_summary(&self, teacher_id: &str, record_count: usize) {
        let Some(token) = self.token_for(teacher_id, "teacher") else {
            log::debug!("no push token for teacher {teacher_id}; skipping summary");
            return;
        };
        let body = format!("Attendance recorded for {record_count} students.");
        if let Err(e) = self.push.send(&token, SUMMARY_TITLE, &body) {
            log::warn!("summary notice for teacher {teacher_id} dropped: {e}");
        }
    }

    fn token_for(&self, principal_id: &str, role: &str) -> Option<String> {
        let looked_up = self
            .conn
            .query_row(
                "SELECT token FROM push_tokens WHERE principal_id = ? AND role = ?",
                (principal_id, role),
                |r| r.get::<_, String>(0),
            )
            .optional();
        match looked_up {
            Ok(token) => token,
            Err(e) => {
                log::warn!("push token lookup failed for {role} {principal_id}: {e}");
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FailingPush, RecordingPush};
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::create_schema(&conn).expect("create schema");
        conn
    }

    fn register_token(conn: &Connection, principal_id: &str, role: &str, token: &str) {
        conn.execute(
            "INSERT INTO push_tokens(principal_id, role, token, updated_at)
             VALUES(?, ?, ?, ?)",
            (principal_id, role, token, "2024-05-01T00:00:00Z"),
        )
        .unwrap();
    }

    #[test]
    fn absence_notice_carries_the_date_to_the_student_token() {
        let conn = test_conn();
        register_token(&conn, "s1", "student", "tok-a");
        let push = RecordingPush::default();
        let dispatcher = NotificationDispatcher::new(&conn, &push);

        dispatcher.notify_absence("s1", "2024-05-01");

        let sent = push.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, "tok-a");
        assert_eq!(sent[0].title, ABSENCE_TITLE);
        assert!(sent[0].body.contains("2024-05-01"));
    }

    #[test]
    fn missing_token_is_a_silent_noop() {
        let conn = test_conn();
        let push = RecordingPush::default();
        let dispatcher = NotificationDispatcher::new(&conn, &push);

        dispatcher.notify_absence("s1", "2024-05-01");
        dispatcher.notify_summary("t1", 3);

        assert!(push.sent.borrow().is_empty());
    }

    #[test]
    fn transport_failure_is_absorbed() {
        let conn = test_conn();
        register_token(&conn, "s1", "student", "tok-a");
        let dispatcher = NotificationDispatcher::new(&conn, &FailingPush);

        // Must not panic or surface anything.
        dispatcher.notify_absence("s1", "2024-05-01");
    }

    #[test]
    fn token_lookup_is_scoped_by_role() {
        let conn = test_conn();
        // Same principal id registered as a student only.
        register_token(&conn, "p9", "student", "tok-s");
        let push = RecordingPush::default();
        let dispatcher = NotificationDispatcher::new(&conn, &push);

        dispatcher.notify_summary("p9", 1);
        assert!(push.sent.borrow().is_empty());

        dispatcher.notify_absence("p9", "2024-05-02");
        assert_eq!(push.sent.borrow().len(), 1);
    }
}
