use crate::auth::{AuthError, ClassAssignmentResolver, Principal};
use crate::notify::{NotificationDispatcher, PushService};
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    HalfDay,
}

impl AttendanceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            "half_day" => Some(AttendanceStatus::HalfDay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::HalfDay => "half_day",
        }
    }
}

/// One record as submitted on the wire. Status and date stay raw here so a
/// bad value is a validation outcome, not a parse failure of the envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInput {
    pub student_id: String,
    pub date: String,
    pub status: String,
    #[serde(default)]
    pub remarks: Option<String>,
}

struct ValidatedRecord {
    student_id: String,
    date: NaiveDate,
    status: AttendanceStatus,
    remarks: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Forbidden(String),
    #[error("unrecognized status `{status}` for student {student_id}")]
    InvalidStatus { student_id: String, status: String },
    #[error("invalid date `{date}` for student {student_id}: expected YYYY-MM-DD")]
    InvalidDate { student_id: String, date: String },
    #[error("attendance write failed: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Forbidden(_) => "forbidden",
            SubmitError::InvalidStatus { .. } => "invalid_status",
            SubmitError::InvalidDate { .. } => "bad_params",
            SubmitError::Persistence(_) => "db_update_failed",
        }
    }
}

impl From<AuthError> for SubmitError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Db(e) => SubmitError::Persistence(e),
            other => SubmitError::Forbidden(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub recorded: usize,
    pub absences: usize,
}

/// Submit one attendance batch: validate and authorize everything up front
/// (fail-closed, no mutation on any rejection), replace all records in one
/// transaction, then fire best-effort notifications in submission order
/// with the teacher summary strictly last.
pub fn submit_batch(
    conn: &Connection,
    push: &dyn PushService,
    principal: &Principal,
    records: &[RecordInput],
) -> Result<BatchOutcome, SubmitError> {
    let validated = validate(records)?;

    let student_ids: Vec<&str> = records.iter().map(|r| r.student_id.as_str()).collect();
    ClassAssignmentResolver::new(conn).authorize(principal, &student_ids)?;

    replace_batch(conn, &validated, &principal.id)?;

    let dispatcher = NotificationDispatcher::new(conn, push);
    let mut absences = 0;
    for record in &validated {
        if record.status == AttendanceStatus::Absent {
            dispatcher.notify_absence(&record.student_id, &record.date.to_string());
            absences += 1;
        }
    }
    dispatcher.notify_summary(&principal.id, validated.len());

    Ok(BatchOutcome {
        recorded: validated.len(),
        absences,
    })
}

/// Whole-batch validation: any unrecognized status or malformed date
/// rejects everything, symmetric with the authorization gate.
fn validate(records: &[RecordInput]) -> Result<Vec<ValidatedRecord>, SubmitError> {
    let mut validated = Vec::with_capacity(records.len());
    for record in records {
        let status = AttendanceStatus::parse(&record.status).ok_or_else(|| {
            SubmitError::InvalidStatus {
                student_id: record.student_id.clone(),
                status: record.status.clone(),
            }
        })?;
        let date = NaiveDate::parse_from_str(&record.date, "%Y-%m-%d").map_err(|_| {
            SubmitError::InvalidDate {
                student_id: record.student_id.clone(),
                date: record.date.clone(),
            }
        })?;
        validated.push(ValidatedRecord {
            student_id: record.student_id.clone(),
            date,
            status,
            remarks: record.remarks.clone(),
        });
    }
    Ok(validated)
}

/// Replace every record of the batch inside one transaction. The upsert on
/// (student_id, date) keeps at most one live row per key; a mid-batch
/// failure rolls the whole batch back.
fn replace_batch(
    conn: &Connection,
    records: &[ValidatedRecord],
    marked_by: &str,
) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    let marked_at = Utc::now().to_rfc3339();
    for record in records {
        tx.execute(
            "INSERT INTO attendance_records(id, student_id, date, status, remarks, marked_by, marked_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               status = excluded.status,
               remarks = excluded.remarks,
               marked_by = excluded.marked_by,
               marked_at = excluded.marked_at",
            (
                Uuid::new_v4().to_string(),
                &record.student_id,
                record.date.to_string(),
                record.status.as_str(),
                &record.remarks,
                marked_by,
                &marked_at,
            ),
        )?;
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::notify::testing::{FailingPush, RecordingPush};
    use crate::notify::{ABSENCE_TITLE, SUMMARY_TITLE};
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::create_schema(&conn).expect("create schema");
        conn
    }

    fn seed_roster(conn: &Connection) {
        conn.execute("INSERT INTO classes(id, name) VALUES('c1', '8D')", [])
            .unwrap();
        conn.execute("INSERT INTO classes(id, name) VALUES('c2', '7B')", [])
            .unwrap();
        conn.execute("INSERT INTO teachers(id, name) VALUES('t1', 'Moore')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO teacher_classes(teacher_id, class_id) VALUES('t1', 'c1')",
            [],
        )
        .unwrap();
        for (id, last) in [("s1", "Avery"), ("s3", "Chen")] {
            conn.execute(
                "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
                 VALUES(?, 'c1', ?, 'Sam', 1, 0)",
                (id, last),
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
             VALUES('s2', 'c2', 'Brooks', 'Kim', 1, 0)",
            [],
        )
        .unwrap();
    }

    fn register_token(conn: &Connection, principal_id: &str, role: &str, token: &str) {
        conn.execute(
            "INSERT INTO push_tokens(principal_id, role, token, updated_at)
             VALUES(?, ?, ?, ?)",
            (principal_id, role, token, "2024-05-01T00:00:00Z"),
        )
        .unwrap();
    }

    fn teacher() -> Principal {
        Principal {
            id: "t1".to_string(),
            role: Role::Teacher,
        }
    }

    fn record(student_id: &str, date: &str, status: &str) -> RecordInput {
        RecordInput {
            student_id: student_id.to_string(),
            date: date.to_string(),
            status: status.to_string(),
            remarks: None,
        }
    }

    fn record_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM attendance_records", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn resubmission_converges_to_one_row_with_latest_status() {
        let conn = test_conn();
        seed_roster(&conn);
        let push = RecordingPush::default();

        submit_batch(&conn, &push, &teacher(), &[record("s1", "2024-05-01", "absent")])
            .expect("first submission");
        submit_batch(&conn, &push, &teacher(), &[record("s1", "2024-05-01", "late")])
            .expect("resubmission");

        assert_eq!(record_count(&conn), 1);
        let status: String = conn
            .query_row(
                "SELECT status FROM attendance_records WHERE student_id = 's1' AND date = '2024-05-01'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "late");
    }

    #[test]
    fn out_of_assignment_student_blocks_the_whole_batch() {
        let conn = test_conn();
        seed_roster(&conn);
        register_token(&conn, "t1", "teacher", "tok-b");
        let push = RecordingPush::default();

        let err = submit_batch(
            &conn,
            &push,
            &teacher(),
            &[
                record("s1", "2024-05-01", "present"),
                record("s2", "2024-05-01", "absent"),
            ],
        )
        .expect_err("s2 is outside t1's classes");

        assert_eq!(err.code(), "forbidden");
        assert_eq!(record_count(&conn), 0);
        assert!(push.sent.borrow().is_empty());
    }

    #[test]
    fn invalid_status_rejects_the_whole_batch_before_any_write() {
        let conn = test_conn();
        seed_roster(&conn);
        let push = RecordingPush::default();

        let err = submit_batch(
            &conn,
            &push,
            &teacher(),
            &[
                record("s1", "2024-05-01", "present"),
                record("s3", "2024-05-01", "vacationing"),
            ],
        )
        .expect_err("unrecognized status");

        assert_eq!(err.code(), "invalid_status");
        assert_eq!(record_count(&conn), 0);
        assert!(push.sent.borrow().is_empty());
    }

    #[test]
    fn malformed_date_rejects_the_whole_batch() {
        let conn = test_conn();
        seed_roster(&conn);
        let push = RecordingPush::default();

        let err = submit_batch(
            &conn,
            &push,
            &teacher(),
            &[record("s1", "05/01/2024", "present")],
        )
        .expect_err("malformed date");

        assert_eq!(err.code(), "bad_params");
        assert_eq!(record_count(&conn), 0);
    }

    #[test]
    fn non_teacher_principal_is_forbidden() {
        let conn = test_conn();
        seed_roster(&conn);
        let push = RecordingPush::default();
        let principal = Principal {
            id: "s1".to_string(),
            role: Role::Student,
        };

        let err = submit_batch(
            &conn,
            &push,
            &principal,
            &[record("s1", "2024-05-01", "present")],
        )
        .expect_err("students may not submit");

        assert_eq!(err.code(), "forbidden");
        assert_eq!(record_count(&conn), 0);
    }

    #[test]
    fn absences_notify_in_submission_order_then_one_summary() {
        let conn = test_conn();
        seed_roster(&conn);
        register_token(&conn, "s1", "student", "tok-a");
        register_token(&conn, "s3", "student", "tok-c");
        register_token(&conn, "t1", "teacher", "tok-b");
        let push = RecordingPush::default();

        let outcome = submit_batch(
            &conn,
            &push,
            &teacher(),
            &[
                record("s3", "2024-05-01", "absent"),
                record("s1", "2024-05-01", "absent"),
            ],
        )
        .expect("submission");

        assert_eq!(outcome.recorded, 2);
        assert_eq!(outcome.absences, 2);

        let sent = push.sent.borrow();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].token, "tok-c");
        assert_eq!(sent[0].title, ABSENCE_TITLE);
        assert!(sent[0].body.contains("2024-05-01"));
        assert_eq!(sent[1].token, "tok-a");
        assert_eq!(sent[2].token, "tok-b");
        assert_eq!(sent[2].title, SUMMARY_TITLE);
        assert!(sent[2].body.contains('2'));
    }

    #[test]
    fn present_and_late_records_trigger_no_absence_notice() {
        let conn = test_conn();
        seed_roster(&conn);
        register_token(&conn, "s1", "student", "tok-a");
        register_token(&conn, "t1", "teacher", "tok-b");
        let push = RecordingPush::default();

        submit_batch(
            &conn,
            &push,
            &teacher(),
            &[
                record("s1", "2024-05-01", "present"),
                record("s3", "2024-05-01", "half_day"),
            ],
        )
        .expect("submission");

        let sent = push.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, "tok-b");
        assert_eq!(sent[0].title, SUMMARY_TITLE);
    }

    #[test]
    fn mid_batch_write_failure_rolls_back_the_whole_batch() {
        let conn = test_conn();
        seed_roster(&conn);
        register_token(&conn, "s1", "student", "tok-a");
        register_token(&conn, "t1", "teacher", "tok-b");
        // Make the second record's upsert fail at the storage layer.
        conn.execute_batch(
            "CREATE TRIGGER block_s3 BEFORE INSERT ON attendance_records
             WHEN NEW.student_id = 's3'
             BEGIN SELECT RAISE(ABORT, 'row locked'); END",
        )
        .unwrap();
        let push = RecordingPush::default();

        let err = submit_batch(
            &conn,
            &push,
            &teacher(),
            &[
                record("s1", "2024-05-01", "absent"),
                record("s3", "2024-05-01", "present"),
            ],
        )
        .expect_err("second upsert is blocked");

        assert_eq!(err.code(), "db_update_failed");
        // All or none: the first record must not survive the failure, and
        // nothing may be dispatched for a failed batch.
        assert_eq!(record_count(&conn), 0);
        assert!(push.sent.borrow().is_empty());
    }

    #[test]
    fn push_outage_never_fails_a_persisted_submission() {
        let conn = test_conn();
        seed_roster(&conn);
        register_token(&conn, "s1", "student", "tok-a");
        register_token(&conn, "t1", "teacher", "tok-b");

        let outcome = submit_batch(
            &conn,
            &FailingPush,
            &teacher(),
            &[record("s1", "2024-05-01", "absent")],
        )
        .expect("persistence succeeded, delivery failure is absorbed");

        assert_eq!(outcome.recorded, 1);
        assert_eq!(record_count(&conn), 1);
    }

    #[test]
    fn status_parse_covers_the_four_recognized_values() {
        for (raw, expected) in [
            ("present", AttendanceStatus::Present),
            ("absent", AttendanceStatus::Absent),
            ("late", AttendanceStatus::Late),
            ("half_day", AttendanceStatus::HalfDay),
        ] {
            assert_eq!(AttendanceStatus::parse(raw), Some(expected));
            assert_eq!(expected.as_str(), raw);
        }
        assert_eq!(AttendanceStatus::parse("halfday"), None);
        assert_eq!(AttendanceStatus::parse("Present"), None);
    }
}
