use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;

/// Role of an authenticated principal, resolved upstream by the session
/// layer and passed explicitly with each protected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    // Any other role the session layer issues (admin, parent, ...). Such a
    // principal is authenticated but never authorized to record attendance.
    #[serde(other)]
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("role `{0}` may not record attendance")]
    NotTeacher(&'static str),
    #[error("student {student_id} is not in a class assigned to this teacher")]
    OutsideAssignedClasses { student_id: String },
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

struct TeacherAssignmentRow {
    class_id: String,
}

struct StudentClassRow {
    class_id: String,
}

/// Maps a teacher principal to the class set it may mark attendance for,
/// and each student to its class. Read-only over rows owned by the roster
/// admin operations.
pub struct ClassAssignmentResolver<'c> {
    conn: &'c Connection,
}

impl<'c> ClassAssignmentResolver<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// All-or-nothing gate over a whole batch: every student must belong to
    /// a class in the teacher's assigned set. Runs before any mutation; any
    /// single violation rejects the entire batch.
    pub fn authorize(&self, principal: &Principal, student_ids: &[&str]) -> Result<(), AuthError> {
        if principal.role != Role::Teacher {
            return Err(AuthError::NotTeacher(principal.role.as_str()));
        }
        let assigned = self.assigned_classes(&principal.id)?;
        for student_id in student_ids {
            match self.student_class(student_id)? {
                Some(row) if assigned.contains(&row.class_id) => {}
                // Unknown students cannot be proven in-assignment; fail closed.
                _ => {
                    return Err(AuthError::OutsideAssignedClasses {
                        student_id: student_id.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn assigned_classes(&self, teacher_id: &str) -> Result<HashSet<String>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT class_id FROM teacher_classes WHERE teacher_id = ?")?;
        let rows = stmt
            .query_map([teacher_id], |r| {
                Ok(TeacherAssignmentRow { class_id: r.get(0)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|row| row.class_id).collect())
    }

    fn student_class(&self, student_id: &str) -> Result<Option<StudentClassRow>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT class_id FROM students WHERE id = ?",
                [student_id],
                |r| Ok(StudentClassRow { class_id: r.get(0)? }),
            )
            .optional()
    }
}
