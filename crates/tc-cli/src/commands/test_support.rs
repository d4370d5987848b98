//! Fixtures shared by command tests.

use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use tc_core::{Moment, Notification, Notifier};
use tc_db::{CreditPurchase, Database, NewEnrollment};

/// Notifier that keeps every notification it is handed.
#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<Notification>>);

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(Notification::kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn deliver(&self, notification: &Notification) -> bool {
        self.0.lock().unwrap().push(notification.clone());
        true
    }
}

/// Monday 2026-03-02 10:00 UTC, inside class hours.
pub fn monday_morning() -> Moment {
    Moment::utc(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap())
}

pub fn enroll(db: &mut Database, teacher: &str, student: &str, meeting_url: Option<&str>) {
    db.add_enrollment_at(
        &NewEnrollment {
            teacher_id: teacher.to_string(),
            student_id: student.to_string(),
            student_email: None,
            meeting_url: meeting_url.map(str::to_string),
            classes_per_week: 2,
            schedule: Vec::new(),
        },
        monday_morning().utc,
    )
    .unwrap();
}

pub fn buy(db: &mut Database, teacher: &str, student: &str, hours: f64) {
    db.purchase_credits_at(
        &CreditPurchase {
            student_id: student.to_string(),
            teacher_id: teacher.to_string(),
            parent_id: None,
            hours,
            rate_per_hour: None,
            payment_reference: None,
        },
        monday_morning().utc,
    )
    .unwrap();
}
