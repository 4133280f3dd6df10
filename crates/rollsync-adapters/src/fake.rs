use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rollsync_core::{AttendanceStatus, ExternalNameRow};
use secrecy::ExposeSecret;

use crate::{AttendancePortal, PortalCredentials, PortalError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub date: NaiveDate,
    pub external_row_reference: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Default)]
struct FakeState {
    rows_by_date: HashMap<NaiveDate, Vec<ExternalNameRow>>,
    expected_password: Option<String>,
    launch_failure: Option<String>,
    navigation_failures: HashSet<NaiveDate>,
    rejected_rows: HashMap<String, String>,
    timed_out_rows: HashSet<String>,
    disconnect_row: Option<String>,
    writes: Vec<RecordedWrite>,
    open_sessions: HashSet<usize>,
    launches: usize,
    closes: usize,
    logins: Vec<String>,
}

/// In-memory portal whose rows and failures are scripted by the caller.
///
/// Clones share state, so a test can keep one handle and give another to the
/// orchestrator.
#[derive(Debug, Clone, Default)]
pub struct FakePortal {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
pub struct FakeSession {
    id: usize,
}

#[derive(Debug, Default)]
pub struct FakePage {
    logged_in: bool,
    course: Option<String>,
    date: Option<NaiveDate>,
}

impl FakePortal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_rows(self, date: NaiveDate, rows: Vec<ExternalNameRow>) -> Self {
        self.state().rows_by_date.insert(date, rows);
        self
    }

    pub fn expect_password(self, password: &str) -> Self {
        self.state().expected_password = Some(password.to_string());
        self
    }

    pub fn fail_launch(self, message: &str) -> Self {
        self.state().launch_failure = Some(message.to_string());
        self
    }

    pub fn fail_navigation(self, date: NaiveDate) -> Self {
        self.state().navigation_failures.insert(date);
        self
    }

    pub fn reject_row(self, reference: &str, message: &str) -> Self {
        self.state()
            .rejected_rows
            .insert(reference.to_string(), message.to_string());
        self
    }

    pub fn time_out_row(self, reference: &str) -> Self {
        self.state().timed_out_rows.insert(reference.to_string());
        self
    }

    pub fn disconnect_on_row(self, reference: &str) -> Self {
        self.state().disconnect_row = Some(reference.to_string());
        self
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    pub fn launches(&self) -> usize {
        self.state().launches
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// Sessions launched and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions.len()
    }

    /// Ends every live session from the portal side, as a browser crash would.
    pub fn kill_sessions(&self) {
        self.state().open_sessions.clear();
    }

    pub fn logins(&self) -> Vec<String> {
        self.state().logins.clone()
    }
}

#[async_trait]
impl AttendancePortal for FakePortal {
    type Session = FakeSession;
    type Page = FakePage;

    async fn launch_browser(&self) -> Result<FakeSession, PortalError> {
        let mut state = self.state();
        if let Some(message) = &state.launch_failure {
            return Err(PortalError::Disconnected(message.clone()));
        }
        state.launches += 1;
        let id = state.launches;
        state.open_sessions.insert(id);
        Ok(FakeSession { id })
    }

    async fn create_page(&self, session: &mut FakeSession) -> Result<FakePage, PortalError> {
        if !self.state().open_sessions.contains(&session.id) {
            return Err(PortalError::Disconnected("session closed".into()));
        }
        Ok(FakePage::default())
    }

    async fn login_to_external_system(
        &self,
        page: &mut FakePage,
        credentials: &PortalCredentials,
    ) -> Result<(), PortalError> {
        let mut state = self.state();
        if let Some(expected) = &state.expected_password {
            if credentials.password.expose_secret() != expected {
                return Err(PortalError::Auth("invalid username or password".into()));
            }
        }
        state.logins.push(credentials.username.clone());
        page.logged_in = true;
        Ok(())
    }

    async fn select_course(
        &self,
        page: &mut FakePage,
        course_identifier: &str,
    ) -> Result<(), PortalError> {
        if !page.logged_in {
            return Err(PortalError::Navigation("not logged in".into()));
        }
        page.course = Some(course_identifier.to_string());
        Ok(())
    }

    async fn navigate_to_attendance_view(
        &self,
        page: &mut FakePage,
        date: NaiveDate,
    ) -> Result<(), PortalError> {
        if page.course.is_none() {
            return Err(PortalError::Navigation("no course selected".into()));
        }
        if self.state().navigation_failures.contains(&date) {
            return Err(PortalError::Navigation(format!("no attendance view for {date}")));
        }
        page.date = Some(date);
        Ok(())
    }

    async fn read_attendance_rows(
        &self,
        page: &mut FakePage,
    ) -> Result<Vec<ExternalNameRow>, PortalError> {
        let Some(date) = page.date else {
            return Err(PortalError::Read("no attendance view loaded".into()));
        };
        Ok(self
            .state()
            .rows_by_date
            .get(&date)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_attendance_for_row(
        &self,
        page: &mut FakePage,
        external_row_reference: &str,
        status: AttendanceStatus,
    ) -> Result<(), PortalError> {
        let Some(date) = page.date else {
            return Err(PortalError::Write {
                reference: external_row_reference.to_string(),
                message: "attendance view not open".into(),
            });
        };
        let mut state = self.state();
        if state.disconnect_row.as_deref() == Some(external_row_reference) {
            return Err(PortalError::Disconnected("browser crashed".into()));
        }
        if state.timed_out_rows.contains(external_row_reference) {
            return Err(PortalError::Timeout(Duration::from_secs(30)));
        }
        if let Some(message) = state.rejected_rows.get(external_row_reference) {
            return Err(PortalError::Write {
                reference: external_row_reference.to_string(),
                message: message.clone(),
            });
        }
        state.writes.push(RecordedWrite {
            date,
            external_row_reference: external_row_reference.to_string(),
            status,
        });
        Ok(())
    }

    async fn close_browser(&self, session: FakeSession) -> Result<(), PortalError> {
        let mut state = self.state();
        if !state.open_sessions.remove(&session.id) {
            return Err(PortalError::Disconnected("session already closed".into()));
        }
        state.closes += 1;
        Ok(())
    }
}
