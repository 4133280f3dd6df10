//! Capability contract for the external attendance portal plus its implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rollsync_core::{AttendanceStatus, ExternalNameRow};
use secrecy::SecretString;
use thiserror::Error;

mod fake;
mod http;

pub use fake::{FakePage, FakePortal, FakeSession, RecordedWrite};
pub use http::{parse_attendance_rows, HttpFormPortal, HttpPage, HttpPortalConfig};

pub const CRATE_NAME: &str = "rollsync-adapters";

/// Decrypted portal login. Only ever built right before `login_to_external_system`.
#[derive(Debug)]
pub struct PortalCredentials {
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal login rejected: {0}")]
    Auth(String),
    #[error("portal navigation failed: {0}")]
    Navigation(String),
    #[error("could not read attendance rows: {0}")]
    Read(String),
    #[error("attendance write for row {reference} rejected: {message}")]
    Write { reference: String, message: String },
    #[error("portal call timed out after {0:?}")]
    Timeout(Duration),
    #[error("portal session lost: {0}")]
    Disconnected(String),
}

impl PortalError {
    /// Errors after which the session cannot be used for further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PortalError::Disconnected(_))
    }
}

/// One exclusive portal session per sync job. Every method is an I/O suspension point;
/// timeouts are enforced by the implementation and surface as [`PortalError::Timeout`].
#[async_trait]
pub trait AttendancePortal: Send + Sync {
    type Session: Send;
    type Page: Send;

    async fn launch_browser(&self) -> Result<Self::Session, PortalError>;

    async fn create_page(&self, session: &mut Self::Session) -> Result<Self::Page, PortalError>;

    async fn login_to_external_system(
        &self,
        page: &mut Self::Page,
        credentials: &PortalCredentials,
    ) -> Result<(), PortalError>;

    async fn select_course(
        &self,
        page: &mut Self::Page,
        course_identifier: &str,
    ) -> Result<(), PortalError>;

    async fn navigate_to_attendance_view(
        &self,
        page: &mut Self::Page,
        date: NaiveDate,
    ) -> Result<(), PortalError>;

    async fn read_attendance_rows(
        &self,
        page: &mut Self::Page,
    ) -> Result<Vec<ExternalNameRow>, PortalError>;

    async fn record_attendance_for_row(
        &self,
        page: &mut Self::Page,
        external_row_reference: &str,
        status: AttendanceStatus,
    ) -> Result<(), PortalError>;

    async fn close_browser(&self, session: Self::Session) -> Result<(), PortalError>;
}
