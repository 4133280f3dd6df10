use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Response, StatusCode};
use rollsync_core::{AttendanceStatus, ExternalNameRow};
use scraper::{Html, Selector};
use secrecy::ExposeSecret;
use tracing::{debug, info_span, Instrument};

use crate::{AttendancePortal, PortalCredentials, PortalError};

/// Endpoints and page selectors of the legacy portal's HTML forms.
#[derive(Debug, Clone)]
pub struct HttpPortalConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub login_path: String,
    pub course_path: String,
    pub attendance_path: String,
    pub record_path: String,
    pub login_error_selector: String,
    pub row_selector: String,
    pub name_selector: String,
    pub reference_attr: String,
    pub status_codes: BTreeMap<AttendanceStatus, String>,
}

impl HttpPortalConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let status_codes = [
            (AttendanceStatus::Present, "P"),
            (AttendanceStatus::Absent, "A"),
            (AttendanceStatus::Late, "T"),
            (AttendanceStatus::Excused, "E"),
        ]
        .into_iter()
        .map(|(status, code)| (status, code.to_string()))
        .collect();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            login_path: "/login".into(),
            course_path: "/course".into(),
            attendance_path: "/attendance".into(),
            record_path: "/attendance/record".into(),
            login_error_selector: ".login-error".into(),
            row_selector: "tr[data-row-ref]".into(),
            name_selector: "td.student-name".into(),
            reference_attr: "data-row-ref".into(),
            status_codes,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn status_code(&self, status: AttendanceStatus) -> &str {
        self.status_codes
            .get(&status)
            .map(String::as_str)
            .unwrap_or_else(|| status.as_str())
    }
}

/// Portal driven through its plain HTML forms over a cookie-backed HTTP session.
#[derive(Debug, Clone)]
pub struct HttpFormPortal {
    config: HttpPortalConfig,
}

/// Navigation state of one portal tab.
#[derive(Debug)]
pub struct HttpPage {
    client: Client,
    authenticated: bool,
    course: Option<String>,
    date: Option<NaiveDate>,
    html: Option<String>,
}

impl HttpFormPortal {
    pub fn new(config: HttpPortalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HttpPortalConfig {
        &self.config
    }

    fn transport_error(
        &self,
        err: reqwest::Error,
        fallback: impl FnOnce(String) -> PortalError,
    ) -> PortalError {
        if err.is_timeout() {
            PortalError::Timeout(self.config.timeout)
        } else if err.is_connect() {
            PortalError::Disconnected(err.to_string())
        } else {
            fallback(err.to_string())
        }
    }

    async fn body_text(
        &self,
        resp: Response,
        fallback: impl FnOnce(String) -> PortalError,
    ) -> Result<String, PortalError> {
        resp.text().await.map_err(|e| self.transport_error(e, fallback))
    }
}

fn require_success(
    status: StatusCode,
    what: &str,
    on_error: impl FnOnce(String) -> PortalError,
) -> Result<(), PortalError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(on_error(format!("{what} returned http {}", status.as_u16())))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PortalError> {
    Selector::parse(selector)
        .map_err(|e| PortalError::Read(format!("invalid selector '{selector}': {e}")))
}

fn first_text(document: &Html, selector: &str) -> Result<Option<String>, PortalError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty()))
}

/// Extracts `ExternalNameRow`s from a rendered attendance view.
///
/// Rows without a reference attribute or a non-empty name cell are skipped.
pub fn parse_attendance_rows(
    html: &str,
    config: &HttpPortalConfig,
) -> Result<Vec<ExternalNameRow>, PortalError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector(&config.row_selector)?;
    let name_sel = parse_selector(&config.name_selector)?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let Some(reference) = row
            .value()
            .attr(&config.reference_attr)
            .map(str::trim)
            .filter(|r| !r.is_empty())
        else {
            debug!("skipping attendance row without reference");
            continue;
        };
        let name = row
            .select(&name_sel)
            .next()
            .map(|n| n.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        if name.is_empty() {
            debug!(reference, "skipping attendance row without name");
            continue;
        }
        rows.push(ExternalNameRow {
            name,
            external_row_reference: reference.to_string(),
        });
    }
    Ok(rows)
}

#[async_trait]
impl AttendancePortal for HttpFormPortal {
    type Session = Client;
    type Page = HttpPage;

    async fn launch_browser(&self) -> Result<Client, PortalError> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
            .build()
            .map_err(|e| PortalError::Disconnected(format!("building http client: {e}")))
    }

    async fn create_page(&self, session: &mut Client) -> Result<HttpPage, PortalError> {
        Ok(HttpPage {
            client: session.clone(),
            authenticated: false,
            course: None,
            date: None,
            html: None,
        })
    }

    async fn login_to_external_system(
        &self,
        page: &mut HttpPage,
        credentials: &PortalCredentials,
    ) -> Result<(), PortalError> {
        let span = info_span!("portal_login", username = %credentials.username);
        async {
            let resp = page
                .client
                .post(self.config.url(&self.config.login_path))
                .form(&[
                    ("username", credentials.username.as_str()),
                    ("password", credentials.password.expose_secret().as_str()),
                ])
                .send()
                .await
                .map_err(|e| self.transport_error(e, PortalError::Auth))?;
            require_success(resp.status(), "login", PortalError::Auth)?;

            let body = self.body_text(resp, PortalError::Auth).await?;
            let rejection = {
                let document = Html::parse_document(&body);
                first_text(&document, &self.config.login_error_selector)?
            };
            if let Some(message) = rejection {
                return Err(PortalError::Auth(message));
            }
            page.authenticated = true;
            Ok::<(), PortalError>(())
        }
        .instrument(span)
        .await
    }

    async fn select_course(
        &self,
        page: &mut HttpPage,
        course_identifier: &str,
    ) -> Result<(), PortalError> {
        if !page.authenticated {
            return Err(PortalError::Navigation("not logged in".into()));
        }
        let resp = page
            .client
            .get(self.config.url(&self.config.course_path))
            .query(&[("course", course_identifier)])
            .send()
            .await
            .map_err(|e| self.transport_error(e, PortalError::Navigation))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(PortalError::Auth("session expired".into()));
        }
        require_success(resp.status(), "course selection", PortalError::Navigation)?;
        page.course = Some(course_identifier.to_string());
        page.date = None;
        page.html = None;
        Ok(())
    }

    async fn navigate_to_attendance_view(
        &self,
        page: &mut HttpPage,
        date: NaiveDate,
    ) -> Result<(), PortalError> {
        let Some(course) = page.course.clone() else {
            return Err(PortalError::Navigation("no course selected".into()));
        };
        let date_param = date.format("%Y-%m-%d").to_string();
        let resp = page
            .client
            .get(self.config.url(&self.config.attendance_path))
            .query(&[("course", course.as_str()), ("date", date_param.as_str())])
            .send()
            .await
            .map_err(|e| self.transport_error(e, PortalError::Navigation))?;
        require_success(resp.status(), "attendance view", PortalError::Navigation)?;
        let html = self.body_text(resp, PortalError::Navigation).await?;
        page.date = Some(date);
        page.html = Some(html);
        Ok(())
    }

    async fn read_attendance_rows(
        &self,
        page: &mut HttpPage,
    ) -> Result<Vec<ExternalNameRow>, PortalError> {
        let Some(html) = page.html.as_deref() else {
            return Err(PortalError::Read("no attendance view loaded".into()));
        };
        parse_attendance_rows(html, &self.config)
    }

    async fn record_attendance_for_row(
        &self,
        page: &mut HttpPage,
        external_row_reference: &str,
        status: AttendanceStatus,
    ) -> Result<(), PortalError> {
        let write_error = |message: String| PortalError::Write {
            reference: external_row_reference.to_string(),
            message,
        };
        let (Some(course), Some(date)) = (page.course.clone(), page.date) else {
            return Err(write_error("attendance view not open".into()));
        };
        let date_param = date.format("%Y-%m-%d").to_string();
        let resp = page
            .client
            .post(self.config.url(&self.config.record_path))
            .form(&[
                ("course", course.as_str()),
                ("date", date_param.as_str()),
                ("row", external_row_reference),
                ("status", self.config.status_code(status)),
            ])
            .send()
            .await
            .map_err(|e| self.transport_error(e, write_error))?;
        require_success(resp.status(), "attendance write", write_error)
    }

    async fn close_browser(&self, session: Client) -> Result<(), PortalError> {
        drop(session);
        Ok(())
    }
}
