//! Spreadsheet mirror of personnel and attendance rows.
//!
//! Rows are appended through a [`SheetSink`]. Appends run only inside task
//! bodies, wrapped in [`crate::retry::with_retry`], so every failure is
//! returned as an error rather than a `success: false` payload.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::DateTime;
use serde::Serialize;

use crate::config::SheetsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetTab {
    Personnel,
    Attendance,
}

/// Summary of a successful append, stored as the task result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetAppend {
    pub tab: String,
    pub rows: usize,
    pub updated_range: Option<String>,
}

#[async_trait]
pub trait SheetSink: Send + Sync {
    async fn append(&self, tab: SheetTab, row: Vec<String>) -> Result<SheetAppend>;
}

/// Attendance row: `[punch time without offset, ident, image url or ""]`.
pub fn attendance_row(punch_time: &str, ident: &str, image_url: Option<&str>) -> Vec<String> {
    vec![
        format_timestamp(punch_time),
        ident.to_string(),
        image_url.unwrap_or("").to_string(),
    ]
}

/// Personnel row: `[group, name, "", "", time zone]`.
///
/// `TEACHER <name>` and `STAFF <name>` idents keep their prefix as the
/// group; student idents shaped like `NTU2025 Vincent Cheng` split into
/// school+year and name. Anything else is used verbatim for both columns.
pub fn personnel_row(ident: &str, time_zone: &str) -> Vec<String> {
    let (group, name) = split_ident(ident);
    let time_zone = if time_zone.is_empty() {
        attendance_core::models::DEFAULT_TIME_ZONE
    } else {
        time_zone
    };
    vec![
        group,
        name,
        String::new(),
        String::new(),
        time_zone.to_string(),
    ]
}

fn split_ident(ident: &str) -> (String, String) {
    for prefix in ["TEACHER", "STAFF"] {
        if let Some(rest) = ident.strip_prefix(prefix) {
            if rest.starts_with(char::is_whitespace) && !rest.trim().is_empty() {
                return (prefix.to_string(), rest.trim().to_string());
            }
        }
    }

    if let Some((head, rest)) = ident.split_once(char::is_whitespace) {
        let letters = head.trim_end_matches(|c: char| c.is_ascii_digit());
        let digits = &head[letters.len()..];
        if !letters.is_empty()
            && letters.chars().all(|c| c.is_ascii_uppercase())
            && digits.len() == 4
            && !rest.trim().is_empty()
        {
            return (head.to_string(), rest.trim().to_string());
        }
    }

    (ident.to_string(), ident.to_string())
}

/// Render an RFC 3339 timestamp as local wall time `YYYY-mm-ddTHH:MM:SS`.
pub fn format_timestamp(timestamp: &str) -> String {
    if timestamp.is_empty() {
        return String::new();
    }
    match DateTime::parse_from_rfc3339(&timestamp.replace('Z', "+00:00")) {
        Ok(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        Err(_) => timestamp
            .split('+')
            .next()
            .unwrap_or(timestamp)
            .to_string(),
    }
}

// ============ Disabled ============

pub struct DisabledSheetSink;

#[async_trait]
impl SheetSink for DisabledSheetSink {
    async fn append(&self, _tab: SheetTab, _row: Vec<String>) -> Result<SheetAppend> {
        bail!("Spreadsheet sink is disabled (set sheets.provider)")
    }
}

// ============ Webhook ============

/// Appends rows by posting `{"tab": .., "values": [[..]]}` to a web app
/// bound to the spreadsheet. A JSON reply may carry `updatedRange`.
pub struct WebhookSheetSink {
    client: reqwest::Client,
    url: String,
    personnel_tab: String,
    attendance_tab: String,
}

impl WebhookSheetSink {
    pub fn new(config: &SheetsConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("sheets.url required for webhook provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url,
            personnel_tab: config.personnel_tab.clone(),
            attendance_tab: config.attendance_tab.clone(),
        })
    }

    fn tab_name(&self, tab: SheetTab) -> &str {
        match tab {
            SheetTab::Personnel => &self.personnel_tab,
            SheetTab::Attendance => &self.attendance_tab,
        }
    }
}

#[async_trait]
impl SheetSink for WebhookSheetSink {
    async fn append(&self, tab: SheetTab, row: Vec<String>) -> Result<SheetAppend> {
        let tab_name = self.tab_name(tab).to_string();
        let body = serde_json::json!({
            "tab": tab_name,
            "values": [row],
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Spreadsheet append to '{}' failed {}: {}", tab_name, status, text);
        }

        let text = response.text().await.unwrap_or_default();
        let updated_range = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|json| {
                json.get("updatedRange")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
            });

        Ok(SheetAppend {
            tab: tab_name,
            rows: 1,
            updated_range,
        })
    }
}

/// Instantiate the sink named by `sheets.provider`.
pub fn create_sheet_sink(config: &SheetsConfig) -> Result<Box<dyn SheetSink>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSheetSink)),
        "webhook" => Ok(Box::new(WebhookSheetSink::new(config)?)),
        other => bail!("Unknown sheets provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attendance_row_drops_offset() {
        assert_eq!(
            attendance_row("2026-03-02T08:15:00+08:00", "s001", None),
            vec!["2026-03-02T08:15:00", "s001", ""]
        );
        assert_eq!(
            attendance_row("2026-03-02T00:15:00Z", "s001", Some("https://x/y.jpg")),
            vec!["2026-03-02T00:15:00", "s001", "https://x/y.jpg"]
        );
    }

    #[test]
    fn test_format_timestamp_fallback() {
        assert_eq!(format_timestamp("yesterday+noon"), "yesterday");
        assert_eq!(format_timestamp(""), "");
    }

    #[test]
    fn test_personnel_row_groups() {
        assert_eq!(
            personnel_row("TEACHER Amy Lin", "Asia/Taipei"),
            vec!["TEACHER", "Amy Lin", "", "", "Asia/Taipei"]
        );
        assert_eq!(
            personnel_row("STAFF Bob", "UTC")[..2],
            ["STAFF".to_string(), "Bob".to_string()]
        );
        assert_eq!(
            personnel_row("NTU2025 Vincent Cheng", "")[..2],
            ["NTU2025".to_string(), "Vincent Cheng".to_string()]
        );
        assert_eq!(personnel_row("NTU2025 Vincent Cheng", "")[4], "Asia/Taipei");
    }

    #[test]
    fn test_personnel_row_fallback() {
        assert_eq!(personnel_row("s001", "UTC")[..2], ["s001".to_string(), "s001".to_string()]);
        // Three digits is not a school year.
        assert_eq!(personnel_row("NTU202 Amy", "UTC")[0], "NTU202 Amy");
        assert_eq!(personnel_row("TEACHERS", "UTC")[0], "TEACHERS");
    }

    #[tokio::test]
    async fn test_disabled_sink_errors() {
        let sink = create_sheet_sink(&SheetsConfig::default()).unwrap();
        assert!(sink
            .append(SheetTab::Attendance, vec!["a".into()])
            .await
            .is_err());
    }
}
