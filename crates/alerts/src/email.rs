//! Email delivery through an HTTP relay.

use crate::channel::{format_price, format_volume, DeliveryChannel, DeliveryError, Notification, SendOutcome};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use sentinel_core::Channel;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Email relay settings.
#[derive(Clone)]
pub struct EmailConfig {
    /// Relay endpoint accepting `{from, to, subject, html}` JSON.
    pub relay_url: String,
    /// Bearer token for the relay.
    pub api_token: Option<String>,
    pub from_email: String,
    pub from_name: String,
    /// Base URL for links in the email body.
    pub frontend_url: String,
    pub timeout_ms: u64,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("relay_url", &self.relay_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .field("from_email", &self.from_email)
            .field("from_name", &self.from_name)
            .field("frontend_url", &self.frontend_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8025/send".to_string(),
            api_token: None,
            from_email: "alerts@localhost".to_string(),
            from_name: "Sentinel Alerts".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            timeout_ms: 8_000,
        }
    }
}

impl EmailConfig {
    /// Clamp the request timeout to 90% of the dispatcher's per-send timeout.
    pub fn bounded_by(mut self, delivery_timeout: Duration) -> Self {
        let ceiling = (delivery_timeout.as_millis() as u64).saturating_mul(9) / 10;
        self.timeout_ms = self.timeout_ms.min(ceiling.max(1));
        self
    }
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    from: String,
    to: String,
    subject: String,
    html: &'a str,
}

/// Email channel.
pub struct EmailChannel {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Why this notification should not be emailed, if anything.
    fn skip_reason(notification: &Notification) -> Option<String> {
        let profile = &notification.profile;
        if !profile.email_enabled {
            return Some("email disabled".to_string());
        }
        match profile.email.as_deref() {
            None | Some("") => return Some("no email address".to_string()),
            Some(_) => {}
        }
        if profile.in_quiet_hours(Utc::now()) {
            return Some("quiet hours".to_string());
        }
        None
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn kind(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &Notification) -> Result<SendOutcome, DeliveryError> {
        if let Some(reason) = Self::skip_reason(notification) {
            debug!(
                user_id = %notification.profile.user_id,
                trigger_id = notification.event.id,
                reason = %reason,
                "Skipping email"
            );
            return Ok(SendOutcome::Skipped(reason));
        }

        let to = sanitize_header(notification.profile.email.as_deref().unwrap_or_default());
        let subject = sanitize_header(&format!("Alert: {}", notification.title));
        let html = format_email_body(notification, &self.config.frontend_url);
        let message = RelayMessage {
            from: format!(
                "{} <{}>",
                sanitize_header(&self.config.from_name),
                sanitize_header(&self.config.from_email)
            ),
            to: to.clone(),
            subject: subject.clone(),
            html: &html,
        };

        let mut request = self.http.post(&self.config.relay_url).json(&message);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        info!(to = %to, subject = %subject, "Email sent");
        Ok(SendOutcome::Delivered)
    }
}

/// Map a relay error status to a delivery error.
fn classify_status(status: StatusCode, body: String) -> DeliveryError {
    let detail = format!("relay returned {}: {}", status.as_u16(), body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::Transient(detail)
    } else {
        DeliveryError::Permanent(detail)
    }
}

/// Strip CR and LF so values cannot inject extra headers.
pub fn sanitize_header(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// HTML body for an alert email.
pub fn format_email_body(notification: &Notification, frontend_url: &str) -> String {
    let event = &notification.event;
    let data = &event.market_data;
    let price = data.get("price").and_then(|v| v.as_f64());
    let change = data.get("change_pct").and_then(|v| v.as_f64());
    let volume = data.get("volume").and_then(|v| v.as_f64());
    let name = if notification.profile.full_name.is_empty() {
        "there"
    } else {
        notification.profile.full_name.as_str()
    };

    let cell = |v: Option<String>| v.unwrap_or_else(|| "n/a".to_string());

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"></head>
<body style="font-family: sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
  <h2>Alert Triggered: {rule}</h2>
  <p>Hi {name},</p>
  <p>{message}</p>
  <table style="width: 100%; border-collapse: collapse;">
    <tr><td><strong>Symbol</strong></td><td style="text-align: right;">{symbol}</td></tr>
    <tr><td><strong>Current Price</strong></td><td style="text-align: right;">{price}</td></tr>
    <tr><td><strong>Change</strong></td><td style="text-align: right;">{change}</td></tr>
    <tr><td><strong>Volume</strong></td><td style="text-align: right;">{volume}</td></tr>
  </table>
  <p><a href="{frontend}/alerts/{rule_id}">View Alert</a></p>
  <p style="color: #888; font-size: 12px;">
    You received this email because you have email alerts enabled.
    Manage your preferences in <a href="{frontend}/settings">account settings</a>.
  </p>
</body>
</html>"#,
        rule = escape_html(&event.rule_name),
        name = escape_html(name),
        message = escape_html(&notification.message),
        symbol = escape_html(event.symbol.as_str()),
        price = cell(price.map(format_price)),
        change = cell(change.map(|c| format!("{:.2}%", c))),
        volume = cell(volume.map(format_volume)),
        frontend = frontend_url.trim_end_matches('/'),
        rule_id = event.rule_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Timelike};
    use sentinel_core::{
        AlertRule, Comparison, ConditionMet, Frequency, QuietHours, RuleCondition, TriggerEvent,
        UserProfile,
    };

    fn notification(profile: UserProfile) -> Notification {
        let rule = AlertRule::new(
            "u1",
            "AAPL",
            RuleCondition::PriceAbove { threshold: 150.0 },
            Frequency::Daily,
        );
        let event = TriggerEvent::new(
            &rule,
            ConditionMet::Price {
                price: 152.34,
                threshold: 150.0,
                comparison: Comparison::Above,
            },
            serde_json::json!({"price": 152.34, "change_pct": 1.5, "volume": 2_500_000.0}),
            Utc::now(),
        );
        Notification::new(event, profile)
    }

    fn enabled_profile() -> UserProfile {
        let mut profile = UserProfile::default_for("u1");
        profile.email = Some("u1@example.com".to_string());
        profile.email_enabled = true;
        profile
    }

    #[test]
    fn test_sanitize_header() {
        assert_eq!(
            sanitize_header("a@b.com\r\nBcc: evil@x.com"),
            "a@b.comBcc: evil@x.com"
        );
    }

    #[test]
    fn test_skip_reasons() {
        assert_eq!(
            EmailChannel::skip_reason(&notification(UserProfile::default_for("u1"))),
            Some("email disabled".to_string())
        );

        let mut no_address = enabled_profile();
        no_address.email = None;
        assert_eq!(
            EmailChannel::skip_reason(&notification(no_address)),
            Some("no email address".to_string())
        );

        assert_eq!(EmailChannel::skip_reason(&notification(enabled_profile())), None);
    }

    #[test]
    fn test_skip_in_quiet_hours() {
        let mut profile = enabled_profile();
        let now = Utc::now().time();
        // A two-hour window centred on now, which may wrap midnight.
        let start = now - chrono::Duration::hours(1);
        let end = now + chrono::Duration::hours(1);
        profile.quiet_hours = Some(QuietHours::new(
            NaiveTime::from_hms_opt(start.hour(), start.minute(), 0).unwrap(),
            NaiveTime::from_hms_opt(end.hour(), end.minute(), 0).unwrap(),
        ));
        assert_eq!(
            EmailChannel::skip_reason(&notification(profile)),
            Some("quiet hours".to_string())
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
    }

    #[test]
    fn test_email_body() {
        let mut profile = enabled_profile();
        profile.full_name = "Ada <Admin>".to_string();
        let body = format_email_body(&notification(profile), "https://app.example.com/");
        assert!(body.contains("Hi Ada &lt;Admin&gt;,"));
        assert!(body.contains("$152.34"));
        assert!(body.contains("1.50%"));
        assert!(body.contains("2.5M"));
        assert!(body.contains("https://app.example.com/settings"));
    }

    #[test]
    fn test_request_timeout_stays_under_delivery_timeout() {
        let config = EmailConfig::default().bounded_by(Duration::from_secs(10));
        assert_eq!(config.timeout_ms, 8_000);

        let config = EmailConfig {
            timeout_ms: 10_000,
            ..Default::default()
        }
        .bounded_by(Duration::from_secs(10));
        assert_eq!(config.timeout_ms, 9_000);

        let config = EmailConfig::default().bounded_by(Duration::from_millis(500));
        assert_eq!(config.timeout_ms, 450);
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_transient() {
        let channel = EmailChannel::new(EmailConfig {
            relay_url: "http://127.0.0.1:9/send".to_string(),
            timeout_ms: 2_000,
            ..Default::default()
        })
        .unwrap();
        let err = channel.send(&notification(enabled_profile())).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {}", err);
    }
}
