//! Core types for Cadence

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Local wall-clock time of a recurring slot.
///
/// Written `HH:MM` to apply on every active weekday, or `Mon 09:00` to pin the
/// time to one weekday (0 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime {
    pub weekday: Option<u8>,
    pub hour: u8,
    pub minute: u8,
}

impl SlotTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidRule(format!(
                "{:02}:{:02} is not a valid time of day",
                hour, minute
            )));
        }
        Ok(Self {
            weekday: None,
            hour,
            minute,
        })
    }

    /// A time that only applies on `weekday` (0 = Sunday)
    pub fn on(weekday: u8, hour: u8, minute: u8) -> Result<Self, ScheduleError> {
        if weekday > 6 {
            return Err(ScheduleError::InvalidRule(format!(
                "weekday {} is outside 0-6",
                weekday
            )));
        }
        Ok(Self {
            weekday: Some(weekday),
            ..Self::new(hour, minute)?
        })
    }

    pub fn applies_on(&self, weekday: chrono::Weekday) -> bool {
        self.weekday
            .map_or(true, |d| d == weekday.num_days_from_sunday() as u8)
    }
}

fn parse_weekday(name: &str) -> Option<u8> {
    name.parse::<chrono::Weekday>()
        .ok()
        .map(|day| day.num_days_from_sunday() as u8)
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(day) = self.weekday {
            write!(f, "{} ", WEEKDAY_NAMES[day as usize % 7])?;
        }
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for SlotTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (weekday, clock) = match s.split_once(char::is_whitespace) {
            Some((day, clock)) => {
                let day = parse_weekday(day).ok_or_else(|| {
                    ScheduleError::InvalidRule(format!("unknown weekday in '{}'", s))
                })?;
                (Some(day), clock.trim())
            }
            None => (None, s),
        };

        let (h, m) = clock
            .split_once(':')
            .ok_or_else(|| ScheduleError::InvalidRule(format!("expected HH:MM, got '{}'", s)))?;
        let hour = h
            .parse::<u8>()
            .map_err(|_| ScheduleError::InvalidRule(format!("invalid hour in '{}'", s)))?;
        let minute = m
            .parse::<u8>()
            .map_err(|_| ScheduleError::InvalidRule(format!("invalid minute in '{}'", s)))?;

        match weekday {
            Some(day) => Self::on(day, hour, minute),
            None => Self::new(hour, minute),
        }
    }
}

impl TryFrom<String> for SlotTime {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotTime> for String {
    fn from(value: SlotTime) -> Self {
        value.to_string()
    }
}

/// Weekly posting cadence for one account.
///
/// Weekdays use 0 = Sunday through 6 = Saturday. An empty weekday set means
/// every day. `max_per_day` of `None` means no daily cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub account_id: String,
    pub times: Vec<SlotTime>,
    pub weekdays: Vec<u8>,
    pub timezone: String,
    pub max_per_day: Option<u32>,
    pub paused: bool,
    pub skip_next: bool,
}

impl RecurrenceRule {
    pub fn new(account_id: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            times: Vec::new(),
            weekdays: Vec::new(),
            timezone: timezone.into(),
            max_per_day: None,
            paused: false,
            skip_next: false,
        }
    }

    pub fn with_times(mut self, times: impl IntoIterator<Item = SlotTime>) -> Self {
        self.times = times.into_iter().collect();
        self
    }

    pub fn with_weekdays(mut self, weekdays: impl IntoIterator<Item = u8>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    pub fn with_max_per_day(mut self, max: u32) -> Self {
        self.max_per_day = Some(max);
        self
    }

    /// Parse the rule's IANA timezone
    pub fn tz(&self) -> Result<chrono_tz::Tz, ScheduleError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ScheduleError::InvalidRule(format!("unknown timezone '{}'", self.timezone)))
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.tz()?;
        if let Some(day) = self.weekdays.iter().find(|d| **d > 6) {
            return Err(ScheduleError::InvalidRule(format!(
                "weekday {} is outside 0-6",
                day
            )));
        }
        Ok(())
    }

    pub fn is_active_weekday(&self, weekday: chrono::Weekday) -> bool {
        self.weekdays.is_empty()
            || self
                .weekdays
                .contains(&(weekday.num_days_from_sunday() as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Reserved,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Reserved => "reserved",
            SlotStatus::InProgress => "in_progress",
            SlotStatus::Completed => "completed",
            SlotStatus::Failed => "failed",
            SlotStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(SlotStatus::Reserved),
            "in_progress" => Some(SlotStatus::InProgress),
            "completed" => Some(SlotStatus::Completed),
            "failed" => Some(SlotStatus::Failed),
            "canceled" => Some(SlotStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (account, instant) booking in the queue ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSlot {
    pub id: String,
    pub account_id: String,
    pub slot_at: DateTime<Utc>,
    pub content_id: Option<String>,
    pub status: SlotStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueSlot {
    pub fn reserve(account_id: &str, slot_at: DateTime<Utc>, content_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            slot_at,
            content_id: content_id.map(str::to_string),
            status: SlotStatus::Reserved,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    Scheduled,
    Queued,
    Publishing,
    Published,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Scheduled => "scheduled",
            ContentStatus::Queued => "queued",
            ContentStatus::Publishing => "publishing",
            ContentStatus::Published => "published",
            ContentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ContentStatus::Draft),
            "scheduled" => Some(ContentStatus::Scheduled),
            "queued" => Some(ContentStatus::Queued),
            "publishing" => Some(ContentStatus::Publishing),
            "published" => Some(ContentStatus::Published),
            "failed" => Some(ContentStatus::Failed),
            _ => None,
        }
    }

    /// States the orchestrator accepts for a dispatch
    pub fn is_publishable(&self) -> bool {
        matches!(
            self,
            ContentStatus::Scheduled | ContentStatus::Queued | ContentStatus::Publishing
        )
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishable body of a content item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Apply a per-account variant; fields set on the override win
    pub fn with_override(&self, variant: &PayloadOverride) -> Payload {
        Payload {
            text: variant.text.clone().unwrap_or_else(|| self.text.clone()),
            media: variant.media.clone().unwrap_or_else(|| self.media.clone()),
            link: variant.link.clone().or_else(|| self.link.clone()),
        }
    }
}

/// Per-account variant of a content item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub body: Payload,
    pub targets: Vec<String>,
    pub variants: HashMap<String, PayloadOverride>,
    pub status: ContentStatus,
    pub due_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ContentItem {
    pub fn new(body: Payload, targets: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body,
            targets,
            variants: HashMap::new(),
            status: ContentStatus::Draft,
            due_at: None,
            last_error_code: None,
            last_error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_variant(mut self, account_id: &str, variant: PayloadOverride) -> Self {
        self.variants.insert(account_id.to_string(), variant);
        self
    }

    /// Payload sent to one target account
    pub fn payload_for(&self, account_id: &str) -> Payload {
        match self.variants.get(account_id) {
            Some(variant) => self.body.with_override(variant),
            None => self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
    Revoked,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
            AccountStatus::Revoked => "revoked",
            AccountStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "expired" => Some(AccountStatus::Expired),
            "revoked" => Some(AccountStatus::Revoked),
            "error" => Some(AccountStatus::Error),
            _ => None,
        }
    }

    /// Whether new slots may be booked for the account
    pub fn can_allocate(&self) -> bool {
        !matches!(self, AccountStatus::Expired | AccountStatus::Revoked)
    }

    /// Whether the orchestrator should attempt a publish at all
    pub fn can_attempt(&self) -> bool {
        matches!(self, AccountStatus::Active | AccountStatus::Expired)
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External identity content is published to.
///
/// Credentials are not part of this record; only the token broker reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub platform: String,
    pub display_name: String,
    pub status: AccountStatus,
    pub credential_expires_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(id: impl Into<String>, platform: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            platform: platform.into(),
            status: AccountStatus::Active,
            credential_expires_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Published,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Published => "published",
            OutcomeStatus::Failed => "failed",
        }
    }
}

/// Latest publish result for one (content item, account) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub content_id: String,
    pub account_id: String,
    pub status: OutcomeStatus,
    pub platform_id: Option<String>,
    pub platform_url: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl PublishOutcome {
    pub fn published(
        content_id: &str,
        account_id: &str,
        platform_id: String,
        platform_url: Option<String>,
    ) -> Self {
        Self {
            content_id: content_id.to_string(),
            account_id: account_id.to_string(),
            status: OutcomeStatus::Published,
            platform_id: Some(platform_id),
            platform_url,
            error_code: None,
            error_message: None,
            attempted_at: Utc::now(),
        }
    }

    pub fn failed(content_id: &str, account_id: &str, code: &str, message: String) -> Self {
        Self {
            content_id: content_id.to_string(),
            account_id: account_id.to_string(),
            status: OutcomeStatus::Failed,
            platform_id: None,
            platform_url: None,
            error_code: Some(code.to_string()),
            error_message: Some(message),
            attempted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_time_parse_and_display() {
        let time: SlotTime = "09:05".parse().unwrap();
        assert_eq!(
            time,
            SlotTime {
                weekday: None,
                hour: 9,
                minute: 5
            }
        );
        assert_eq!(time.to_string(), "09:05");
    }

    #[test]
    fn test_slot_time_with_weekday() {
        let time: SlotTime = "wed 12:00".parse().unwrap();
        assert_eq!(time, SlotTime::on(3, 12, 0).unwrap());
        assert_eq!(time.to_string(), "Wed 12:00");
        assert!(time.applies_on(chrono::Weekday::Wed));
        assert!(!time.applies_on(chrono::Weekday::Thu));

        let full: SlotTime = "Friday 18:00".parse().unwrap();
        assert_eq!(full.weekday, Some(5));

        assert!("Funday 09:00".parse::<SlotTime>().is_err());
        assert!(SlotTime::on(7, 9, 0).is_err());
    }

    #[test]
    fn test_slot_time_rejects_out_of_range() {
        assert!("24:00".parse::<SlotTime>().is_err());
        assert!("12:60".parse::<SlotTime>().is_err());
        assert!("noon".parse::<SlotTime>().is_err());
    }

    #[test]
    fn test_slot_time_serializes_as_string() {
        let time = SlotTime::new(18, 30).unwrap();
        assert_eq!(serde_json::to_string(&time).unwrap(), r#""18:30""#);
        let parsed: SlotTime = serde_json::from_str(r#""07:00""#).unwrap();
        assert_eq!(parsed, SlotTime::new(7, 0).unwrap());
        assert!(serde_json::from_str::<SlotTime>(r#""7""#).is_err());
    }

    #[test]
    fn test_rule_validation() {
        let rule = RecurrenceRule::new("acct", "Europe/Berlin").with_weekdays([1, 3]);
        assert!(rule.validate().is_ok());

        let bad_tz = RecurrenceRule::new("acct", "Mars/Olympus");
        assert!(bad_tz.validate().is_err());

        let bad_day = RecurrenceRule::new("acct", "UTC").with_weekdays([7]);
        assert!(bad_day.validate().is_err());
    }

    #[test]
    fn test_rule_empty_weekdays_means_every_day() {
        let rule = RecurrenceRule::new("acct", "UTC");
        assert!(rule.is_active_weekday(chrono::Weekday::Sun));
        assert!(rule.is_active_weekday(chrono::Weekday::Wed));

        let weekdays_only = rule.with_weekdays([1, 2, 3, 4, 5]);
        assert!(!weekdays_only.is_active_weekday(chrono::Weekday::Sun));
        assert!(weekdays_only.is_active_weekday(chrono::Weekday::Mon));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SlotStatus::Reserved,
            SlotStatus::InProgress,
            SlotStatus::Completed,
            SlotStatus::Failed,
            SlotStatus::Canceled,
        ] {
            assert_eq!(SlotStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ContentStatus::parse("publishing"), Some(ContentStatus::Publishing));
        assert_eq!(AccountStatus::parse("revoked"), Some(AccountStatus::Revoked));
        assert_eq!(ContentStatus::parse("posted"), None);
    }

    #[test]
    fn test_content_status_publishable() {
        assert!(ContentStatus::Scheduled.is_publishable());
        assert!(ContentStatus::Queued.is_publishable());
        assert!(ContentStatus::Publishing.is_publishable());
        assert!(!ContentStatus::Draft.is_publishable());
        assert!(!ContentStatus::Published.is_publishable());
        assert!(!ContentStatus::Failed.is_publishable());
    }

    #[test]
    fn test_account_status_eligibility() {
        assert!(AccountStatus::Active.can_allocate());
        assert!(AccountStatus::Error.can_allocate());
        assert!(!AccountStatus::Expired.can_allocate());
        assert!(!AccountStatus::Revoked.can_allocate());

        assert!(AccountStatus::Expired.can_attempt());
        assert!(!AccountStatus::Revoked.can_attempt());
        assert!(!AccountStatus::Error.can_attempt());
    }

    #[test]
    fn test_payload_for_applies_variant() {
        let item = ContentItem::new(
            Payload {
                text: "Base text".to_string(),
                media: vec!["img-1".to_string()],
                link: Some("https://example.org".to_string()),
            },
            vec!["a".to_string(), "b".to_string()],
        )
        .with_variant(
            "b",
            PayloadOverride {
                text: Some("Short text".to_string()),
                media: Some(vec![]),
                link: None,
            },
        );

        let a = item.payload_for("a");
        assert_eq!(a.text, "Base text");
        assert_eq!(a.media, vec!["img-1".to_string()]);

        let b = item.payload_for("b");
        assert_eq!(b.text, "Short text");
        assert!(b.media.is_empty());
        assert_eq!(b.link.as_deref(), Some("https://example.org"));
    }

    #[test]
    fn test_content_item_new_defaults() {
        let item = ContentItem::new(Payload::text("hello"), vec!["a".into()]);
        assert!(Uuid::parse_str(&item.id).is_ok());
        assert_eq!(item.status, ContentStatus::Draft);
        assert_eq!(item.due_at, None);
        assert!(item.variants.is_empty());
    }
}
