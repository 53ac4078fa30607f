//! Core types shared across the protocol

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    CallTaker,
    Caller,
    System,
}

/// Session lifecycle status as stored locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    #[default]
    Completed,
}

/// One utterance in a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(default = "crate::new_id")]
    pub id: String,
    pub role: SpeakerRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_progress: Option<f64>,
}

impl TranscriptEntry {
    pub fn call_taker(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::plain(SpeakerRole::CallTaker, content.into(), timestamp)
    }

    pub fn system(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::plain(SpeakerRole::System, content.into(), timestamp)
    }

    /// A caller line with no service annotations (e.g. the pickup greeting).
    pub fn caller_text(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::plain(SpeakerRole::Caller, content.into(), timestamp)
    }

    /// A caller line derived from a service reply, carrying its annotations.
    pub fn caller(reply: &CallerReply, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id(),
            role: SpeakerRole::Caller,
            content: reply.caller_response.clone(),
            timestamp,
            emotional_state: Some(reply.emotional_state.clone()),
            intensity: Some(reply.intensity),
            scenario_progress: Some(normalize_progress(reply.scenario_progress)),
        }
    }

    fn plain(role: SpeakerRole, content: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id(),
            role,
            content,
            timestamp,
            emotional_state: None,
            intensity: None,
            scenario_progress: None,
        }
    }
}

/// Append-only, insertion-ordered list of transcript entries.
///
/// Entries are never edited or removed once appended; a correction is a new entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript(Vec<TranscriptEntry>);

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return a reference to it.
    pub fn append(&mut self, entry: TranscriptEntry) -> &TranscriptEntry {
        self.0.push(entry);
        &self.0[self.0.len() - 1]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TranscriptEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.0.last()
    }

    pub fn count_role(&self, role: SpeakerRole) -> usize {
        self.0.iter().filter(|e| e.role == role).count()
    }
}

/// One simulated call.
///
/// Serialized with the same field names the browser client kept in local storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub trainee_id: String,
    #[serde(rename = "scenarioType")]
    pub scenario_code: String,
    #[serde(
        rename = "selectedSubtype",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub scenario_subtype: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "unknown_emotional_state")]
    pub emotional_state: String,
    #[serde(default)]
    pub scenario_progress: f64,
    #[serde(default)]
    pub key_details_revealed: Vec<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(rename = "conversation", default)]
    pub transcript: Transcript,
}

fn unknown_emotional_state() -> String {
    "unknown".to_string()
}

impl Session {
    /// A freshly created, active session with an empty transcript.
    pub fn new(
        session_id: impl Into<String>,
        trainee_id: impl Into<String>,
        scenario_code: impl Into<String>,
        scenario_subtype: Option<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            trainee_id: trainee_id.into(),
            scenario_code: scenario_code.into(),
            scenario_subtype,
            start_time,
            end_time: None,
            emotional_state: unknown_emotional_state(),
            scenario_progress: 0.0,
            key_details_revealed: Vec::new(),
            status: SessionStatus::Active,
            transcript: Transcript::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Apply the caller-state fields of a service reply.
    pub fn apply_reply(&mut self, reply: &CallerReply) {
        self.emotional_state = reply.emotional_state.clone();
        self.scenario_progress = normalize_progress(reply.scenario_progress);
        self.merge_details(&reply.key_details_revealed);
    }

    /// Add revealed details, keeping them unique in first-seen order.
    pub fn merge_details(&mut self, details: &[String]) {
        for detail in details {
            if !self.key_details_revealed.iter().any(|d| d == detail) {
                self.key_details_revealed.push(detail.clone());
            }
        }
    }

    /// Mark the session finished at `now`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Completed;
        self.end_time = Some(now);
    }

    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.scenario_progress)
    }
}

/// Caller reply to a call-taker utterance (HTTP response or push event payload)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerReply {
    pub caller_response: String,
    #[serde(default = "unknown_emotional_state")]
    pub emotional_state: String,
    #[serde(default)]
    pub intensity: f64,
    #[serde(default)]
    pub scenario_progress: f64,
    #[serde(default)]
    pub key_details_revealed: Vec<String>,
}

/// Remote view of a session, returned by create and fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    #[serde(default)]
    pub scenario_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_caller_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub key_details_revealed: Vec<String>,
}

impl SessionDescriptor {
    /// Parsed start time, if the service sent one we understand.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start_time.as_deref().and_then(parse_timestamp)
    }
}

/// Acknowledgement of a remote session end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminationAck {
    #[serde(default)]
    pub status: String,
}

/// Static scenario catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    #[serde(alias = "Code")]
    pub code: String,
    #[serde(alias = "EPD", default)]
    pub epd: String,
    #[serde(alias = "EventType")]
    pub event_type: String,
    #[serde(alias = "EventSubtypes", default)]
    pub event_subtypes: Vec<String>,
    #[serde(alias = "WeaponAvailable", default)]
    pub weapon_available: bool,
}

impl ScenarioDescriptor {
    /// Human label, e.g. `10-11 Domestic`.
    pub fn label(&self) -> String {
        format!("{} {}", self.code, self.event_type)
    }

    pub fn allows_subtype(&self, subtype: &str) -> bool {
        self.event_subtypes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(subtype.trim()))
    }
}

/// Clamp a progress value to a fraction in [0, 1].
///
/// Values above 1 are read as percentages.
pub fn normalize_progress(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let fraction = if value > 1.0 { value / 100.0 } else { value };
    fraction.clamp(0.0, 1.0)
}

/// Presentation helper: fraction to whole percent.
pub fn progress_percent(fraction: f64) -> u8 {
    (normalize_progress(fraction) * 100.0).round() as u8
}

/// Parse an RFC 3339 timestamp, or a naive ISO timestamp assumed to be UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(details: &[&str], progress: f64) -> CallerReply {
        CallerReply {
            caller_response: "123 Main St".to_string(),
            emotional_state: "anxious".to_string(),
            intensity: 0.6,
            scenario_progress: progress,
            key_details_revealed: details.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn progress_is_kept_as_fraction() {
        assert_eq!(normalize_progress(0.2), 0.2);
        assert_eq!(normalize_progress(45.0), 0.45);
        assert_eq!(normalize_progress(-3.0), 0.0);
        assert_eq!(normalize_progress(f64::NAN), 0.0);
        assert_eq!(progress_percent(0.2), 20);
    }

    #[test]
    fn apply_reply_merges_details_without_duplicates() {
        let mut session = Session::new("s-1", "t-1", "10-11", None, Utc::now());
        session.apply_reply(&reply(&["location"], 0.2));
        session.apply_reply(&reply(&["location", "weapon"], 40.0));

        assert_eq!(session.key_details_revealed, vec!["location", "weapon"]);
        assert_eq!(session.scenario_progress, 0.4);
        assert_eq!(session.emotional_state, "anxious");
    }

    #[test]
    fn session_reads_browser_storage_shape() {
        let json = r#"{
          "id": "1700000000000",
          "sessionId": "abc",
          "scenarioType": "10-11",
          "selectedSubtype": "Domestic",
          "startTime": "2024-05-01T10:00:00.000Z",
          "endTime": "2024-05-01T10:05:00.000Z",
          "conversation": [
            {"role": "call_taker", "content": "What's your location?", "timestamp": "2024-05-01T10:01:00Z"},
            {"role": "caller", "content": "123 Main St", "timestamp": "2024-05-01T10:01:02Z", "emotional_state": "anxious", "intensity": 0.6}
          ],
          "scenarioProgress": 0.2,
          "keyDetailsRevealed": ["location"]
        }"#;

        let session: Session = serde_json::from_str(json).expect("parse stored session");
        assert_eq!(session.session_id, "abc");
        assert_eq!(session.scenario_subtype.as_deref(), Some("Domestic"));
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.emotional_state, "unknown");
        assert_eq!(session.transcript.len(), 2);
        assert_eq!(session.transcript.entries()[1].role, SpeakerRole::Caller);
        assert!(!session.transcript.entries()[0].id.is_empty());
    }

    #[test]
    fn scenario_descriptor_accepts_catalog_keys() {
        let json = r#"{"Code":"10-11","EPD":"114","EventType":"Domestic","EventSubtypes":["Domestic"],"WeaponAvailable":true}"#;
        let scenario: ScenarioDescriptor = serde_json::from_str(json).expect("parse scenario");
        assert_eq!(scenario.label(), "10-11 Domestic");
        assert!(scenario.allows_subtype("domestic"));
        assert!(scenario.weapon_available);
    }

    #[test]
    fn parses_naive_service_timestamps() {
        let ts = parse_timestamp("2024-05-01T10:00:00.123456").expect("naive timestamp");
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00.123456+00:00");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
