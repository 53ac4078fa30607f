//! Per-user statistics over completed sessions.

use dispatchsim_protocol::{Session, SessionStatus};

const RECENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserStats {
    pub total_sessions: usize,
    pub completed_sessions: usize,
    /// Mean progress as a fraction in [0, 1]
    pub average_progress: f64,
    /// Transcript entries across all sessions
    pub total_conversations: usize,
    /// Most recent sessions by start time, newest first
    pub recent: Vec<Session>,
}

impl UserStats {
    pub fn from_sessions(sessions: &[Session]) -> Self {
        if sessions.is_empty() {
            return Self::default();
        }

        let completed_sessions = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .count();
        let progress_sum: f64 = sessions
            .iter()
            .map(|s| dispatchsim_protocol::normalize_progress(s.scenario_progress))
            .sum();
        let total_conversations = sessions.iter().map(|s| s.transcript.len()).sum();

        let mut recent = sessions.to_vec();
        recent.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        recent.truncate(RECENT_LIMIT);

        Self {
            total_sessions: sessions.len(),
            completed_sessions,
            average_progress: progress_sum / sessions.len() as f64,
            total_conversations,
            recent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use dispatchsim_protocol::TranscriptEntry;

    #[test]
    fn empty_history_has_zero_stats() {
        let stats = UserStats::from_sessions(&[]);
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.average_progress, 0.0);
        assert!(stats.recent.is_empty());
    }

    #[test]
    fn stats_summarize_history() {
        let base = Utc::now();
        let sessions: Vec<Session> = (0..7)
            .map(|i| {
                let mut s = Session::new(
                    format!("s-{i}"),
                    "trainee-1",
                    "10-11",
                    None,
                    base + Duration::minutes(i),
                );
                s.scenario_progress = if i % 2 == 0 { 0.5 } else { 0.25 };
                s.transcript
                    .append(TranscriptEntry::call_taker("hello", base));
                if i < 6 {
                    s.complete(base + Duration::minutes(i + 1));
                }
                s
            })
            .collect();

        let stats = UserStats::from_sessions(&sessions);
        assert_eq!(stats.total_sessions, 7);
        assert_eq!(stats.completed_sessions, 6);
        assert_eq!(stats.total_conversations, 7);
        assert!((stats.average_progress - (4.0 * 0.5 + 3.0 * 0.25) / 7.0).abs() < 1e-9);
        assert_eq!(stats.recent.len(), 5);
        assert_eq!(stats.recent[0].session_id, "s-6");
        assert_eq!(stats.recent[4].session_id, "s-2");
    }
}
