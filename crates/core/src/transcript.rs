//! Transcript reconciliation
//!
//! Merges the call-taker's optimistic entries with confirmed caller replies
//! into one ordered transcript. Each send moves the turn machine
//! `Idle -> Sending -> Settled`; only the completion carrying the current
//! ticket may settle it, so the "caller is responding" signal clears exactly
//! once per send.

use chrono::{DateTime, Utc};
use dispatchsim_protocol::{CallerReply, Transcript, TranscriptEntry};

pub type TurnTicket = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    Sending {
        ticket: TurnTicket,
    },
    Settled {
        ticket: TurnTicket,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRejection {
    /// Empty or whitespace-only text
    Empty,
    /// A previous send has not completed yet
    InFlight,
    /// The session is not in a state that accepts turns
    NotActive,
}

/// An accepted send, awaiting its completion
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub ticket: TurnTicket,
    pub text: String,
    pub entry: TranscriptEntry,
}

/// Result of applying a push-delivered reply
#[derive(Debug, Clone, PartialEq)]
pub struct PushAccepted {
    pub entry: TranscriptEntry,
    /// The outstanding send this reply completed, if there was one
    pub settled: Option<TurnTicket>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptReconciler {
    transcript: Transcript,
    phase: TurnPhase,
    last_ticket: TurnTicket,
}

impl TranscriptReconciler {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            phase: TurnPhase::Idle,
            last_ticket: 0,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_caller_responding(&self) -> bool {
        matches!(self.phase, TurnPhase::Sending { .. })
    }

    pub fn outstanding(&self) -> Option<TurnTicket> {
        match self.phase {
            TurnPhase::Sending { ticket } => Some(ticket),
            _ => None,
        }
    }

    /// Validate and optimistically append the call-taker entry.
    pub fn begin_turn(
        &mut self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingTurn, TurnRejection> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnRejection::Empty);
        }
        if self.is_caller_responding() {
            return Err(TurnRejection::InFlight);
        }

        self.last_ticket += 1;
        let ticket = self.last_ticket;
        self.phase = TurnPhase::Sending { ticket };
        let entry = self
            .transcript
            .append(TranscriptEntry::call_taker(text, now))
            .clone();

        Ok(PendingTurn {
            ticket,
            text: text.to_string(),
            entry,
        })
    }

    /// Settle `ticket` with the caller's reply. Stale tickets are ignored.
    pub fn confirm(
        &mut self,
        ticket: TurnTicket,
        reply: &CallerReply,
        now: DateTime<Utc>,
    ) -> Option<TranscriptEntry> {
        if self.outstanding() != Some(ticket) {
            return None;
        }
        self.phase = TurnPhase::Settled { ticket };
        Some(self.transcript.append(TranscriptEntry::caller(reply, now)).clone())
    }

    /// Settle `ticket` as failed, recording a system entry.
    pub fn fail(
        &mut self,
        ticket: TurnTicket,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<TranscriptEntry> {
        if self.outstanding() != Some(ticket) {
            return None;
        }
        self.phase = TurnPhase::Settled { ticket };
        Some(
            self.transcript
                .append(TranscriptEntry::system(failure_text(reason), now))
                .clone(),
        )
    }

    /// Apply a reply delivered on the push channel.
    ///
    /// It completes the outstanding send if there is one; otherwise it is an
    /// unsolicited caller line and is appended on its own.
    pub fn accept_push(&mut self, reply: &CallerReply, now: DateTime<Utc>) -> PushAccepted {
        let settled = self.outstanding();
        if let Some(ticket) = settled {
            self.phase = TurnPhase::Settled { ticket };
        }
        let entry = self.transcript.append(TranscriptEntry::caller(reply, now)).clone();
        PushAccepted { entry, settled }
    }

    /// Fail whatever send is outstanding (connection lost, call ended).
    pub fn abort_outstanding(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<(TurnTicket, TranscriptEntry)> {
        let ticket = self.outstanding()?;
        self.fail(ticket, reason, now).map(|entry| (ticket, entry))
    }

    /// Append a caller line that is not a reply to any send (pickup greeting).
    pub fn append_caller_text(&mut self, content: &str, now: DateTime<Utc>) -> TranscriptEntry {
        self.transcript
            .append(TranscriptEntry::caller_text(content, now))
            .clone()
    }

    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }
}

fn failure_text(reason: &str) -> String {
    format!("Message not delivered: {reason}. Send it again to retry.")
}
