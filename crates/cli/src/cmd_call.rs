//! `dispatchsim call` / `dispatchsim resume`: the interactive call screen.
//!
//! Typed lines go to the caller; lines starting with `/` are commands.
//! Sends run concurrently with input and event rendering so the screen
//! stays live while the caller is responding.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use dispatchsim_core::{
    LifecyclePhase, ScenarioSelection, SessionController, SessionError, SessionEvent,
    SessionSnapshot, TurnOutcome,
};
use dispatchsim_protocol::{Session, SpeakerRole, TranscriptEntry};
use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::cmd_history;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Say(String),
    Hangup,
    Retry,
    Status,
    Help,
    Unknown(String),
    Blank,
}

fn parse_input(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Line::Say(trimmed.to_string());
    };
    match command.to_ascii_lowercase().as_str() {
        "hangup" | "end" | "quit" => Line::Hangup,
        "retry" => Line::Retry,
        "status" => Line::Status,
        "help" | "?" => Line::Help,
        other => Line::Unknown(other.to_string()),
    }
}

/// Create a call, let it ring, answer it, and start the call screen.
pub async fn place(
    controller: &Arc<SessionController>,
    code: &str,
    subtype: Option<String>,
    ring: Duration,
) -> anyhow::Result<()> {
    let selection = ScenarioSelection::new(code, subtype);
    let session_id = controller.create(&selection).await?;
    let snapshot = pick_up(controller, &session_id, ring).await?;
    chat(controller, session_id, snapshot).await
}

/// Reattach to a call that is still active on the service.
pub async fn resume(controller: &Arc<SessionController>, session_id: &str) -> anyhow::Result<()> {
    let snapshot = match controller.load_existing(session_id).await {
        Ok(snapshot) => snapshot,
        Err(SessionError::NotActive(_)) => {
            println!(
                "  {} Call {} has already ended; it is in your history.",
                style("!").yellow(),
                session_id
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("  Resumed call {}", style(session_id).bold());
    for entry in snapshot.session.transcript.iter() {
        print_entry(entry);
    }
    chat(controller, session_id.to_string(), snapshot).await
}

/// Active calls for the trainee, as stored locally.
pub async fn list_active(controller: &SessionController) -> anyhow::Result<()> {
    let sessions = controller
        .store()
        .list_active(&controller.identity().trainee_id)
        .await?;
    if sessions.is_empty() {
        println!("  No active calls.");
        return Ok(());
    }
    println!("{}", cmd_history::session_table(&sessions));
    println!("  Resume with: dispatchsim resume <session-id>");
    Ok(())
}

async fn pick_up(
    controller: &SessionController,
    session_id: &str,
    ring: Duration,
) -> anyhow::Result<Arc<SessionSnapshot>> {
    if !ring.is_zero() {
        println!("  {} Incoming call...", style("☎").yellow().bold());
        tokio::time::sleep(ring).await;
    }
    let snapshot = controller.answer(session_id).await?;
    println!(
        "  {} Call {} connected ({}). Type to speak, /help for commands.",
        style("●").green(),
        style(session_id).bold(),
        snapshot.mode
    );
    for entry in snapshot.session.transcript.iter() {
        print_entry(entry);
    }
    Ok(snapshot)
}

async fn chat(
    controller: &Arc<SessionController>,
    mut session_id: String,
    snapshot: Arc<SessionSnapshot>,
) -> anyhow::Result<()> {
    if snapshot.phase != LifecyclePhase::Active {
        anyhow::bail!("Call {session_id} is not active");
    }

    let mut events = controller
        .events(&session_id)
        .ok_or_else(|| SessionError::Detached(session_id.clone()))?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight: FuturesUnordered<LocalBoxFuture<'static, Result<TurnOutcome, SessionError>>> =
        FuturesUnordered::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    detach(controller, &session_id).await;
                    break;
                };
                match parse_input(&line) {
                    Line::Blank => {}
                    Line::Say(text) => {
                        let controller = Arc::clone(controller);
                        let id = session_id.clone();
                        in_flight.push(
                            async move { controller.send_turn(&id, &text).await }.boxed_local(),
                        );
                    }
                    Line::Hangup => {
                        in_flight.clear();
                        let session = controller.terminate(&session_id).await?;
                        print_summary(&session);
                        break;
                    }
                    Line::Retry => {
                        in_flight.clear();
                        let next = controller.retry(&session_id).await?;
                        println!("  {} Placing a new call with the same scenario", style("↻").cyan());
                        pick_up(controller, &next, Duration::ZERO).await?;
                        events = controller
                            .events(&next)
                            .ok_or_else(|| SessionError::Detached(next.clone()))?;
                        session_id = next;
                    }
                    Line::Status => print_status(controller.snapshot(&session_id).as_deref()),
                    Line::Help => print_help(),
                    Line::Unknown(command) => {
                        println!("  {} Unknown command /{command}. Try /help.", style("?").yellow());
                    }
                }
            }
            Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                report_turn(result);
            }
            event = events.recv() => match event {
                Ok(event) => render_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "cli",
                        event = "call.events_lagged",
                        session_id = %session_id,
                        skipped = skipped,
                        "Event subscriber lagged"
                    );
                }
                Err(RecvError::Closed) => {
                    println!("  Call closed.");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                detach(controller, &session_id).await;
                break;
            }
        }
    }

    Ok(())
}

async fn detach(controller: &SessionController, session_id: &str) {
    controller.detach(session_id).await;
    println!();
    println!(
        "  Detached. The call is still open; resume with: dispatchsim resume {}",
        session_id
    );
}

fn report_turn(result: Result<TurnOutcome, SessionError>) {
    match result {
        // Replies and failure notices arrive as transcript events.
        Ok(outcome) => debug!(
            component = "cli",
            event = "call.turn_settled",
            outcome = ?outcome,
            "Turn settled"
        ),
        Err(SessionError::TurnInFlight(_)) => {
            println!(
                "  {} The caller is still answering. Wait for the reply before speaking again.",
                style("…").dim()
            );
        }
        Err(e) => println!("  {} {}", style("✗").red(), e),
    }
}

fn render_event(event: &SessionEvent) {
    match event {
        // The terminal already echoed what the trainee typed.
        SessionEvent::EntryAppended(entry) if entry.role == SpeakerRole::CallTaker => {}
        SessionEvent::EntryAppended(entry) => print_entry(entry),
        SessionEvent::Responding(true) => {
            println!("  {}", style("caller is responding…").dim().italic());
        }
        SessionEvent::Responding(false) => {}
        SessionEvent::ConnectionChanged(true) => {
            println!("  {} Connected", style("●").green());
        }
        SessionEvent::ConnectionChanged(false) => {
            println!(
                "  {} Connection lost. Messages cannot be delivered until it returns.",
                style("●").red()
            );
        }
        SessionEvent::CallerStateChanged {
            emotional_state,
            scenario_progress,
            ..
        } => {
            println!(
                "  {}",
                style(format!(
                    "[{} · {}% complete]",
                    emotional_state,
                    dispatchsim_protocol::progress_percent(*scenario_progress)
                ))
                .dim()
            );
        }
        SessionEvent::PhaseChanged(LifecyclePhase::Terminated) => {
            println!("  {}", style("Call ended.").bold());
        }
        SessionEvent::PhaseChanged(_) => {}
        SessionEvent::ChannelError(message) => {
            println!("  {} {}", style("✗").red(), message);
        }
    }
}

fn print_entry(entry: &TranscriptEntry) {
    match entry.role {
        SpeakerRole::Caller => {
            println!("  {} {}", style("Caller:").red().bold(), entry.content);
        }
        SpeakerRole::CallTaker => {
            println!("  {} {}", style("You:").cyan().bold(), entry.content);
        }
        SpeakerRole::System => {
            println!("  {}", style(&entry.content).yellow());
        }
    }
}

fn print_status(snapshot: Option<&SessionSnapshot>) {
    let Some(snapshot) = snapshot else {
        println!("  No open call.");
        return;
    };
    let session = &snapshot.session;
    println!();
    println!("  Session:   {}", session.session_id);
    println!(
        "  Scenario:  {}{}",
        session.scenario_code,
        session
            .scenario_subtype
            .as_deref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default()
    );
    println!("  Phase:     {}", snapshot.phase.as_str());
    println!(
        "  Delivery:  {}{}",
        snapshot.mode,
        if snapshot.connected { "" } else { " (disconnected)" }
    );
    println!("  Caller:    {}", session.emotional_state);
    println!("  Progress:  {}%", session.progress_percent());
    println!("  Entries:   {}", session.transcript.len());
    if !session.key_details_revealed.is_empty() {
        println!("  Details:   {}", session.key_details_revealed.join(", "));
    }
    println!();
}

fn print_summary(session: &Session) {
    println!();
    println!("  {} Call {} saved to history", style("✓").green(), session.session_id);
    println!(
        "  {} caller replies, {}% scenario progress",
        session.transcript.count_role(SpeakerRole::Caller),
        session.progress_percent()
    );
    if !session.key_details_revealed.is_empty() {
        println!("  Details gathered: {}", session.key_details_revealed.join(", "));
    }
    println!();
}

fn print_help() {
    println!();
    println!("  /status   show caller state and progress");
    println!("  /retry    end this call and place a new one with the same scenario");
    println!("  /hangup   end the call and save it to history");
    println!("  /help     this list");
    println!("  Ctrl-D    leave the call open and exit (resume later)");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_spoken_trimmed() {
        assert_eq!(
            parse_input("  Where is the emergency?  \n"),
            Line::Say("Where is the emergency?".to_string())
        );
        assert_eq!(parse_input("   "), Line::Blank);
    }

    #[test]
    fn slash_commands_are_recognized() {
        assert_eq!(parse_input("/hangup"), Line::Hangup);
        assert_eq!(parse_input("/END"), Line::Hangup);
        assert_eq!(parse_input("/retry"), Line::Retry);
        assert_eq!(parse_input("/status"), Line::Status);
        assert_eq!(parse_input("/?"), Line::Help);
        assert_eq!(parse_input("/transfer"), Line::Unknown("transfer".to_string()));
    }
}
