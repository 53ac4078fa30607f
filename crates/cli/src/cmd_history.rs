//! `dispatchsim history`: completed calls for the current trainee.

use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, Table};
use console::{style, Term};
use dispatchsim_core::{SessionStore, UserStats};
use dispatchsim_protocol::{Session, SpeakerRole};
use tracing::info;

use crate::cli::HistoryCommand;

pub async fn run(cmd: HistoryCommand, store: &SessionStore, trainee_id: &str) -> anyhow::Result<()> {
    match cmd {
        HistoryCommand::List => {
            let mut sessions = store.list_history(trainee_id).await?;
            if sessions.is_empty() {
                println!("  No completed calls yet.");
                return Ok(());
            }
            sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
            println!("{}", session_table(&sessions));
        }
        HistoryCommand::Show { session_id } => {
            let Some(session) = store.get_history(trainee_id, &session_id).await? else {
                anyhow::bail!("No completed call {session_id} for trainee {trainee_id}");
            };
            print_transcript(&session);
        }
        HistoryCommand::Delete { session_id } => {
            if store.delete_history(trainee_id, &session_id).await? {
                println!("  Deleted {session_id}");
            } else {
                println!("  No completed call {session_id}");
            }
        }
        HistoryCommand::Clear { yes } => {
            let count = store.list_history(trainee_id).await?.len();
            if count == 0 {
                println!("  History is already empty.");
                return Ok(());
            }
            if !yes && !confirm(&format!("Delete all {count} completed calls for {trainee_id}?"))? {
                println!("  Cancelled.");
                return Ok(());
            }
            store.clear_history(trainee_id).await?;
            info!(
                component = "cli",
                event = "history.cleared",
                trainee_id = %trainee_id,
                count = count,
                "History cleared"
            );
            println!("  Cleared {count} calls.");
        }
        HistoryCommand::Stats => {
            let sessions = store.list_history(trainee_id).await?;
            print_stats(&UserStats::from_sessions(&sessions));
        }
    }
    Ok(())
}

/// One row per session: id, scenario, start, status, progress, entries.
pub fn session_table(sessions: &[Session]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(
        ["Session", "Scenario", "Started", "Status", "Progress", "Entries"]
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan)),
    );
    for session in sessions {
        table.add_row(vec![
            Cell::new(&session.session_id),
            Cell::new(scenario_label(session)),
            Cell::new(session.start_time.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(format!("{:?}", session.status).to_lowercase()),
            Cell::new(format!("{}%", session.progress_percent())),
            Cell::new(session.transcript.len()),
        ]);
    }
    table
}

fn scenario_label(session: &Session) -> String {
    match &session.scenario_subtype {
        Some(subtype) => format!("{} ({subtype})", session.scenario_code),
        None => session.scenario_code.clone(),
    }
}

fn print_transcript(session: &Session) {
    println!();
    println!(
        "  {}  {}",
        style(&session.session_id).bold(),
        scenario_label(session)
    );
    let ended = session
        .end_time
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {} to {}, {}% progress, caller {}",
        session.start_time.format("%Y-%m-%d %H:%M"),
        ended,
        session.progress_percent(),
        session.emotional_state
    );
    if !session.key_details_revealed.is_empty() {
        println!("  Details: {}", session.key_details_revealed.join(", "));
    }
    println!();
    for entry in session.transcript.iter() {
        let time = entry.timestamp.format("%H:%M:%S");
        match entry.role {
            SpeakerRole::CallTaker => {
                println!("  {} {} {}", style(time).dim(), style("You:").cyan().bold(), entry.content)
            }
            SpeakerRole::Caller => {
                println!("  {} {} {}", style(time).dim(), style("Caller:").red().bold(), entry.content)
            }
            SpeakerRole::System => {
                println!("  {} {}", style(time).dim(), style(&entry.content).yellow())
            }
        }
    }
    println!();
}

fn print_stats(stats: &UserStats) {
    println!();
    println!("  Total calls:      {}", stats.total_sessions);
    println!("  Completed:        {}", stats.completed_sessions);
    println!(
        "  Average progress: {}%",
        dispatchsim_protocol::progress_percent(stats.average_progress)
    );
    println!("  Transcript lines: {}", stats.total_conversations);
    println!();
    if !stats.recent.is_empty() {
        println!("  Recent calls:");
        println!("{}", session_table(&stats.recent));
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let term = Term::stdout();
    term.write_str(&format!("  {prompt} [y/N] "))?;
    let answer = term.read_line()?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
