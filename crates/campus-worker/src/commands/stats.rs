//! Stats command - queue counts, or the details of one job

use anyhow::{Context, Result};
use campus_queue::{JobEntry, QueueBackend, QueueCounts, QueueSettings};
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use uuid::Uuid;

#[derive(Args)]
pub struct StatsArgs {
    /// Show a single job instead of the counts
    #[arg(long)]
    pub job: Option<Uuid>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatsArgs, settings: QueueSettings) -> Result<()> {
    let backend = crate::open_backend(&settings).await?;

    if let Some(id) = args.job {
        let job = backend
            .get_job(id)
            .await
            .with_context(|| format!("Looking up job {}", id))?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&job)?);
        } else {
            print_job(&job);
        }
        return Ok(());
    }

    let counts = backend.counts().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("{}", counts_table(&counts));
    }
    Ok(())
}

fn counts_table(counts: &QueueCounts) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Jobs").fg(Color::Cyan),
        ]);

    for (state, n) in [
        ("waiting", counts.waiting),
        ("delayed", counts.delayed),
        ("active", counts.active),
        ("completed", counts.completed),
        ("failed", counts.failed),
    ] {
        table.add_row(vec![Cell::new(state), Cell::new(n)]);
    }
    table.add_row(vec![
        Cell::new("total").fg(Color::Green),
        Cell::new(counts.total()).fg(Color::Green),
    ]);
    table
}

fn print_job(job: &JobEntry) {
    println!("{} {}", "Job".bold(), job.id.to_string().cyan());
    println!("  {} {}", "Kind:".dimmed(), job.kind);
    println!("  {} {}", "State:".dimmed(), job.state.to_string().green());
    println!("  {} {}", "Priority:".dimmed(), job.priority);
    println!("  {} {}/{}", "Attempts:".dimmed(), job.attempts, job.max_attempts);
    println!("  {} {}", "Available at:".dimmed(), job.available_at);
    if let Some(worker) = &job.leased_by {
        println!("  {} {}", "Leased by:".dimmed(), worker);
    }
    if let Some(error) = &job.last_error {
        println!("  {} {}", "Last error:".dimmed(), error.red());
    }
    if let Some(result) = &job.result {
        println!("  {} {}", "Result:".dimmed(), result);
    }
}
