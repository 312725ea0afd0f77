//! cadence-queue - manage recurring schedules and queued content
//!
//! Unix-style front end to the Cadence queue: rules, content items,
//! bookings and account connections.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use libcadence::instant::parse_instant;
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::{
    Account, CadenceError, CadenceService, ContentItem, Payload, PayloadOverride, QueueSlot,
    RecurrenceRule, Result, RunOutcome, ScheduleMode, ScheduleReport, SlotTime,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "cadence-queue")]
#[command(version)]
#[command(about = "Manage recurring schedules and queued content")]
#[command(long_about = "\
cadence-queue - Manage recurring schedules and queued content

DESCRIPTION:
    cadence-queue edits the Cadence queue. Each account has a weekly
    recurrence rule; content items are booked onto the next free slot of
    every target account and published by cadence-send when due.

COMMANDS:
    account     Add, list and connect accounts
    rule        Set, show, pause, resume or skip an account's rule
    content     Add and inspect content items
    schedule    Book an item onto its targets' next free slots
    now         Book an item for immediate publishing
    list        Show an account's queued slots
    preview     Show the next instants an account would book
    reorder     Reassign an account's queued items to a new order
    clear       Cancel an account's upcoming bookings
    unbind      Cancel a single booked slot

USAGE EXAMPLES:
    # Post weekdays at 09:00 and 17:30 Berlin time, at most twice a day
    cadence-queue rule set blog --time 09:00 --time 17:30 \\
        --weekday mon --weekday tue --weekday wed --weekday thu --weekday fri \\
        --timezone Europe/Berlin --max-per-day 2

    # Queue a post for two accounts and book it
    cadence-queue content add \"New release is out\" --target blog --target news
    cadence-queue schedule <CONTENT_ID> --from \"next monday\"

    # Inspect the queue as JSON
    cadence-queue list blog --format json

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml

    Override with environment variables:
        CADENCE_CONFIG    - Path to config file
        CADENCE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Configuration or credential error
    3 - Invalid input (bad ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Manage an account's recurrence rule
    #[command(subcommand)]
    Rule(RuleCommand),

    /// Manage content items
    #[command(subcommand)]
    Content(ContentCommand),

    /// Book a content item onto its targets' next free slots
    Schedule {
        content_id: String,

        /// Earliest instant to book (e.g. "tomorrow 9am", "2h", RFC 3339)
        #[arg(long, default_value = "now")]
        from: String,

        /// Book each target at or after the previous target's slot
        #[arg(long)]
        sequential: bool,
    },

    /// Book a content item for immediate publishing
    Now {
        content_id: String,

        /// Publish in this process instead of leaving it to cadence-send
        #[arg(long)]
        run: bool,
    },

    /// Show an account's queued slots
    List { account_id: String },

    /// Show the next instants an account would book
    Preview {
        account_id: String,

        #[arg(short, long, default_value_t = 5)]
        count: usize,

        #[arg(long, default_value = "now")]
        from: String,
    },

    /// Reassign an account's queued items to the given order
    Reorder {
        account_id: String,

        /// Every queued content ID of the account, earliest first
        #[arg(required = true)]
        content_ids: Vec<String>,
    },

    /// Cancel an account's upcoming bookings
    Clear { account_id: String },

    /// Cancel one booked slot
    Unbind { slot_id: String },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Register an account on a platform
    Add {
        account_id: String,

        /// Platform adapter name (a configured webhook)
        #[arg(long)]
        platform: String,

        #[arg(long)]
        name: Option<String>,
    },

    /// List accounts
    List,

    /// Exchange an authorization code for credentials
    Connect { account_id: String, code: String },
}

#[derive(Subcommand, Debug)]
enum RuleCommand {
    /// Create or replace an account's rule
    Set(RuleArgs),

    /// Show an account's rule
    Show { account_id: String },

    /// Hold publishing for the account; bookings are kept
    Pause { account_id: String },

    /// Resume publishing for the account
    Resume { account_id: String },

    /// Pass over the next candidate slot once
    SkipNext { account_id: String },
}

#[derive(Args, Debug)]
struct RuleArgs {
    account_id: String,

    /// Slot time, "HH:MM" or "Mon 09:00" (repeatable)
    #[arg(long = "time", required = true)]
    times: Vec<String>,

    /// Active weekday, name or 0-6 with 0 = Sunday (repeatable; default every day)
    #[arg(long = "weekday")]
    weekdays: Vec<String>,

    /// IANA timezone
    #[arg(long, default_value = "UTC")]
    timezone: String,

    #[arg(long)]
    max_per_day: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum ContentCommand {
    /// Create a draft content item
    Add {
        text: String,

        /// Target account (repeatable)
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,

        /// Media reference (repeatable)
        #[arg(long = "media")]
        media: Vec<String>,

        #[arg(long)]
        link: Option<String>,

        /// Per-account text, as ACCOUNT=TEXT (repeatable)
        #[arg(long = "variant")]
        variants: Vec<String>,
    },

    /// Show a content item and its per-account outcomes
    Show { content_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let service = CadenceService::new().await?;
    let format = cli.format;

    match cli.command {
        Commands::Account(cmd) => cmd_account(&service, cmd, format).await,
        Commands::Rule(cmd) => cmd_rule(&service, cmd, format).await,
        Commands::Content(cmd) => cmd_content(&service, cmd, format).await,
        Commands::Schedule {
            content_id,
            from,
            sequential,
        } => {
            validate_id(&content_id, "content")?;
            let from = parse_instant(&from, Utc::now())?;
            let mode = if sequential {
                ScheduleMode::Sequential
            } else {
                ScheduleMode::Independent
            };
            let report = service.schedule(&content_id, from, mode).await?;
            output_report(&report, format)
        }
        Commands::Now { content_id, run } => {
            validate_id(&content_id, "content")?;
            let report = service.publish_now(&content_id).await?;
            if !run {
                return output_report(&report, format);
            }
            let outcome = service.run_now(&content_id).await?;
            output_outcome(&content_id, &outcome, format)
        }
        Commands::List { account_id } => {
            let slots = service.queue(&account_id).await?;
            output_slots(&slots, format)
        }
        Commands::Preview {
            account_id,
            count,
            from,
        } => {
            let from = parse_instant(&from, Utc::now())?;
            let instants = service.preview(&account_id, count, from).await?;
            match format {
                OutputFormat::Json => print_json(&instants),
                OutputFormat::Text => {
                    let now = Utc::now();
                    for instant in instants {
                        println!("{} | {}", instant.to_rfc3339(), format_time_until(now, instant));
                    }
                    Ok(())
                }
            }
        }
        Commands::Reorder {
            account_id,
            content_ids,
        } => {
            for id in &content_ids {
                validate_id(id, "content")?;
            }
            let slots = service.reorder(&account_id, &content_ids).await?;
            output_slots(&slots, format)
        }
        Commands::Clear { account_id } => {
            let affected = service.clear_queue(&account_id).await?;
            match format {
                OutputFormat::Json => print_json(&affected),
                OutputFormat::Text => {
                    println!("Cleared {} item(s) from {}", affected.len(), account_id);
                    Ok(())
                }
            }
        }
        Commands::Unbind { slot_id } => {
            validate_id(&slot_id, "slot")?;
            let content_id = service.unbind(&slot_id).await?;
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "slot_id": slot_id,
                    "content_id": content_id,
                })),
                OutputFormat::Text => {
                    match content_id {
                        Some(id) => println!("Unbound slot {} from {}", slot_id, id),
                        None => println!("Canceled slot {}", slot_id),
                    }
                    Ok(())
                }
            }
        }
    }
}

async fn cmd_account(service: &CadenceService, cmd: AccountCommand, format: OutputFormat) -> Result<()> {
    match cmd {
        AccountCommand::Add {
            account_id,
            platform,
            name,
        } => {
            let mut account = Account::new(account_id, platform);
            if let Some(name) = name {
                account.display_name = name;
            }
            service.add_account(&account).await?;
            output_accounts(&[account], format)
        }
        AccountCommand::List => {
            let accounts = service.database().list_accounts().await?;
            output_accounts(&accounts, format)
        }
        AccountCommand::Connect { account_id, code } => {
            let account = service.broker().connect_account(&account_id, &code).await?;
            output_accounts(&[account], format)
        }
    }
}

async fn cmd_rule(service: &CadenceService, cmd: RuleCommand, format: OutputFormat) -> Result<()> {
    let account_id = match cmd {
        RuleCommand::Set(args) => {
            let rule = build_rule(args)?;
            service.set_rule(&rule).await?;
            rule.account_id
        }
        RuleCommand::Show { account_id } => account_id,
        RuleCommand::Pause { account_id } => {
            service.set_paused(&account_id, true).await?;
            account_id
        }
        RuleCommand::Resume { account_id } => {
            service.set_paused(&account_id, false).await?;
            account_id
        }
        RuleCommand::SkipNext { account_id } => {
            service.skip_next(&account_id).await?;
            account_id
        }
    };

    let rule = service.rule(&account_id).await?;
    output_rule(&rule, format)
}

async fn cmd_content(service: &CadenceService, cmd: ContentCommand, format: OutputFormat) -> Result<()> {
    match cmd {
        ContentCommand::Add {
            text,
            targets,
            media,
            link,
            variants,
        } => {
            let mut item = ContentItem::new(Payload { text, media, link }, targets);
            for variant in &variants {
                let (account_id, text) = parse_variant(variant)?;
                if !item.targets.iter().any(|t| t == account_id) {
                    return Err(CadenceError::InvalidInput(format!(
                        "variant for '{}' which is not a target",
                        account_id
                    )));
                }
                item = item.with_variant(
                    account_id,
                    PayloadOverride {
                        text: Some(text.to_string()),
                        ..Default::default()
                    },
                );
            }
            service.add_content(&item).await?;

            match format {
                OutputFormat::Json => print_json(&item),
                OutputFormat::Text => {
                    println!("{}", item.id);
                    Ok(())
                }
            }
        }
        ContentCommand::Show { content_id } => {
            validate_id(&content_id, "content")?;
            let item = service.content(&content_id).await?;
            let mut outcomes: Vec<_> = service
                .database()
                .get_outcomes(&content_id)
                .await?
                .into_values()
                .collect();
            outcomes.sort_by(|a, b| a.account_id.cmp(&b.account_id));

            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "item": item,
                    "outcomes": outcomes,
                })),
                OutputFormat::Text => {
                    println!("id:       {}", item.id);
                    println!("status:   {}", item.status);
                    println!("targets:  {}", item.targets.join(", "));
                    if let Some(due) = item.due_at {
                        println!("due:      {} ({})", due.to_rfc3339(), format_time_until(Utc::now(), due));
                    }
                    if let Some(code) = &item.last_error_code {
                        println!(
                            "error:    {} {}",
                            code,
                            item.last_error_message.as_deref().unwrap_or("")
                        );
                    }
                    println!("text:     {}", truncate_content(&item.body.text, 60));
                    for outcome in outcomes {
                        let detail = outcome
                            .platform_url
                            .or(outcome.platform_id)
                            .or(outcome.error_code)
                            .unwrap_or_default();
                        println!("  {} | {} | {}", outcome.account_id, outcome.status.as_str(), detail);
                    }
                    Ok(())
                }
            }
        }
    }
}

fn build_rule(args: RuleArgs) -> Result<RecurrenceRule> {
    let times = args
        .times
        .iter()
        .map(|t| t.parse::<SlotTime>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let weekdays = args
        .weekdays
        .iter()
        .map(|d| parse_weekday(d))
        .collect::<Result<Vec<_>>>()?;

    let mut rule = RecurrenceRule::new(args.account_id, args.timezone)
        .with_times(times)
        .with_weekdays(weekdays);
    rule.max_per_day = args.max_per_day;
    Ok(rule)
}

/// Weekday by name ("mon", "Monday") or number, 0 = Sunday
fn parse_weekday(input: &str) -> Result<u8> {
    if let Ok(n) = input.parse::<u8>() {
        if n <= 6 {
            return Ok(n);
        }
    }
    input
        .parse::<chrono::Weekday>()
        .map(|day| day.num_days_from_sunday() as u8)
        .map_err(|_| CadenceError::InvalidInput(format!("invalid weekday '{}'", input)))
}

fn parse_variant(input: &str) -> Result<(&str, &str)> {
    match input.split_once('=') {
        Some((account, text)) if !account.trim().is_empty() && !text.trim().is_empty() => {
            Ok((account.trim(), text))
        }
        _ => Err(CadenceError::InvalidInput(format!(
            "variant must be ACCOUNT=TEXT, got '{}'",
            input
        ))),
    }
}

/// Content and slot IDs are UUIDs
fn validate_id(id: &str, kind: &str) -> Result<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| CadenceError::InvalidInput(format!("invalid {} ID: {}", kind, id)))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CadenceError::InvalidInput(format!("failed to encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn output_report(report: &ScheduleReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    let now = Utc::now();
    for slot in &report.booked {
        println!(
            "booked  {} | {} | {}",
            slot.account_id,
            slot.slot_at.to_rfc3339(),
            format_time_until(now, slot.slot_at)
        );
    }
    for skipped in &report.skipped {
        println!("skipped {} | {}", skipped.account_id, skipped.reason);
    }
    Ok(())
}

fn output_outcome(content_id: &str, outcome: &RunOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(outcome);
    }

    match outcome {
        RunOutcome::Published { succeeded, failed } => {
            println!("{}: published to {} account(s), {} failed", content_id, succeeded, failed)
        }
        RunOutcome::Failed { code, message } => {
            println!("{}: failed ({}): {}", content_id, code, message)
        }
        RunOutcome::Deferred { run_at, reason } => {
            println!("{}: deferred until {} ({:?})", content_id, run_at.to_rfc3339(), reason)
        }
        RunOutcome::Superseded => println!("{}: changed by another process", content_id),
    }
    Ok(())
}

fn output_slots(slots: &[QueueSlot], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(slots);
    }

    let now = Utc::now();
    for slot in slots {
        println!(
            "{} | {} | {} | {} | {}",
            slot.id,
            slot.slot_at.to_rfc3339(),
            slot.content_id.as_deref().unwrap_or("-"),
            slot.status,
            format_time_until(now, slot.slot_at)
        );
    }
    Ok(())
}

fn output_accounts(accounts: &[Account], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(accounts);
    }

    for account in accounts {
        println!("{} | {} | {}", account.id, account.platform, account.status);
    }
    Ok(())
}

fn output_rule(rule: &RecurrenceRule, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(rule);
    }

    let times: Vec<String> = rule.times.iter().map(ToString::to_string).collect();
    let days = if rule.weekdays.is_empty() {
        "every day".to_string()
    } else {
        rule.weekdays
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    println!("account:     {}", rule.account_id);
    println!("times:       {}", times.join(", "));
    println!("weekdays:    {}", days);
    println!("timezone:    {}", rule.timezone);
    println!(
        "max per day: {}",
        rule.max_per_day
            .map_or_else(|| "unlimited".to_string(), |m| m.to_string())
    );
    println!("paused:      {}", rule.paused);
    println!("skip next:   {}", rule.skip_next);
    Ok(())
}

/// Truncate content to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &content[..idx]),
        None => content.to_string(),
    }
}

/// Human-readable distance to `at`
fn format_time_until(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let diff = (at - now).num_seconds();

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_truncate_content_respects_char_boundaries() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_format_time_until() {
        let now = Utc::now();
        assert_eq!(format_time_until(now, now - Duration::seconds(5)), "overdue");
        assert_eq!(format_time_until(now, now + Duration::seconds(30)), "in <1 minute");
        assert_eq!(format_time_until(now, now + Duration::minutes(1)), "in 1 minute");
        assert_eq!(format_time_until(now, now + Duration::hours(5)), "in 5 hours");
        assert_eq!(format_time_until(now, now + Duration::days(2)), "in 2 days");
    }

    #[test]
    fn test_parse_weekday_forms() {
        assert_eq!(parse_weekday("0").unwrap(), 0);
        assert_eq!(parse_weekday("mon").unwrap(), 1);
        assert_eq!(parse_weekday("Saturday").unwrap(), 6);
        assert!(parse_weekday("7").is_err());
        assert!(parse_weekday("someday").is_err());
    }

    #[test]
    fn test_parse_variant() {
        assert_eq!(parse_variant("blog=Hello = world").unwrap(), ("blog", "Hello = world"));
        assert!(parse_variant("blog").is_err());
        assert!(parse_variant("=text").is_err());
    }
}
