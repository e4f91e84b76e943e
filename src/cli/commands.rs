use std::fmt::Write as _;
use std::io;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::app::StateProjection;
use crate::remaining::now_millis;
use crate::repository::CounterRepository;
use crate::search::{parse_query, Scope};
use crate::storage::{Counter, NewCounter};

#[derive(Args, Debug, Clone)]
pub struct NewArgs {
    /// Counter title
    pub title: String,
    /// Target instant: RFC 3339, YYYY-MM-DD, "YYYY-MM-DD HH:MM" (UTC) or +1d2h30m
    pub target: String,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub icon: Option<String>,
    /// Background color as RRGGBB or AARRGGBB hex
    #[arg(long)]
    pub color: Option<String>,
    #[arg(long)]
    pub favorite: bool,
    #[arg(long)]
    pub reminder: bool,
    /// Goal value to track progress against
    #[arg(long)]
    pub goal: Option<i64>,
    /// Unit or kind of the goal (e.g. "km")
    #[arg(long, requires = "goal")]
    pub goal_type: Option<String>,
    /// Initial note; repeat for several
    #[arg(long = "note")]
    pub notes: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Filter terms (supports category:, is:fav, is:archived, due:, created:)
    pub query: Vec<String>,
    /// Only favorites
    #[arg(long, conflicts_with = "archived")]
    pub favorites: bool,
    /// Only archived counters
    #[arg(long)]
    pub archived: bool,
}

#[derive(Args, Debug, Clone)]
pub struct IdArgs {
    /// Counter identifier
    pub id: i64,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Counter identifier
    pub id: i64,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub target: Option<String>,
    #[arg(long, conflicts_with = "clear_category")]
    pub category: Option<String>,
    #[arg(long)]
    pub clear_category: bool,
    #[arg(long)]
    pub icon: Option<String>,
    #[arg(long, conflicts_with = "clear_color")]
    pub color: Option<String>,
    #[arg(long)]
    pub clear_color: bool,
    #[arg(long)]
    pub reminder: Option<bool>,
    #[arg(long)]
    pub goal: Option<i64>,
    #[arg(long)]
    pub goal_type: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ProgressArgs {
    /// Counter identifier
    pub id: i64,
    /// Set progress to this value
    #[arg(long, conflicts_with_all = ["inc", "dec"])]
    pub set: Option<i64>,
    /// Add one
    #[arg(long, conflicts_with = "dec")]
    pub inc: bool,
    /// Subtract one (never below zero)
    #[arg(long)]
    pub dec: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum NoteCommand {
    /// Append a note
    Add {
        id: i64,
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Remove the note at a 1-based position
    Remove { id: i64, position: usize },
}

#[derive(Args, Debug, Clone)]
pub struct NoteArgs {
    #[command(subcommand)]
    pub command: NoteCommand,
}

#[derive(Args, Debug, Clone)]
pub struct UpcomingArgs {
    /// Maximum counters to print (defaults to widget.upcoming_limit)
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Filter terms, as for `list`
    pub query: Vec<String>,
    /// Stop after this many changes
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    /// Confirm that every counter should be deleted
    #[arg(long)]
    pub yes: bool,
}

pub fn new_counter(repository: &CounterRepository, args: NewArgs) -> Result<String> {
    let target_at = parse_target(&args.target, now_millis())?;
    let mut counter = NewCounter::new(args.title, target_at)
        .favorite(args.favorite)
        .reminder(args.reminder)
        .notes(args.notes);
    if let Some(category) = args.category {
        counter = counter.category(category);
    }
    if let Some(icon) = args.icon {
        counter = counter.icon(icon);
    }
    if let Some(color) = args.color.as_deref() {
        counter = counter.background_color(parse_color(color)?);
    }
    if let Some(goal) = args.goal {
        counter = counter.goal(goal, args.goal_type);
    }
    let id = repository
        .insert_counter(&counter)
        .context("creating counter")?;
    Ok(format!("Created counter #{id}\n"))
}

pub fn list_counters(repository: &CounterRepository, args: ListArgs) -> Result<String> {
    let mut query = parse_query(&args.query.join(" "));
    if args.favorites {
        query.scope = Scope::Favorites;
    } else if args.archived {
        query.scope = Scope::Archived;
    }
    let counters = repository.query(&query)?;
    Ok(format_counter_list(&counters, now_millis()))
}

pub fn show_counter(repository: &CounterRepository, args: IdArgs) -> Result<String> {
    let counter = fetch_counter(repository, args.id)?;
    Ok(format_counter_detail(&counter, now_millis()))
}

pub fn edit_counter(repository: &CounterRepository, args: EditArgs) -> Result<String> {
    let mut counter = fetch_counter(repository, args.id)?;
    if let Some(title) = args.title {
        counter.title = title;
    }
    if let Some(target) = args.target.as_deref() {
        counter.target_at = parse_target(target, now_millis())?;
    }
    if args.clear_category {
        counter.category = None;
    } else if let Some(category) = args.category {
        counter.category = Some(category);
    }
    if let Some(icon) = args.icon {
        counter.icon = icon;
    }
    if args.clear_color {
        counter.background_color = None;
    } else if let Some(color) = args.color.as_deref() {
        counter.background_color = Some(parse_color(color)?);
    }
    if let Some(reminder) = args.reminder {
        counter.has_reminder = reminder;
    }
    if let Some(goal) = args.goal {
        counter.goal_target = Some(goal);
    }
    if let Some(goal_type) = args.goal_type {
        counter.goal_type = Some(goal_type);
    }
    if !repository.update_counter(&counter)? {
        bail!("counter #{} disappeared while editing", counter.id);
    }
    Ok(format!("Updated counter #{}\n", counter.id))
}

pub fn toggle_favorite(repository: &CounterRepository, args: IdArgs) -> Result<String> {
    let counter = fetch_counter(repository, args.id)?;
    match repository.toggle_favorite(&counter)? {
        Some(true) => Ok(format!("Counter #{} is now a favorite\n", counter.id)),
        Some(false) => Ok(format!("Counter #{} is no longer a favorite\n", counter.id)),
        None => Err(not_found(counter.id)),
    }
}

pub fn set_archived(
    repository: &CounterRepository,
    args: IdArgs,
    archived: bool,
) -> Result<String> {
    let counter = fetch_counter(repository, args.id)?;
    if archived {
        repository.archive_counter(&counter)?;
        Ok(format!("Archived counter #{}\n", counter.id))
    } else {
        repository.unarchive_counter(&counter)?;
        Ok(format!("Restored counter #{}\n", counter.id))
    }
}

pub fn delete_counter(repository: &CounterRepository, args: IdArgs) -> Result<String> {
    let counter = fetch_counter(repository, args.id)?;
    repository.delete_counter(&counter)?;
    Ok(format!("Deleted counter #{} ({})\n", counter.id, counter.title))
}

pub fn change_progress(projection: &StateProjection, args: ProgressArgs) -> Result<String> {
    let counter = fetch_counter(projection.repository(), args.id)?;
    match (args.set, args.inc, args.dec) {
        (Some(value), _, _) => projection.update_progress(counter, value),
        (None, true, _) => projection.increment_progress(counter),
        (None, false, true) => projection.decrement_progress(counter),
        (None, false, false) => bail!("pass one of --set, --inc or --dec"),
    }
    projection.flush()?;
    if let Some(message) = projection.state().last_error.get() {
        bail!(message);
    }
    let counter = fetch_counter(projection.repository(), args.id)?;
    Ok(format!(
        "Counter #{} progress {}\n",
        counter.id,
        format_progress(&counter)
    ))
}

pub fn handle_note_command(repository: &CounterRepository, args: NoteArgs) -> Result<String> {
    match args.command {
        NoteCommand::Add { id, text } => {
            let counter = fetch_counter(repository, id)?;
            if !repository.add_note(&counter, &text.join(" "))? {
                return Err(not_found(id));
            }
            Ok(format!("Added note to counter #{id}\n"))
        }
        NoteCommand::Remove { id, position } => {
            let counter = fetch_counter(repository, id)?;
            let removed = match position.checked_sub(1) {
                Some(index) => repository.remove_note(&counter, index)?,
                None => false,
            };
            if !removed {
                bail!("counter #{id} has no note {position}");
            }
            Ok(format!("Removed note {position} from counter #{id}\n"))
        }
    }
}

pub fn list_categories(repository: &CounterRepository) -> Result<String> {
    let categories = repository.all_categories().current()?;
    if categories.is_empty() {
        return Ok("No categories.\n".to_string());
    }
    let mut out = String::new();
    for category in categories {
        let _ = writeln!(&mut out, "{category}");
    }
    Ok(out)
}

pub fn upcoming(
    repository: &CounterRepository,
    args: UpcomingArgs,
    default_limit: usize,
) -> Result<String> {
    let now = now_millis();
    let counters = repository.upcoming(now, args.limit.unwrap_or(default_limit))?;
    Ok(format_counter_list(&counters, now))
}

/// Prints the filtered list, then again after every change, until `count`
/// changes have been seen.
pub fn watch(
    repository: &CounterRepository,
    args: WatchArgs,
    out: &mut dyn io::Write,
) -> Result<()> {
    let subscription = repository.watch_query(parse_query(&args.query.join(" ")));
    let mut counters = subscription.current()?;
    let mut seen = 0usize;
    loop {
        write!(out, "{}", format_counter_list(&counters, now_millis()))?;
        out.flush()?;
        if args.count.is_some_and(|count| seen >= count) {
            return Ok(());
        }
        counters = subscription.next()?;
        seen += 1;
        writeln!(out, "--")?;
    }
}

pub fn reset(repository: &CounterRepository, args: ResetArgs) -> Result<String> {
    if !args.yes {
        bail!("refusing to delete every counter without --yes");
    }
    repository.storage().reset()?;
    Ok("All counters deleted\n".to_string())
}

fn fetch_counter(repository: &CounterRepository, id: i64) -> Result<Counter> {
    repository
        .get_counter(id)
        .with_context(|| format!("loading counter #{id}"))?
        .ok_or_else(|| not_found(id))
}

fn not_found(id: i64) -> anyhow::Error {
    anyhow!("counter #{id} not found")
}

/// Parses a target instant into milliseconds since the epoch.
pub fn parse_target(input: &str, now_ms: i64) -> Result<i64> {
    let input = input.trim();
    if let Some(offset) = input.strip_prefix('+') {
        let delta = parse_offset(offset)?;
        return now_ms
            .checked_add(delta)
            .ok_or_else(|| anyhow!("target {input} is out of range"));
    }
    let datetime = if let Ok(parsed) = OffsetDateTime::parse(input, &Rfc3339) {
        parsed
    } else if let Ok(parsed) =
        PrimitiveDateTime::parse(input, format_description!("[year]-[month]-[day] [hour]:[minute]"))
    {
        parsed.assume_utc()
    } else if let Ok(date) = Date::parse(input, format_description!("[year]-[month]-[day]")) {
        date.with_time(Time::MIDNIGHT).assume_utc()
    } else {
        bail!(
            "unrecognised target {input:?}; \
             use RFC 3339, YYYY-MM-DD, \"YYYY-MM-DD HH:MM\" or +1d2h"
        );
    };
    i64::try_from(datetime.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| anyhow!("target {input} is out of range"))
}

/// `1d2h30m15s` style offsets.
fn parse_offset(input: &str) -> Result<i64> {
    let mut total: i64 = 0;
    let mut digits = String::new();
    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit_ms: i64 = match ch {
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            other => bail!("unknown offset unit {other:?} in +{input}"),
        };
        let amount: i64 = digits
            .parse()
            .with_context(|| format!("missing amount before {ch:?} in +{input}"))?;
        digits.clear();
        total = amount
            .checked_mul(unit_ms)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(|| anyhow!("offset +{input} is too large"))?;
    }
    if !digits.is_empty() || input.is_empty() {
        bail!("offset +{input} must end with a unit (d, h, m or s)");
    }
    Ok(total)
}

/// `RRGGBB` (opaque) or `AARRGGBB`, with or without a leading `#`.
pub fn parse_color(input: &str) -> Result<u32> {
    let hex = input.trim().trim_start_matches('#');
    let value =
        u32::from_str_radix(hex, 16).with_context(|| format!("invalid color {input:?}"))?;
    match hex.len() {
        6 => Ok(0xFF00_0000 | value),
        8 => Ok(value),
        _ => bail!("color {input:?} must have 6 or 8 hex digits"),
    }
}

pub fn format_counter_list(counters: &[Counter], now: i64) -> String {
    if counters.is_empty() {
        return "No counters.\n".to_string();
    }
    let mut out = String::new();
    for counter in counters {
        let _ = write!(&mut out, "#{} {} {}", counter.id, counter.icon, counter.title);
        if let Some(category) = &counter.category {
            let _ = write!(&mut out, " [{category}]");
        }
        if counter.is_favorite {
            out.push_str(" *");
        }
        if counter.is_archived {
            out.push_str(" (archived)");
        }
        let _ = write!(
            &mut out,
            "\n    due {}  {}",
            format_timestamp(counter.target_at),
            counter.time_remaining(now)
        );
        if counter.goal_target.is_some() {
            let _ = write!(&mut out, "  progress {}", format_progress(counter));
        }
        out.push('\n');
    }
    out
}

pub fn format_counter_detail(counter: &Counter, now: i64) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "{} {} (#{})", counter.icon, counter.title, counter.id);
    let _ = writeln!(&mut out, "    target     {}", format_rfc3339(counter.target_at));
    let _ = writeln!(&mut out, "    remaining  {}", counter.time_remaining(now));
    let _ = writeln!(
        &mut out,
        "    elapsed    {:.0}%",
        counter.elapsed_fraction(now) * 100.0
    );
    let _ = writeln!(&mut out, "    created    {}", format_rfc3339(counter.created_at));
    if let Some(category) = &counter.category {
        let _ = writeln!(&mut out, "    category   {category}");
    }
    let mut flags = Vec::new();
    if counter.is_favorite {
        flags.push("favorite");
    }
    if counter.is_archived {
        flags.push("archived");
    }
    if counter.has_reminder {
        flags.push("reminder");
    }
    if !flags.is_empty() {
        let _ = writeln!(&mut out, "    flags      {}", flags.join(", "));
    }
    if let Some(argb) = counter.background_color {
        let _ = writeln!(&mut out, "    color      #{argb:08X}");
    }
    if counter.goal_target.is_some() {
        let _ = writeln!(&mut out, "    progress   {}", format_progress(counter));
    }
    if !counter.notes.is_empty() {
        let _ = writeln!(&mut out, "    notes");
        for (position, note) in counter.notes.iter().enumerate() {
            let _ = writeln!(&mut out, "      {}. {note}", position + 1);
        }
    }
    if !counter.history.is_empty() {
        let _ = writeln!(&mut out, "    history");
        for entry in &counter.history {
            let _ = writeln!(
                &mut out,
                "      {}  {:<9} {}",
                format_timestamp(entry.timestamp),
                entry.action,
                entry.value
            );
        }
    }
    out
}

fn format_progress(counter: &Counter) -> String {
    match (counter.goal_target, counter.goal_type.as_deref()) {
        (Some(goal), Some(kind)) => format!("{}/{goal} {kind}", counter.current_progress),
        (Some(goal), None) => format!("{}/{goal}", counter.current_progress),
        (None, _) => counter.current_progress.to_string(),
    }
}

fn to_datetime(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

fn format_timestamp(ms: i64) -> String {
    to_datetime(ms)
        .and_then(|dt| {
            dt.format(format_description!("[year]-[month]-[day] [hour]:[minute] UTC"))
                .ok()
        })
        .unwrap_or_else(|| ms.to_string())
}

fn format_rfc3339(ms: i64) -> String {
    to_datetime(ms)
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}
