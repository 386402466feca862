use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use org_agenda::agenda::{self, AgendaItem, AgendaQuery, AgendaView};
use org_agenda::core::{DomainError, OrgFile};
use org_agenda::filter::{self, AgendaFilter, DEFAULT_HORIZON_DAYS, DueWithin};
use org_agenda::format::{self, PlanningTag};
use org_agenda::{NomOrgParser, OrgParser};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "ORG_AGENDA_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "org-agenda",
    about = "Org agenda views and date modifiers",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a date modifier such as "+2w", "fri 14:00" or "3/15".
    Date(DateArgs),

    /// Build an agenda view from one or more Org files.
    Agenda(AgendaArgs),

    /// Schedule a headline or give it a deadline.
    Plan(PlanArgs),

    /// Parse an Org file and print its structure.
    Parse(ParseArgs),
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Modifier text; empty or "." means the reference date.
    modifier: Vec<String>,
    /// Date the modifier is relative to (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    reference: Option<NaiveDate>,
    /// Render as an inactive `[...]` timestamp.
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Preset filter list to run.
    #[arg(long, value_enum, default_value_t = ViewArg::Week)]
    view: ViewArg,
    /// Named filters to run instead of the view's preset, in order.
    #[arg(long = "filter")]
    filters: Vec<String>,
    /// Days ahead that count as due.
    #[arg(long, default_value_t = DEFAULT_HORIZON_DAYS)]
    horizon: i64,
    /// Date the horizon is measured from (YYYY-MM-DD). Defaults to now.
    #[arg(long)]
    reference: Option<NaiveDate>,
    /// Stop after this many items.
    #[arg(long)]
    limit: Option<usize>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ViewArg {
    Week,
    Todos,
    Timeline,
    Next,
    Stuck,
}

impl From<ViewArg> for AgendaView {
    fn from(view: ViewArg) -> Self {
        match view {
            ViewArg::Week => AgendaView::Week,
            ViewArg::Todos => AgendaView::Todos,
            ViewArg::Timeline => AgendaView::Timeline,
            ViewArg::Next => AgendaView::Next,
            ViewArg::Stuck => AgendaView::Stuck,
        }
    }
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Org file holding the headline.
    file: PathBuf,
    /// 1-based line number of the headline.
    #[arg(long)]
    line: usize,
    /// Which planning keyword to set.
    #[arg(long, value_enum, default_value_t = KindArg::Scheduled)]
    kind: KindArg,
    /// Modifier text resolved against the reference date.
    modifier: Vec<String>,
    /// Date the modifier is relative to (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    reference: Option<NaiveDate>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum KindArg {
    Scheduled,
    Deadline,
}

impl From<KindArg> for PlanningTag {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Scheduled => PlanningTag::Scheduled,
            KindArg::Deadline => PlanningTag::Deadline,
        }
    }
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Date(args) => handle_date(args),
        Commands::Agenda(args) => handle_agenda(args),
        Commands::Plan(args) => handle_plan(args),
        Commands::Parse(args) => handle_parse(args),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn handle_date(args: DateArgs) -> Result<()> {
    let DateArgs {
        modifier,
        reference,
        inactive,
    } = args;
    let reference = reference.unwrap_or_else(|| Local::now().date_naive());
    let value = org_agenda::resolve(reference, &modifier.join(" "));
    println!("{}", format::render_timestamp(&value, !inactive));
    Ok(())
}

fn handle_agenda(args: AgendaArgs) -> Result<()> {
    let AgendaArgs {
        inputs,
        view,
        filters,
        horizon,
        reference,
        limit,
        json,
    } = args;

    let files = load_files(&inputs)?;
    let now = reference
        .map(|date| date.and_time(NaiveTime::MIN))
        .unwrap_or_else(|| Local::now().naive_local());
    let horizon = Duration::try_days(horizon).context("--horizon is out of range")?;

    let view = AgendaView::from(view);
    let mut query = AgendaQuery::from_view(view, now, horizon);
    if !filters.is_empty() {
        query.filters = build_filters(&filters, now, horizon)?;
    }
    query.limit = limit;

    let items = agenda::collect(files.iter(), &query);
    info!(count = items.len(), ?view, "agenda collected");

    if items.is_empty() {
        eprintln!("No agenda items found for the provided inputs.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for item in &items {
            println!("{}", agenda_line(item));
        }
    }
    Ok(())
}

/// Filters by registry name, plus `due-within` bound to the agenda's clock and horizon.
fn build_filters(
    names: &[String],
    now: NaiveDateTime,
    horizon: Duration,
) -> Result<Vec<Box<dyn AgendaFilter>>> {
    names
        .iter()
        .map(|name| -> Result<Box<dyn AgendaFilter>> {
            if name == "due-within" {
                return Ok(Box::new(DueWithin { now, horizon }));
            }
            let predicate =
                filter::named(name).ok_or_else(|| DomainError::UnknownFilter(name.clone()))?;
            Ok(Box::new(predicate))
        })
        .collect()
}

fn agenda_line(item: &AgendaItem) -> String {
    let date = item
        .active_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    let todo = item.todo.as_ref().map(|t| t.as_str()).unwrap_or("");
    let outline = item
        .path
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(item.title.as_str()))
        .collect::<Vec<_>>()
        .join(" / ");
    let tags = if item.tags.is_empty() {
        String::new()
    } else {
        format!(" :{}:", item.tags.join(":"))
    };
    format!("{date:<16} {todo:<8} {outline}{tags}")
}

fn handle_plan(args: PlanArgs) -> Result<()> {
    let PlanArgs {
        file,
        line,
        kind,
        modifier,
        reference,
        in_place,
    } = args;
    let reference = reference.unwrap_or_else(|| Local::now().date_naive());
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let updated = plan_text(&text, line, kind.into(), reference, &modifier.join(" "))?;

    if in_place {
        fs::write(&file, updated.as_bytes()).with_context(|| format!("writing {:?}", file))?;
        debug!(?file, line, "planning line written");
    } else {
        print!("{updated}");
        if !updated.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn plan_text(
    text: &str,
    line: usize,
    tag: PlanningTag,
    reference: NaiveDate,
    modifier: &str,
) -> Result<String> {
    let index = line.checked_sub(1).context("--line is 1-based")?;
    let value = org_agenda::resolve(reference, modifier);
    debug!(%value, tag = tag.as_str(), "resolved planning date");
    Ok(format::splice_planning(text, index, tag, &value)?)
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let files = load_files(&inputs)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
    } else {
        for (idx, file) in files.iter().enumerate() {
            if files.len() > 1 {
                if let Some(path) = &file.path {
                    println!("== {} ==", path.display());
                }
            }
            println!("{:#?}", file);
            if files.len() > 1 && idx + 1 < files.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn load_files(inputs: &[PathBuf]) -> Result<Vec<OrgFile>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let parser = NomOrgParser;
    let mut files = Vec::with_capacity(expanded.len());
    for path in expanded {
        debug!(?path, "parsing");
        let file = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        files.push(file);
    }
    Ok(files)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org(&canonical) {
        out.push(canonical);
    }
    Ok(())
}

fn is_org(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}
