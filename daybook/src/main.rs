use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use daybook::calendar;
use daybook::core::Outcome;
use daybook::html::{self, HtmlPage};
use daybook::locale::{self, Locale};
use daybook::logging;
use daybook::parser::MarkdownNoteParser;
use daybook::period::{self, Period, PeriodContext};
use daybook::prompt::{Choice, Prompter, ScriptedPrompter, match_option};
use daybook::review::{Grouping, ListingReviewer, ReviewSummary, Session};
use daybook::settings::Settings;
use daybook::storage::{FsNoteRepository, NoteRepository, NoteStore};
use daybook::theme::{self, Theme};

#[derive(Debug, Parser)]
#[command(
    name = "daybook",
    about = "Date periods, task review and theme CSS for a Markdown note library",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Log filter, e.g. `info` or `daybook=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Settings file. Defaults to the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Treat this date (YYYY-MM-DD) as today.
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a period tag (lm, mtd, last7d, ...) to a date range.
    Period(PeriodArgs),

    /// Print the relative label for a day offset.
    Relative(RelativeArgs),

    /// List calendar-note date strings relative to today.
    Dates(DatesArgs),

    /// List weekly-note choices for the next six months.
    Weeks,

    /// Generate CSS from a theme file.
    Css(CssArgs),

    /// Build a themed HTML page around a body fragment.
    Html(HtmlArgs),

    /// Review overdue, scheduled or forgotten tasks in a note library.
    Review(ReviewArgs),
}

#[derive(Debug, Args)]
struct PeriodArgs {
    /// Period tag; asked for when omitted.
    tag: Option<String>,
    /// End periods on today instead of yesterday. Applies to every tag.
    #[arg(long)]
    include_today: bool,
    /// Pre-supplied prompt answers, used in order.
    #[arg(long = "answer")]
    answers: Vec<String>,
    /// Emit JSON instead of a one-line summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RelativeArgs {
    /// Days from today (negative for the past).
    #[arg(allow_hyphen_values = true)]
    days: i64,
    /// Abbreviated form (`3d ago`).
    #[arg(long)]
    short: bool,
    /// Locale tag such as `de` or `en-GB`. Defaults to the settings.
    #[arg(long)]
    locale: Option<String>,
}

#[derive(Debug, Args)]
struct DatesArgs {
    /// Note library root; marks date strings that already have a note.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CssArgs {
    /// Theme JSON file.
    theme: PathBuf,
    /// Write the CSS here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Print only the `:root` variables.
    #[arg(long)]
    vars: bool,
}

#[derive(Debug, Args)]
struct HtmlArgs {
    /// Theme JSON file used when no CSS file is given.
    #[arg(long)]
    theme: Option<PathBuf>,
    #[arg(long, default_value = "")]
    title: String,
    /// HTML fragment placed inside `<body>`.
    #[arg(long)]
    body: PathBuf,
    /// CSS file used instead of theme-generated CSS.
    #[arg(long)]
    css: Option<PathBuf>,
    /// Write the page here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Also save a copy under this name in the data directory.
    #[arg(long)]
    save: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ReviewArgs {
    /// Note library root containing `Calendar/` and `Notes/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Walk tasks one at a time instead of grouped by note.
    #[arg(long, global = true)]
    by_task: bool,
    /// Skip confirmations.
    #[arg(long, global = true)]
    silent: bool,
    /// Pre-supplied prompt answers, used in order.
    #[arg(long = "answer", global = true)]
    answers: Vec<String>,
    #[command(subcommand)]
    kind: ReviewCommand,
}

#[derive(Debug, Subcommand)]
enum ReviewCommand {
    /// All overdue tasks, then today's and forgotten tasks.
    Overdue,
    /// Overdue `>date+` tasks.
    DatePlus,
    /// Overdue tasks in one note.
    Note { filename: String },
    /// Overdue tasks in a folder; asked for when omitted.
    Folder { name: Option<String> },
    /// Tasks elsewhere that reference today.
    Today,
    /// Open tasks left behind in recent calendar notes.
    Forgotten {
        /// Keep tasks that already carry a schedule link.
        #[arg(long)]
        include_scheduled: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose, cli.log_level.as_deref())?;
    let result = run(cli);
    if let Err(err) = &result {
        tracing::error!("{err:#}");
    }
    result
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    let today = cli.today.unwrap_or_else(|| Local::now().date_naive());
    tracing::debug!(%today, "starting");
    match cli.command {
        Commands::Period(args) => handle_period(args, &settings, today),
        Commands::Relative(args) => handle_relative(args, &settings),
        Commands::Dates(args) => handle_dates(args, &settings, today),
        Commands::Weeks => handle_weeks(&settings, today),
        Commands::Css(args) => handle_css(args, &settings),
        Commands::Html(args) => handle_html(args, &settings),
        Commands::Review(args) => handle_review(args, &settings, today, io::stdout().lock()),
    }
}

fn prompter_for(answers: &[String]) -> Box<dyn Prompter> {
    if answers.is_empty() {
        Box::new(StdioPrompter)
    } else {
        Box::new(ScriptedPrompter::from_strs(answers))
    }
}

fn period_summary(p: &Period) -> String {
    let mut line = format!("{}: {} to {} ({} days)", p.label, p.start, p.end, p.days());
    if !p.progress.is_empty() {
        line.push_str(&format!(", {}", p.progress));
    }
    line
}

fn handle_period(args: PeriodArgs, settings: &Settings, today: NaiveDate) -> Result<()> {
    let PeriodArgs {
        tag,
        include_today,
        answers,
        json,
    } = args;
    let ctx = PeriodContext {
        today,
        first_day_of_week: settings.preferences.first_day_of_week,
        exclude_today: !include_today,
    };
    let mut prompter = prompter_for(&answers);
    let period = match period::choose_period(prompter.as_mut(), "Create stats for which period?", &ctx, tag.as_deref()) {
        Outcome::Done(p) => p,
        Outcome::Canceled => {
            eprintln!("Cancelled.");
            return Ok(());
        }
        Outcome::NotFound => bail!("no period chosen"),
        Outcome::Invalid(msg) => bail!(msg),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&period)?);
    } else {
        println!("{}", period_summary(&period));
    }
    Ok(())
}

fn handle_relative(args: RelativeArgs, settings: &Settings) -> Result<()> {
    let locale = match args.locale.as_deref() {
        Some(tag) => Locale::parse(tag),
        None => settings.locale(),
    };
    println!("{}", locale::relative_date_from_days(args.days, args.short, &locale));
    Ok(())
}

fn handle_dates(args: DatesArgs, settings: &Settings, today: NaiveDate) -> Result<()> {
    let dates = calendar::relative_dates(today, settings.preferences.first_day_of_week);
    let library = match &args.root {
        Some(root) => Some(
            FsNoteRepository::new(MarkdownNoteParser)
                .with_extension(&settings.preferences.default_file_extension)
                .scan(root)
                .with_context(|| format!("scanning {:?}", root))?,
        ),
        None => None,
    };

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonDate<'a> {
            name: &'a str,
            date_string: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            note: Option<&'a str>,
        }

        let payload: Vec<JsonDate<'_>> = dates
            .iter()
            .map(|d| JsonDate {
                name: d.name,
                date_string: &d.date_string,
                note: library
                    .as_ref()
                    .and_then(|lib| lib.calendar_note_by_date_string(&d.date_string))
                    .map(|n| n.filename.as_str()),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        let locale = settings.locale();
        for d in &dates {
            let note = library
                .as_ref()
                .and_then(|lib| lib.calendar_note_by_date_string(&d.date_string))
                .map(|n| format!("\t{} (changed {})", n.filename, locale.short_date_time(n.changed)))
                .unwrap_or_default();
            println!("{:<13}{}{note}", d.name, d.date_string);
        }
    }
    Ok(())
}

fn handle_weeks(settings: &Settings, today: NaiveDate) -> Result<()> {
    for option in calendar::week_options(today, settings.preferences.first_day_of_week) {
        println!("{}", option.label);
    }
    Ok(())
}

fn read_theme(path: &Path) -> Result<Theme> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Theme::from_json(&text).with_context(|| format!("parsing theme {:?}", path))
}

fn write_output(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("writing {:?}", path))?;
            eprintln!("Wrote {}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            if !text.ends_with('\n') {
                writeln!(stdout)?;
            }
        }
    }
    Ok(())
}

fn handle_css(args: CssArgs, settings: &Settings) -> Result<()> {
    let theme = read_theme(&args.theme)?;
    let generated = theme::generate_css(&theme, &settings.css_options())?;
    if args.vars {
        let lines: Vec<String> = generated
            .variables
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        write_output(args.output.as_deref(), &lines.join("\n"))
    } else {
        write_output(args.output.as_deref(), &generated.css)
    }
}

fn default_data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("unable to determine data directory")?
        .join("daybook"))
}

fn handle_html(args: HtmlArgs, settings: &Settings) -> Result<()> {
    let HtmlArgs {
        theme,
        title,
        body,
        css,
        output,
        save,
        data_dir,
    } = args;
    if theme.is_none() && css.is_none() {
        bail!("either --theme or --css is required");
    }

    let body = fs::read_to_string(&body).with_context(|| format!("reading {:?}", body))?;
    let general_css = match &css {
        Some(path) => Some(fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?),
        None => None,
    };
    let theme = theme.as_deref().map(read_theme).transpose()?;
    let opts = settings.css_options();

    let page = HtmlPage {
        general_css,
        ..HtmlPage::new(title, body)
    };
    let rendered = page.render(theme.as_ref().map(|t| (t, &opts)))?;

    if let Some(name) = save {
        let dir = match data_dir {
            Some(d) => d,
            None => default_data_dir()?,
        };
        let path = html::save_snapshot(&dir, &name, &rendered)?;
        eprintln!("Saved copy to {}", path.display());
    }
    write_output(output.as_deref(), &rendered)
}

fn report(outcome: Outcome<ReviewSummary>) -> Result<()> {
    match outcome {
        Outcome::Done(summary) => {
            eprintln!(
                "Reviewed {} task(s) in {} note(s), {} updated.",
                summary.tasks, summary.notes, summary.updated
            );
            Ok(())
        }
        Outcome::NotFound => {
            eprintln!("No tasks to review.");
            Ok(())
        }
        Outcome::Canceled => {
            eprintln!("Review cancelled.");
            Ok(())
        }
        Outcome::Invalid(msg) => bail!(msg),
    }
}

fn handle_review<W: Write>(args: ReviewArgs, settings: &Settings, today: NaiveDate, out: W) -> Result<()> {
    let ReviewArgs {
        root,
        by_task,
        silent,
        answers,
        kind,
    } = args;
    let library = FsNoteRepository::new(MarkdownNoteParser)
        .with_extension(&settings.preferences.default_file_extension)
        .scan(&root)
        .with_context(|| format!("scanning {:?}", root))?;
    tracing::info!(notes = library.len(), root = %root.display(), "loaded note library");

    let grouping = if by_task { Grouping::ByTask } else { Grouping::ByNote };
    let mut prompter = prompter_for(&answers);
    let mut reviewer = ListingReviewer::new(out, today, settings.locale());
    let mut session = Session {
        store: &library,
        prompter: prompter.as_mut(),
        reviewer: &mut reviewer,
        settings,
        today,
    };

    let outcome = match kind {
        ReviewCommand::Overdue => session.review_overdue_tasks(silent, grouping)?,
        ReviewCommand::DatePlus => session.update_date_plus_tags(silent)?,
        ReviewCommand::Note { filename } => session.review_overdue_tasks_in_note(&filename, silent)?,
        ReviewCommand::Folder { name } => session.review_overdue_tasks_in_folder(name.as_deref(), silent)?,
        ReviewCommand::Today => session.review_referenced_tasks(silent, grouping)?,
        ReviewCommand::Forgotten { include_scheduled } => session.search_for_open_tasks(grouping, !include_scheduled)?,
    };
    report(outcome)
}

/* ------------------------------ Terminal ------------------------------ */

/// Prompts on stderr and reads answers from stdin. For lists, answer with a
/// number or label; a trailing `+` chooses with the modifier.
struct StdioPrompter;

impl StdioPrompter {
    fn read_line(&self, prompt: &str) -> Option<String> {
        eprint!("{prompt}");
        let _ = io::stderr().flush();
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

fn split_modifier(answer: &str) -> (&str, bool) {
    let answer = answer.trim();
    match answer.strip_suffix('+') {
        Some(rest) => (rest.trim_end(), true),
        None => (answer, false),
    }
}

impl Prompter for StdioPrompter {
    fn choose(&mut self, title: &str, options: &[String]) -> Option<Choice> {
        eprintln!("{title}");
        for (idx, option) in options.iter().enumerate() {
            eprintln!("{:>3}. {option}", idx + 1);
        }
        let answer = self.read_line("> ")?;
        let (text, modified) = split_modifier(&answer);
        if text.is_empty() {
            return None;
        }
        match_option(text, options).map(|index| Choice { index, modified })
    }

    fn input(&mut self, title: &str, message: &str, default: Option<&str>) -> Option<String> {
        eprintln!("{title}: {message}");
        let prompt = match default {
            Some(d) => format!("[{d}] > "),
            None => "> ".to_string(),
        };
        let answer = self.read_line(&prompt)?;
        match (answer.trim(), default) {
            ("", Some(d)) => Some(d.to_string()),
            ("", None) => None,
            (text, _) => Some(text.to_string()),
        }
    }

    fn confirm(&mut self, title: &str, message: &str) -> Option<bool> {
        eprintln!("{title}: {message}");
        match self.read_line("(y/n) > ")?.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(true),
            "n" | "no" => Some(false),
            _ => None,
        }
    }

    fn message(&mut self, title: &str, message: &str) {
        eprintln!("{title}: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn library_root() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().expect("tempdir");
        let calendar = tmp.path().join("Calendar");
        let notes = tmp.path().join("Notes").join("Work");
        fs::create_dir_all(&calendar).expect("mkdir calendar");
        fs::create_dir_all(&notes).expect("mkdir notes");
        fs::write(calendar.join("20230310.md"), "* left behind\n").expect("write calendar");
        fs::write(notes.join("plan.md"), "# Plan\n* ship it >2023-03-01\n* later >2023-04-01\n").expect("write note");
        tmp
    }

    fn review_args(root: &Path, kind: ReviewCommand, answers: &[&str]) -> ReviewArgs {
        ReviewArgs {
            root: root.to_path_buf(),
            by_task: false,
            silent: true,
            answers: answers.iter().map(|a| a.to_string()).collect(),
            kind,
        }
    }

    #[test]
    fn modifier_suffix_is_split_off() {
        assert_eq!(split_modifier(" 3+ "), ("3", true));
        assert_eq!(split_modifier("1 week"), ("1 week", false));
    }

    #[test]
    fn period_summary_includes_progress() {
        let ctx = PeriodContext {
            today: ymd(2023, 3, 15),
            first_day_of_week: chrono::Weekday::Mon,
            exclude_today: false,
        };
        let lm = period::resolve("lm", &ctx, None);
        assert_eq!(period_summary(&lm), "Feb 2023: 2023-02-01 to 2023-02-28 (28 days)");
        let mtd = period::resolve("mtd", &ctx, None);
        assert!(period_summary(&mtd).ends_with(&format!(", {}", mtd.progress)));
    }

    #[test]
    fn overdue_review_lists_only_past_links() {
        let root = library_root();
        let mut settings = Settings::default();
        settings.review.ask_to_review_todays_tasks = false;
        let mut out = Vec::new();
        handle_review(review_args(root.path(), ReviewCommand::Overdue, &[]), &settings, ymd(2023, 3, 15), &mut out)
            .expect("review");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("Plan (Work/plan.md)"), "{text}");
        assert!(text.contains("ship it"), "{text}");
        assert!(!text.contains("later"), "{text}");
    }

    #[test]
    fn forgotten_review_uses_scripted_window() {
        let root = library_root();
        let settings = Settings::default();
        let mut out = Vec::new();
        let kind = ReviewCommand::Forgotten {
            include_scheduled: false,
        };
        handle_review(review_args(root.path(), kind, &["7 days"]), &settings, ymd(2023, 3, 15), &mut out)
            .expect("review");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("left behind"), "{text}");
    }

    #[test]
    fn review_scans_the_default_file_extension() {
        let root = library_root();
        fs::write(root.path().join("Notes/Work/old.text"), "* from text >2023-03-02\n").expect("write note");
        let mut settings = Settings::default();
        settings.review.ask_to_review_todays_tasks = false;

        let mut out = Vec::new();
        handle_review(review_args(root.path(), ReviewCommand::Overdue, &[]), &settings, ymd(2023, 3, 15), &mut out)
            .expect("review");
        assert!(!String::from_utf8(out).expect("utf8").contains("from text"));

        settings.preferences.default_file_extension = "text".into();
        let mut out = Vec::new();
        handle_review(review_args(root.path(), ReviewCommand::Overdue, &[]), &settings, ymd(2023, 3, 15), &mut out)
            .expect("review");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("from text"), "{text}");
        assert!(text.contains("ship it"), "{text}");
    }

    #[test]
    fn missing_library_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let args = review_args(&tmp.path().join("absent"), ReviewCommand::Today, &[]);
        let err = handle_review(args, &Settings::default(), ymd(2023, 3, 15), Vec::new()).unwrap_err();
        assert!(format!("{err:#}").contains("scanning"));
    }
}
