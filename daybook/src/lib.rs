//! Task-review, date-period and theme helpers for a plain-text note library.
//! The date and formatting modules stay pure; everything that used to need the
//! note application goes through the `storage`, `prompt` and `review` seams.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NoteId(pub Uuid);

    impl NoteId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for NoteId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Notes ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum NoteKind {
        Calendar,
        Project,
    }

    /// A note as loaded from the library. Paragraphs are kept in file order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Note {
        pub id: NoteId,
        /// Path relative to the kind's root folder (`Calendar/` or `Notes/`).
        pub filename: String,
        pub kind: NoteKind,
        pub title: String,
        /// Calendar reference derived from a calendar note's filename.
        pub calendar: Option<CalendarRef>,
        /// Last modification time (local).
        pub changed: NaiveDateTime,
        #[serde(default)]
        pub paragraphs: Vec<Paragraph>,
    }

    impl Note {
        pub fn new(filename: impl Into<String>, kind: NoteKind, changed: NaiveDateTime) -> Self {
            Self {
                id: NoteId::new(),
                filename: filename.into(),
                kind,
                title: String::new(),
                calendar: None,
                changed,
                paragraphs: vec![],
            }
        }

        /// Folder part of the filename, if the note is not at the top level.
        pub fn folder(&self) -> Option<&str> {
            self.filename.rsplit_once('/').map(|(dir, _)| dir)
        }

        /// Calendar-note date string (`20230315`, `2023-W11`, `2023-03`, ...).
        pub fn date_string(&self) -> Option<String> {
            self.calendar.map(|c| c.date_string())
        }

        /// Open tasks with non-blank content.
        pub fn open_tasks(&self) -> impl Iterator<Item = &Paragraph> {
            self.paragraphs
                .iter()
                .filter(|p| p.is_open_task() && p.has_content())
        }

        /// Day of a daily calendar note.
        pub fn day(&self) -> Option<NaiveDate> {
            match self.calendar {
                Some(CalendarRef::Day(d)) => Some(d),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ParagraphKind {
        Open,
        Done,
        Cancelled,
        Scheduled,
        ChecklistOpen,
        ChecklistDone,
        ChecklistCancelled,
        ChecklistScheduled,
        Title,
        List,
        Quote,
        Separator,
        Text,
        Empty,
    }

    /// One line of a note.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Paragraph {
        pub kind: ParagraphKind,
        /// Text after the marker/checkbox.
        pub content: String,
        /// The untouched source line.
        pub raw: String,
        pub line_index: usize,
        /// Leading whitespace width.
        pub indent: usize,
        /// 1..=6 for titles, 0 otherwise.
        pub heading_level: u8,
    }

    impl Paragraph {
        pub fn is_open_task(&self) -> bool {
            self.kind == ParagraphKind::Open
        }

        /// Open task or open checklist item.
        pub fn is_open(&self) -> bool {
            matches!(self.kind, ParagraphKind::Open | ParagraphKind::ChecklistOpen)
        }

        pub fn has_content(&self) -> bool {
            !self.content.trim().is_empty()
        }
    }

    /* ------------------------- Calendar references ------------------------- */

    /// A calendar unit as written in note filenames and `>` schedule links.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum CalendarRef {
        Day(NaiveDate),
        /// ISO week.
        Week { year: i32, week: u32 },
        Month { year: i32, month: u32 },
        Quarter { year: i32, quarter: u32 },
        Year(i32),
    }

    impl CalendarRef {
        pub fn date_string(&self) -> String {
            match self {
                CalendarRef::Day(d) => d.format("%Y%m%d").to_string(),
                CalendarRef::Week { year, week } => crate::calendar::week_string(*year, *week),
                CalendarRef::Month { year, month } => format!("{year}-{month:02}"),
                CalendarRef::Quarter { year, quarter } => format!("{year}-Q{quarter}"),
                CalendarRef::Year(year) => year.to_string(),
            }
        }

        pub fn first_day(&self) -> Option<NaiveDate> {
            self.bounds().map(|(start, _)| start)
        }

        pub fn last_day(&self) -> Option<NaiveDate> {
            self.bounds().map(|(_, end)| end)
        }

        pub fn bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
            use crate::calendar;
            match *self {
                CalendarRef::Day(d) => Some((d, d)),
                CalendarRef::Week { year, week } => calendar::iso_week_bounds(year, week),
                CalendarRef::Month { year, month } => calendar::month_bounds(year, month),
                CalendarRef::Quarter { year, quarter } => calendar::quarter_bounds(quarter, year),
                CalendarRef::Year(year) => calendar::year_bounds(year),
            }
        }
    }

    /// A `>` link inside a task: `>today`, `>2023-03-15`, `>2023-03-15+`, `>2023-W11`, ...
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ScheduleRef {
        Today,
        Date(NaiveDate),
        /// `>date+`: shows up on that date and every day after until done.
        DatePlus(NaiveDate),
        Period(CalendarRef),
    }

    impl ScheduleRef {
        /// Whether the referenced date (or the whole referenced unit) lies before `today`.
        pub fn is_overdue(&self, today: NaiveDate) -> bool {
            match self {
                ScheduleRef::Today => false,
                ScheduleRef::Date(d) | ScheduleRef::DatePlus(d) => *d < today,
                ScheduleRef::Period(r) => r.last_day().map(|end| end < today).unwrap_or(false),
            }
        }

        pub fn refers_to(&self, today: NaiveDate) -> bool {
            match self {
                ScheduleRef::Today => true,
                ScheduleRef::Date(d) => *d == today,
                ScheduleRef::DatePlus(d) => *d <= today,
                ScheduleRef::Period(CalendarRef::Day(d)) => *d == today,
                ScheduleRef::Period(_) => false,
            }
        }

        pub fn is_date_plus(&self) -> bool {
            matches!(self, ScheduleRef::DatePlus(_))
        }

        /// Earliest day the reference points at (`today` for `>today`).
        pub fn first_day(&self, today: NaiveDate) -> Option<NaiveDate> {
            match self {
                ScheduleRef::Today => Some(today),
                ScheduleRef::Date(d) | ScheduleRef::DatePlus(d) => Some(*d),
                ScheduleRef::Period(r) => r.first_day(),
            }
        }
    }

    /* ------------------------------ Outcomes ------------------------------ */

    /// Result kind for user-driven operations. Cancelling a prompt or finding
    /// nothing is ordinary control flow, not an error.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub enum Outcome<T> {
        Done(T),
        Canceled,
        NotFound,
        Invalid(String),
    }

    impl<T> Outcome<T> {
        pub fn is_done(&self) -> bool {
            matches!(self, Outcome::Done(_))
        }

        pub fn done(self) -> Option<T> {
            match self {
                Outcome::Done(v) => Some(v),
                _ => None,
            }
        }

        pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
            match self {
                Outcome::Done(v) => Outcome::Done(f(v)),
                Outcome::Canceled => Outcome::Canceled,
                Outcome::NotFound => Outcome::NotFound,
                Outcome::Invalid(msg) => Outcome::Invalid(msg),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("couldn't parse interval type '{0}'")]
        UnknownPeriod(String),
        #[error("period '{0}' needs a year and number")]
        MissingInput(String),
        #[error("'{0}' is not a number")]
        NotANumber(String),
        #[error("week {week} is not valid for {year}")]
        InvalidWeek { year: i32, week: u32 },
        #[error("month {0} is out of range (1-12)")]
        InvalidMonth(u32),
        #[error("quarter {0} is out of range (1-4)")]
        InvalidQuarter(u32),
        #[error("year {0} is out of range")]
        InvalidYear(i32),
        #[error("date out of range")]
        OutOfRange,
        #[error("unrecognized date string '{0}'")]
        InvalidDateString(String),
        #[error("unknown sort key '{0}'")]
        UnknownSortKey(String),
    }

}

pub mod settings {
    //! User settings, read from a TOML file at call time.
    //!
    //! `preferences` mirrors the note application's own preferences (first day of
    //! week, font, locale); `review` holds the task-review switches.

    use crate::locale::Locale;
    use crate::theme::CssOptions;
    use chrono::Weekday;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    const CONFIG_DIR: &str = "daybook";
    const CONFIG_FILE: &str = "config.toml";
    const CONFIG_DIR_ENV_VAR: &str = "DAYBOOK_CONFIG_DIR";

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("unable to determine config directory")]
        NoConfigDir,
        #[error("failed to read settings from {path:?}: {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("failed to parse settings from {path:?}: {source}")]
        Parse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
        #[error("failed to serialize settings: {0}")]
        Serialize(#[from] toml::ser::Error),
        #[error("failed to write settings to {path:?}: {source}")]
        Write {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        pub preferences: Preferences,
        pub review: ReviewSettings,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Preferences {
        pub first_day_of_week: Weekday,
        /// Base editor font size in px; 1rem in generated CSS.
        pub font_size: f64,
        /// Used when a theme asks for the generic "Sans" font.
        pub font_family: String,
        pub language_code: String,
        pub region_code: Option<String>,
        pub default_file_extension: String,
    }

    impl Default for Preferences {
        fn default() -> Self {
            Self {
                first_day_of_week: Weekday::Mon,
                font_size: 14.0,
                font_family: String::new(),
                language_code: "en".to_string(),
                region_code: None,
                default_file_extension: "md".to_string(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ReviewSettings {
        pub ask_to_review_todays_tasks: bool,
        pub ask_to_review_forgotten_tasks: bool,
        pub date_plus_open_only: bool,
        pub date_plus_folders_to_ignore: Vec<String>,
        pub overdue_open_only: bool,
        pub overdue_folders_to_ignore: Vec<String>,
        pub show_updated_task: bool,
        pub replace_date: bool,
        pub search_forgotten_tasks_oldest_to_newest: bool,
    }

    impl Default for ReviewSettings {
        fn default() -> Self {
            let special = vec![
                "@Archive".to_string(),
                "@Templates".to_string(),
                "@Trash".to_string(),
            ];
            Self {
                ask_to_review_todays_tasks: true,
                ask_to_review_forgotten_tasks: false,
                date_plus_open_only: true,
                date_plus_folders_to_ignore: special.clone(),
                overdue_open_only: true,
                overdue_folders_to_ignore: special,
                show_updated_task: true,
                replace_date: true,
                search_forgotten_tasks_oldest_to_newest: true,
            }
        }
    }

    impl Settings {
        /// `$DAYBOOK_CONFIG_DIR/config.toml`, else `<user config dir>/daybook/config.toml`.
        pub fn default_path() -> Result<PathBuf, SettingsError> {
            let dir = if let Ok(env_dir) = std::env::var(CONFIG_DIR_ENV_VAR) {
                PathBuf::from(env_dir)
            } else {
                dirs::config_dir()
                    .ok_or(SettingsError::NoConfigDir)?
                    .join(CONFIG_DIR)
            };
            Ok(dir.join(CONFIG_FILE))
        }

        /// Load from `path` (or the default path). A missing file yields defaults.
        pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
            let path = match path {
                Some(p) => p.to_path_buf(),
                None => Self::default_path()?,
            };
            if !path.exists() {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            let text = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&text).map_err(|source| SettingsError::Parse { path, source })
        }

        pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
            let text = toml::to_string_pretty(self)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            fs::write(path, text).map_err(|source| SettingsError::Write {
                path: path.to_path_buf(),
                source,
            })
        }

        pub fn locale(&self) -> Locale {
            Locale::new(
                &self.preferences.language_code,
                self.preferences.region_code.as_deref(),
            )
        }

        pub fn css_options(&self) -> CssOptions {
            CssOptions {
                base_font_size: self.preferences.font_size,
                user_font_family: self.preferences.font_family.clone(),
            }
        }
    }

}

pub mod logging {
    //! `tracing` subscriber setup for the CLI.

    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    const LOG_ENV_VAR: &str = "DAYBOOK_LOG";

    /// Install a compact stderr subscriber. `DAYBOOK_LOG` overrides the level
    /// chosen from the flags.
    pub fn init_tracing(verbose: bool, level: Option<&str>) -> anyhow::Result<()> {
        let level = match (verbose, level) {
            (_, Some(level)) => level.to_string(),
            (true, None) => "debug".to_string(),
            (false, None) => "warn".to_string(),
        };
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
            EnvFilter::new(if level.contains('=') {
                level
            } else {
                format!("daybook={level}")
            })
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
        Ok(())
    }
}

pub mod locale {
    //! Locale-aware date labels. The locale is explicit configuration; nothing
    //! here reads the process environment.

    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Locale {
        pub language: String,
        pub region: Option<String>,
    }

    impl Default for Locale {
        fn default() -> Self {
            Self::new("en", None)
        }
    }

    impl Locale {
        pub fn new(language: &str, region: Option<&str>) -> Self {
            Self {
                language: language.trim().to_ascii_lowercase(),
                region: region
                    .map(|r| r.trim().to_ascii_uppercase())
                    .filter(|r| !r.is_empty()),
            }
        }

        /// Parse `en`, `en-GB` or `en_GB`.
        pub fn parse(tag: &str) -> Self {
            match tag.split_once(['-', '_']) {
                Some((lang, region)) => Self::new(lang, Some(region)),
                None => Self::new(tag, None),
            }
        }

        pub fn tag(&self) -> String {
            match &self.region {
                Some(region) => format!("{}-{}", self.language, region),
                None => self.language.clone(),
            }
        }

        fn date_pattern(&self) -> &'static str {
            match (self.language.as_str(), self.region.as_deref()) {
                ("en", None | Some("US")) => "%m/%d/%Y",
                ("de", _) => "%d.%m.%Y",
                ("en" | "fr" | "es", _) => "%d/%m/%Y",
                _ => "%Y-%m-%d",
            }
        }

        fn time_pattern(&self) -> &'static str {
            match (self.language.as_str(), self.region.as_deref()) {
                ("en", None | Some("US")) => "%-I:%M %p",
                _ => "%H:%M",
            }
        }

        pub fn short_date(&self, date: NaiveDate) -> String {
            date.format(self.date_pattern()).to_string()
        }

        pub fn short_time(&self, time: NaiveTime) -> String {
            time.format(self.time_pattern()).to_string()
        }

        pub fn short_date_time(&self, dt: NaiveDateTime) -> String {
            format!("{} {}", self.short_date(dt.date()), self.short_time(dt.time()))
        }
    }

    /* ------------------------- Relative date labels ------------------------- */

    struct Phrases {
        future: &'static str,
        past: &'static str,
        /// (singular, plural) for day, week, month, year. `{}` takes the count.
        units: [(&'static str, &'static str); 4],
    }

    const EN: Phrases = Phrases {
        future: "in {}",
        past: "{} ago",
        units: [
            ("a day", "{} days"),
            ("a week", "{} weeks"),
            ("a month", "{} months"),
            ("a year", "{} years"),
        ],
    };

    const DE: Phrases = Phrases {
        future: "in {}",
        past: "vor {}",
        units: [
            ("einem Tag", "{} Tagen"),
            ("einer Woche", "{} Wochen"),
            ("einem Monat", "{} Monaten"),
            ("einem Jahr", "{} Jahren"),
        ],
    };

    const FR: Phrases = Phrases {
        future: "dans {}",
        past: "il y a {}",
        units: [
            ("un jour", "{} jours"),
            ("une semaine", "{} semaines"),
            ("un mois", "{} mois"),
            ("un an", "{} ans"),
        ],
    };

    const ES: Phrases = Phrases {
        future: "en {}",
        past: "hace {}",
        units: [
            ("un día", "{} días"),
            ("una semana", "{} semanas"),
            ("un mes", "{} meses"),
            ("un año", "{} años"),
        ],
    };

    fn phrases(locale: &Locale) -> &'static Phrases {
        match locale.language.as_str() {
            "de" => &DE,
            "fr" => &FR,
            "es" => &ES,
            _ => &EN,
        }
    }

    const SHORT_UNITS: [&str; 4] = ["d", "w", "m", "y"];

    /// Most significant unit and its rounded count for a day difference.
    fn significant_unit(abs: u64) -> (usize, u64) {
        if abs < 7 {
            (0, abs)
        } else if abs < 30 {
            (1, (abs + 3) / 7)
        } else if abs < 365 {
            let months = (abs as f64 / 30.436875).round() as u64;
            if months >= 12 { (3, 1) } else { (2, months.max(1)) }
        } else {
            (3, (abs as f64 / 365.2425).round() as u64)
        }
    }

    /// Label a day difference relative to today: `today`, `3 days ago`, `in 2 weeks`.
    /// The short style abbreviates plural English units (`3d ago`, `in 2w`).
    pub fn relative_date_from_days(diff: i64, short: bool, locale: &Locale) -> String {
        if diff == 0 {
            return "today".to_string();
        }
        let table = phrases(locale);
        let (unit, count) = significant_unit(diff.unsigned_abs());
        let (singular, plural) = table.units[unit];
        let amount = if count == 1 {
            singular.to_string()
        } else if short && locale.language == "en" {
            format!("{count}{}", SHORT_UNITS[unit])
        } else {
            plural.replace("{}", &count.to_string())
        };
        let frame = if diff < 0 { table.past } else { table.future };
        frame.replace("{}", &amount)
    }

    /// `relative_date_from_days` for the difference `date - today`.
    pub fn relative_date(date: NaiveDate, today: NaiveDate, short: bool, locale: &Locale) -> String {
        relative_date_from_days((date - today).num_days(), short, locale)
    }

}

pub mod calendar {
    //! Calendar arithmetic: ISO weeks, user weeks, months, quarters, years, and
    //! the calendar-note date strings that name them.

    use crate::core::{CalendarRef, DomainError};
    use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
    use serde::Serialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum OffsetUnit {
        Day,
        Week,
        Month,
        Quarter,
        Year,
    }

    impl std::str::FromStr for OffsetUnit {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().trim_end_matches('s') {
                "day" | "d" => Ok(OffsetUnit::Day),
                "week" | "w" => Ok(OffsetUnit::Week),
                "month" | "m" => Ok(OffsetUnit::Month),
                "quarter" | "q" => Ok(OffsetUnit::Quarter),
                "year" | "y" => Ok(OffsetUnit::Year),
                _ => Err(DomainError::UnknownPeriod(s.to_string())),
            }
        }
    }

    /// Month arithmetic clamps to the last day of shorter months.
    pub fn add_offset(date: NaiveDate, n: i32, unit: OffsetUnit) -> Option<NaiveDate> {
        let months = |m: i32| {
            if m >= 0 {
                date.checked_add_months(Months::new(m as u32))
            } else {
                date.checked_sub_months(Months::new(m.unsigned_abs()))
            }
        };
        match unit {
            OffsetUnit::Day => date.checked_add_signed(Duration::days(n as i64)),
            OffsetUnit::Week => date.checked_add_signed(Duration::weeks(n as i64)),
            OffsetUnit::Month => months(n),
            OffsetUnit::Quarter => months(n.checked_mul(3)?),
            OffsetUnit::Year => months(n.checked_mul(12)?),
        }
    }

    pub fn week_string(year: i32, week: u32) -> String {
        format!("{year}-W{week:02}")
    }

    pub fn quarter_of(date: NaiveDate) -> u32 {
        date.month0() / 3 + 1
    }

    pub fn start_of_month(date: NaiveDate) -> NaiveDate {
        date.with_day(1).unwrap_or(date)
    }

    pub fn end_of_month(date: NaiveDate) -> NaiveDate {
        start_of_month(date)
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .unwrap_or(date)
    }

    pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        Some((start, end_of_month(start)))
    }

    /// First and last day of quarter `q` (1-4) of `year`.
    pub fn quarter_bounds(q: u32, year: i32) -> Option<(NaiveDate, NaiveDate)> {
        if !(1..=4).contains(&q) {
            return None;
        }
        let start = NaiveDate::from_ymd_opt(year, (q - 1) * 3 + 1, 1)?;
        let end = end_of_month(NaiveDate::from_ymd_opt(year, q * 3, 1)?);
        Some((start, end))
    }

    pub fn year_bounds(year: i32) -> Option<(NaiveDate, NaiveDate)> {
        Some((
            NaiveDate::from_ymd_opt(year, 1, 1)?,
            NaiveDate::from_ymd_opt(year, 12, 31)?,
        ))
    }

    /// 52 or 53: 28 December always falls in the last ISO week.
    pub fn iso_weeks_in_year(year: i32) -> u32 {
        NaiveDate::from_ymd_opt(year, 12, 28)
            .map(|d| d.iso_week().week())
            .unwrap_or(52)
    }

    /// Monday..Sunday of ISO week `week` of ISO year `year`.
    pub fn iso_week_bounds(year: i32, week: u32) -> Option<(NaiveDate, NaiveDate)> {
        if week == 0 || week > iso_weeks_in_year(year) {
            return None;
        }
        Some((
            NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?,
            NaiveDate::from_isoywd_opt(year, week, Weekday::Sun)?,
        ))
    }

    /// 1-based position of `date` within a week starting on `first_day`.
    pub fn day_of_user_week(date: NaiveDate, first_day: Weekday) -> u32 {
        (date.weekday().num_days_from_monday() + 7 - first_day.num_days_from_monday()) % 7 + 1
    }

    pub fn start_of_user_week(date: NaiveDate, first_day: Weekday) -> NaiveDate {
        let back = day_of_user_week(date, first_day) - 1;
        date.checked_sub_signed(Duration::days(back as i64)).unwrap_or(date)
    }

    /// Parse a calendar-note date string (`YYYYMMDD`, `YYYY-MM-DD`, `YYYY-Www`,
    /// `YYYY-MM`, `YYYY-Qn`, `YYYY`) to the first day it covers.
    pub fn parse_date_string(s: &str) -> Result<NaiveDate, DomainError> {
        let r = crate::parser::parse_calendar_ref(s)?;
        r.first_day()
            .ok_or_else(|| DomainError::InvalidDateString(s.to_string()))
    }

    /* ------------------------------ Unit info ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct WeekInfo {
        pub week_number: u32,
        pub week_year: i32,
        pub week_string: String,
        pub start: NaiveDate,
        pub end: NaiveDate,
        /// The anchor date after the offset was applied.
        pub date: NaiveDate,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct MonthInfo {
        /// 0-based.
        pub month_index: u32,
        pub month_string: String,
        pub start: NaiveDate,
        pub end: NaiveDate,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct QuarterInfo {
        /// 1-based.
        pub quarter: u32,
        pub quarter_string: String,
        pub start: NaiveDate,
        pub end: NaiveDate,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct YearInfo {
        pub year_string: String,
        pub start: NaiveDate,
        pub end: NaiveDate,
    }

    /// Week containing `anchor + offset`, with weeks starting on `first_day`.
    /// The week is numbered by the ISO week of its fourth day, so Monday-start
    /// weeks match ISO numbering exactly.
    pub fn week_info(anchor: NaiveDate, offset: i32, unit: OffsetUnit, first_day: Weekday) -> Option<WeekInfo> {
        let date = add_offset(anchor, offset, unit)?;
        let start = start_of_user_week(date, first_day);
        let end = start + Duration::days(6);
        let iso = (start + Duration::days(3)).iso_week();
        Some(WeekInfo {
            week_number: iso.week(),
            week_year: iso.year(),
            week_string: week_string(iso.year(), iso.week()),
            start,
            end,
            date,
        })
    }

    pub fn month_info(anchor: NaiveDate, offset: i32, unit: OffsetUnit) -> Option<MonthInfo> {
        let date = add_offset(anchor, offset, unit)?;
        Some(MonthInfo {
            month_index: date.month0(),
            month_string: date.format("%Y-%m").to_string(),
            start: start_of_month(date),
            end: end_of_month(date),
        })
    }

    pub fn quarter_info(anchor: NaiveDate, offset: i32, unit: OffsetUnit) -> Option<QuarterInfo> {
        let date = add_offset(anchor, offset, unit)?;
        let quarter = quarter_of(date);
        let (start, end) = quarter_bounds(quarter, date.year())?;
        Some(QuarterInfo {
            quarter,
            quarter_string: format!("{}-Q{quarter}", date.year()),
            start,
            end,
        })
    }

    pub fn year_info(anchor: NaiveDate, offset: i32, unit: OffsetUnit) -> Option<YearInfo> {
        let date = add_offset(anchor, offset, unit)?;
        let (start, end) = year_bounds(date.year())?;
        Some(YearInfo {
            year_string: date.year().to_string(),
            start,
            end,
        })
    }

    /* --------------------------- Relative dates --------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct RelativeDate {
        pub name: &'static str,
        pub date_string: String,
    }

    /// Calendar-note date strings for today/yesterday/tomorrow and the current,
    /// previous and next week, month and quarter.
    pub fn relative_dates(today: NaiveDate, first_day: Weekday) -> Vec<RelativeDate> {
        let mut out = Vec::with_capacity(12);
        let mut push = |name: &'static str, s: Option<String>| {
            if let Some(date_string) = s {
                out.push(RelativeDate { name, date_string });
            }
        };
        let day = |n: i32| add_offset(today, n, OffsetUnit::Day).map(|d| d.format("%Y%m%d").to_string());
        let week = |n: i32| week_info(today, n, OffsetUnit::Week, first_day).map(|w| w.week_string);
        let month = |n: i32| month_info(today, n, OffsetUnit::Month).map(|m| m.month_string);
        let quarter = |n: i32| quarter_info(today, n, OffsetUnit::Quarter).map(|q| q.quarter_string);

        push("today", day(0));
        push("yesterday", day(-1));
        push("tomorrow", day(1));
        push("this week", week(0));
        push("last week", week(-1));
        push("next week", week(1));
        push("this month", month(0));
        push("last month", month(-1));
        push("next month", month(1));
        push("this quarter", quarter(0));
        push("last quarter", quarter(-1));
        push("next quarter", quarter(1));
        out
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct WeekOption {
        pub label: String,
        pub value: String,
    }

    /// `>YYYY-Www` choices for every week from this one to six months ahead,
    /// preceded by `>thisweek` and `>nextweek` shortcuts.
    pub fn week_options(today: NaiveDate, first_day: Weekday) -> Vec<WeekOption> {
        let Some(horizon) = add_offset(today, 6, OffsetUnit::Month) else {
            return vec![];
        };
        let mut weeks = vec![];
        let mut anchor = start_of_user_week(today, first_day);
        while anchor <= horizon {
            if let Some(info) = week_info(anchor, 0, OffsetUnit::Day, first_day) {
                weeks.push(WeekOption {
                    label: format!(
                        ">{} Weekly Note ({} - {})",
                        info.week_string,
                        info.start.format("%Y-%m-%d"),
                        info.end.format("%Y-%m-%d")
                    ),
                    value: format!(">{}", info.week_string),
                });
            }
            match anchor.checked_add_signed(Duration::days(7)) {
                Some(next) => anchor = next,
                None => break,
            }
        }
        if weeks.len() < 2 {
            return vec![];
        }
        let extras = [
            WeekOption {
                label: format!(">thisweek -- {}", weeks[0].label),
                value: weeks[0].value.clone(),
            },
            WeekOption {
                label: format!(">nextweek -- {}", weeks[1].label),
                value: weeks[1].value.clone(),
            },
        ];
        extras.into_iter().chain(weeks).collect()
    }

    /// Resolve a `CalendarRef` from week/month/quarter/year numbers, validating ranges.
    pub fn calendar_ref_for(kind: OffsetUnit, year: i32, number: u32) -> Result<CalendarRef, DomainError> {
        if !(1..=9999).contains(&year) {
            return Err(DomainError::InvalidYear(year));
        }
        match kind {
            OffsetUnit::Week => {
                if number == 0 || number > iso_weeks_in_year(year) {
                    Err(DomainError::InvalidWeek { year, week: number })
                } else {
                    Ok(CalendarRef::Week { year, week: number })
                }
            }
            OffsetUnit::Month if (1..=12).contains(&number) => Ok(CalendarRef::Month { year, month: number }),
            OffsetUnit::Month => Err(DomainError::InvalidMonth(number)),
            OffsetUnit::Quarter if (1..=4).contains(&number) => Ok(CalendarRef::Quarter { year, quarter: number }),
            OffsetUnit::Quarter => Err(DomainError::InvalidQuarter(number)),
            OffsetUnit::Year => Ok(CalendarRef::Year(year)),
            OffsetUnit::Day => Err(DomainError::OutOfRange),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn quarter_bounds_cover_three_months() {
            assert_eq!(quarter_bounds(1, 2023), Some((ymd(2023, 1, 1), ymd(2023, 3, 31))));
            assert_eq!(quarter_bounds(4, 2024), Some((ymd(2024, 10, 1), ymd(2024, 12, 31))));
            assert_eq!(quarter_bounds(5, 2024), None);
        }

        #[test]
        fn iso_week_counts() {
            assert_eq!(iso_weeks_in_year(2020), 53);
            assert_eq!(iso_weeks_in_year(2023), 52);
            assert!(iso_week_bounds(2023, 53).is_none());
            assert_eq!(iso_week_bounds(2020, 53), Some((ymd(2020, 12, 28), ymd(2021, 1, 3))));
        }

        #[test]
        fn month_offsets_clamp_to_month_end() {
            assert_eq!(add_offset(ymd(2023, 1, 31), 1, OffsetUnit::Month), Some(ymd(2023, 2, 28)));
            assert_eq!(add_offset(ymd(2023, 5, 15), -1, OffsetUnit::Quarter), Some(ymd(2023, 2, 15)));
        }

        #[test]
        fn week_info_honors_first_day() {
            // Wednesday 15 March 2023.
            let monday = week_info(ymd(2023, 3, 15), 0, OffsetUnit::Week, Weekday::Mon).unwrap();
            assert_eq!(monday.start, ymd(2023, 3, 13));
            assert_eq!(monday.end, ymd(2023, 3, 19));
            assert_eq!(monday.week_string, "2023-W11");

            let sunday = week_info(ymd(2023, 3, 15), 0, OffsetUnit::Week, Weekday::Sun).unwrap();
            assert_eq!(sunday.start, ymd(2023, 3, 12));
            assert_eq!(sunday.end, ymd(2023, 3, 18));
        }

        #[test]
        fn week_year_follows_iso_across_new_year() {
            let info = week_info(ymd(2021, 1, 2), 0, OffsetUnit::Day, Weekday::Mon).unwrap();
            assert_eq!(info.week_string, "2020-W53");
            assert_eq!(info.week_year, 2020);
        }

        #[test]
        fn month_and_quarter_info() {
            let m = month_info(ymd(2023, 1, 15), -1, OffsetUnit::Month).unwrap();
            assert_eq!(m.month_string, "2022-12");
            assert_eq!(m.month_index, 11);
            assert_eq!(m.end, ymd(2022, 12, 31));

            let q = quarter_info(ymd(2023, 5, 2), 1, OffsetUnit::Quarter).unwrap();
            assert_eq!(q.quarter_string, "2023-Q3");
            assert_eq!(q.start, ymd(2023, 7, 1));

            let y = year_info(ymd(2023, 1, 15), -14, OffsetUnit::Month).unwrap();
            assert_eq!(y.year_string, "2021");
            assert_eq!((y.start, y.end), (ymd(2021, 1, 1), ymd(2021, 12, 31)));
        }

        #[test]
        fn relative_dates_lists_twelve_entries() {
            let dates = relative_dates(ymd(2023, 3, 15), Weekday::Mon);
            let pairs: Vec<(&str, &str)> = dates.iter().map(|d| (d.name, d.date_string.as_str())).collect();
            assert_eq!(
                pairs,
                vec![
                    ("today", "20230315"),
                    ("yesterday", "20230314"),
                    ("tomorrow", "20230316"),
                    ("this week", "2023-W11"),
                    ("last week", "2023-W10"),
                    ("next week", "2023-W12"),
                    ("this month", "2023-03"),
                    ("last month", "2023-02"),
                    ("next month", "2023-04"),
                    ("this quarter", "2023-Q1"),
                    ("last quarter", "2022-Q4"),
                    ("next quarter", "2023-Q2"),
                ]
            );
        }

        #[test]
        fn week_options_start_with_shortcuts() {
            let opts = week_options(ymd(2023, 3, 15), Weekday::Mon);
            assert_eq!(opts[0].value, ">2023-W11");
            assert!(opts[0].label.starts_with(">thisweek -- >2023-W11 Weekly Note (2023-03-13 - 2023-03-19)"));
            assert_eq!(opts[1].value, ">2023-W12");
            assert!(opts[1].label.starts_with(">nextweek -- "));
            assert_eq!(opts[2].value, ">2023-W11");
            assert!(opts.len() > 20);
        }

        #[test]
        fn date_strings_parse_to_first_day() {
            assert_eq!(parse_date_string("20230315"), Ok(ymd(2023, 3, 15)));
            assert_eq!(parse_date_string("2023-03-15"), Ok(ymd(2023, 3, 15)));
            assert_eq!(parse_date_string("2023-W11"), Ok(ymd(2023, 3, 13)));
            assert_eq!(parse_date_string("2023-Q2"), Ok(ymd(2023, 4, 1)));
            assert_eq!(parse_date_string("2023-03"), Ok(ymd(2023, 3, 1)));
            assert_eq!(parse_date_string("2023"), Ok(ymd(2023, 1, 1)));
            assert!(parse_date_string("2023-W60").is_err());
            assert!(parse_date_string("next tuesday").is_err());
        }

        #[test]
        fn calendar_refs_are_validated() {
            assert!(calendar_ref_for(OffsetUnit::Week, 2020, 53).is_ok());
            assert_eq!(
                calendar_ref_for(OffsetUnit::Week, 2023, 53),
                Err(DomainError::InvalidWeek { year: 2023, week: 53 })
            );
            assert_eq!(calendar_ref_for(OffsetUnit::Month, 2023, 13), Err(DomainError::InvalidMonth(13)));
            assert_eq!(calendar_ref_for(OffsetUnit::Quarter, 2023, 0), Err(DomainError::InvalidQuarter(0)));
        }
    }
}

pub mod prompt {
    //! Modal dialog seam. Every interactive step goes through `Prompter`, so
    //! callers can drive flows from a terminal, a script, or a test.

    use std::collections::VecDeque;

    /// A picked option. `modified` is set when the choice was made with the
    /// modifier key held (used to widen searches).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Choice {
        pub index: usize,
        pub modified: bool,
    }

    pub trait Prompter {
        /// `None` when the user dismisses the list.
        fn choose(&mut self, title: &str, options: &[String]) -> Option<Choice>;
        /// `None` when cancelled. `default` is offered pre-filled.
        fn input(&mut self, title: &str, message: &str, default: Option<&str>) -> Option<String>;
        /// `Some(true)` yes, `Some(false)` no, `None` cancelled.
        fn confirm(&mut self, title: &str, message: &str) -> Option<bool>;
        fn message(&mut self, title: &str, message: &str);
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Answer {
        Text(String),
        /// `alt:` prefix: choose with the modifier held.
        Modified(String),
        Default,
        Yes,
        No,
        Cancel,
    }

    impl std::str::FromStr for Answer {
        type Err = std::convert::Infallible;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            Ok(match s.to_ascii_lowercase().as_str() {
                "" => Answer::Default,
                "y" | "yes" => Answer::Yes,
                "n" | "no" => Answer::No,
                "cancel" | "esc" => Answer::Cancel,
                _ => match s.strip_prefix("alt:") {
                    Some(rest) => Answer::Modified(rest.trim().to_string()),
                    None => Answer::Text(s.to_string()),
                },
            })
        }
    }

    /// Replays a fixed list of answers. Running out of answers cancels.
    #[derive(Debug, Default)]
    pub struct ScriptedPrompter {
        answers: VecDeque<Answer>,
        /// Titles and messages shown, in order.
        pub shown: Vec<String>,
    }

    impl ScriptedPrompter {
        pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
            Self {
                answers: answers.into_iter().collect(),
                shown: vec![],
            }
        }

        pub fn from_strs<S: AsRef<str>>(answers: &[S]) -> Self {
            Self::new(answers.iter().map(|a| {
                let Ok(answer) = a.as_ref().parse::<Answer>();
                answer
            }))
        }

        pub fn remaining(&self) -> usize {
            self.answers.len()
        }
    }

    /// Match `text` against an option label, or a 1-based option number.
    pub fn match_option(text: &str, options: &[String]) -> Option<usize> {
        if let Ok(n) = text.parse::<usize>() {
            return (1..=options.len()).contains(&n).then(|| n - 1);
        }
        let lower = text.to_lowercase();
        options
            .iter()
            .position(|o| o.to_lowercase() == lower)
            .or_else(|| options.iter().position(|o| o.to_lowercase().starts_with(&lower)))
    }

    impl Prompter for ScriptedPrompter {
        fn choose(&mut self, title: &str, options: &[String]) -> Option<Choice> {
            self.shown.push(title.to_string());
            match self.answers.pop_front()? {
                Answer::Default if !options.is_empty() => Some(Choice { index: 0, modified: false }),
                Answer::Text(t) => match_option(&t, options).map(|index| Choice { index, modified: false }),
                Answer::Modified(t) => match_option(&t, options).map(|index| Choice { index, modified: true }),
                _ => None,
            }
        }

        fn input(&mut self, title: &str, message: &str, default: Option<&str>) -> Option<String> {
            self.shown.push(format!("{title}: {message}"));
            match self.answers.pop_front()? {
                Answer::Text(t) | Answer::Modified(t) => Some(t),
                Answer::Default => Some(default.unwrap_or_default().to_string()),
                Answer::Yes => Some("yes".to_string()),
                Answer::No => Some("no".to_string()),
                Answer::Cancel => None,
            }
        }

        fn confirm(&mut self, title: &str, message: &str) -> Option<bool> {
            self.shown.push(format!("{title}: {message}"));
            match self.answers.pop_front()? {
                Answer::Yes | Answer::Default => Some(true),
                Answer::No => Some(false),
                Answer::Text(_) | Answer::Modified(_) => Some(false),
                Answer::Cancel => None,
            }
        }

        fn message(&mut self, title: &str, message: &str) {
            self.shown.push(format!("{title}: {message}"));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn options() -> Vec<String> {
            vec!["Last Week".into(), "Last Month".into(), "Other Year".into()]
        }

        #[test]
        fn answers_parse_from_strings() {
            assert_eq!("y".parse::<Answer>(), Ok(Answer::Yes));
            assert_eq!("".parse::<Answer>(), Ok(Answer::Default));
            assert_eq!("alt:2".parse::<Answer>(), Ok(Answer::Modified("2".into())));
            assert_eq!("2023".parse::<Answer>(), Ok(Answer::Text("2023".into())));
        }

        #[test]
        fn choose_matches_numbers_and_labels() {
            let mut p = ScriptedPrompter::from_strs(&["2", "other", "alt:Last Week", "9"]);
            let opts = options();
            assert_eq!(p.choose("t", &opts), Some(Choice { index: 1, modified: false }));
            assert_eq!(p.choose("t", &opts), Some(Choice { index: 2, modified: false }));
            assert_eq!(p.choose("t", &opts), Some(Choice { index: 0, modified: true }));
            assert_eq!(p.choose("t", &opts), None);
        }

        #[test]
        fn exhausted_script_cancels() {
            let mut p = ScriptedPrompter::default();
            assert_eq!(p.confirm("t", "m"), None);
            assert_eq!(p.input("t", "m", Some("x")), None);
            assert_eq!(p.shown.len(), 2);
        }
    }
}

pub mod period {
    //! Named reporting periods ("last month", "quarter to date", ...) resolved
    //! to concrete start/end dates.

    use crate::calendar::{self, OffsetUnit};
    use crate::core::{DomainError, Outcome};
    use crate::prompt::Prompter;
    use chrono::{Datelike, Duration, NaiveDate, Weekday};
    use serde::Serialize;
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub enum PeriodTag {
        LastWeek,
        UserWeekToDate,
        WeekToDate,
        OtherWeek,
        LastMonth,
        MonthToDate,
        OtherMonth,
        LastQuarter,
        QuarterToDate,
        OtherQuarter,
        LastYear,
        YearToDate,
        OtherYear,
        Last7Days,
        Last2Weeks,
        Last4Weeks,
        /// `YYYY-MM-DD`: from that date up to today.
        Since(NaiveDate),
    }

    /// Menu shown when no tag is given.
    pub const MENU: [(&str, PeriodTag); 12] = [
        ("Last Week", PeriodTag::LastWeek),
        ("This week (so far)", PeriodTag::UserWeekToDate),
        ("Other Week", PeriodTag::OtherWeek),
        ("Last Month", PeriodTag::LastMonth),
        ("This Month (to date)", PeriodTag::MonthToDate),
        ("Other Month", PeriodTag::OtherMonth),
        ("Last Quarter", PeriodTag::LastQuarter),
        ("This Quarter (to date)", PeriodTag::QuarterToDate),
        ("Other Quarter", PeriodTag::OtherQuarter),
        ("Last Year", PeriodTag::LastYear),
        ("Year to date", PeriodTag::YearToDate),
        ("Other Year", PeriodTag::OtherYear),
    ];

    impl PeriodTag {
        pub fn code(&self) -> String {
            match self {
                PeriodTag::LastWeek => "lw".into(),
                PeriodTag::UserWeekToDate => "userwtd".into(),
                PeriodTag::WeekToDate => "wtd".into(),
                PeriodTag::OtherWeek => "ow".into(),
                PeriodTag::LastMonth => "lm".into(),
                PeriodTag::MonthToDate => "mtd".into(),
                PeriodTag::OtherMonth => "om".into(),
                PeriodTag::LastQuarter => "lq".into(),
                PeriodTag::QuarterToDate => "qtd".into(),
                PeriodTag::OtherQuarter => "oq".into(),
                PeriodTag::LastYear => "ly".into(),
                PeriodTag::YearToDate => "ytd".into(),
                PeriodTag::OtherYear => "oy".into(),
                PeriodTag::Last7Days => "last7d".into(),
                PeriodTag::Last2Weeks => "last2w".into(),
                PeriodTag::Last4Weeks => "last4w".into(),
                PeriodTag::Since(d) => d.format("%Y-%m-%d").to_string(),
            }
        }

        /// The "other ..." tags ask for a year, and all but `oy` for a number.
        pub fn needs_input(&self) -> Option<OffsetUnit> {
            match self {
                PeriodTag::OtherWeek => Some(OffsetUnit::Week),
                PeriodTag::OtherMonth => Some(OffsetUnit::Month),
                PeriodTag::OtherQuarter => Some(OffsetUnit::Quarter),
                PeriodTag::OtherYear => Some(OffsetUnit::Year),
                _ => None,
            }
        }
    }

    impl fmt::Display for PeriodTag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.code())
        }
    }

    /// Strip one layer of matching single or double quotes.
    pub fn trim_any_quotes(s: &str) -> &str {
        let s = s.trim();
        for q in ['"', '\''] {
            if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
                return &s[1..s.len() - 1];
            }
        }
        s
    }

    impl std::str::FromStr for PeriodTag {
        type Err = DomainError;

        fn from_str(raw: &str) -> Result<Self, Self::Err> {
            let s = trim_any_quotes(raw);
            Ok(match s {
                "lw" => PeriodTag::LastWeek,
                "userwtd" => PeriodTag::UserWeekToDate,
                "wtd" => PeriodTag::WeekToDate,
                "ow" => PeriodTag::OtherWeek,
                "lm" => PeriodTag::LastMonth,
                "mtd" => PeriodTag::MonthToDate,
                "om" => PeriodTag::OtherMonth,
                "lq" => PeriodTag::LastQuarter,
                "qtd" => PeriodTag::QuarterToDate,
                "oq" => PeriodTag::OtherQuarter,
                "ly" => PeriodTag::LastYear,
                "ytd" => PeriodTag::YearToDate,
                "oy" => PeriodTag::OtherYear,
                "last7d" => PeriodTag::Last7Days,
                "last2w" => PeriodTag::Last2Weeks,
                "last4w" => PeriodTag::Last4Weeks,
                other => match NaiveDate::parse_from_str(other, "%Y-%m-%d") {
                    Ok(d) if other.len() == 10 => PeriodTag::Since(d),
                    _ => return Err(DomainError::UnknownPeriod(other.to_string())),
                },
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Period {
        pub start: NaiveDate,
        pub end: NaiveDate,
        /// Tag code as requested (quotes stripped).
        pub tag: String,
        /// `Mar 2023`, `2023-W11`, `last 7 days`, or `<Error: ...>`.
        pub label: String,
        /// How far into a partial period today is; empty for complete periods.
        pub progress: String,
    }

    impl Period {
        pub fn is_error(&self) -> bool {
            self.label.starts_with("<Error:")
        }

        pub fn days(&self) -> i64 {
            (self.end - self.start).num_days() + 1
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeriodContext {
        pub today: NaiveDate,
        pub first_day_of_week: Weekday,
        pub exclude_today: bool,
    }

    impl PeriodContext {
        pub fn new(today: NaiveDate) -> Self {
            Self {
                today,
                first_day_of_week: Weekday::Mon,
                exclude_today: true,
            }
        }
    }

    /// Year and week/month/quarter number for the "other ..." tags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeriodInput {
        pub year: i32,
        pub number: Option<u32>,
    }

    fn month_label(d: NaiveDate) -> String {
        d.format("%b %Y").to_string()
    }

    fn quarter_label(q: u32, start: NaiveDate, end: NaiveDate) -> String {
        format!("{} Q{q} ({}-{})", start.year(), start.format("%b"), end.format("%b"))
    }

    fn iso_week_period(year: i32, week: u32) -> Result<(NaiveDate, NaiveDate, String), DomainError> {
        let (start, end) = calendar::iso_week_bounds(year, week).ok_or(DomainError::InvalidWeek { year, week })?;
        Ok((start, end, calendar::week_string(year, week)))
    }

    fn days_back(today: NaiveDate, n: i64) -> Result<NaiveDate, DomainError> {
        today
            .checked_sub_signed(Duration::days(n - 1))
            .ok_or(DomainError::OutOfRange)
    }

    fn require_input(tag: PeriodTag, input: Option<PeriodInput>, needs_number: bool) -> Result<(i32, u32), DomainError> {
        let input = input.ok_or_else(|| DomainError::MissingInput(tag.code()))?;
        match (input.number, needs_number) {
            (Some(n), _) => Ok((input.year, n)),
            (None, false) => Ok((input.year, 0)),
            (None, true) => Err(DomainError::MissingInput(tag.code())),
        }
    }

    /// Resolve a parsed tag. `input` is only read for the "other ..." tags.
    pub fn resolve_tag(tag: PeriodTag, ctx: &PeriodContext, input: Option<PeriodInput>) -> Result<Period, DomainError> {
        let today = ctx.today;
        let y = today.year();
        let mut progress = String::new();

        let (start, end, label) = match tag {
            PeriodTag::LastMonth => {
                let start = calendar::start_of_month(today)
                    .pred_opt()
                    .map(calendar::start_of_month)
                    .ok_or(DomainError::OutOfRange)?;
                (start, calendar::end_of_month(start), month_label(start))
            }
            PeriodTag::MonthToDate => {
                let start = calendar::start_of_month(today);
                let label = month_label(start);
                progress = format!("{label}, day {}", today.day());
                (start, today, label)
            }
            PeriodTag::OtherMonth => {
                let (year, month) = require_input(tag, input, true)?;
                calendar::calendar_ref_for(OffsetUnit::Month, year, month)?;
                let (start, end) = calendar::month_bounds(year, month).ok_or(DomainError::InvalidMonth(month))?;
                (start, end, month_label(start))
            }
            PeriodTag::LastQuarter => {
                let (q, year) = match calendar::quarter_of(today) {
                    1 => (4, y - 1),
                    q => (q - 1, y),
                };
                let (start, end) = calendar::quarter_bounds(q, year).ok_or(DomainError::InvalidQuarter(q))?;
                (start, end, quarter_label(q, start, end))
            }
            PeriodTag::QuarterToDate => {
                let q = calendar::quarter_of(today);
                let (start, _) = calendar::quarter_bounds(q, y).ok_or(DomainError::InvalidQuarter(q))?;
                let label = format!("{y} Q{q}");
                progress = format!("{label} (to {})", today.format("%Y-%m-%d"));
                (start, today, label)
            }
            PeriodTag::OtherQuarter => {
                let (year, q) = require_input(tag, input, true)?;
                calendar::calendar_ref_for(OffsetUnit::Quarter, year, q)?;
                let (start, end) = calendar::quarter_bounds(q, year).ok_or(DomainError::InvalidQuarter(q))?;
                (start, end, quarter_label(q, start, end))
            }
            PeriodTag::LastWeek => {
                // Numbered from a day in last week, so New Year lands in the right ISO year.
                let iso = today
                    .checked_sub_signed(Duration::days(7))
                    .ok_or(DomainError::OutOfRange)?
                    .iso_week();
                iso_week_period(iso.year(), iso.week())?
            }
            PeriodTag::UserWeekToDate => {
                let n = calendar::day_of_user_week(today, ctx.first_day_of_week);
                progress = format!("at day {n} of this week");
                (
                    calendar::start_of_user_week(today, ctx.first_day_of_week),
                    today,
                    "this week".to_string(),
                )
            }
            PeriodTag::WeekToDate => {
                let iso = today.iso_week();
                let (start, end, label) = iso_week_period(iso.year(), iso.week())?;
                progress = format!("day {}, {label}", today.weekday().number_from_monday());
                (start, end, label)
            }
            PeriodTag::OtherWeek => {
                let (year, week) = require_input(tag, input, true)?;
                calendar::calendar_ref_for(OffsetUnit::Week, year, week)?;
                iso_week_period(year, week)?
            }
            PeriodTag::Last7Days => (days_back(today, 7)?, today, "last 7 days".to_string()),
            PeriodTag::Last2Weeks => (days_back(today, 14)?, today, "last 2 weeks".to_string()),
            PeriodTag::Last4Weeks => (days_back(today, 28)?, today, "last 4 weeks".to_string()),
            PeriodTag::LastYear => {
                let info = calendar::year_info(today, -1, OffsetUnit::Year).ok_or(DomainError::InvalidYear(y - 1))?;
                (info.start, info.end, info.year_string)
            }
            PeriodTag::YearToDate => {
                let info = calendar::year_info(today, 0, OffsetUnit::Year).ok_or(DomainError::InvalidYear(y))?;
                progress = format!("{y} (to {})", today.format("%Y-%m-%d"));
                (info.start, today, info.year_string)
            }
            PeriodTag::OtherYear => {
                let (year, _) = require_input(tag, input, false)?;
                calendar::calendar_ref_for(OffsetUnit::Year, year, 0)?;
                let (start, end) = calendar::year_bounds(year).ok_or(DomainError::InvalidYear(year))?;
                (start, end, year.to_string())
            }
            PeriodTag::Since(from) => {
                let code = tag.code();
                progress = format!("{} days since {code}", (today - from).num_days());
                (from, today, format!("since {code}"))
            }
        };

        let end = if ctx.exclude_today {
            end.checked_sub_signed(Duration::days(1)).ok_or(DomainError::OutOfRange)?
        } else {
            end
        };
        tracing::debug!(tag = %tag, %start, %end, %label, "resolved period");
        Ok(Period {
            start,
            end,
            tag: tag.code(),
            label,
            progress,
        })
    }

    fn error_period(raw: &str, ctx: &PeriodContext, err: &DomainError) -> Period {
        let end = if ctx.exclude_today {
            ctx.today.checked_sub_signed(Duration::days(1)).unwrap_or(ctx.today)
        } else {
            ctx.today
        };
        Period {
            start: ctx.today,
            end,
            tag: trim_any_quotes(raw).to_string(),
            label: format!("<Error: {err}>"),
            progress: String::new(),
        }
    }

    /// Resolve a raw tag string. Never fails: problems come back as an error
    /// period (see `Period::is_error`).
    pub fn resolve(raw: &str, ctx: &PeriodContext, input: Option<PeriodInput>) -> Period {
        match raw.parse::<PeriodTag>().and_then(|tag| resolve_tag(tag, ctx, input)) {
            Ok(period) => period,
            Err(err) => {
                tracing::warn!(tag = raw, error = %err, "could not resolve period");
                error_period(raw, ctx, &err)
            }
        }
    }

    fn ask_number<T: std::str::FromStr>(
        prompter: &mut dyn Prompter,
        title: &str,
        message: &str,
        default: Option<&str>,
    ) -> Outcome<T> {
        match prompter.input(title, message, default) {
            None => Outcome::Canceled,
            Some(text) => match text.trim().parse::<T>() {
                Ok(v) => Outcome::Done(v),
                Err(_) => Outcome::Invalid(DomainError::NotANumber(text.trim().to_string()).to_string()),
            },
        }
    }

    /// Ask for the year (and week/month/quarter) an "other ..." tag needs.
    fn ask_input(prompter: &mut dyn Prompter, unit: OffsetUnit, this_year: i32) -> Outcome<PeriodInput> {
        let title = match unit {
            OffsetUnit::Week => "Counts for Week",
            OffsetUnit::Month => "Counts for Month",
            OffsetUnit::Quarter => "Counts for Quarter",
            _ => "Counts for Year",
        };
        let default_year = this_year.to_string();
        let year = match ask_number::<i32>(prompter, title, &format!("Choose year, e.g. {this_year}"), Some(&default_year)) {
            Outcome::Done(y) => y,
            Outcome::Canceled => return Outcome::Canceled,
            Outcome::NotFound => return Outcome::NotFound,
            Outcome::Invalid(msg) => return Outcome::Invalid(msg),
        };
        let question = match unit {
            OffsetUnit::Week => "Choose week number, 1-53",
            OffsetUnit::Month => "Choose month, (1-12)",
            OffsetUnit::Quarter => "Choose quarter, (1-4)",
            _ => return Outcome::Done(PeriodInput { year, number: None }),
        };
        ask_number::<u32>(prompter, title, question, None).map(|n| PeriodInput { year, number: Some(n) })
    }

    /// Resolve `raw_tag`, or ask for one from `MENU` when absent. Declining any
    /// prompt cancels; unknown tags and out-of-range answers are `Invalid`.
    pub fn choose_period(
        prompter: &mut dyn Prompter,
        question: &str,
        ctx: &PeriodContext,
        raw_tag: Option<&str>,
    ) -> Outcome<Period> {
        let tag = match raw_tag.map(trim_any_quotes).filter(|t| !t.is_empty()) {
            Some(raw) => match raw.parse::<PeriodTag>() {
                Ok(tag) => tag,
                Err(err) => return Outcome::Invalid(error_period(raw, ctx, &err).label),
            },
            None => {
                let labels: Vec<String> = MENU.iter().map(|(label, _)| label.to_string()).collect();
                match prompter.choose(question, &labels) {
                    Some(choice) => MENU[choice.index].1,
                    None => return Outcome::Canceled,
                }
            }
        };

        let input = match tag.needs_input() {
            Some(unit) => match ask_input(prompter, unit, ctx.today.year()) {
                Outcome::Done(input) => Some(input),
                Outcome::Canceled => return Outcome::Canceled,
                Outcome::NotFound => return Outcome::NotFound,
                Outcome::Invalid(msg) => return Outcome::Invalid(msg),
            },
            None => None,
        };

        match resolve_tag(tag, ctx, input) {
            Ok(period) => Outcome::Done(period),
            Err(err) => {
                tracing::warn!(tag = %tag, error = %err, "invalid period answer");
                Outcome::Invalid(error_period(&tag.code(), ctx, &err).label)
            }
        }
    }

}

pub mod parser {
    //! Line-oriented Markdown note parser built on `nom`.
    //!
    //! Each line becomes one `Paragraph`. Task markers (`*`, `-`, `+` with an
    //! optional `[ ]`/`[x]`/`[-]`/`[>]` box), headings, quotes and separators are
    //! recognised; everything else is text. Schedule links (`>today`,
    //! `>2023-03-15`, `>2023-03-15+`, `>2023-W11`, `>2023-03`, `>2023-Q1`, `>2023`)
    //! are found anywhere in a paragraph's content.

    use crate::core::*;
    use crate::storage::NoteParser;
    use anyhow::{Context, Result, anyhow};
    use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, one_of, space0, space1},
        combinator::{all_consuming, map, map_opt, map_res, opt, rest, value},
        error::VerboseError,
        sequence::{delimited, terminated, tuple},
    };
    use std::{fs, path::Path};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a calendar-note date string. Weeks beyond the year's last ISO week
    /// parse but have no bounds.
    pub fn parse_calendar_ref(s: &str) -> Result<CalendarRef, DomainError> {
        all_consuming(calendar_ref)(s.trim())
            .map(|(_, r)| r)
            .map_err(|_| DomainError::InvalidDateString(s.to_string()))
    }

    /// All schedule links in `content`, in order. A link must start the text or
    /// follow whitespace, and must not run on into letters, digits, `-` or `+`.
    /// A malformed date such as `>2023-02-30` is therefore no link at all, not a
    /// shorter month or year link.
    pub fn schedule_refs(content: &str) -> Vec<ScheduleRef> {
        let mut out = vec![];
        let mut prev_ws = true;
        for (idx, c) in content.char_indices() {
            if c == '>' && prev_ws {
                if let Ok((after, r)) = schedule_ref(&content[idx + 1..]) {
                    if !after.starts_with(|ch: char| ch.is_alphanumeric() || ch == '-' || ch == '+') {
                        out.push(r);
                    }
                }
            }
            prev_ws = c.is_whitespace();
        }
        out
    }

    pub fn is_scheduled(content: &str) -> bool {
        !schedule_refs(content).is_empty()
    }

    /// Classify one source line.
    pub fn parse_paragraph(line: &str, line_index: usize) -> Paragraph {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        let mut para = Paragraph {
            kind: ParagraphKind::Text,
            content: trimmed.trim_end().to_string(),
            raw: line.to_string(),
            line_index,
            indent,
            heading_level: 0,
        };

        if trimmed.trim().is_empty() {
            para.kind = ParagraphKind::Empty;
            para.content.clear();
        } else if is_separator(trimmed) {
            para.kind = ParagraphKind::Separator;
        } else if let Ok((_, (level, text))) = heading(trimmed) {
            para.kind = ParagraphKind::Title;
            para.heading_level = level;
            para.content = text.trim_end().to_string();
        } else if let Ok((_, (marker, checkbox, text))) = bullet(trimmed) {
            para.kind = bullet_kind(marker, checkbox);
            para.content = text.trim_end().to_string();
        } else if let Ok((_, text)) = quote(trimmed) {
            para.kind = ParagraphKind::Quote;
            para.content = text.trim_end().to_string();
        }
        para
    }

    /// Build a note from its text. Calendar notes take their date from the
    /// filename stem; their title is the date string.
    pub fn parse_note_from_str(filename: &str, kind: NoteKind, changed: NaiveDateTime, text: &str) -> Result<Note> {
        let mut note = Note::new(filename, kind, changed);
        note.paragraphs = text
            .lines()
            .enumerate()
            .map(|(i, line)| parse_paragraph(line, i))
            .collect();

        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        match kind {
            NoteKind::Calendar => {
                let r = parse_calendar_ref(stem)
                    .map_err(|e| anyhow!("calendar note {filename:?}: {e}"))?;
                note.calendar = Some(r);
                note.title = r.date_string();
            }
            NoteKind::Project => {
                note.title = note
                    .paragraphs
                    .iter()
                    .find(|p| p.kind == ParagraphKind::Title && p.heading_level == 1)
                    .or_else(|| note.paragraphs.iter().find(|p| p.has_content()))
                    .map(|p| p.content.clone())
                    .unwrap_or_else(|| stem.to_string());
            }
        }
        Ok(note)
    }

    /// Concrete parser implementing the `storage::NoteParser` trait.
    pub struct MarkdownNoteParser;

    impl NoteParser for MarkdownNoteParser {
        fn parse_file(&self, abs_path: &Path, rel_path: &str, kind: NoteKind) -> Result<Note> {
            let text = fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            let modified = fs::metadata(abs_path)
                .and_then(|m| m.modified())
                .with_context(|| format!("reading mtime of {:?}", abs_path))?;
            let changed = DateTime::<Local>::from(modified).naive_local();
            parse_note_from_str(rel_path, kind, changed, &text)
        }
    }

    /* --------------------------- Calendar refs --------------------------- */

    fn fixed_digits<'a>(n: usize) -> impl FnMut(&'a str) -> PResult<'a, u32> {
        map_res(take_while_m_n(n, n, |c: char| c.is_ascii_digit()), |s: &str| s.parse::<u32>())
    }

    fn iso_day(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((fixed_digits(4), char('-'), fixed_digits(2), char('-'), fixed_digits(2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y as i32, m, d),
        )(i)
    }

    fn compact_day(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((fixed_digits(4), fixed_digits(2), fixed_digits(2))),
            |(y, m, d)| NaiveDate::from_ymd_opt(y as i32, m, d),
        )(i)
    }

    fn week(i: &str) -> PResult<'_, CalendarRef> {
        map_opt(tuple((fixed_digits(4), tag("-W"), fixed_digits(2))), |(year, _, week)| {
            (1..=53)
                .contains(&week)
                .then_some(CalendarRef::Week { year: year as i32, week })
        })(i)
    }

    fn quarter(i: &str) -> PResult<'_, CalendarRef> {
        map(
            tuple((fixed_digits(4), tag("-Q"), one_of("1234"))),
            |(year, _, q)| CalendarRef::Quarter {
                year: year as i32,
                quarter: q.to_digit(10).unwrap_or(1),
            },
        )(i)
    }

    fn month(i: &str) -> PResult<'_, CalendarRef> {
        map_opt(tuple((fixed_digits(4), char('-'), fixed_digits(2))), |(year, _, month)| {
            (1..=12)
                .contains(&month)
                .then_some(CalendarRef::Month { year: year as i32, month })
        })(i)
    }

    fn year(i: &str) -> PResult<'_, CalendarRef> {
        map(fixed_digits(4), |y| CalendarRef::Year(y as i32))(i)
    }

    fn calendar_ref(i: &str) -> PResult<'_, CalendarRef> {
        alt((
            map(iso_day, CalendarRef::Day),
            map(compact_day, CalendarRef::Day),
            week,
            quarter,
            month,
            year,
        ))(i)
    }

    fn schedule_ref(i: &str) -> PResult<'_, ScheduleRef> {
        alt((
            value(ScheduleRef::Today, tag("today")),
            map(terminated(iso_day, char('+')), ScheduleRef::DatePlus),
            map(iso_day, ScheduleRef::Date),
            map(alt((week, quarter, month, year)), ScheduleRef::Period),
        ))(i)
    }

    /* ------------------------------ Lines ------------------------------ */

    fn is_separator(s: &str) -> bool {
        let s = s.trim_end();
        s.len() >= 3 && (s.chars().all(|c| c == '-') || s.chars().all(|c| c == '*'))
    }

    fn heading(i: &str) -> PResult<'_, (u8, &str)> {
        map(
            tuple((take_while_m_n(1, 6, |c: char| c == '#'), space1, rest)),
            |(hashes, _, text): (&str, &str, &str)| (hashes.len() as u8, text),
        )(i)
    }

    fn checkbox(i: &str) -> PResult<'_, char> {
        terminated(delimited(char('['), one_of(" xX->"), char(']')), space0)(i)
    }

    fn bullet(i: &str) -> PResult<'_, (char, Option<char>, &str)> {
        map(
            tuple((one_of("*-+"), space1, opt(checkbox), rest)),
            |(marker, _, boxed, text)| (marker, boxed, text),
        )(i)
    }

    fn quote(i: &str) -> PResult<'_, &str> {
        map(tuple((char('>'), space1, rest)), |(_, _, text)| text)(i)
    }

    fn bullet_kind(marker: char, checkbox: Option<char>) -> ParagraphKind {
        let checklist = marker == '+';
        match (checklist, checkbox) {
            (false, None) if marker == '-' => ParagraphKind::List,
            (false, None | Some(' ')) => ParagraphKind::Open,
            (false, Some('x' | 'X')) => ParagraphKind::Done,
            (false, Some('-')) => ParagraphKind::Cancelled,
            (false, Some(_)) => ParagraphKind::Scheduled,
            (true, None | Some(' ')) => ParagraphKind::ChecklistOpen,
            (true, Some('x' | 'X')) => ParagraphKind::ChecklistDone,
            (true, Some('-')) => ParagraphKind::ChecklistCancelled,
            (true, Some(_)) => ParagraphKind::ChecklistScheduled,
        }
    }

}

pub mod storage {
    //! Note sources. `NoteStore` is what the review logic reads; the filesystem
    //! repository scans a `Calendar/` + `Notes/` tree into an in-memory library.

    use crate::core::{CalendarRef, Note, NoteKind};
    use anyhow::{Context, Result};
    use std::{
        collections::{BTreeSet, HashSet},
        fs,
        path::{Path, PathBuf},
    };

    pub const CALENDAR_DIR: &str = "Calendar";
    pub const NOTES_DIR: &str = "Notes";

    /// Parsing is independent of scanning.
    pub trait NoteParser {
        fn parse_file(&self, abs_path: &Path, rel_path: &str, kind: NoteKind) -> Result<Note>;
    }

    /// Builds a note library from some backing location.
    pub trait NoteRepository {
        fn scan(&self, root: &Path) -> Result<NoteLibrary>;
    }

    /// Read access to the notes the review logic works over.
    pub trait NoteStore {
        fn calendar_notes(&self) -> &[Note];
        fn project_notes(&self) -> &[Note];

        /// Accepts any calendar-note date string form (`20230315` or `2023-03-15`).
        fn calendar_note_by_date_string(&self, date_string: &str) -> Option<&Note> {
            let wanted = crate::parser::parse_calendar_ref(date_string).ok()?;
            self.calendar_note_for(wanted)
        }

        fn calendar_note_for(&self, r: CalendarRef) -> Option<&Note> {
            self.calendar_notes().iter().find(|n| n.calendar == Some(r))
        }

        fn note_by_filename(&self, filename: &str) -> Option<&Note> {
            self.project_notes()
                .iter()
                .chain(self.calendar_notes())
                .find(|n| n.filename == filename)
        }

        /// Every project-note folder, parents included, sorted.
        fn folders(&self) -> Vec<String> {
            let mut out = BTreeSet::new();
            for note in self.project_notes() {
                let mut folder = note.folder();
                while let Some(f) = folder {
                    out.insert(f.to_string());
                    folder = f.rsplit_once('/').map(|(parent, _)| parent);
                }
            }
            out.into_iter().collect()
        }

        fn all_notes(&self) -> Vec<&Note> {
            self.calendar_notes()
                .iter()
                .chain(self.project_notes())
                .collect()
        }
    }

    /// Notes held in memory, split by kind.
    #[derive(Debug, Clone, Default)]
    pub struct NoteLibrary {
        calendar: Vec<Note>,
        projects: Vec<Note>,
    }

    impl NoteLibrary {
        pub fn from_notes(notes: impl IntoIterator<Item = Note>) -> Self {
            let mut lib = Self::default();
            for note in notes {
                lib.push(note);
            }
            lib
        }

        pub fn push(&mut self, note: Note) {
            match note.kind {
                NoteKind::Calendar => self.calendar.push(note),
                NoteKind::Project => self.projects.push(note),
            }
        }

        pub fn len(&self) -> usize {
            self.calendar.len() + self.projects.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl NoteStore for NoteLibrary {
        fn calendar_notes(&self) -> &[Note] {
            &self.calendar
        }

        fn project_notes(&self) -> &[Note] {
            &self.projects
        }
    }

    /// Drop notes under any of `folders`. With `exclude_special`, also drop
    /// notes under `@`-prefixed folders (`@Archive`, `@Trash`, ...).
    pub fn filter_notes_against_exclude_folders<'a, I>(notes: I, folders: &[String], exclude_special: bool) -> Vec<&'a Note>
    where
        I: IntoIterator<Item = &'a Note>,
    {
        notes
            .into_iter()
            .filter(|note| !is_excluded(note, folders, exclude_special))
            .collect()
    }

    fn is_excluded(note: &Note, folders: &[String], exclude_special: bool) -> bool {
        let Some(folder) = note.folder() else {
            return false;
        };
        if exclude_special && folder.starts_with('@') {
            return true;
        }
        folders.iter().any(|f| {
            let f = f.trim_matches('/');
            !f.is_empty() && (folder == f || folder.starts_with(&format!("{f}/")))
        })
    }

    /* ---------------------------- Filesystem ---------------------------- */

    /// Scans `<root>/Calendar` (flat) and `<root>/Notes` (recursive).
    pub struct FsNoteRepository<P: NoteParser> {
        parser: P,
        extensions: Vec<String>,
    }

    impl<P: NoteParser> FsNoteRepository<P> {
        pub fn new(parser: P) -> Self {
            Self {
                parser,
                extensions: vec!["md".into(), "txt".into()],
            }
        }

        /// Also scan files with `ext` (the editor's default file extension).
        /// A leading dot is ignored.
        pub fn with_extension(mut self, ext: &str) -> Self {
            let ext = ext.trim().trim_start_matches('.');
            if !ext.is_empty() && !self.extensions.iter().any(|x| x == ext) {
                self.extensions.push(ext.to_string());
            }
            self
        }

        fn has_note_extension(&self, path: &Path) -> bool {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| self.extensions.iter().any(|x| x == e))
                .unwrap_or(false)
        }

        fn load(&self, lib: &mut NoteLibrary, base: &Path, files: Vec<PathBuf>, kind: NoteKind) {
            for abs in files {
                let Ok(rel) = abs.strip_prefix(base) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                match self.parser.parse_file(&abs, &rel, kind) {
                    Ok(note) => lib.push(note),
                    Err(err) => tracing::warn!(path = %abs.display(), error = %err, "skipping note"),
                }
            }
        }
    }

    impl<P: NoteParser> NoteRepository for FsNoteRepository<P> {
        fn scan(&self, root: &Path) -> Result<NoteLibrary> {
            let root = fs::canonicalize(root).with_context(|| format!("resolving path {:?}", root))?;
            let mut lib = NoteLibrary::default();

            let calendar_dir = root.join(CALENDAR_DIR);
            if calendar_dir.is_dir() {
                let mut files = vec![];
                for entry in fs::read_dir(&calendar_dir).with_context(|| format!("reading {:?}", calendar_dir))? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() && self.has_note_extension(&entry.path()) {
                        files.push(entry.path());
                    }
                }
                files.sort();
                self.load(&mut lib, &calendar_dir, files, NoteKind::Calendar);
            }

            let notes_dir = root.join(NOTES_DIR);
            if notes_dir.is_dir() {
                let mut files = vec![];
                let mut visited = HashSet::new();
                self.visit_dir(&notes_dir, &mut files, &mut visited)?;
                files.sort();
                let notes_dir = fs::canonicalize(&notes_dir)?;
                self.load(&mut lib, &notes_dir, files, NoteKind::Project);
            }

            tracing::debug!(root = %root.display(), notes = lib.len(), "scanned note library");
            Ok(lib)
        }
    }

    impl<P: NoteParser> FsNoteRepository<P> {
        fn visit_dir(&self, path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
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
                    self.visit_dir(&entry.path(), out, visited)?;
                }
            } else if metadata.is_file() && self.has_note_extension(&canonical) {
                out.push(canonical);
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::MarkdownNoteParser;
        use chrono::NaiveDate;

        fn note(filename: &str, kind: NoteKind) -> Note {
            let changed = NaiveDate::from_ymd_opt(2023, 3, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            let mut n = Note::new(filename, kind, changed);
            if kind == NoteKind::Calendar {
                n.calendar = crate::parser::parse_calendar_ref(filename.trim_end_matches(".md")).ok();
            }
            n
        }

        #[test]
        fn exclude_folders_matches_whole_segments() {
            let notes = vec![
                note("Work/a.md", NoteKind::Project),
                note("Workshop/b.md", NoteKind::Project),
                note("Work/Old/c.md", NoteKind::Project),
                note("@Archive/d.md", NoteKind::Project),
                note("top.md", NoteKind::Project),
            ];
            let kept: Vec<&str> = filter_notes_against_exclude_folders(&notes, &["Work".into()], false)
                .iter()
                .map(|n| n.filename.as_str())
                .collect();
            assert_eq!(kept, vec!["Workshop/b.md", "@Archive/d.md", "top.md"]);

            let kept = filter_notes_against_exclude_folders(&notes, &[], true);
            assert_eq!(kept.len(), 4);
        }

        #[test]
        fn folders_include_parents() {
            let lib = NoteLibrary::from_notes(vec![
                note("Work/Old/c.md", NoteKind::Project),
                note("Home/x.md", NoteKind::Project),
                note("20230301.md", NoteKind::Calendar),
            ]);
            assert_eq!(lib.folders(), vec!["Home", "Work", "Work/Old"]);
            assert!(lib.calendar_note_by_date_string("2023-03-01").is_some());
            assert!(lib.calendar_note_by_date_string("20230301").is_some());
            assert!(lib.note_by_filename("Home/x.md").is_some());

            let week = crate::parser::parse_calendar_ref("2023-W09").expect("week ref");
            assert!(lib.calendar_note_for(week).is_none());
            let day = crate::parser::parse_calendar_ref("2023-03-01").expect("day ref");
            assert_eq!(lib.calendar_note_for(day).map(|n| n.filename.as_str()), Some("20230301.md"));
        }

        #[test]
        fn scans_calendar_and_notes_trees() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("Calendar")).expect("mkdir calendar");
            fs::create_dir_all(root.join("Notes/Work/Deep")).expect("mkdir notes");
            fs::write(root.join("Calendar/20230315.md"), "* overdue >2023-03-10\n").expect("write");
            fs::write(root.join("Calendar/2023-W11.md"), "* weekly\n").expect("write");
            fs::write(root.join("Calendar/not-a-date.md"), "* ignored\n").expect("write");
            fs::write(root.join("Notes/Work/Deep/plan.md"), "# Plan\n* step\n").expect("write");
            fs::write(root.join("Notes/readme.txt"), "hello\n").expect("write");
            fs::write(root.join("Notes/image.png"), "binary").expect("write");

            let lib = FsNoteRepository::new(MarkdownNoteParser).scan(root).expect("scan");
            assert_eq!(lib.calendar_notes().len(), 2);
            let names: Vec<&str> = lib.project_notes().iter().map(|n| n.filename.as_str()).collect();
            assert_eq!(names, vec!["Work/Deep/plan.md", "readme.txt"]);
            assert_eq!(lib.project_notes()[0].title, "Plan");
        }

        #[test]
        fn default_extension_widens_the_scan() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("Notes")).expect("mkdir notes");
            fs::write(root.join("Notes/a.md"), "* a\n").expect("write");
            fs::write(root.join("Notes/b.markdown"), "* b\n").expect("write");

            let lib = FsNoteRepository::new(MarkdownNoteParser).scan(root).expect("scan");
            assert_eq!(lib.project_notes().len(), 1);

            let lib = FsNoteRepository::new(MarkdownNoteParser)
                .with_extension(".markdown")
                .scan(root)
                .expect("scan");
            let names: Vec<&str> = lib.project_notes().iter().map(|n| n.filename.as_str()).collect();
            assert_eq!(names, vec!["a.md", "b.markdown"]);

            let repo = FsNoteRepository::new(MarkdownNoteParser).with_extension("md").with_extension("");
            assert_eq!(repo.extensions, vec!["md", "txt"]);
        }

        #[test]
        fn missing_subdirectories_scan_empty() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let lib = FsNoteRepository::new(MarkdownNoteParser).scan(tmp.path()).expect("scan");
            assert!(lib.is_empty());
        }
    }
}

pub mod review {
    //! Task review orchestration: pick the notes and tasks that need attention,
    //! optionally ask the user, and hand the result to a `TaskReviewer`.

    use crate::calendar::{self, OffsetUnit};
    use crate::core::*;
    use crate::locale::{self, Locale};
    use crate::parser::{is_scheduled, schedule_refs};
    use crate::prompt::Prompter;
    use crate::settings::{ReviewSettings, Settings};
    use crate::storage::{NoteStore, filter_notes_against_exclude_folders};
    use anyhow::Result;
    use chrono::NaiveDate;
    use serde::Serialize;
    use std::{cmp::Ordering, io::Write};

    /* ------------------------------ Options ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum Grouping {
        /// Show each note's tasks together.
        ByNote,
        /// Walk tasks one at a time.
        ByTask,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ReviewOptions {
        /// Open tasks only (no checklist items).
        pub open_only: bool,
        pub folders_to_ignore: Vec<String>,
        /// Only `>date+` tasks.
        pub date_plus_only: bool,
        /// Ask before applying changes.
        pub confirm: bool,
        pub show_updated_task: bool,
        pub grouping: Grouping,
        /// Restrict to this folder (and its subfolders).
        pub note_folder: Option<String>,
        pub replace_date: bool,
        /// Only tasks whose schedule link lies before today.
        pub overdue_only: bool,
    }

    impl ReviewOptions {
        pub fn overdue(settings: &ReviewSettings, silent: bool, grouping: Grouping) -> Self {
            Self {
                open_only: settings.overdue_open_only,
                folders_to_ignore: settings.overdue_folders_to_ignore.clone(),
                date_plus_only: false,
                confirm: !silent,
                show_updated_task: settings.show_updated_task,
                grouping,
                note_folder: None,
                replace_date: settings.replace_date,
                overdue_only: true,
            }
        }

        pub fn date_plus(settings: &ReviewSettings, silent: bool) -> Self {
            Self {
                open_only: settings.date_plus_open_only,
                folders_to_ignore: settings.date_plus_folders_to_ignore.clone(),
                date_plus_only: true,
                confirm: !silent,
                grouping: Grouping::ByTask,
                ..Self::overdue(settings, silent, Grouping::ByTask)
            }
        }
    }

    /// Tasks from one note, in note order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NoteTasks<'a> {
        pub note: &'a Note,
        pub tasks: Vec<&'a Paragraph>,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct ReviewSummary {
        pub notes: usize,
        pub tasks: usize,
        pub updated: usize,
    }

    impl std::ops::AddAssign for ReviewSummary {
        fn add_assign(&mut self, rhs: Self) {
            self.notes += rhs.notes;
            self.tasks += rhs.tasks;
            self.updated += rhs.updated;
        }
    }

    /// The interactive routine that walks the user through the selected tasks.
    pub trait TaskReviewer {
        fn review(&mut self, groups: &[NoteTasks<'_>], options: &ReviewOptions) -> Result<ReviewSummary>;
    }

    /* ------------------------------ Sorting ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SortField {
        Filename,
        ChangedDate,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SortKey {
        pub field: SortField,
        pub descending: bool,
    }

    impl std::str::FromStr for SortKey {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            let (descending, name) = match s.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, s),
            };
            let field = match name.to_ascii_lowercase().as_str() {
                "filename" => SortField::Filename,
                "changeddate" | "changed_date" | "changed" => SortField::ChangedDate,
                _ => return Err(DomainError::UnknownSortKey(s.to_string())),
            };
            Ok(SortKey { field, descending })
        }
    }

    /// `"filename"`, `"-changedDate,filename"`, ...
    pub fn parse_sort_order(order: &str) -> Result<Vec<SortKey>, DomainError> {
        order
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect()
    }

    fn compare(a: &Note, b: &Note, keys: &[SortKey]) -> Ordering {
        for key in keys {
            let ord = match key.field {
                SortField::Filename => a.filename.cmp(&b.filename),
                SortField::ChangedDate => a.changed.cmp(&b.changed),
            };
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Stable multi-key sort of note groups.
    pub fn sort_note_tasks(groups: &mut [NoteTasks<'_>], keys: &[SortKey]) {
        if !keys.is_empty() {
            groups.sort_by(|a, b| compare(a.note, b.note, keys));
        }
    }

    /* ----------------------------- Selection ----------------------------- */

    /// Open, non-blank tasks grouped by note, dropping notes without any.
    /// With `ignore_scheduled`, tasks carrying a schedule link are skipped.
    pub fn open_tasks_by_note<'a, I>(notes: I, sort: &[SortKey], ignore_scheduled: bool) -> Vec<NoteTasks<'a>>
    where
        I: IntoIterator<Item = &'a Note>,
    {
        let mut groups: Vec<NoteTasks<'a>> = notes
            .into_iter()
            .filter_map(|note| {
                let tasks: Vec<&Paragraph> = note
                    .open_tasks()
                    .filter(|p| !ignore_scheduled || !is_scheduled(&p.content))
                    .collect();
                (!tasks.is_empty()).then_some(NoteTasks { note, tasks })
            })
            .collect();
        sort_note_tasks(&mut groups, sort);
        groups
    }

    fn wants_task(p: &Paragraph, options: &ReviewOptions, today: NaiveDate) -> bool {
        let kind_ok = if options.open_only { p.is_open_task() } else { p.is_open() };
        if !kind_ok || !p.has_content() {
            return false;
        }
        let refs = schedule_refs(&p.content);
        if options.date_plus_only {
            refs.iter().any(|r| r.is_date_plus() && r.is_overdue(today))
        } else if options.overdue_only {
            refs.iter().any(|r| r.is_overdue(today))
        } else {
            !refs.is_empty()
        }
    }

    fn in_folder(note: &Note, folder: &str) -> bool {
        let folder = folder.trim_matches('/');
        match note.folder() {
            Some(f) => f == folder || f.starts_with(&format!("{folder}/")),
            None => folder.is_empty(),
        }
    }

    /// Tasks in one note matching `options`, if any.
    pub fn tasks_in_note<'a>(note: &'a Note, options: &ReviewOptions, today: NaiveDate) -> Option<NoteTasks<'a>> {
        let tasks: Vec<&Paragraph> = note
            .paragraphs
            .iter()
            .filter(|p| wants_task(p, options, today))
            .collect();
        (!tasks.is_empty()).then_some(NoteTasks { note, tasks })
    }

    /// Overdue (or overdue `>date+`) tasks across the store, honoring the
    /// folder options. Calendar notes come first, each kind in store order.
    pub fn notes_and_tasks_to_review<'a>(
        store: &'a dyn NoteStore,
        options: &ReviewOptions,
        today: NaiveDate,
    ) -> Vec<NoteTasks<'a>> {
        let notes = filter_notes_against_exclude_folders(store.all_notes(), &options.folders_to_ignore, false);
        let groups: Vec<NoteTasks<'a>> = notes
            .into_iter()
            .filter(|n| options.note_folder.as_deref().is_none_or(|f| in_folder(n, f)))
            .filter_map(|n| tasks_in_note(n, options, today))
            .collect();
        tracing::debug!(
            notes = groups.len(),
            tasks = groups.iter().map(|g| g.tasks.len()).sum::<usize>(),
            date_plus_only = options.date_plus_only,
            "selected tasks to review"
        );
        groups
    }

    /// Open tasks anywhere that point at today (`>today`, today's date, or a
    /// `>date+` that has come due).
    pub fn todays_references<'a>(store: &'a dyn NoteStore, today: NaiveDate) -> Vec<NoteTasks<'a>> {
        store
            .all_notes()
            .into_iter()
            .filter_map(|note| {
                let tasks: Vec<&Paragraph> = note
                    .open_tasks()
                    .filter(|p| schedule_refs(&p.content).iter().any(|r| r.refers_to(today)))
                    .collect();
                (!tasks.is_empty()).then_some(NoteTasks { note, tasks })
            })
            .collect()
    }

    /// Look-back windows offered when searching for forgotten tasks.
    pub const HISTORY_WINDOWS: [(&str, i32, OffsetUnit); 8] = [
        ("1 day", 1, OffsetUnit::Day),
        ("7 days", 7, OffsetUnit::Day),
        ("14 days", 14, OffsetUnit::Day),
        ("1 month", 1, OffsetUnit::Month),
        ("3 months", 3, OffsetUnit::Month),
        ("6 months", 6, OffsetUnit::Month),
        ("1 year", 1, OffsetUnit::Year),
        ("All Time", 99, OffsetUnit::Year),
    ];

    const HISTORY_HINT: &str = "(choose with modifier to include Project Notes for period)";

    /* ------------------------------ Session ------------------------------ */

    /// Everything an entry point needs. `today` is fixed for the session.
    pub struct Session<'a> {
        pub store: &'a dyn NoteStore,
        pub prompter: &'a mut dyn Prompter,
        pub reviewer: &'a mut dyn TaskReviewer,
        pub settings: &'a Settings,
        pub today: NaiveDate,
    }

    impl<'a> Session<'a> {
        fn run(&mut self, groups: &[NoteTasks<'_>], options: &ReviewOptions) -> Result<Outcome<ReviewSummary>> {
            if groups.is_empty() {
                tracing::info!("nothing to review");
                return Ok(Outcome::NotFound);
            }
            let summary = self.reviewer.review(groups, options)?;
            tracing::info!(notes = summary.notes, tasks = summary.tasks, updated = summary.updated, "review finished");
            Ok(Outcome::Done(summary))
        }

        /// Review overdue `>date+` tasks. `silent` skips confirmations.
        pub fn update_date_plus_tags(&mut self, silent: bool) -> Result<Outcome<ReviewSummary>> {
            let store: &'a dyn NoteStore = self.store;
            let options = ReviewOptions::date_plus(&self.settings.review, silent);
            let groups = notes_and_tasks_to_review(store, &options, self.today);
            self.run(&groups, &options)
        }

        /// Review all overdue tasks, then offer today's and forgotten tasks.
        pub fn review_overdue_tasks(&mut self, silent: bool, grouping: Grouping) -> Result<Outcome<ReviewSummary>> {
            let store: &'a dyn NoteStore = self.store;
            let options = ReviewOptions::overdue(&self.settings.review, silent, grouping);
            let groups = notes_and_tasks_to_review(store, &options, self.today);

            let mut total = ReviewSummary::default();
            let mut any = false;
            let steps = [
                self.run(&groups, &options)?,
                self.ask_to_review_todays_tasks(grouping)?,
                self.ask_to_review_forgotten_tasks(grouping)?,
            ];
            for step in steps {
                if let Outcome::Done(summary) = step {
                    total += summary;
                    any = true;
                }
            }
            self.prompter.message("Task Review", "Review Complete!");
            Ok(if any { Outcome::Done(total) } else { Outcome::NotFound })
        }

        pub fn review_overdue_tasks_by_note(&mut self, silent: bool) -> Result<Outcome<ReviewSummary>> {
            self.review_overdue_tasks(silent, Grouping::ByNote)
        }

        pub fn review_overdue_tasks_by_task(&mut self, silent: bool) -> Result<Outcome<ReviewSummary>> {
            self.review_overdue_tasks(silent, Grouping::ByTask)
        }

        /// Overdue tasks inside a single note.
        pub fn review_overdue_tasks_in_note(&mut self, filename: &str, silent: bool) -> Result<Outcome<ReviewSummary>> {
            let store: &'a dyn NoteStore = self.store;
            let Some(note) = store.note_by_filename(filename) else {
                tracing::warn!(filename, "note not found");
                return Ok(Outcome::NotFound);
            };
            let options = ReviewOptions::overdue(&self.settings.review, silent, Grouping::ByNote);
            let groups: Vec<NoteTasks<'a>> = tasks_in_note(note, &options, self.today).into_iter().collect();
            self.run(&groups, &options)
        }

        /// Open tasks elsewhere that reference today.
        pub fn review_referenced_tasks(&mut self, silent: bool, grouping: Grouping) -> Result<Outcome<ReviewSummary>> {
            let store: &'a dyn NoteStore = self.store;
            let options = ReviewOptions {
                overdue_only: false,
                ..ReviewOptions::overdue(&self.settings.review, silent, grouping)
            };
            let groups = todays_references(store, self.today);
            self.run(&groups, &options)
        }

        /// Overdue tasks within a folder; asks for the folder when not given.
        pub fn review_overdue_tasks_in_folder(
            &mut self,
            folder: Option<&str>,
            silent: bool,
        ) -> Result<Outcome<ReviewSummary>> {
            let store: &'a dyn NoteStore = self.store;
            let folder = match folder {
                Some(f) => f.to_string(),
                None => {
                    let folders = store.folders();
                    let picked = self
                        .prompter
                        .choose("Choose Folder to Search for Overdue Tasks", &folders)
                        .and_then(|choice| folders.get(choice.index));
                    match picked {
                        Some(f) => f.clone(),
                        None => return Ok(Outcome::Canceled),
                    }
                }
            };
            let options = ReviewOptions {
                note_folder: Some(folder),
                ..ReviewOptions::overdue(&self.settings.review, silent, Grouping::ByNote)
            };
            let groups = notes_and_tasks_to_review(store, &options, self.today);
            self.run(&groups, &options)
        }

        /// Ask for a look-back window and collect open tasks from calendar notes
        /// in it (and project notes changed in it, when chosen with the modifier).
        pub fn notes_to_review_for_open_tasks(&mut self, ignore_scheduled: bool) -> Outcome<Vec<NoteTasks<'a>>> {
            let store: &'a dyn NoteStore = self.store;
            let settings: &'a Settings = self.settings;
            let review = &settings.review;
            let mut labels: Vec<String> = HISTORY_WINDOWS.iter().map(|(l, _, _)| l.to_string()).collect();
            labels.push(HISTORY_HINT.to_string());

            let Some(choice) = self.prompter.choose("Review Calendar Note Tasks From the Last...", &labels) else {
                return Outcome::Canceled;
            };
            let Some(&(label, n, unit)) = HISTORY_WINDOWS.get(choice.index) else {
                return Outcome::Canceled;
            };
            let Some(after) = calendar::add_offset(self.today, -n, unit) else {
                return Outcome::Invalid(format!("window '{label}' is out of range"));
            };
            tracing::debug!(window = label, %after, include_projects = choice.modified, "searching for open tasks");

            let recent_calendar = store.calendar_notes().iter().filter(|n| {
                n.calendar
                    .and_then(|c| c.first_day())
                    .is_some_and(|d| after <= d && d < self.today)
            });
            let recent_calendar = filter_notes_against_exclude_folders(recent_calendar, &review.overdue_folders_to_ignore, true);

            let recent_projects = if choice.modified {
                let changed = store.project_notes().iter().filter(|n| n.changed.date() >= after);
                filter_notes_against_exclude_folders(changed, &review.overdue_folders_to_ignore, true)
            } else {
                vec![]
            };

            let (cal_key, proj_key) = if review.search_forgotten_tasks_oldest_to_newest {
                ("filename", "changedDate")
            } else {
                ("-filename", "-changedDate")
            };
            let cal_sort = parse_sort_order(cal_key).unwrap_or_default();
            let proj_sort = parse_sort_order(proj_key).unwrap_or_default();

            let mut groups = open_tasks_by_note(recent_calendar, &cal_sort, ignore_scheduled);
            groups.extend(open_tasks_by_note(recent_projects, &proj_sort, ignore_scheduled));
            Outcome::Done(groups)
        }

        /// Forgotten open tasks from recent notes.
        pub fn search_for_open_tasks(&mut self, grouping: Grouping, ignore_scheduled: bool) -> Result<Outcome<ReviewSummary>> {
            let groups = match self.notes_to_review_for_open_tasks(ignore_scheduled) {
                Outcome::Done(groups) => groups,
                Outcome::Canceled => return Ok(Outcome::Canceled),
                Outcome::NotFound => return Ok(Outcome::NotFound),
                Outcome::Invalid(msg) => return Ok(Outcome::Invalid(msg)),
            };
            if groups.is_empty() {
                self.prompter.message("Open Tasks", "No open tasks in that timeframe!");
                return Ok(Outcome::NotFound);
            }
            let options = ReviewOptions {
                confirm: true,
                ..ReviewOptions::overdue(&self.settings.review, false, grouping)
            };
            self.run(&groups, &options)
        }

        pub fn ask_to_review_todays_tasks(&mut self, grouping: Grouping) -> Result<Outcome<ReviewSummary>> {
            if !self.settings.review.ask_to_review_todays_tasks {
                return Ok(Outcome::Canceled);
            }
            match self.prompter.confirm("Review Today's Tasks", "Do you want to review today's tasks?") {
                Some(true) => self.review_referenced_tasks(false, grouping),
                _ => Ok(Outcome::Canceled),
            }
        }

        pub fn ask_to_review_forgotten_tasks(&mut self, grouping: Grouping) -> Result<Outcome<ReviewSummary>> {
            if !self.settings.review.ask_to_review_forgotten_tasks {
                return Ok(Outcome::Canceled);
            }
            let title = "Review Forgotten Tasks";
            let question = "Do you want to review (potentially forgotten) tasks from previous Calendar days?";
            if self.prompter.confirm(title, question) != Some(true) {
                return Ok(Outcome::Canceled);
            }
            // Anything but a yes keeps scheduled items in the review.
            let ignore_scheduled = self.prompter.confirm(title, "Ignore items which have dates/are scheduled?") == Some(true);
            self.search_for_open_tasks(grouping, ignore_scheduled)
        }
    }

    /* ------------------------------ Listing ------------------------------ */

    /// Prints the selected tasks with a relative label for their first link.
    /// Changes nothing, so `updated` is always zero.
    pub struct ListingReviewer<W: Write> {
        out: W,
        today: NaiveDate,
        locale: Locale,
    }

    impl<W: Write> ListingReviewer<W> {
        pub fn new(out: W, today: NaiveDate, locale: Locale) -> Self {
            Self { out, today, locale }
        }

        pub fn into_inner(self) -> W {
            self.out
        }

        fn when(&self, p: &Paragraph) -> Option<String> {
            let first = schedule_refs(&p.content).into_iter().next()?;
            let day = first.first_day(self.today)?;
            Some(locale::relative_date(day, self.today, true, &self.locale))
        }
    }

    impl<W: Write> TaskReviewer for ListingReviewer<W> {
        fn review(&mut self, groups: &[NoteTasks<'_>], options: &ReviewOptions) -> Result<ReviewSummary> {
            let mut summary = ReviewSummary::default();
            for group in groups {
                summary.notes += 1;
                if options.grouping == Grouping::ByNote {
                    writeln!(self.out, "{} ({})", group.note.title, group.note.filename)?;
                }
                for task in &group.tasks {
                    summary.tasks += 1;
                    let when = self.when(task).map(|w| format!(" [{w}]")).unwrap_or_default();
                    match options.grouping {
                        Grouping::ByNote => writeln!(self.out, "  * {}{when}", task.content)?,
                        Grouping::ByTask => writeln!(self.out, "* {}{when} ({})", task.content, group.note.title)?,
                    }
                }
            }
            Ok(summary)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_note_from_str;
        use crate::prompt::ScriptedPrompter;
        use crate::storage::NoteLibrary;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn today() -> NaiveDate {
            ymd(2023, 3, 15)
        }

        fn note(filename: &str, kind: NoteKind, changed: NaiveDate, text: &str) -> Note {
            parse_note_from_str(filename, kind, changed.and_hms_opt(8, 0, 0).unwrap(), text).expect("parse note")
        }

        fn library() -> NoteLibrary {
            NoteLibrary::from_notes(vec![
                note(
                    "20230310.md",
                    NoteKind::Calendar,
                    ymd(2023, 3, 10),
                    "* forgotten\n* [x] done\n* scheduled elsewhere >2023-04-01\n",
                ),
                note("20230301.md", NoteKind::Calendar, ymd(2023, 3, 1), "* old one\n"),
                note("20230315.md", NoteKind::Calendar, ymd(2023, 3, 15), "* todays own\n"),
                note(
                    "Work/plan.md",
                    NoteKind::Project,
                    ymd(2023, 3, 14),
                    "# Plan\n* late >2023-03-01\n* rolling >2023-03-10+\n* future >2023-04-01\n+ check >2023-03-02\n* now >today\n",
                ),
                note("@Archive/old.md", NoteKind::Project, ymd(2022, 1, 1), "# Old\n* ancient >2022-01-01\n"),
                note("Home/list.md", NoteKind::Project, ymd(2023, 1, 1), "# Home\n* fix door >2023-W09\n"),
            ])
        }

        /// Records what it was asked to review.
        #[derive(Default)]
        struct Recorder {
            calls: Vec<(Vec<String>, ReviewOptions)>,
        }

        impl TaskReviewer for Recorder {
            fn review(&mut self, groups: &[NoteTasks<'_>], options: &ReviewOptions) -> Result<ReviewSummary> {
                let tasks: Vec<String> = groups
                    .iter()
                    .flat_map(|g| g.tasks.iter().map(move |t| format!("{}: {}", g.note.filename, t.content)))
                    .collect();
                let summary = ReviewSummary {
                    notes: groups.len(),
                    tasks: tasks.len(),
                    updated: 0,
                };
                self.calls.push((tasks, options.clone()));
                Ok(summary)
            }
        }

        fn settings() -> Settings {
            let mut s = Settings::default();
            s.review.ask_to_review_todays_tasks = false;
            s
        }

        #[test]
        fn open_tasks_by_note_skips_empty_and_scheduled() {
            let lib = library();
            let groups = open_tasks_by_note(lib.calendar_notes(), &[], true);
            let counts: Vec<(&str, usize)> = groups.iter().map(|g| (g.note.filename.as_str(), g.tasks.len())).collect();
            assert_eq!(counts, vec![("20230310.md", 1), ("20230301.md", 1), ("20230315.md", 1)]);

            let with_scheduled = open_tasks_by_note(lib.calendar_notes(), &[], false);
            assert_eq!(with_scheduled[0].tasks.len(), 2);
        }

        #[test]
        fn sort_keys_are_stable_and_reversible() {
            let lib = library();
            let keys = parse_sort_order("-filename").expect("sort");
            let groups = open_tasks_by_note(lib.calendar_notes(), &keys, true);
            let names: Vec<&str> = groups.iter().map(|g| g.note.filename.as_str()).collect();
            assert_eq!(names, vec!["20230315.md", "20230310.md", "20230301.md"]);

            let keys = parse_sort_order("changedDate, filename").expect("sort");
            assert_eq!(keys.len(), 2);
            assert!(parse_sort_order("size").is_err());
        }

        #[test]
        fn overdue_selection_respects_folders_and_kinds() {
            let lib = library();
            let options = ReviewOptions::overdue(&settings().review, false, Grouping::ByNote);
            let groups = notes_and_tasks_to_review(&lib, &options, today());
            let found: Vec<String> = groups
                .iter()
                .flat_map(|g| g.tasks.iter().map(|t| t.content.clone()))
                .collect();
            assert_eq!(found, vec!["late >2023-03-01", "rolling >2023-03-10+", "fix door >2023-W09"]);

            let wider = ReviewOptions {
                open_only: false,
                folders_to_ignore: vec![],
                ..options
            };
            let groups = notes_and_tasks_to_review(&lib, &wider, today());
            let total: usize = groups.iter().map(|g| g.tasks.len()).sum();
            assert_eq!(total, 5);
        }

        #[test]
        fn malformed_date_links_are_not_overdue() {
            let lib = NoteLibrary::from_notes(vec![note(
                "Inbox.md",
                NoteKind::Project,
                ymd(2023, 3, 1),
                "* typo >2023-02-30\n* bad month >2023-13-01\n* real >2023-02-28\n",
            )]);
            let options = ReviewOptions::overdue(&settings().review, false, Grouping::ByNote);
            let groups = notes_and_tasks_to_review(&lib, &options, today());
            let found: Vec<&str> = groups
                .iter()
                .flat_map(|g| g.tasks.iter().map(|t| t.content.as_str()))
                .collect();
            assert_eq!(found, vec!["real >2023-02-28"]);
        }

        #[test]
        fn date_plus_only_picks_rolling_tasks() {
            let lib = library();
            let options = ReviewOptions::date_plus(&settings().review, true);
            assert!(!options.confirm);
            let groups = notes_and_tasks_to_review(&lib, &options, today());
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].tasks[0].content, "rolling >2023-03-10+");
        }

        #[test]
        fn todays_references_include_due_date_plus() {
            let lib = library();
            let refs = todays_references(&lib, today());
            let found: Vec<&str> = refs
                .iter()
                .flat_map(|g| g.tasks.iter().map(|t| t.content.as_str()))
                .collect();
            assert_eq!(found, vec!["rolling >2023-03-10+", "now >today"]);
        }

        #[test]
        fn update_date_plus_tags_hands_options_to_reviewer() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::default();
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            let out = session.update_date_plus_tags(true).expect("review");
            assert_eq!(out, Outcome::Done(ReviewSummary { notes: 1, tasks: 1, updated: 0 }));
            let (_, options) = &reviewer.calls[0];
            assert!(options.date_plus_only && !options.confirm);
        }

        #[test]
        fn overdue_review_chains_into_todays_tasks() {
            let lib = library();
            let mut settings = settings();
            settings.review.ask_to_review_todays_tasks = true;
            let mut prompter = ScriptedPrompter::from_strs(&["yes"]);
            let mut reviewer = Recorder::default();
            let out = {
                let mut session = Session {
                    store: &lib,
                    prompter: &mut prompter,
                    reviewer: &mut reviewer,
                    settings: &settings,
                    today: today(),
                };
                session.review_overdue_tasks_by_task(false).expect("review")
            };
            assert_eq!(reviewer.calls.len(), 2);
            assert!(!reviewer.calls[1].1.overdue_only);
            assert_eq!(out, Outcome::Done(ReviewSummary { notes: 3, tasks: 5, updated: 0 }));
            assert_eq!(prompter.shown.last().map(String::as_str), Some("Task Review: Review Complete!"));
        }

        #[test]
        fn folder_review_asks_for_folder() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::from_strs(&["Home"]);
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            let out = session.review_overdue_tasks_in_folder(None, false).expect("review");
            assert!(out.is_done());
            assert_eq!(reviewer.calls[0].0, vec!["Home/list.md: fix door >2023-W09"]);
        }

        #[test]
        fn folder_review_cancel_is_not_an_error() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::default();
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            assert_eq!(session.review_overdue_tasks_in_folder(None, false).expect("review"), Outcome::Canceled);
        }

        #[test]
        fn note_review_reports_missing_note() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::default();
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            assert_eq!(session.review_overdue_tasks_in_note("nope.md", false).expect("review"), Outcome::NotFound);
            assert!(session.review_overdue_tasks_in_note("Work/plan.md", false).expect("review").is_done());
        }

        #[test]
        fn forgotten_task_search_uses_window() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::from_strs(&["7 days"]);
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            let out = session.search_for_open_tasks(Grouping::ByNote, true).expect("search");
            assert!(out.is_done());
            // Today's note is excluded; 1 March is outside the window.
            assert_eq!(reviewer.calls[0].0, vec!["20230310.md: forgotten"]);
        }

        #[test]
        fn modifier_adds_recent_project_notes() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::from_strs(&["alt:1 month"]);
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            let groups = session.notes_to_review_for_open_tasks(false).done().expect("groups");
            let names: Vec<&str> = groups.iter().map(|g| g.note.filename.as_str()).collect();
            assert_eq!(names, vec!["20230301.md", "20230310.md", "Work/plan.md"]);
        }

        #[test]
        fn empty_window_reports_nothing_found() {
            let lib = library();
            let settings = settings();
            let mut prompter = ScriptedPrompter::from_strs(&["1 day"]);
            let mut reviewer = Recorder::default();
            let out = {
                let mut session = Session {
                    store: &lib,
                    prompter: &mut prompter,
                    reviewer: &mut reviewer,
                    settings: &settings,
                    today: today(),
                };
                session.search_for_open_tasks(Grouping::ByTask, true).expect("search")
            };
            assert_eq!(out, Outcome::NotFound);
            assert!(prompter.shown.iter().any(|s| s.ends_with("No open tasks in that timeframe!")));
        }

        #[test]
        fn forgotten_prompt_disabled_or_declined_cancels() {
            let lib = library();
            let mut settings = settings();
            let mut prompter = ScriptedPrompter::from_strs(&["no"]);
            let mut reviewer = Recorder::default();
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            assert_eq!(session.ask_to_review_forgotten_tasks(Grouping::ByNote).expect("ask"), Outcome::Canceled);

            settings.review.ask_to_review_forgotten_tasks = true;
            let mut session = Session {
                store: &lib,
                prompter: &mut prompter,
                reviewer: &mut reviewer,
                settings: &settings,
                today: today(),
            };
            assert_eq!(session.ask_to_review_forgotten_tasks(Grouping::ByNote).expect("ask"), Outcome::Canceled);
        }

        #[test]
        fn forgotten_prompt_second_answer_only_picks_scheduled_handling() {
            let lib = library();
            let mut settings = settings();
            settings.review.ask_to_review_forgotten_tasks = true;
            let cases: [(&[&str], Vec<&str>); 3] = [
                (&["yes", "yes", "7 days"], vec!["20230310.md: forgotten"]),
                (
                    &["yes", "no", "7 days"],
                    vec!["20230310.md: forgotten", "20230310.md: scheduled elsewhere >2023-04-01"],
                ),
                (
                    &["yes", "cancel", "7 days"],
                    vec!["20230310.md: forgotten", "20230310.md: scheduled elsewhere >2023-04-01"],
                ),
            ];
            for (answers, expected) in cases {
                let mut prompter = ScriptedPrompter::from_strs(answers);
                let mut reviewer = Recorder::default();
                let out = {
                    let mut session = Session {
                        store: &lib,
                        prompter: &mut prompter,
                        reviewer: &mut reviewer,
                        settings: &settings,
                        today: today(),
                    };
                    session.ask_to_review_forgotten_tasks(Grouping::ByNote).expect("ask")
                };
                assert!(out.is_done(), "{answers:?}");
                assert_eq!(reviewer.calls[0].0, expected, "{answers:?}");
                assert_eq!(prompter.remaining(), 0);
            }
        }

        #[test]
        fn listing_reviewer_prints_relative_labels() {
            let lib = library();
            let options = ReviewOptions::overdue(&settings().review, false, Grouping::ByNote);
            let groups = notes_and_tasks_to_review(&lib, &options, today());
            let mut reviewer = ListingReviewer::new(Vec::new(), today(), Locale::default());
            let summary = reviewer.review(&groups, &options).expect("list");
            assert_eq!(summary.tasks, 3);
            let text = String::from_utf8(reviewer.into_inner()).expect("utf8");
            assert!(text.contains("Plan (Work/plan.md)"));
            assert!(text.contains("  * late >2023-03-01 [2w ago]"));
            assert!(text.contains("  * rolling >2023-03-10+ [5d ago]"));
        }
    }
}

pub mod theme {
    //! Editor theme JSON and its translation to CSS for HTML views.

    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, PickFirst, serde_as};
    use std::fmt::Write;

    #[derive(Debug, thiserror::Error)]
    pub enum ThemeError {
        #[error("theme '{0}' has no editor colours or styles")]
        Empty(String),
        #[error("invalid theme JSON: {0}")]
        Json(#[from] serde_json::Error),
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Theme {
        pub name: String,
        pub editor: EditorColors,
        /// Keyed by style name: `body`, `title1`.., `bold`, `checked-canceled`, ...
        pub styles: IndexMap<String, StyleBlock>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct EditorColors {
        pub background_color: Option<String>,
        pub text_color: Option<String>,
        pub alt_background_color: Option<String>,
        pub tint_color: Option<String>,
    }

    /// Numbers may be written as JSON numbers or strings.
    #[serde_as]
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StyleBlock {
        #[serde(default)]
        pub color: Option<String>,
        #[serde(default)]
        pub font: Option<String>,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub size: Option<f64>,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub paragraph_spacing_before: Option<f64>,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub paragraph_spacing: Option<f64>,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub strikethrough_style: Option<u32>,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub underline_style: Option<u32>,
    }

    impl Theme {
        pub fn from_json(text: &str) -> Result<Self, ThemeError> {
            Ok(serde_json::from_str(text)?)
        }

        pub fn is_empty(&self) -> bool {
            self.editor == EditorColors::default() && self.styles.is_empty()
        }

        pub fn style(&self, key: &str) -> Option<&StyleBlock> {
            self.styles.get(key)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CssOptions {
        /// px size that maps to 1rem.
        pub base_font_size: f64,
        /// Substituted for the generic "Sans" family.
        pub user_font_family: String,
    }

    impl Default for CssOptions {
        fn default() -> Self {
            Self {
                base_font_size: 14.0,
                user_font_family: String::new(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ThemeCss {
        pub css: String,
        /// `:root` custom properties, in emission order.
        pub variables: IndexMap<String, String>,
    }

    /* ----------------------------- Generation ----------------------------- */

    const DEFAULT_BACKGROUND: &str = "#1D1E1F";
    const DEFAULT_TEXT: &str = "#CC6666";
    const DEFAULT_ALT_BACKGROUND: &str = "#2E2F30";
    const DEFAULT_TINT: &str = "#E9C0A2";

    /// (style key, selector, default colour, root variable)
    const HEADINGS: [(&str, &str, &str, Option<&str>); 4] = [
        ("title1", "h1", "#CC6666", Some("--h1-color")),
        ("title2", "h2", "#E9C062", Some("--h2-color")),
        ("title3", "h3", "#E9C062", Some("--h3-color")),
        ("title4", "h4", "#E9C062", None),
    ];

    /// (style key, selector, default colour)
    const INLINE_STYLES: [(&str, &str, &str); 5] = [
        ("bold", "b", "#CC6666"),
        ("italic", "i", "#96CBFE"),
        ("checked", ".task-checked", "#9DC777"),
        ("checked-canceled", ".task-cancelled", "#9DC777"),
        ("checked-scheduled", ".task-scheduled", "#9DC777"),
    ];

    /// Translate `theme` to CSS. Style-derived selectors are only emitted for
    /// styles the theme defines.
    pub fn generate_css(theme: &Theme, opts: &CssOptions) -> Result<ThemeCss, ThemeError> {
        if theme.is_empty() {
            tracing::error!(theme = %theme.name, "theme is empty");
            return Err(ThemeError::Empty(theme.name.clone()));
        }
        let editor = &theme.editor;
        let colour = |c: &Option<String>, default: &str| c.as_deref().map(argb_to_rgba).unwrap_or_else(|| default.to_string());

        let mut rules = vec![];
        let mut vars = IndexMap::new();

        let background = colour(&editor.background_color, DEFAULT_BACKGROUND);
        rules.push(css_rule("html", &[format!("background: {background}")]));
        vars.insert("--bg-main-color".to_string(), background);

        if let Some(body) = theme.style("body") {
            let fg = colour(&editor.text_color, DEFAULT_TEXT);
            let mut decls = vec![format!("color: {fg}")];
            decls.extend(style_declarations(body, opts));
            rules.push(css_rule("body", &decls));
            vars.insert("--fg-main-color".to_string(), fg);
        }

        for (key, selector, default, var) in HEADINGS {
            if let Some(style) = theme.style(key) {
                let c = colour(&style.color, default);
                let mut decls = vec![format!("color: {c}")];
                decls.extend(style_declarations(style, opts));
                rules.push(css_rule(selector, &decls));
                if let Some(var) = var {
                    vars.insert(var.to_string(), c);
                }
            }
        }

        let alt = colour(&editor.alt_background_color, DEFAULT_ALT_BACKGROUND);
        rules.push(css_rule("tr:nth-child(even)", &[format!("background-color: {alt}")]));
        rules.push(css_rule("th", &[format!("background-color: {alt}")]));
        vars.insert("--bg-alt-color".to_string(), alt);

        let tint = colour(&editor.tint_color, DEFAULT_TINT);
        rules.push(css_rule("table tbody tr:first-child", &[format!("border-top: 1px solid {tint}")]));
        rules.push(css_rule("table tbody tr:last-child", &[format!("border-bottom: 1px solid {tint}")]));
        vars.insert("--tint-color".to_string(), tint);

        for (key, selector, default) in INLINE_STYLES {
            if let Some(style) = theme.style(key) {
                let mut decls = vec![format!("color: {}", colour(&style.color, default))];
                decls.extend(style_declarations(style, opts));
                rules.push(css_rule(selector, &decls));
            }
        }

        let root: Vec<String> = vars.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        let mut css = String::new();
        let _ = writeln!(css, "/* Generated from theme '{}' */", theme.name);
        css.push_str(&css_rule(":root", &root));
        for rule in rules {
            css.push('\n');
            css.push_str(&rule);
        }
        tracing::debug!(theme = %theme.name, variables = vars.len(), "generated theme CSS");
        Ok(ThemeCss { css, variables: vars })
    }

    /// One indented CSS rule.
    pub fn css_rule(selector: &str, declarations: &[String]) -> String {
        format!("\t{selector} {{\n\t\t{}\n\t}}", declarations.join(";\n\t\t"))
    }

    /// Size, spacing, font and decoration declarations for a style block.
    pub fn style_declarations(style: &StyleBlock, opts: &CssOptions) -> Vec<String> {
        let mut out = vec![];
        let base = opts.base_font_size;
        if let Some(size) = style.size.filter(|v| *v != 0.0) {
            out.push(format!("font-size: {}", px_to_rem(size, base)));
        }
        if let Some(before) = style.paragraph_spacing_before.filter(|v| *v != 0.0) {
            out.push(format!("line-height: {}", px_to_rem(before, base)));
        }
        if let Some(after) = style.paragraph_spacing.filter(|v| *v != 0.0) {
            out.push(format!("padding-bottom: {}", px_to_rem(after, base)));
        }
        if let Some(font) = &style.font {
            out.extend(font_properties(font, &opts.user_font_family));
        }
        if let Some(code) = style.strikethrough_style.filter(|c| *c != 0) {
            out.extend(text_decoration(Decoration::Strikethrough, code));
        }
        if let Some(code) = style.underline_style.filter(|c| *c != 0) {
            out.extend(text_decoration(Decoration::Underline, code));
        }
        out
    }

    /// `n` significant digits, the way `Number.toPrecision` prints them for
    /// ordinary magnitudes (`0.86`, `1.0`, `1.4`, `110`).
    pub fn to_precision(value: f64, digits: i32) -> String {
        if value == 0.0 || !value.is_finite() {
            return format!("{:.*}", (digits - 1).max(0) as usize, 0.0);
        }
        let round_at = |v: f64| {
            let magnitude = v.abs().log10().floor() as i32;
            let factor = 10f64.powi(digits - 1 - magnitude);
            (v * factor).round() / factor
        };
        let rounded = round_at(value);
        let magnitude = rounded.abs().log10().floor() as i32;
        let decimals = (digits - 1 - magnitude).max(0) as usize;
        format!("{rounded:.decimals$}")
    }

    pub fn px_to_rem(px: f64, base_font_size: f64) -> String {
        let base = if base_font_size > 0.0 { base_font_size } else { 14.0 };
        format!("{}rem", to_precision(px / base, 2))
    }

    /// Theme colours are `#AARRGGBB`; CSS wants `#RRGGBBAA`. Anything else
    /// passes through.
    pub fn argb_to_rgba(colour: &str) -> String {
        let hex = colour.strip_prefix('#').unwrap_or("");
        if hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            format!("#{}{}", &hex[2..8], &hex[0..2])
        } else {
            colour.to_string()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Decoration {
        Underline,
        Strikethrough,
    }

    /// Theme decoration codes: 1 plain, 9 double, 513 dashed.
    pub fn text_decoration(kind: Decoration, code: u32) -> Option<String> {
        let line = match kind {
            Decoration::Underline => "underline",
            Decoration::Strikethrough => "line-through",
        };
        let variant = match code {
            1 => "",
            9 => " double",
            513 => " dashed",
            _ => {
                tracing::warn!(?kind, code, "no CSS for text decoration code");
                return None;
            }
        };
        Some(format!("text-decoration: {line}{variant}"))
    }

    fn font_weight_and_style(modifier: &str) -> (&'static str, &'static str) {
        match modifier {
            "thin" => ("100", "normal"),
            "light" => ("300", "normal"),
            "book" => ("500", "normal"),
            "demi-bold" | "demibold" | "semi-bold" | "semibold" => ("600", "normal"),
            "bold" => ("700", "normal"),
            "heavy" | "black" => ("900", "normal"),
            "italic" | "slant" => ("400", "italic"),
            "bolditalic" => ("700", "italic"),
            _ => ("400", "normal"),
        }
    }

    /// CSS font declarations for a theme font name such as `HelveticaNeue-Bold`.
    pub fn font_properties(font_name: &str, user_font_family: &str) -> Vec<String> {
        let (family, weight, style) = match font_name {
            "" | "System" => ("sans".to_string(), "400", "normal"),
            "noteplanstate" => ("noteplanstate".to_string(), "400", "normal"),
            _ => {
                let (name, modifier) = font_name.split_once('-').unwrap_or((font_name, ""));
                let mut spaced = String::with_capacity(name.len() + 4);
                for c in name.chars() {
                    if c.is_ascii_uppercase() {
                        spaced.push(' ');
                    }
                    spaced.push(c);
                }
                let (weight, style) = font_weight_and_style(&modifier.to_lowercase());
                let mut family = spaced.trim().to_string();
                if family == "Sans" {
                    family = if user_font_family.is_empty() {
                        "sans".to_string()
                    } else {
                        user_font_family.to_string()
                    };
                }
                (family, weight, style)
            }
        };
        vec![
            format!("font-family: \"{family}\""),
            format!("font-weight: {weight}"),
            format!("font-style: {style}"),
        ]
    }

}

pub mod html {
    //! HTML page assembly and small SVG/colour helpers for generated views.

    use crate::theme::{self, CssOptions, Theme, ThemeError};
    use anyhow::{Context, Result};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct HtmlPage {
        pub title: String,
        pub header_tags: String,
        pub body: String,
        /// When `None` or blank, CSS is generated from the theme passed to `render`.
        pub general_css: Option<String>,
        pub specific_css: String,
        pub pre_body_script: String,
        pub post_body_script: String,
    }

    impl HtmlPage {
        pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                body: body.into(),
                ..Self::default()
            }
        }

        pub fn render(&self, theme: Option<(&Theme, &CssOptions)>) -> Result<String, ThemeError> {
            let general = match (self.general_css.as_deref().filter(|c| !c.trim().is_empty()), theme) {
                (Some(css), _) => css.to_string(),
                (None, Some((theme, opts))) => theme::generate_css(theme, opts)?.css,
                (None, None) => {
                    tracing::warn!(title = %self.title, "no CSS and no theme for page");
                    String::new()
                }
            };

            let mut parts: Vec<&str> = vec![
                "<!DOCTYPE html>",
                "<html>",
                "<head>",
            ];
            let title = format!("<title>{}</title>", self.title);
            parts.push(&title);
            parts.push("<meta charset=\"utf-8\">");
            parts.push(&self.header_tags);
            parts.push("<style type=\"text/css\">");
            parts.push(&general);
            parts.push(&self.specific_css);
            parts.push("</style>");
            if !self.pre_body_script.is_empty() {
                parts.extend(["\n", self.pre_body_script.as_str(), "\n"]);
            }
            parts.push("</head>");
            parts.push("\n<body>");
            parts.push(&self.body);
            parts.push("\n</body>");
            if !self.post_body_script.is_empty() {
                parts.extend(["\n", self.post_body_script.as_str(), "\n"]);
            }
            parts.push("</html>");
            Ok(parts.join("\n"))
        }
    }

    /// Write a copy of `html` to `dir/name` (spaces removed from the name).
    pub fn save_snapshot(dir: &Path, name: &str, html: &str) -> Result<PathBuf> {
        let file_name: String = name.chars().filter(|c| *c != ' ').collect();
        fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
        let path = dir.join(file_name);
        fs::write(&path, html).with_context(|| format!("writing {:?}", path))?;
        tracing::debug!(path = %path.display(), "saved HTML snapshot");
        Ok(path)
    }

    /// Ring drawn by `setPercentRing(percent, id)` on load.
    pub fn svg_percent_ring(percent: f64, color: &str, text: &str, id: &str) -> String {
        format!(
            r#"
  <svg id="pring{id}" class="percent-ring" height="200" width="200" viewBox="0 0 100 100" onload="setPercentRing({percent}, 'pring{id}');">
    <circle class="percent-ring-circle" stroke="{color}" stroke-width=12% fill="transparent" r=40% cx=50% cy=50% />
    <g class="circle-percent-text" color={color}>
    <text class="circle-percent-text" x=50% y=53% dominant-baseline="middle" text-anchor="middle" fill="currentcolor" stroke="currentcolor">{text}</text>
    </g>
  </svg>
"#
        )
    }

    /// Red at 0 through yellow to green at 100, softened at both ends.
    pub fn red_to_green_interpolation(percent: f64) -> String {
        let p = percent.clamp(0.0, 100.0);
        let red = if p > 60.0 { 1.0 - 2.0 * (p - 60.0) / 100.0 } else { 1.0 } * 223.0;
        let green = if p > 40.0 { 1.0 } else { 2.0 * p / 100.0 } * 223.0;
        let blue = (50.0 - p).abs();
        rgb_to_hex(red.round() as u8, green.round() as u8, blue.round() as u8)
    }

    pub fn rgb_to_hex(r: u8, g: u8, b: u8) -> String {
        format!("#{r:02x}{g:02x}{b:02x}")
    }

}
