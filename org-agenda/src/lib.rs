//! Org agenda library: an outline model with TODO states and timestamps, a resolver for
//! free-text date modifiers, and a predicate pipeline that narrows headings into agenda views.
//! The core stays pure; reading files and editing text live at the edges (`parser`, `format`).

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeSet, fmt, path::PathBuf};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeadingId(pub Uuid);

    impl HeadingId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for HeadingId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// A single `.org` document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OrgFile {
        /// Optional filesystem path if the file originates from disk.
        pub path: Option<PathBuf>,

        /// Title from `#+title:` (if present).
        pub title: Option<String>,

        /// Every TODO keyword the parser recognized in this file, built-in ones included.
        #[serde(default)]
        pub todo_keywords: BTreeSet<String>,

        /// Top-level headings.
        #[serde(default)]
        pub headings: Vec<Heading>,
    }

    impl OrgFile {
        pub fn new(path: Option<PathBuf>) -> Self {
            Self {
                path,
                title: None,
                todo_keywords: BTreeSet::new(),
                headings: vec![],
            }
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A heading node. Children are owned in document order; there is no link back to the
    /// parent or to siblings (see `tree::Node` for sibling navigation).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Heading {
        pub id: HeadingId,
        /// Number of leading stars.
        pub level: u8,
        pub title: String,
        pub todo: Option<TodoKeyword>,
        pub priority: Option<char>,
        #[serde(default)]
        pub tags: BTreeSet<String>,
        #[serde(default)]
        pub planning: Planning,
        /// Timestamps found in the headline and the section body.
        #[serde(default)]
        pub timestamps: Vec<Timestamp>,
        /// The live timestamp used by agenda filters. Derived by `refresh_active_date`.
        pub active_date: Option<DateOrDateTime>,
        #[serde(default)]
        pub children: Vec<Heading>,
        /// 0-based line of the headline in its source text.
        #[serde(default)]
        pub line: usize,
    }

    impl Heading {
        pub fn new(level: u8, title: impl Into<String>) -> Self {
            Self {
                id: HeadingId::new(),
                level,
                title: title.into(),
                todo: None,
                priority: None,
                tags: BTreeSet::new(),
                planning: Planning::default(),
                timestamps: vec![],
                active_date: None,
                children: vec![],
                line: 0,
            }
        }

        pub fn with_todo(mut self, todo: TodoKeyword) -> Self {
            self.todo = Some(todo);
            self
        }

        pub fn with_active_date(mut self, date: impl Into<DateOrDateTime>) -> Self {
            self.active_date = Some(date.into());
            self
        }

        pub fn with_children(mut self, children: Vec<Heading>) -> Self {
            self.children = children;
            self
        }

        /// Recompute `active_date`: SCHEDULED, then DEADLINE, then the first active headline or
        /// body timestamp. CLOSED and inactive stamps never count.
        pub fn refresh_active_date(&mut self) {
            self.active_date = self
                .planning
                .scheduled
                .iter()
                .chain(self.planning.deadline.iter())
                .chain(self.timestamps.iter())
                .find(|ts| ts.active)
                .map(Timestamp::value);
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// TODO state of a heading. Only `Todo` and `Next` count as active.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "String", into = "String")]
    pub enum TodoKeyword {
        Todo,
        Next,
        Done,
        Other(String),
    }

    impl TodoKeyword {
        pub fn from_word(word: &str) -> Self {
            match word {
                "TODO" => Self::Todo,
                "NEXT" => Self::Next,
                "DONE" => Self::Done,
                other => Self::Other(other.to_string()),
            }
        }

        pub fn as_str(&self) -> &str {
            match self {
                Self::Todo => "TODO",
                Self::Next => "NEXT",
                Self::Done => "DONE",
                Self::Other(word) => word,
            }
        }

        pub fn is_active(&self) -> bool {
            matches!(self, Self::Todo | Self::Next)
        }
    }

    impl From<String> for TodoKeyword {
        fn from(word: String) -> Self {
            Self::from_word(&word)
        }
    }

    impl From<TodoKeyword> for String {
        fn from(keyword: TodoKeyword) -> Self {
            keyword.as_str().to_string()
        }
    }

    impl fmt::Display for TodoKeyword {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Planning line(s): SCHEDULED, DEADLINE, CLOSED.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Planning {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<Timestamp>,
    }

    /// An Org timestamp, active `<...>` or inactive `[...]`. Repeaters and ranges are read
    /// past but not kept.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    impl Timestamp {
        pub fn value(&self) -> DateOrDateTime {
            match self.time {
                Some(time) => DateOrDateTime::DateTime(self.date.and_time(time)),
                None => DateOrDateTime::Date(self.date),
            }
        }
    }

    /// Either a calendar date or a date with a clock time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum DateOrDateTime {
        Date(NaiveDate),
        DateTime(NaiveDateTime),
    }

    impl DateOrDateTime {
        pub fn date(&self) -> NaiveDate {
            match self {
                Self::Date(date) => *date,
                Self::DateTime(dt) => dt.date(),
            }
        }

        pub fn time(&self) -> Option<NaiveTime> {
            match self {
                Self::Date(_) => None,
                Self::DateTime(dt) => Some(dt.time()),
            }
        }

        /// Dates compare as midnight.
        pub fn as_datetime(&self) -> NaiveDateTime {
            match self {
                Self::Date(date) => date.and_time(NaiveTime::MIN),
                Self::DateTime(dt) => *dt,
            }
        }
    }

    impl From<NaiveDate> for DateOrDateTime {
        fn from(date: NaiveDate) -> Self {
            Self::Date(date)
        }
    }

    impl From<NaiveDateTime> for DateOrDateTime {
        fn from(dt: NaiveDateTime) -> Self {
            Self::DateTime(dt)
        }
    }

    impl fmt::Display for DateOrDateTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M")),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum DomainError {
        #[error("line {line} is out of range (document has {lines} lines)")]
        LineOutOfRange { line: usize, lines: usize },
        #[error("unknown agenda filter {0:?}")]
        UnknownFilter(String),
    }
}

pub mod tree {
    //! Read-only navigation over a heading forest.
    //!
    //! A `Node` is a position inside a parent's `children` (or the file's top-level list), so
    //! the previous sibling is always the element right before it. Nothing here owns or
    //! mutates headings.

    use crate::core::{Heading, HeadingId};
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy)]
    pub struct Node<'a> {
        siblings: &'a [Heading],
        index: usize,
    }

    impl<'a> Node<'a> {
        pub fn new(siblings: &'a [Heading], index: usize) -> Option<Self> {
            (index < siblings.len()).then_some(Self { siblings, index })
        }

        /// Every heading of `list` as a node, in document order.
        pub fn all(list: &'a [Heading]) -> impl Iterator<Item = Node<'a>> + 'a {
            (0..list.len()).map(move |index| Node {
                siblings: list,
                index,
            })
        }

        pub fn heading(&self) -> &'a Heading {
            let siblings: &'a [Heading] = self.siblings;
            &siblings[self.index]
        }

        pub fn index(&self) -> usize {
            self.index
        }

        pub fn previous_sibling(&self) -> Option<Node<'a>> {
            let index = self.index.checked_sub(1)?;
            Some(Node {
                siblings: self.siblings,
                index,
            })
        }

        pub fn children(&self) -> impl Iterator<Item = Node<'a>> + 'a {
            Node::all(&self.heading().children)
        }
    }

    /// Lazy depth-first (document order) traversal of a forest.
    pub struct Walk<'a> {
        stack: Vec<Node<'a>>,
    }

    impl<'a> Iterator for Walk<'a> {
        type Item = Node<'a>;

        fn next(&mut self) -> Option<Node<'a>> {
            let node = self.stack.pop()?;
            let children: &'a [Heading] = &node.heading().children;
            self.stack
                .extend((0..children.len()).rev().map(|index| Node {
                    siblings: children,
                    index,
                }));
            Some(node)
        }
    }

    pub fn walk(roots: &[Heading]) -> Walk<'_> {
        Walk {
            stack: (0..roots.len())
                .rev()
                .map(|index| Node {
                    siblings: roots,
                    index,
                })
                .collect(),
        }
    }

    /// Parent of every heading in a forest, built in one pass.
    pub struct ParentIndex<'a> {
        parents: HashMap<HeadingId, &'a Heading>,
    }

    impl<'a> ParentIndex<'a> {
        pub fn new(roots: &'a [Heading]) -> Self {
            let mut parents = HashMap::new();
            for node in walk(roots) {
                let h = node.heading();
                parents.extend(h.children.iter().map(|child| (child.id, h)));
            }
            Self { parents }
        }

        pub fn parent(&self, id: HeadingId) -> Option<&'a Heading> {
            self.parents.get(&id).copied()
        }

        /// Headings enclosing `id`, outermost first. Empty for roots and unknown ids.
        pub fn ancestors(&self, id: HeadingId) -> Vec<&'a Heading> {
            let mut trail: Vec<&'a Heading> =
                std::iter::successors(self.parent(id), |p| self.parent(p.id)).collect();
            trail.reverse();
            trail
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn forest() -> Vec<Heading> {
            vec![
                Heading::new(1, "a").with_children(vec![
                    Heading::new(2, "a1"),
                    Heading::new(2, "a2").with_children(vec![Heading::new(3, "a2x")]),
                ]),
                Heading::new(1, "b"),
            ]
        }

        #[test]
        fn walk_visits_in_document_order() {
            let roots = forest();
            let titles: Vec<&str> = walk(&roots).map(|n| n.heading().title.as_str()).collect();
            assert_eq!(titles, ["a", "a1", "a2", "a2x", "b"]);
        }

        #[test]
        fn previous_sibling_follows_parent_order() {
            let roots = forest();
            let a2 = Node::new(&roots[0].children, 1).expect("a2");
            let prev = a2.previous_sibling().expect("a1");
            assert_eq!(prev.heading().title, "a1");
            assert!(prev.previous_sibling().is_none());
            assert!(Node::new(&roots, 2).is_none());
        }

        #[test]
        fn parent_index_lists_enclosing_headings() {
            let roots = forest();
            let index = ParentIndex::new(&roots);
            let target = roots[0].children[1].children[0].id;
            let titles: Vec<&str> = index
                .ancestors(target)
                .iter()
                .map(|h| h.title.as_str())
                .collect();
            assert_eq!(titles, ["a", "a2"]);
            assert_eq!(index.parent(roots[1].id), None);
            assert!(index.ancestors(HeadingId::new()).is_empty());
        }

        #[test]
        fn deep_chain_resolves_every_level() {
            let mut h = Heading::new(200, "leaf");
            let leaf = h.id;
            for level in (1..200u8).rev() {
                h = Heading::new(level, format!("h{level}")).with_children(vec![h]);
            }
            let roots = vec![h];
            let trail = ParentIndex::new(&roots).ancestors(leaf);
            assert_eq!(trail.len(), 199);
            assert_eq!(trail[0].title, "h1");
            assert_eq!(trail[198].title, "h199");
        }
    }
}

pub mod date {
    //! Resolves the free-text modifier typed at a date prompt (`+3d`, `fri`, `sep 12 2011`,
    //! `12:45`, ...) against a reference date.
    //!
    //! Rules run in a fixed order and every rule that matches overwrites the candidate held so
    //! far, so when a modifier fits several patterns the last rule in `RULES` wins. A trailing
    //! clock time is applied afterwards to whatever date was resolved. Unrecognized input
    //! resolves to the reference date itself.

    use crate::core::DateOrDateTime;
    use chrono::{Datelike, Days, Months, NaiveDate, NaiveTime, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, digit1},
        combinator::{all_consuming, eof},
        error::{Error, ErrorKind},
        sequence::{preceded, separated_pair, terminated, tuple},
    };
    use tracing::trace;

    type PResult<'a, T> = IResult<&'a str, T>;

    /// Three-letter month names understood by the month rules.
    pub const MONTHS: [(&str, u32); 12] = [
        ("jan", 1),
        ("feb", 2),
        ("mar", 3),
        ("apr", 4),
        ("may", 5),
        ("jun", 6),
        ("jul", 7),
        ("aug", 8),
        ("sep", 9),
        ("oct", 10),
        ("nov", 11),
        ("dec", 12),
    ];

    const WEEKDAYS: [(&str, Weekday); 7] = [
        ("mon", Weekday::Mon),
        ("tue", Weekday::Tue),
        ("wed", Weekday::Wed),
        ("thu", Weekday::Thu),
        ("fri", Weekday::Fri),
        ("sat", Weekday::Sat),
        ("sun", Weekday::Sun),
    ];

    /// The modifier as typed (trimmed) and lowercased for the name-based rules.
    pub struct Modifier<'a> {
        pub text: &'a str,
        pub lower: &'a str,
    }

    /// One step of the cascade. `apply` yields a candidate date or `None` when the pattern is
    /// absent or describes a date that does not exist.
    pub struct Rule {
        pub name: &'static str,
        pub apply: fn(&Modifier<'_>, NaiveDate) -> Option<NaiveDate>,
    }

    /// Evaluation order matters: later matches override earlier ones.
    pub const RULES: [Rule; 14] = [
        Rule { name: "iso-date", apply: iso_date },
        Rule { name: "short-dashed-date", apply: short_dashed_date },
        Rule { name: "month-slash-day", apply: month_slash_day },
        Rule { name: "month-day-short-year", apply: month_day_short_year },
        Rule { name: "day-of-month", apply: day_of_month },
        Rule { name: "weekday", apply: next_weekday },
        Rule { name: "plus-days", apply: plus_days },
        Rule { name: "plus-bare-days", apply: plus_bare_days },
        Rule { name: "plus-weeks", apply: plus_weeks },
        Rule { name: "plus-months", apply: plus_months },
        Rule { name: "plus-years", apply: plus_years },
        Rule { name: "month-day", apply: month_day },
        Rule { name: "month-slash-day-slash-year", apply: month_day_year_slashed },
        Rule { name: "month-day-year", apply: month_day_year },
    ];

    /// Resolve `modifier` relative to `reference`. Never fails.
    pub fn resolve(reference: NaiveDate, modifier: &str) -> DateOrDateTime {
        let text = modifier.trim();
        if text.is_empty() || text == "." {
            return DateOrDateTime::Date(reference);
        }
        let lower = text.to_lowercase();
        let input = Modifier {
            text,
            lower: &lower,
        };

        let mut resolved: Option<NaiveDate> = None;
        for rule in &RULES {
            if let Some(candidate) = (rule.apply)(&input, reference) {
                trace!(rule = rule.name, %candidate, "date rule matched");
                resolved = Some(candidate);
            }
        }

        let date = resolved.unwrap_or(reference);
        match clock_time(text) {
            Some(time) => {
                trace!(%time, "clock time applied");
                DateOrDateTime::DateTime(date.and_time(time))
            }
            None => DateOrDateTime::Date(date),
        }
    }

    /* ------------------------------ Rules ------------------------------ */

    // YYYY-MM-DD
    fn iso_date(m: &Modifier<'_>, _reference: NaiveDate) -> Option<NaiveDate> {
        let (y, mo, d) = search(
            m.text,
            tuple((digits(4, 4), char('-'), digits(2, 2), char('-'), digits(2, 2))),
        )
        .map(|(y, _, mo, _, d)| (y, mo, d))?;
        NaiveDate::from_ymd_opt(y.parse().ok()?, mo.parse().ok()?, d.parse().ok()?)
    }

    // Y-M-D with a one or two digit year in the 2000s
    fn short_dashed_date(m: &Modifier<'_>, _reference: NaiveDate) -> Option<NaiveDate> {
        let (y, _, mo, _, d) = search(
            m.text,
            tuple((digits(1, 2), char('-'), digit1, char('-'), digit1)),
        )?;
        NaiveDate::from_ymd_opt(century(y)?, mo.parse().ok()?, d.parse().ok()?)
    }

    // M/D, never in the past
    fn month_slash_day(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let (mo, d) = search(m.text, separated_pair(digits(1, 2), char('/'), digits(1, 2)))?;
        upcoming(reference, mo.parse().ok()?, d.parse().ok()?)
    }

    // "sep 12 9"
    fn month_day_short_year(m: &Modifier<'_>, _reference: NaiveDate) -> Option<NaiveDate> {
        let (month, _, d, _, y) = search(
            m.lower,
            tuple((month_name, char(' '), digits(1, 2), char(' '), digits(1, 2))),
        )?;
        NaiveDate::from_ymd_opt(century(y)?, month, d.parse().ok()?)
    }

    // A bare day of month. Days not after today move to "next month", taken as 28 days on.
    fn day_of_month(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let (_, day) = all_consuming(digits(1, 2))(m.text).ok()?;
        let day: u32 = day.parse().ok()?;
        if day > reference.day() {
            NaiveDate::from_ymd_opt(reference.year(), reference.month(), day)
        } else {
            let later = reference.checked_add_days(Days::new(28))?;
            NaiveDate::from_ymd_opt(later.year(), later.month(), day)
        }
    }

    // Next occurrence strictly after the reference; the same weekday means a week later.
    fn next_weekday(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let target = search(m.lower, weekday_name)?;
        let from = reference.weekday().num_days_from_monday();
        let to = target.num_days_from_monday();
        let diff = match (to + 7 - from) % 7 {
            0 => 7,
            n => n,
        };
        reference.checked_add_days(Days::new(u64::from(diff)))
    }

    fn plus_days(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let n = search(m.text, offset('d'))?;
        reference.checked_add_days(Days::new(n.parse().ok()?))
    }

    // "+N " or "+N" at the very end
    fn plus_bare_days(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let n = search(
            m.text,
            preceded(char('+'), terminated(digit1, alt((tag(" "), eof)))),
        )?;
        reference.checked_add_days(Days::new(n.parse().ok()?))
    }

    fn plus_weeks(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let n: u64 = search(m.text, offset('w'))?.parse().ok()?;
        reference.checked_add_days(Days::new(n.checked_mul(7)?))
    }

    // Calendar months; a day missing from the target month clamps to its last day.
    fn plus_months(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let n = search(m.text, offset('m'))?;
        reference.checked_add_months(Months::new(n.parse().ok()?))
    }

    fn plus_years(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let n: i32 = search(m.text, offset('y'))?.parse().ok()?;
        NaiveDate::from_ymd_opt(
            reference.year().checked_add(n)?,
            reference.month(),
            reference.day(),
        )
    }

    // "sep 12", never in the past
    fn month_day(m: &Modifier<'_>, reference: NaiveDate) -> Option<NaiveDate> {
        let (month, d) = search(m.lower, separated_pair(month_name, char(' '), digits(1, 2)))?;
        upcoming(reference, month, d.parse().ok()?)
    }

    // M/D/Y with the year in the 2000s
    fn month_day_year_slashed(m: &Modifier<'_>, _reference: NaiveDate) -> Option<NaiveDate> {
        let (mo, _, d, _, y) = search(
            m.text,
            tuple((digits(1, 2), char('/'), digit1, char('/'), digit1)),
        )?;
        NaiveDate::from_ymd_opt(century(y)?, mo.parse().ok()?, d.parse().ok()?)
    }

    // "sep 12 2011"; years shorter than four digits are in the 2000s
    fn month_day_year(m: &Modifier<'_>, _reference: NaiveDate) -> Option<NaiveDate> {
        let (month, _, d, _, y) = search(
            m.lower,
            tuple((month_name, char(' '), digits(1, 2), char(' '), digits(1, 4))),
        )?;
        let year = if y.len() < 4 { century(y)? } else { y.parse().ok()? };
        NaiveDate::from_ymd_opt(year, month, d.parse().ok()?)
    }

    // H:MM or HH:MM at the end of the modifier
    fn clock_time(text: &str) -> Option<NaiveTime> {
        let (h, m) = search(
            text,
            terminated(separated_pair(digits(1, 2), char(':'), digits(2, 2)), eof),
        )?;
        NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
    }

    /* ------------------------------ Helpers ------------------------------ */

    /// First match of `parser` at any character offset, scanning left to right.
    fn search<'a, O>(
        input: &'a str,
        mut parser: impl FnMut(&'a str) -> PResult<'a, O>,
    ) -> Option<O> {
        input
            .char_indices()
            .map(|(at, _)| at)
            .chain(std::iter::once(input.len()))
            .find_map(|at| parser(&input[at..]).ok().map(|(_, out)| out))
    }

    fn digits<'a>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(min, max, |c: char| c.is_ascii_digit())
    }

    // "+N<unit>"
    fn offset<'a>(unit: char) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        preceded(char('+'), terminated(digit1, char(unit)))
    }

    fn month_name(i: &str) -> PResult<'_, u32> {
        for (name, month) in MONTHS {
            if let Ok((rest, _)) = tag::<_, _, Error<&str>>(name)(i) {
                return Ok((rest, month));
            }
        }
        Err(nom::Err::Error(Error::new(i, ErrorKind::Tag)))
    }

    fn weekday_name(i: &str) -> PResult<'_, Weekday> {
        for (name, weekday) in WEEKDAYS {
            if let Ok((rest, _)) = tag::<_, _, Error<&str>>(name)(i) {
                return Ok((rest, weekday));
            }
        }
        Err(nom::Err::Error(Error::new(i, ErrorKind::Tag)))
    }

    fn century(year: &str) -> Option<i32> {
        year.parse::<i32>().ok()?.checked_add(2000)
    }

    /// `month`/`day` in the reference year, or the next year if that is already past.
    fn upcoming(reference: NaiveDate, month: u32, day: u32) -> Option<NaiveDate> {
        let this_year = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
        if this_year < reference {
            NaiveDate::from_ymd_opt(reference.year() + 1, month, day)
        } else {
            Some(this_year)
        }
    }

}

pub mod filter {
    //! Agenda filters: predicates over heading nodes and the pipeline that chains them.
    //!
    //! Every predicate is pure and read-only. `filter_items` applies them in order, each stage
    //! consuming the previous stage's output, and stays lazy until the caller iterates.

    use crate::core::TodoKeyword;
    use crate::tree::Node;
    use chrono::{Duration, Local, NaiveDateTime};
    use indexmap::IndexMap;

    pub const DEFAULT_HORIZON_DAYS: i64 = 7;

    /// Anything that can accept or reject a heading.
    pub trait AgendaFilter {
        fn matches(&self, node: &Node<'_>) -> bool;
    }

    impl<F> AgendaFilter for F
    where
        F: Fn(&Node<'_>) -> bool,
    {
        fn matches(&self, node: &Node<'_>) -> bool {
            self(node)
        }
    }

    pub type Predicate = fn(&Node<'_>) -> bool;

    /// Narrow `nodes` through `filters`, one lazy stage per filter.
    pub fn filter_items<'h: 'f, 'f, I>(
        nodes: I,
        filters: &'f [&'f dyn AgendaFilter],
    ) -> Box<dyn Iterator<Item = Node<'h>> + 'f>
    where
        I: IntoIterator<Item = Node<'h>>,
        I::IntoIter: 'f,
    {
        let mut stage: Box<dyn Iterator<Item = Node<'h>> + 'f> = Box::new(nodes.into_iter());
        for filter in filters {
            stage = Box::new(stage.filter(move |node| filter.matches(node)));
        }
        stage
    }

    /* ------------------------------ Predicates ------------------------------ */

    pub fn has_active_date(node: &Node<'_>) -> bool {
        node.heading().active_date.is_some()
    }

    /// Only `TODO` and `NEXT` are active.
    pub fn has_active_todo(node: &Node<'_>) -> bool {
        node.heading()
            .todo
            .as_ref()
            .is_some_and(TodoKeyword::is_active)
    }

    pub fn is_next_action(node: &Node<'_>) -> bool {
        matches!(node.heading().todo, Some(TodoKeyword::Next))
    }

    /// Dated before `now + horizon`. Overdue dates always qualify.
    pub fn is_due_within_horizon(node: &Node<'_>, now: NaiveDateTime, horizon: Duration) -> bool {
        let Some(date) = node.heading().active_date else {
            return false;
        };
        match now.checked_add_signed(horizon) {
            Some(limit) => date.as_datetime() < limit,
            None => true,
        }
    }

    pub fn is_leaf(node: &Node<'_>) -> bool {
        node.heading().children.is_empty()
    }

    /// A NEXT heading is never stuck and a childless one always is. Otherwise the heading is
    /// stuck when any child is, checked depth-first in document order; if no child is stuck
    /// the heading is not stuck either.
    pub fn is_stuck(node: &Node<'_>) -> bool {
        if is_next_action(node) {
            return false;
        }
        if is_leaf(node) {
            return true;
        }
        node.children().any(|child| is_stuck(&child))
    }

    /// True when every earlier sibling is stuck (vacuously so for a first child).
    pub fn is_blocked_by_earlier_sibling(node: &Node<'_>) -> bool {
        if is_next_action(node) {
            return false;
        }
        std::iter::successors(node.previous_sibling(), Node::previous_sibling)
            .all(|sibling| is_stuck(&sibling))
    }

    pub fn is_within_week_and_active_todo(node: &Node<'_>) -> bool {
        is_within_week_and_active_todo_at(node, Local::now().naive_local())
    }

    pub fn is_within_week_and_active_todo_at(node: &Node<'_>, now: NaiveDateTime) -> bool {
        is_due_within_horizon(node, now, Duration::days(DEFAULT_HORIZON_DAYS))
            && has_active_todo(node)
    }

    /// The horizon predicate with its clock and window fixed.
    #[derive(Debug, Clone, Copy)]
    pub struct DueWithin {
        pub now: NaiveDateTime,
        pub horizon: Duration,
    }

    impl DueWithin {
        pub fn week_from(now: NaiveDateTime) -> Self {
            Self {
                now,
                horizon: Duration::days(DEFAULT_HORIZON_DAYS),
            }
        }
    }

    impl AgendaFilter for DueWithin {
        fn matches(&self, node: &Node<'_>) -> bool {
            is_due_within_horizon(node, self.now, self.horizon)
        }
    }

    /* ------------------------------- Registry ------------------------------- */

    /// Filters addressable by name, in listing order.
    pub fn named_filters() -> IndexMap<&'static str, Predicate> {
        let mut filters: IndexMap<&'static str, Predicate> = IndexMap::new();
        filters.insert("has-active-date", has_active_date);
        filters.insert("has-active-todo", has_active_todo);
        filters.insert("is-next-action", is_next_action);
        filters.insert("is-leaf", is_leaf);
        filters.insert("is-stuck", is_stuck);
        filters.insert("is-blocked-by-earlier-sibling", is_blocked_by_earlier_sibling);
        filters.insert("is-within-week-and-active-todo", is_within_week_and_active_todo);
        filters
    }

    pub fn named(name: &str) -> Option<Predicate> {
        named_filters().get(name).copied()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Heading;
        use chrono::NaiveDate;

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 1, 10)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
        }

        fn leaf(title: &str, todo: Option<TodoKeyword>) -> Heading {
            let h = Heading::new(2, title);
            match todo {
                Some(kw) => h.with_todo(kw),
                None => h,
            }
        }

        fn titles<'a>(nodes: impl Iterator<Item = Node<'a>>) -> Vec<&'a str> {
            nodes.map(|n| n.heading().title.as_str()).collect()
        }

        #[test]
        fn active_todo_recognizes_only_todo_and_next() {
            let list = vec![
                leaf("t", Some(TodoKeyword::Todo)),
                leaf("n", Some(TodoKeyword::Next)),
                leaf("d", Some(TodoKeyword::Done)),
                leaf("w", Some(TodoKeyword::from_word("WAITING"))),
                leaf("none", None),
            ];
            let active: Vec<bool> = Node::all(&list).map(|n| has_active_todo(&n)).collect();
            assert_eq!(active, [true, true, false, false, false]);
            let next: Vec<bool> = Node::all(&list).map(|n| is_next_action(&n)).collect();
            assert_eq!(next, [false, true, false, false, false]);
        }

        #[test]
        fn pipeline_keeps_headings_passing_every_filter() {
            let today = now().date();
            let list = vec![
                leaf("A", Some(TodoKeyword::Next)),
                leaf("B", Some(TodoKeyword::Todo)).with_active_date(today + Duration::days(3)),
            ];
            let filters: [&dyn AgendaFilter; 2] = [&has_active_date, &has_active_todo];
            assert_eq!(titles(filter_items(Node::all(&list), &filters)), ["B"]);
        }

        #[test]
        fn empty_filter_list_passes_everything() {
            let list = vec![leaf("a", None), leaf("b", None)];
            assert_eq!(titles(filter_items(Node::all(&list), &[])), ["a", "b"]);
        }

        #[test]
        fn pipeline_is_lazy() {
            use std::cell::Cell;
            let list: Vec<Heading> = (0..10).map(|i| leaf(&i.to_string(), None)).collect();
            let calls = Cell::new(0);
            let counting = |_: &Node<'_>| {
                calls.set(calls.get() + 1);
                true
            };
            let filters: [&dyn AgendaFilter; 1] = [&counting];
            let mut stream = filter_items(Node::all(&list), &filters);
            assert_eq!(calls.get(), 0);
            let first_two: Vec<_> = stream.by_ref().take(2).collect();
            assert_eq!(first_two.len(), 2);
            assert_eq!(calls.get(), 2);
        }

        #[test]
        fn horizon_includes_overdue_and_excludes_far_future() {
            let today = now().date();
            let list = vec![
                leaf("overdue", None).with_active_date(today - Duration::days(30)),
                leaf("soon", None).with_active_date(today + Duration::days(6)),
                leaf("edge", None).with_active_date(now() + Duration::days(7)),
                leaf("later", None).with_active_date(today + Duration::days(8)),
                leaf("undated", None),
            ];
            let due = DueWithin::week_from(now());
            let filters: [&dyn AgendaFilter; 1] = [&due];
            assert_eq!(
                titles(filter_items(Node::all(&list), &filters)),
                ["overdue", "soon"]
            );
        }

        #[test]
        fn within_week_requires_active_todo() {
            let today = now().date();
            let list = vec![
                leaf("todo", Some(TodoKeyword::Todo)).with_active_date(today),
                leaf("done", Some(TodoKeyword::Done)).with_active_date(today),
            ];
            let hits: Vec<bool> = Node::all(&list)
                .map(|n| is_within_week_and_active_todo_at(&n, now()))
                .collect();
            assert_eq!(hits, [true, false]);
        }

        #[test]
        fn leaf_matches_children_count() {
            let list = vec![
                leaf("bare", None),
                Heading::new(1, "parent").with_children(vec![leaf("kid", None)]),
            ];
            for node in Node::all(&list) {
                assert_eq!(is_leaf(&node), node.heading().children.is_empty());
            }
        }

        #[test]
        fn next_action_is_never_stuck() {
            let list = vec![
                leaf("n", Some(TodoKeyword::Next)),
                Heading::new(1, "n-parent")
                    .with_todo(TodoKeyword::Next)
                    .with_children(vec![leaf("kid", None)]),
            ];
            assert!(Node::all(&list).all(|n| !is_stuck(&n)));
        }

        #[test]
        fn heading_with_a_stuck_child_is_stuck() {
            // Q is a TODO leaf (stuck), R is NEXT (not stuck); any stuck child makes P stuck.
            let p = Heading::new(2, "P").with_children(vec![
                leaf("Q", Some(TodoKeyword::Todo)),
                leaf("R", Some(TodoKeyword::Next)),
            ]);
            let root = vec![Heading::new(1, "root").with_children(vec![p])];
            let p = Node::new(&root[0].children, 0).unwrap();
            let kids: Vec<bool> = p.children().map(|c| is_stuck(&c)).collect();
            assert_eq!(kids, [true, false]);
            assert!(is_stuck(&p));
        }

        #[test]
        fn heading_without_stuck_children_is_not_stuck() {
            let list = vec![Heading::new(1, "P").with_children(vec![
                leaf("R", Some(TodoKeyword::Next)),
                leaf("S", Some(TodoKeyword::Next)),
            ])];
            let p = Node::new(&list, 0).unwrap();
            assert!(!is_stuck(&p));
        }

        #[test]
        fn blocked_by_earlier_sibling() {
            let list = vec![
                leaf("first", Some(TodoKeyword::Todo)),
                leaf("second", Some(TodoKeyword::Todo)),
                leaf("next", Some(TodoKeyword::Next)),
                leaf("after-next", Some(TodoKeyword::Todo)),
            ];
            let blocked: Vec<bool> = Node::all(&list)
                .map(|n| is_blocked_by_earlier_sibling(&n))
                .collect();
            // first: no earlier siblings; second: "first" is a stuck leaf;
            // next: NEXT itself; after-next: "next" is not stuck.
            assert_eq!(blocked, [true, true, false, false]);
        }

        #[test]
        fn registry_resolves_names() {
            assert!(named("is-stuck").is_some());
            assert!(named("is-everything").is_none());
            let names: Vec<&str> = named_filters().keys().copied().collect();
            assert_eq!(names[0], "has-active-date");
        }
    }
}

pub mod parser {
    //! Outline reader built on `nom`.
    //!
    //! The scan is line-oriented: headlines are parsed with combinators (stars, TODO keyword,
    //! priority, title, tags) and stacked by level into a tree. A planning line directly under a
    //! headline is parsed as such; every other line is only searched for timestamps.

    use crate::core::*;
    use anyhow::{Context, Result, anyhow};
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till, take_while, take_while1, take_while_m_n},
        character::complete::{anychar, char, space0, space1},
        combinator::{eof, map_res, opt, recognize, verify},
        error::{VerboseError, VerboseErrorKind},
        multi::many1,
        sequence::{delimited, preceded, terminated, tuple},
    };
    use std::{
        collections::BTreeSet,
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    /// Keywords recognized in every file; `#+TODO:` lines add more.
    pub const DEFAULT_TODO_KEYWORDS: [&str; 5] = ["TODO", "NEXT", "WAITING", "DONE", "CANCELLED"];

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    pub trait OrgParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OrgFile>;
    }

    pub struct NomOrgParser;

    impl OrgParser for NomOrgParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OrgFile> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            parse_org_from_str(Some(abs_path.to_path_buf()), &text)
        }
    }

    /// Parse an Org document from a string.
    pub fn parse_org_from_str(path: Option<PathBuf>, input: &str) -> Result<OrgFile> {
        let lines: Vec<&str> = input.lines().collect();
        let mut file = OrgFile::new(path);

        // 1) Directives may appear anywhere; keywords must be known before any headline.
        file.todo_keywords = DEFAULT_TODO_KEYWORDS.iter().map(|s| s.to_string()).collect();
        for line in &lines {
            let Ok((_, (key, value))) = parse_directive(line) else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "title" => file.title = Some(value.trim().to_string()),
                "todo" | "seq_todo" | "typ_todo" => {
                    file.todo_keywords.extend(keywords_from_directive(value))
                }
                _ => {}
            }
        }

        // 2) Headings (stack build).
        let mut stack: Vec<Heading> = Vec::new();
        let mut roots: Vec<Heading> = Vec::new();
        let mut after_headline = false;

        for (idx, line) in lines.iter().enumerate() {
            if is_heading_line(line) {
                let (_, mut node) =
                    parse_headline(line, &file.todo_keywords).map_err(to_anyhow(idx))?;
                node.line = idx;
                while stack.last().is_some_and(|top| top.level >= node.level) {
                    close_top(&mut stack, &mut roots);
                }
                stack.push(node);
                after_headline = true;
                continue;
            }

            let Some(current) = stack.last_mut() else {
                continue;
            };
            if std::mem::take(&mut after_headline) {
                if let Ok((_, planning)) = parse_planning_line(line) {
                    current.planning = planning;
                    continue;
                }
            }
            current.timestamps.extend(scan_timestamps(line));
        }
        while !stack.is_empty() {
            close_top(&mut stack, &mut roots);
        }

        debug!(
            path = ?file.path,
            headings = roots.len(),
            keywords = file.todo_keywords.len(),
            "parsed org file"
        );
        file.headings = roots;
        Ok(file)
    }

    fn to_anyhow(line: usize) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let detail = ve
                    .errors
                    .iter()
                    .map(|(frag, kind)| format!("{:?} at {:?}", kind, frag))
                    .collect::<Vec<_>>()
                    .join(", ");
                anyhow!("parse error on line {}: {}", line + 1, detail)
            }
            nom::Err::Incomplete(_) => anyhow!("incomplete input on line {}", line + 1),
        }
    }

    /* ------------------------------- Utils ------------------------------- */

    /// Pop the innermost open heading, finish it, and attach it to its parent (or the roots).
    fn close_top(stack: &mut Vec<Heading>, roots: &mut Vec<Heading>) {
        let Some(mut done) = stack.pop() else {
            return;
        };
        done.refresh_active_date();
        match stack.last_mut() {
            Some(parent) => parent.children.push(done),
            None => roots.push(done),
        }
    }

    fn is_heading_line(s: &str) -> bool {
        let stars = s.chars().take_while(|c| *c == '*').count();
        stars >= 1 && s[stars..].starts_with(' ')
    }

    fn keywords_from_directive(value: &str) -> impl Iterator<Item = String> + '_ {
        value
            .split_whitespace()
            .filter(|w| *w != "|")
            // fast-access suffixes: TODO(t), DONE(d!)
            .map(|w| w.split('(').next().unwrap_or(w).to_string())
            .filter(|w| !w.is_empty())
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '@' || c == '#' || c == '%'
    }

    /* ------------------------------ Headlines ------------------------------ */

    fn parse_directive(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, key) = delimited(
            tag("#+"),
            take_while1(|c: char| c.is_alphanumeric() || c == '_'),
            char(':'),
        )(i)?;
        Ok(("", (key, i)))
    }

    fn parse_headline<'a>(i: &'a str, keywords: &BTreeSet<String>) -> PResult<'a, Heading> {
        let (i, stars) = recognize(many1(char('*')))(i)?;
        let (i, _) = space1(i)?;
        let (i, todo) = opt(terminated(
            verify(
                take_while1(|c: char| c.is_ascii_uppercase()),
                |w: &str| keywords.contains(w),
            ),
            alt((space1, eof)),
        ))(i)?;
        let (i, priority) = opt(terminated(
            delimited(tag("[#"), anychar, char(']')),
            space0,
        ))(i)?;

        let text = i.trim_end();
        let (title, tags) = split_tags(text);

        let level = u8::try_from(stars.len()).unwrap_or(u8::MAX);
        let mut h = Heading::new(level, title);
        h.todo = todo.map(TodoKeyword::from_word);
        h.priority = priority;
        h.tags = tags;
        h.timestamps = scan_timestamps(title);
        Ok(("", h))
    }

    /// Split a trailing `:tag1:tag2:` group off a headline.
    fn split_tags(text: &str) -> (&str, BTreeSet<String>) {
        let candidate = match text.rsplit_once(char::is_whitespace) {
            Some((_, last)) => last,
            None => text,
        };
        let is_group = candidate.len() > 1
            && candidate.starts_with(':')
            && candidate.ends_with(':')
            && candidate
                .split(':')
                .filter(|t| !t.is_empty())
                .all(|t| t.chars().all(is_tag_char));
        if !is_group || candidate.len() == text.len() {
            return (text, BTreeSet::new());
        }
        let tags = candidate
            .split(':')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        (text[..text.len() - candidate.len()].trim_end(), tags)
    }

    /* --------------------------- Planning lines --------------------------- */

    fn parse_planning_line(line: &str) -> PResult<'_, Planning> {
        // e.g.: SCHEDULED: <2025-11-15 Sat 12:00> DEADLINE: <...>  CLOSED: [2025-11-15 14:10]
        let mut planning = Planning::default();
        let mut rest = line;
        let mut matched = false;
        loop {
            let (r, _) = space0(rest)?;
            if r.is_empty() {
                break;
            }
            let (r, (keyword, ts)) = tuple((
                alt((tag("SCHEDULED:"), tag("DEADLINE:"), tag("CLOSED:"))),
                preceded(space0, parse_timestamp),
            ))(r)?;
            match keyword {
                "SCHEDULED:" => planning.scheduled = Some(ts),
                "DEADLINE:" => planning.deadline = Some(ts),
                _ => planning.closed = Some(ts),
            }
            matched = true;
            rest = r;
        }
        if !matched {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(line, VerboseErrorKind::Context("planning"))],
            }));
        }
        Ok((rest, planning))
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// Every well-formed timestamp in `line`, left to right.
    fn scan_timestamps(line: &str) -> Vec<Timestamp> {
        let mut out = Vec::new();
        let mut rest = line;
        while let Some(at) = rest.find(['<', '[']) {
            rest = &rest[at..];
            match parse_timestamp(rest) {
                Ok((r, ts)) => {
                    out.push(ts);
                    rest = r;
                }
                Err(_) => rest = &rest[1..],
            }
        }
        out
    }

    fn parse_timestamp(i: &str) -> PResult<'_, Timestamp> {
        // Active: <YYYY-MM-DD Day HH:MM ...>
        // Inactive: [YYYY-MM-DD Day HH:MM ...]
        let (i, open) = alt((char('<'), char('[')))(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, date) = parse_date(i)?;
        let (i, _day) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        // Ranges, repeaters and delays are skipped.
        let (i, _) = take_till(move |c: char| c == close || matches!(c, '\n' | '<' | '['))(i)?;
        let (i, _) = char(close)(i)?;
        Ok((
            i,
            Timestamp {
                active: open == '<',
                date,
                time,
            },
        ))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(digits(4, 4), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(digits(2, 2), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(digits(2, 2), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(digits(1, 2), |s: &str| s.parse::<u32>()),
                char(':'),
                map_res(digits(2, 2), |s: &str| s.parse::<u32>()),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn digits<'a>(m: usize, n: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        let inner = take_while_m_n(m, n, |c: char| c.is_ascii_digit());
        move |i: &'a str| {
            let (rest, out) = inner(i)?;
            // take_while_m_n stops at `n`; reject longer runs like a 5-digit year.
            match take_while::<_, _, VerboseError<&str>>(|c: char| c.is_ascii_digit())(rest) {
                Ok((_, extra)) if !extra.is_empty() => Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("digits"))],
                })),
                _ => Ok((rest, out)),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn keywords() -> BTreeSet<String> {
            DEFAULT_TODO_KEYWORDS.iter().map(|s| s.to_string()).collect()
        }

        #[test]
        fn headline_with_keyword_priority_and_tags() {
            let (_, h) = parse_headline("** NEXT [#A] Call the plumber :home:phone:", &keywords())
                .unwrap();
            assert_eq!(h.level, 2);
            assert_eq!(h.todo, Some(TodoKeyword::Next));
            assert_eq!(h.priority, Some('A'));
            assert_eq!(h.title, "Call the plumber");
            assert!(h.tags.contains("home") && h.tags.contains("phone"));
        }

        #[test]
        fn uppercase_word_that_is_not_a_keyword_stays_in_title() {
            let (_, h) = parse_headline("* API design", &keywords()).unwrap();
            assert_eq!(h.todo, None);
            assert_eq!(h.title, "API design");
        }

        #[test]
        fn bare_keyword_headline() {
            let (_, h) = parse_headline("* TODO", &keywords()).unwrap();
            assert_eq!(h.todo, Some(TodoKeyword::Todo));
            assert_eq!(h.title, "");
        }

        #[test]
        fn timestamps_active_inactive_with_time() {
            let found = scan_timestamps("met [2024-01-09 Tue] then <2024-01-12 Fri 14:30 +1w> ok");
            assert_eq!(found.len(), 2);
            assert!(!found[0].active);
            assert!(found[1].active);
            assert_eq!(found[1].time, NaiveTime::from_hms_opt(14, 30, 0));
        }

        #[test]
        fn malformed_timestamps_are_skipped() {
            assert!(scan_timestamps("<2024-13-01> [nope] <20240-01-01>").is_empty());
        }

        #[test]
        fn planning_line_parses_all_fields() {
            let (_, p) = parse_planning_line(
                "   SCHEDULED: <2024-01-10 Wed> DEADLINE: <2024-01-12 Fri 10:00> CLOSED: [2024-01-09 Tue]",
            )
            .unwrap();
            assert!(p.scheduled.is_some());
            assert_eq!(
                p.deadline.map(|ts| ts.time),
                Some(NaiveTime::from_hms_opt(10, 0, 0))
            );
            assert!(p.closed.is_some_and(|ts| !ts.active));
            assert!(parse_planning_line("Just text").is_err());
        }

        #[test]
        fn tree_and_active_dates() {
            let input = "#+title: Plan
#+TODO: TODO(t) WAIT | DONE(d!)
* Project
** TODO Draft
   SCHEDULED: <2024-01-11 Thu>
** WAIT Review
   CLOSED: [2024-01-09 Tue]
   Body mentions <2024-01-20 Sat 09:00>.
*** NEXT Ping reviewer
* Inbox
";
            let file = parse_org_from_str(None, input).expect("parse");
            assert_eq!(file.title.as_deref(), Some("Plan"));
            assert!(file.todo_keywords.contains("WAIT"));
            assert_eq!(file.headings.len(), 2);

            let project = &file.headings[0];
            assert_eq!(project.line, 2);
            assert_eq!(project.children.len(), 2);
            let draft = &project.children[0];
            assert_eq!(
                draft.active_date,
                Some(DateOrDateTime::Date(
                    NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()
                ))
            );
            let review = &project.children[1];
            assert_eq!(review.todo, Some(TodoKeyword::from_word("WAIT")));
            assert_eq!(
                review.active_date.map(|d| d.to_string()),
                Some("2024-01-20 09:00".to_string())
            );
            assert_eq!(review.children[0].todo, Some(TodoKeyword::Next));
            assert_eq!(file.headings[1].title, "Inbox");
        }

        #[test]
        fn closed_only_heading_has_no_active_date() {
            let file = parse_org_from_str(None, "* DONE Ship\n  CLOSED: [2024-01-09 Tue]\n")
                .expect("parse");
            assert_eq!(file.headings[0].active_date, None);
        }

        #[test]
        fn shallower_heading_after_deep_one_closes_levels() {
            let file = parse_org_from_str(None, "* a\n*** deep\n** b\n* c\n").expect("parse");
            let titles: Vec<&str> = file.headings.iter().map(|h| h.title.as_str()).collect();
            assert_eq!(titles, ["a", "c"]);
            let kids: Vec<&str> = file.headings[0]
                .children
                .iter()
                .map(|h| h.title.as_str())
                .collect();
            assert_eq!(kids, ["deep", "b"]);
        }
    }
}

pub mod format {
    //! Text side of timestamps: rendering resolved dates and splicing planning lines into a
    //! document. Pure string functions; callers own the I/O.

    use crate::core::{DateOrDateTime, DomainError};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PlanningTag {
        Scheduled,
        Deadline,
    }

    impl PlanningTag {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Scheduled => "SCHEDULED",
                Self::Deadline => "DEADLINE",
            }
        }
    }

    /// `<2024-01-10 Wed>`, `<2024-01-10 Wed 12:45>`, or the `[...]` form when inactive.
    pub fn render_timestamp(value: &DateOrDateTime, active: bool) -> String {
        let body = match value {
            DateOrDateTime::Date(date) => date.format("%Y-%m-%d %a").to_string(),
            DateOrDateTime::DateTime(dt) => dt.format("%Y-%m-%d %a %H:%M").to_string(),
        };
        if active {
            format!("<{body}>")
        } else {
            format!("[{body}]")
        }
    }

    /// A planning line indented one column past the headline's stars.
    pub fn planning_line(tag: PlanningTag, value: &DateOrDateTime, stars: usize) -> String {
        format!(
            "{}{}: {}",
            " ".repeat(stars + 1),
            tag.as_str(),
            render_timestamp(value, true)
        )
    }

    /// Set `tag` for the headline on 0-based line `headline`.
    ///
    /// An existing `TAG: <...>` (or `TAG: [...]`) on the following line is rewritten in place; a
    /// following line that carries only the other planning keyword gets the stamp appended;
    /// otherwise a new planning line is inserted under the headline. CRLF documents stay CRLF.
    pub fn splice_planning(
        text: &str,
        headline: usize,
        tag: PlanningTag,
        value: &DateOrDateTime,
    ) -> Result<String, DomainError> {
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let Some(head) = lines.get(headline) else {
            return Err(DomainError::LineOutOfRange {
                line: headline,
                lines: lines.len(),
            });
        };
        let stars = head.chars().take_while(|c| *c == '*').count();
        let line = planning_line(tag, value, stars);
        let stamp = line.trim_start();
        let next = headline + 1;

        let marker = format!("{}:", tag.as_str());
        let updated = lines.get(next).and_then(|existing| {
            if existing.contains(&marker) {
                return replace_stamps(existing, &marker, stamp);
            }
            let other = [PlanningTag::Scheduled, PlanningTag::Deadline]
                .into_iter()
                .filter(|t| *t != tag)
                .any(|t| existing.contains(&format!("{}:", t.as_str())));
            other.then(|| format!("{existing} {stamp}"))
        });
        match updated {
            Some(replaced) => lines[next] = replaced,
            None => lines.insert(next, line),
        }

        let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let mut out = lines.join(eol);
        if text.ends_with('\n') {
            out.push_str(eol);
        }
        Ok(out)
    }

    // Every `MARKER ...>` or `MARKER ...]` span becomes `stamp`; `None` if no span was closed.
    fn replace_stamps(line: &str, marker: &str, stamp: &str) -> Option<String> {
        let mut out = String::with_capacity(line.len() + stamp.len());
        let mut rest = line;
        let mut replaced = false;
        while let Some(start) = rest.find(marker) {
            let Some(len) = rest[start..].find(['>', ']']) else {
                break;
            };
            out.push_str(&rest[..start]);
            out.push_str(stamp);
            rest = &rest[start + len + 1..];
            replaced = true;
        }
        out.push_str(rest);
        replaced.then_some(out)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn wed() -> DateOrDateTime {
            DateOrDateTime::Date(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
        }

        #[test]
        fn renders_active_inactive_and_timed() {
            assert_eq!(render_timestamp(&wed(), true), "<2024-01-10 Wed>");
            assert_eq!(render_timestamp(&wed(), false), "[2024-01-10 Wed]");
            let timed = DateOrDateTime::DateTime(
                NaiveDate::from_ymd_opt(2024, 1, 10)
                    .unwrap()
                    .and_hms_opt(12, 45, 0)
                    .unwrap(),
            );
            assert_eq!(render_timestamp(&timed, true), "<2024-01-10 Wed 12:45>");
        }

        #[test]
        fn inserts_new_planning_line() {
            let text = "* Top\n** TODO Task\nbody\n";
            let out = splice_planning(text, 1, PlanningTag::Scheduled, &wed()).unwrap();
            assert_eq!(out, "* Top\n** TODO Task\n   SCHEDULED: <2024-01-10 Wed>\nbody\n");
        }

        #[test]
        fn inserts_at_end_of_document() {
            let out = splice_planning("* TODO Last", 0, PlanningTag::Deadline, &wed()).unwrap();
            assert_eq!(out, "* TODO Last\n  DEADLINE: <2024-01-10 Wed>");
        }

        #[test]
        fn replaces_existing_stamp_for_same_tag() {
            let text = "* TODO Task\n  SCHEDULED: <2023-05-01 Mon> DEADLINE: <2023-06-01 Thu>\n";
            let out = splice_planning(text, 0, PlanningTag::Scheduled, &wed()).unwrap();
            assert_eq!(
                out,
                "* TODO Task\n  SCHEDULED: <2024-01-10 Wed> DEADLINE: <2023-06-01 Thu>\n"
            );
        }

        #[test]
        fn appends_to_line_with_other_tag() {
            let text = "* TODO Task\n  DEADLINE: <2023-06-01 Thu>\n";
            let out = splice_planning(text, 0, PlanningTag::Scheduled, &wed()).unwrap();
            assert_eq!(
                out,
                "* TODO Task\n  DEADLINE: <2023-06-01 Thu> SCHEDULED: <2024-01-10 Wed>\n"
            );
        }

        #[test]
        fn prose_mentioning_the_keyword_gets_a_new_planning_line() {
            let text = "* TODO Call\nWe SCHEDULED nothing yet\n";
            let out = splice_planning(text, 0, PlanningTag::Scheduled, &wed()).unwrap();
            assert_eq!(
                out,
                "* TODO Call\n  SCHEDULED: <2024-01-10 Wed>\nWe SCHEDULED nothing yet\n"
            );
        }

        #[test]
        fn inactive_stamp_for_same_tag_is_replaced() {
            let text = "* TODO Call\n  SCHEDULED: [2024-01-01 Mon]\n";
            let out = splice_planning(text, 0, PlanningTag::Scheduled, &wed()).unwrap();
            assert_eq!(out, "* TODO Call\n  SCHEDULED: <2024-01-10 Wed>\n");
        }

        #[test]
        fn unclosed_stamp_leaves_line_and_inserts_planning() {
            let text = "* TODO Call\n  SCHEDULED: someday\n";
            let out = splice_planning(text, 0, PlanningTag::Scheduled, &wed()).unwrap();
            assert_eq!(
                out,
                "* TODO Call\n  SCHEDULED: <2024-01-10 Wed>\n  SCHEDULED: someday\n"
            );
        }

        #[test]
        fn crlf_line_endings_are_kept() {
            let text = "* Top\r\n** TODO Task\r\nbody\r\n";
            let out = splice_planning(text, 1, PlanningTag::Deadline, &wed()).unwrap();
            assert_eq!(
                out,
                "* Top\r\n** TODO Task\r\n   DEADLINE: <2024-01-10 Wed>\r\nbody\r\n"
            );
        }

        #[test]
        fn out_of_range_line_is_an_error() {
            let err = splice_planning("* a\n", 3, PlanningTag::Deadline, &wed()).unwrap_err();
            assert_eq!(err, DomainError::LineOutOfRange { line: 3, lines: 1 });
        }
    }
}

pub mod agenda {
    //! Agenda views: a filter list per view, run over every heading of every file, projected
    //! into display rows.

    use crate::core::{DateOrDateTime, HeadingId, OrgFile, TodoKeyword};
    use crate::filter::{self, AgendaFilter, DueWithin, filter_items};
    use crate::tree::{self, Node, ParentIndex};
    use chrono::{Duration, NaiveDateTime};
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AgendaView {
        /// Active TODOs dated before the horizon, overdue included.
        Week,
        /// Every active TODO.
        Todos,
        /// Everything with an active date.
        Timeline,
        /// NEXT actions.
        Next,
        /// Active TODO projects with no way forward.
        Stuck,
    }

    impl AgendaView {
        pub fn filters(self, now: NaiveDateTime, horizon: Duration) -> Vec<Box<dyn AgendaFilter>> {
            match self {
                Self::Week => vec![
                    Box::new(DueWithin { now, horizon }),
                    Box::new(filter::has_active_todo),
                ],
                Self::Todos => vec![Box::new(filter::has_active_todo)],
                Self::Timeline => vec![Box::new(filter::has_active_date)],
                Self::Next => vec![Box::new(filter::is_next_action)],
                Self::Stuck => vec![
                    Box::new(filter::has_active_todo),
                    Box::new(has_children),
                    Box::new(filter::is_stuck),
                ],
            }
        }

        pub fn sorts_by_date(self) -> bool {
            matches!(self, Self::Week | Self::Timeline)
        }
    }

    fn has_children(node: &Node<'_>) -> bool {
        !filter::is_leaf(node)
    }

    /// What to run and how to present it.
    pub struct AgendaQuery {
        pub filters: Vec<Box<dyn AgendaFilter>>,
        pub sort_by_date: bool,
        pub limit: Option<usize>,
    }

    impl AgendaQuery {
        pub fn from_view(view: AgendaView, now: NaiveDateTime, horizon: Duration) -> Self {
            Self {
                filters: view.filters(now, horizon),
                sort_by_date: view.sorts_by_date(),
                limit: None,
            }
        }
    }

    /// A matched heading, flattened for display.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaItem {
        pub heading_id: HeadingId,
        pub file: Option<PathBuf>,
        pub line: usize,
        pub title: String,
        pub todo: Option<TodoKeyword>,
        pub tags: Vec<String>,
        pub active_date: Option<DateOrDateTime>,
        /// Titles of enclosing headings, outermost first.
        pub path: Vec<String>,
    }

    impl AgendaItem {
        fn project(file: &OrgFile, parents: &ParentIndex<'_>, node: &Node<'_>) -> Self {
            let h = node.heading();
            let path = parents
                .ancestors(h.id)
                .into_iter()
                .map(|a| a.title.clone())
                .collect();
            Self {
                heading_id: h.id,
                file: file.path.clone(),
                line: h.line,
                title: h.title.clone(),
                todo: h.todo.clone(),
                tags: h.tags.iter().cloned().collect(),
                active_date: h.active_date,
                path,
            }
        }
    }

    /// Run `query` over `files` in document order.
    ///
    /// Unsorted queries stop pulling headings once `limit` rows are found; sorted ones need
    /// every match before truncating.
    pub fn collect<'a>(
        files: impl IntoIterator<Item = &'a OrgFile>,
        query: &AgendaQuery,
    ) -> Vec<AgendaItem> {
        let filters: Vec<&dyn AgendaFilter> = query
            .filters
            .iter()
            .map(|f| f.as_ref() as &dyn AgendaFilter)
            .collect();
        let budget = match (query.sort_by_date, query.limit) {
            (false, Some(limit)) => limit,
            _ => usize::MAX,
        };

        let mut items = Vec::new();
        for file in files {
            let room = budget - items.len();
            if room == 0 {
                break;
            }
            let matched: Vec<Node<'_>> = filter_items(tree::walk(&file.headings), &filters)
                .take(room)
                .collect();
            debug!(path = ?file.path, matched = matched.len(), "agenda file filtered");
            if matched.is_empty() {
                continue;
            }
            let parents = ParentIndex::new(&file.headings);
            items.extend(
                matched
                    .iter()
                    .map(|node| AgendaItem::project(file, &parents, node)),
            );
        }

        if query.sort_by_date {
            items.sort_by_key(|item| {
                (
                    item.active_date.is_none(),
                    item.active_date.map(|d| d.as_datetime()),
                )
            });
        }
        if let Some(limit) = query.limit {
            items.truncate(limit);
        }
        items
    }

}

pub use agenda::{AgendaItem, AgendaQuery, AgendaView};
pub use date::resolve;
pub use parser::{NomOrgParser, OrgParser, parse_org_from_str};
