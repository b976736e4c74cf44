//! ptsched domain library: parse, validate, render and merge school-term schedules.
//!
//! The core pipeline (`syntax` → `transform` → `validate` → `render` → `merge`) is pure and
//! never touches the filesystem. `storage`, `workspace`, `config`, `scheduler` and `generate`
//! are the thin layers the CLI builds on.

pub mod core {
    use chrono::{Month, NaiveDate, Weekday};
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ---------------------------- Text constants ---------------------------- */

    pub const COMMENT_MARKER: char = '~';
    pub const CLASS_MARKER: char = '#';
    pub const DAY_MARKER: char = '-';
    /// Accepted separators between the two metadata dates (hyphen, en dash, em dash).
    pub const DATE_SEPARATORS: &str = "-\u{2013}\u{2014}";

    pub const WEEKDAYS: [(&str, Weekday); 7] = [
        ("Mon", Weekday::Mon),
        ("Tue", Weekday::Tue),
        ("Wed", Weekday::Wed),
        ("Thu", Weekday::Thu),
        ("Fri", Weekday::Fri),
        ("Sat", Weekday::Sat),
        ("Sun", Weekday::Sun),
    ];

    pub const WEEKDAY_NAMES: [&str; 7] = [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ];

    pub const MONTHS: [(&str, Month); 12] = [
        ("January", Month::January),
        ("February", Month::February),
        ("March", Month::March),
        ("April", Month::April),
        ("May", Month::May),
        ("June", Month::June),
        ("July", Month::July),
        ("August", Month::August),
        ("September", Month::September),
        ("October", Month::October),
        ("November", Month::November),
        ("December", Month::December),
    ];

    pub fn weekday_from_abbreviation(word: &str) -> Option<Weekday> {
        WEEKDAYS
            .iter()
            .find(|(name, _)| *name == word)
            .map(|(_, day)| *day)
    }

    pub fn month_from_name(word: &str) -> Option<Month> {
        MONTHS
            .iter()
            .find(|(name, _)| *name == word)
            .map(|(_, month)| *month)
    }

    /// Full English weekday name for an index where Monday = 0.
    pub fn weekday_name(index: u32) -> &'static str {
        WEEKDAY_NAMES
            .get(index as usize)
            .copied()
            .unwrap_or("Unknown")
    }

    /// Full English month name for 1..=12.
    pub fn month_name(number: u32) -> &'static str {
        MONTHS
            .get((number as usize).wrapping_sub(1))
            .map(|(name, _)| *name)
            .unwrap_or("Unknown")
    }

    /* ------------------------------ Positions ------------------------------ */

    /// Location of a node or diagnostic inside the source text.
    ///
    /// Lines and columns are 1-based and counted in characters; `end_column` is exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct SourcePosition {
        pub line: usize,
        pub column: usize,
        pub end_column: Option<usize>,
    }

    impl SourcePosition {
        pub fn new(line: usize, column: usize, end_column: Option<usize>) -> Self {
            Self {
                line,
                column,
                end_column,
            }
        }

        pub fn point(line: usize, column: usize) -> Self {
            Self::new(line, column, None)
        }
    }

    /// A value together with the span it was read from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Spanned<T> {
        pub value: T,
        pub position: SourcePosition,
    }

    impl<T> Spanned<T> {
        pub fn new(value: T, position: SourcePosition) -> Self {
            Self { value, position }
        }

        pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
            Spanned {
                value: f(self.value),
                position: self.position,
            }
        }
    }

    /* ------------------------- Normalized schedule ------------------------- */

    /// Validated, day-major schedule.
    ///
    /// Days are sorted ascending and unique; classes inside a day are unique and sorted by
    /// name; tasks keep their declaration order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NormalizedSchedule {
        pub start_date: NaiveDate,
        pub end_date: NaiveDate,
        pub days: Vec<ScheduleDay>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScheduleDay {
        pub date: NaiveDate,
        pub classes: Vec<ClassTasks>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClassTasks {
        pub name: String,
        pub tasks: Vec<String>,
    }

    impl NormalizedSchedule {
        pub fn day(&self, date: NaiveDate) -> Option<&ScheduleDay> {
            self.days
                .binary_search_by_key(&date, |day| day.date)
                .ok()
                .and_then(|idx| self.days.get(idx))
        }

        /// Every class name that appears on at least one day, sorted.
        pub fn class_names(&self) -> Vec<&str> {
            let mut names: Vec<&str> = self
                .days
                .iter()
                .flat_map(|day| day.classes.iter().map(|class| class.name.as_str()))
                .collect();
            names.sort_unstable();
            names.dedup();
            names
        }
    }

    /* ------------------------------ Diagnostics ------------------------------ */

    /// A single syntax or validation problem.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Diagnostic {
        pub message: String,
        pub position: SourcePosition,
        pub file_name: String,
        /// The text of the offending source line, captured when the diagnostic was raised.
        pub source_line: String,
    }

    impl fmt::Display for Diagnostic {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&crate::diagnostics::render_snippet(
                &self.file_name,
                self.position,
                &self.message,
                &self.source_line,
            ))
        }
    }

    /// Non-fatal diagnostics collected over a whole validation pass, raised as one unit.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DiagnosticSet {
        pub diagnostics: Vec<Diagnostic>,
    }

    impl DiagnosticSet {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, diagnostic: Diagnostic) {
            self.diagnostics.push(diagnostic);
        }

        pub fn is_empty(&self) -> bool {
            self.diagnostics.is_empty()
        }

        pub fn len(&self) -> usize {
            self.diagnostics.len()
        }

        pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
            self.diagnostics.iter()
        }

        pub fn messages(&self) -> Vec<&str> {
            self.iter().map(|d| d.message.as_str()).collect()
        }
    }

    impl<'a> IntoIterator for &'a DiagnosticSet {
        type Item = &'a Diagnostic;
        type IntoIter = std::slice::Iter<'a, Diagnostic>;

        fn into_iter(self) -> Self::IntoIter {
            self.iter()
        }
    }

    impl fmt::Display for DiagnosticSet {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (idx, diagnostic) in self.iter().enumerate() {
                if idx > 0 {
                    writeln!(f)?;
                }
                write!(f, "{diagnostic}")?;
            }
            Ok(())
        }
    }

    impl std::error::Error for DiagnosticSet {}

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Why a schedule source could not be turned into a [`NormalizedSchedule`].
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ParseFailure {
        /// The text does not match the grammar; carries the classified diagnostic.
        #[error("{0}")]
        Syntax(Diagnostic),
        /// The text parsed but failed semantic validation.
        #[error("{0}")]
        Invalid(DiagnosticSet),
    }

    impl ParseFailure {
        pub fn diagnostics(&self) -> &[Diagnostic] {
            match self {
                ParseFailure::Syntax(diagnostic) => std::slice::from_ref(diagnostic),
                ParseFailure::Invalid(set) => &set.diagnostics,
            }
        }
    }
}

pub mod syntax {
    //! Grammar parser built on `nom`.
    //!
    //! Parsing strategy:
    //! - Comments are stripped and every line is trimmed; blank lines are separators.
    //! - The top level is a line-oriented state machine (metadata, first class, first day, body).
    //! - Each metadata, class and day line is matched with `nom` combinators; the first token
    //!   that fails decides the `SyntaxError` (no recovery).

    use crate::core::*;
    use chrono::{Month, NaiveDate, Weekday};
    use nom::{
        IResult, Offset,
        bytes::complete::take_while_m_n,
        character::complete::{alpha1, char, digit1, one_of},
        combinator::{eof, map_res, rest, verify},
        error::VerboseError,
        sequence::tuple,
    };
    use std::fmt;

    /* ------------------------------ Tree nodes ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyntaxTree {
        pub metadata: MetadataNode,
        pub classes: Vec<ClassNode>,
    }

    /// `date SEP date` on the first non-blank line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MetadataNode {
        pub start: DateNode,
        pub separator: Spanned<char>,
        pub end: DateNode,
        pub position: SourcePosition,
    }

    impl MetadataNode {
        /// Calendar dates of the range, if both are real dates.
        pub fn dates(&self) -> Option<(NaiveDate, NaiveDate)> {
            Some((self.start.to_date()?, self.end.to_date()?))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DateNode {
        pub day_of_month: Spanned<u32>,
        pub month: Spanned<Month>,
        pub year: Spanned<i32>,
        pub position: SourcePosition,
    }

    impl DateNode {
        pub fn to_date(&self) -> Option<NaiveDate> {
            NaiveDate::from_ymd_opt(
                self.year.value,
                self.month.value.number_from_month(),
                self.day_of_month.value,
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ClassNode {
        pub name: Spanned<String>,
        pub position: SourcePosition,
        pub days: Vec<DateDeclarationNode>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DateDeclarationNode {
        pub day_of_week: Spanned<Weekday>,
        pub day_of_month: Spanned<u32>,
        pub position: SourcePosition,
        pub tasks: Vec<TaskNode>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TaskNode {
        pub text: String,
        pub position: SourcePosition,
    }

    /* -------------------------------- Errors -------------------------------- */

    /// Grammar production being matched when parsing stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Production {
        Schedule,
        Line,
        Metadata,
        ClassDeclaration,
        DateDeclaration,
    }

    /// Grammar element the parser was looking for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Expected {
        Metadata,
        DayOfMonth,
        MonthName,
        Year,
        DateSeparator,
        /// The single space that separates two tokens on a line.
        Space,
        EndOfLine,
        ClassDeclaration,
        ClassMarker,
        ClassName,
        DateDeclaration,
        DayOfWeek,
        NonReservedLine,
    }

    /// Coarse class of the input found where parsing stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Found {
        EndOfInput,
        EndOfLine,
        Whitespace,
        Digit,
        Letter,
        Hash,
        Dash,
        Other,
    }

    impl Found {
        fn classify(rest: &str) -> Self {
            match rest.chars().next() {
                None => Found::EndOfLine,
                Some(c) if c.is_whitespace() => Found::Whitespace,
                Some(c) if c.is_ascii_digit() => Found::Digit,
                Some(c) if c.is_alphabetic() => Found::Letter,
                Some(CLASS_MARKER) => Found::Hash,
                Some(c) if DATE_SEPARATORS.contains(c) => Found::Dash,
                Some(_) => Found::Other,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error(
        "line {}, column {}: expected {expected} in {production}, found {found}",
        .position.line,
        .position.column
    )]
    pub struct SyntaxError {
        pub position: SourcePosition,
        pub production: Production,
        pub expected: Expected,
        pub found: Found,
    }

    impl SyntaxError {
        /// The parser state this error was raised in, independent of where in the file it
        /// happened. Two inputs failing with the same signature failed the same way.
        pub fn signature(&self) -> (Production, Expected, Found) {
            (self.production, self.expected, self.found)
        }
    }

    impl fmt::Display for Production {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Production::Schedule => "schedule",
                Production::Line => "line",
                Production::Metadata => "metadata",
                Production::ClassDeclaration => "class declaration",
                Production::DateDeclaration => "date declaration",
            })
        }
    }

    impl fmt::Display for Expected {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Expected::Metadata => "a date range",
                Expected::DayOfMonth => "a day of month",
                Expected::MonthName => "a month name",
                Expected::Year => "a four digit year",
                Expected::DateSeparator => "a dash between dates",
                Expected::Space => "a single space",
                Expected::EndOfLine => "end of line",
                Expected::ClassDeclaration => "a class declaration",
                Expected::ClassMarker => "'#'",
                Expected::ClassName => "a class name",
                Expected::DateDeclaration => "a date declaration",
                Expected::DayOfWeek => "a day of week",
                Expected::NonReservedLine => "a line other than YYYY-MM-DD:",
            })
        }
    }

    impl fmt::Display for Found {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Found::EndOfInput => "end of input",
                Found::EndOfLine => "end of line",
                Found::Whitespace => "whitespace",
                Found::Digit => "a digit",
                Found::Letter => "a letter",
                Found::Hash => "'#'",
                Found::Dash => "a dash",
                Found::Other => "a symbol",
            })
        }
    }

    /* ------------------------- Public entry points ------------------------- */

    /// Parse a whole schedule file into a syntax tree.
    pub fn parse(text: &str) -> Result<SyntaxTree, SyntaxError> {
        let mut state = State::Metadata;
        let mut metadata: Option<MetadataNode> = None;
        let mut classes: Vec<ClassNode> = Vec::new();

        for line in source_lines(text) {
            reject_reserved(&line)?;
            state = match state {
                State::Metadata => {
                    metadata = Some(parse_metadata_line(&line)?);
                    State::FirstClass
                }
                State::FirstClass => {
                    classes.push(parse_class_line(&line)?);
                    State::FirstDay
                }
                State::FirstDay => {
                    if !line.text.starts_with(DAY_MARKER) {
                        return Err(line.error_at(
                            line.text,
                            Production::ClassDeclaration,
                            Expected::DateDeclaration,
                        ));
                    }
                    let day = parse_date_line(&line)?;
                    if let Some(class) = classes.last_mut() {
                        class.days.push(day);
                    }
                    State::Body
                }
                State::Body => {
                    if line.text.starts_with(CLASS_MARKER) {
                        classes.push(parse_class_line(&line)?);
                        State::FirstDay
                    } else if line.text.starts_with(DAY_MARKER) {
                        let day = parse_date_line(&line)?;
                        if let Some(class) = classes.last_mut() {
                            class.days.push(day);
                        }
                        State::Body
                    } else {
                        let task = TaskNode {
                            text: line.text.to_string(),
                            position: line.span(line.text),
                        };
                        if let Some(day) = classes.last_mut().and_then(|c| c.days.last_mut()) {
                            day.tasks.push(task);
                        }
                        State::Body
                    }
                }
            };
        }

        let at_end = |production, expected| SyntaxError {
            position: end_of_input(text),
            production,
            expected,
            found: Found::EndOfInput,
        };
        match (state, metadata) {
            (State::Body, Some(metadata)) => Ok(SyntaxTree { metadata, classes }),
            (State::FirstClass, Some(_)) => {
                Err(at_end(Production::Schedule, Expected::ClassDeclaration))
            }
            (State::FirstDay, Some(_)) => Err(at_end(
                Production::ClassDeclaration,
                Expected::DateDeclaration,
            )),
            _ => Err(at_end(Production::Schedule, Expected::Metadata)),
        }
    }

    /// Parse only the metadata line of a schedule file.
    pub fn parse_header(text: &str) -> Result<MetadataNode, SyntaxError> {
        match source_lines(text).first() {
            Some(line) => {
                reject_reserved(line)?;
                parse_metadata_line(line)
            }
            None => Err(SyntaxError {
                position: end_of_input(text),
                production: Production::Schedule,
                expected: Expected::Metadata,
                found: Found::EndOfInput,
            }),
        }
    }

    /* ------------------------------- Lines ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Metadata,
        FirstClass,
        FirstDay,
        Body,
    }

    /// A non-blank source line with its comment removed and surrounding whitespace trimmed.
    struct SourceLine<'a> {
        number: usize,
        text: &'a str,
        /// Characters of the raw line that precede `text`.
        indent: usize,
    }

    /// Where a line-level parser stopped and what it wanted there.
    struct Stuck<'a> {
        at: &'a str,
        expected: Expected,
    }

    impl<'a> SourceLine<'a> {
        fn column_of(&self, rest: &'a str) -> usize {
            let consumed = self.text.offset(rest).min(self.text.len());
            self.indent + self.text[..consumed].chars().count() + 1
        }

        fn span(&self, piece: &'a str) -> SourcePosition {
            let column = self.column_of(piece);
            SourcePosition::new(self.number, column, Some(column + piece.chars().count()))
        }

        fn span_between(&self, first: &'a str, last: &'a str) -> SourcePosition {
            let column = self.column_of(first);
            let end = self.column_of(last) + last.chars().count();
            SourcePosition::new(self.number, column, Some(end))
        }

        fn error_at(&self, at: &'a str, production: Production, expected: Expected) -> SyntaxError {
            let column = self.column_of(at);
            let token = at
                .find(char::is_whitespace)
                .map_or(at, |end| &at[..end.max(at.chars().next().map_or(0, char::len_utf8))]);
            let end_column = if token.is_empty() {
                None
            } else {
                Some(column + token.chars().count())
            };
            SyntaxError {
                position: SourcePosition::new(self.number, column, end_column),
                production,
                expected,
                found: Found::classify(at),
            }
        }

        fn stuck(&self, production: Production) -> impl Fn(Stuck<'a>) -> SyntaxError + '_ {
            move |stuck| self.error_at(stuck.at, production, stuck.expected)
        }
    }

    fn source_lines(text: &str) -> Vec<SourceLine<'_>> {
        text.lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let content = match raw.find(COMMENT_MARKER) {
                    Some(at) => &raw[..at],
                    None => raw,
                };
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    return None;
                }
                let indent = content[..content.offset(trimmed)].chars().count();
                Some(SourceLine {
                    number: idx + 1,
                    text: trimmed,
                    indent,
                })
            })
            .collect()
    }

    fn end_of_input(text: &str) -> SourcePosition {
        match text.lines().enumerate().last() {
            Some((idx, last)) => SourcePosition::point(idx + 1, last.chars().count() + 1),
            None => SourcePosition::point(1, 1),
        }
    }

    /// `YYYY-MM-DD:` lines are what rendered output uses as day headers; they are never
    /// accepted as input.
    fn reject_reserved(line: &SourceLine<'_>) -> Result<(), SyntaxError> {
        let reserved: PResult<'_, _> = tuple((
            digits(4),
            char('-'),
            digits(2),
            char('-'),
            digits(2),
            char(':'),
            eof,
        ))(line.text);
        match reserved {
            Ok(_) => Err(line.error_at(line.text, Production::Line, Expected::NonReservedLine)),
            Err(_) => Ok(()),
        }
    }

    /* ---------------------------- Line parsers ---------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Run one grammar element, reporting the innermost failure position as `expected`.
    fn step<'a, O, F>(input: &'a str, expected: Expected, mut parser: F) -> Result<(&'a str, O), Stuck<'a>>
    where
        F: FnMut(&'a str) -> PResult<'a, O>,
    {
        parser(input).map_err(|err| {
            let at = match err {
                nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                    ve.errors.first().map(|(frag, _)| *frag).unwrap_or(input)
                }
                nom::Err::Incomplete(_) => input,
            };
            Stuck { at, expected }
        })
    }

    /// Exactly one space between two tokens.
    ///
    /// Reaching the end of the line means the `next` token is missing; anything else that is
    /// not a single space (nothing, a tab, a second space) is a spacing error.
    fn space<'a>(input: &'a str, next: Expected) -> Result<&'a str, Stuck<'a>> {
        let parsed: PResult<'a, char> = char(' ')(input);
        match parsed {
            Ok((rest, _)) if rest.starts_with(char::is_whitespace) => Err(Stuck {
                at: rest,
                expected: Expected::Space,
            }),
            Ok((rest, _)) => Ok(rest),
            Err(_) if input.is_empty() => Err(Stuck {
                at: input,
                expected: next,
            }),
            Err(_) => Err(Stuck {
                at: input,
                expected: Expected::Space,
            }),
        }
    }

    fn parse_metadata_line(line: &SourceLine<'_>) -> Result<MetadataNode, SyntaxError> {
        let i = line.text;
        let (i, start) = date_tokens(line, i).map_err(line.stuck(Production::Metadata))?;
        let (i, separator) = space(i, Expected::DateSeparator)
            .and_then(|i| {
                step(
                    i,
                    Expected::DateSeparator,
                    spanned_char(one_of(DATE_SEPARATORS)),
                )
            })
            .map_err(line.stuck(Production::Metadata))?;
        let (i, end) = space(i, Expected::DayOfMonth)
            .and_then(|i| date_tokens(line, i))
            .map_err(line.stuck(Production::Metadata))?;
        step(i, Expected::EndOfLine, eof).map_err(line.stuck(Production::Metadata))?;

        let (sep_text, sep_char) = separator;
        Ok(MetadataNode {
            start,
            separator: Spanned::new(sep_char, line.span(sep_text)),
            end,
            position: line.span(line.text),
        })
    }

    fn date_tokens<'a>(line: &SourceLine<'a>, i: &'a str) -> Result<(&'a str, DateNode), Stuck<'a>> {
        let (i, (day_text, day)) = step(i, Expected::DayOfMonth, day_of_month)?;
        let i = space(i, Expected::MonthName)?;
        let (i, (month_text, month)) = step(i, Expected::MonthName, month_name)?;
        let i = space(i, Expected::Year)?;
        let (i, (year_text, year)) = step(i, Expected::Year, year)?;
        Ok((
            i,
            DateNode {
                day_of_month: Spanned::new(day, line.span(day_text)),
                month: Spanned::new(month, line.span(month_text)),
                year: Spanned::new(year, line.span(year_text)),
                position: line.span_between(day_text, year_text),
            },
        ))
    }

    fn parse_class_line(line: &SourceLine<'_>) -> Result<ClassNode, SyntaxError> {
        let parsed = step(line.text, Expected::ClassMarker, char(CLASS_MARKER))
            .and_then(|(i, _)| space(i, Expected::ClassName))
            .and_then(|i| step(i, Expected::ClassName, class_name));
        let (_, name) = parsed.map_err(line.stuck(Production::ClassDeclaration))?;
        Ok(ClassNode {
            name: Spanned::new(name.to_string(), line.span(name)),
            position: line.span(line.text),
            days: Vec::new(),
        })
    }

    fn parse_date_line(line: &SourceLine<'_>) -> Result<DateDeclarationNode, SyntaxError> {
        let i = line.text;
        let parsed = step(i, Expected::DateDeclaration, char(DAY_MARKER))
            .and_then(|(i, _)| space(i, Expected::DayOfWeek))
            .and_then(|i| step(i, Expected::DayOfWeek, day_of_week))
            .and_then(|(i, weekday)| {
                let i = space(i, Expected::DayOfMonth)?;
                let (i, dom) = step(i, Expected::DayOfMonth, day_of_month)?;
                let (i, _) = step(i, Expected::EndOfLine, eof)?;
                Ok((i, (weekday, dom)))
            });
        let (_, ((weekday_text, weekday), (dom_text, dom))) =
            parsed.map_err(line.stuck(Production::DateDeclaration))?;
        Ok(DateDeclarationNode {
            day_of_week: Spanned::new(weekday, line.span(weekday_text)),
            day_of_month: Spanned::new(dom, line.span(dom_text)),
            position: line.span(line.text),
            tasks: Vec::new(),
        })
    }

    /* ------------------------------- Tokens ------------------------------- */

    fn day_of_month(i: &str) -> PResult<'_, (&str, u32)> {
        map_res(digit1, |digits: &str| {
            let value: u32 = digits.parse().map_err(|_| "day of month is not a number")?;
            if digits.len() <= 2 && (1..=31).contains(&value) {
                Ok((digits, value))
            } else {
                Err("day of month out of range")
            }
        })(i)
    }

    fn month_name(i: &str) -> PResult<'_, (&str, Month)> {
        map_res(alpha1, |word: &str| {
            month_from_name(word)
                .map(|month| (word, month))
                .ok_or("unknown month name")
        })(i)
    }

    fn year(i: &str) -> PResult<'_, (&str, i32)> {
        map_res(digit1, |digits: &str| {
            if digits.len() != 4 {
                return Err("year must have four digits");
            }
            digits
                .parse::<i32>()
                .map(|value| (digits, value))
                .map_err(|_| "year is not a number")
        })(i)
    }

    fn day_of_week(i: &str) -> PResult<'_, (&str, Weekday)> {
        map_res(alpha1, |word: &str| {
            weekday_from_abbreviation(word)
                .map(|day| (word, day))
                .ok_or("unknown day of week")
        })(i)
    }

    fn class_name(i: &str) -> PResult<'_, &str> {
        verify(rest, |name: &str| {
            !name.is_empty()
                && !name.starts_with(CLASS_MARKER)
                && !name.starts_with(char::is_whitespace)
        })(i)
    }

    fn digits(count: usize) -> impl Fn(&str) -> PResult<'_, &str> {
        move |i: &str| take_while_m_n(count, count, |c: char| c.is_ascii_digit())(i)
    }

    /// Wrap a single-character parser so the matched slice is returned alongside the char.
    fn spanned_char<'a, F>(mut parser: F) -> impl FnMut(&'a str) -> PResult<'a, (&'a str, char)>
    where
        F: FnMut(&'a str) -> PResult<'a, char>,
    {
        move |i: &'a str| {
            let (rest, c) = parser(i)?;
            Ok((rest, (&i[..c.len_utf8()], c)))
        }
    }

}

pub mod transform {
    //! Lowers a [`SyntaxTree`] into the typed intermediate schedule.
    //!
    //! Weekdays become 0..=6 (Monday = 0) and months 1..=12; every token keeps its position.
    //! No calendar date is computed here.

    use crate::core::{SourcePosition, Spanned};
    use crate::syntax::{ClassNode, DateDeclarationNode, DateNode, SyntaxTree, TaskNode};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct IntermediateSchedule {
        pub metadata: MetadataDecl,
        pub classes: Vec<ClassDecl>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MetadataDecl {
        pub start_date: DateTokens,
        pub end_date: DateTokens,
        pub position: SourcePosition,
    }

    /// A `<day> <Month> <year>` date kept as separate positioned values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DateTokens {
        pub day: Spanned<u32>,
        pub month: Spanned<u32>,
        pub year: Spanned<i32>,
        pub position: SourcePosition,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ClassDecl {
        pub name: Spanned<String>,
        pub position: SourcePosition,
        pub days: Vec<DayDecl>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DayDecl {
        pub weekday: Spanned<u32>,
        pub day_of_month: Spanned<u32>,
        pub position: SourcePosition,
        pub tasks: Vec<TaskDecl>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TaskDecl {
        pub text: String,
        pub position: SourcePosition,
    }

    pub fn transform(tree: SyntaxTree) -> IntermediateSchedule {
        let SyntaxTree { metadata, classes } = tree;
        IntermediateSchedule {
            metadata: MetadataDecl {
                start_date: date_tokens(&metadata.start),
                end_date: date_tokens(&metadata.end),
                position: metadata.position,
            },
            classes: classes.into_iter().map(class_decl).collect(),
        }
    }

    fn date_tokens(node: &DateNode) -> DateTokens {
        DateTokens {
            day: node.day_of_month,
            month: node.month.map(|month| month.number_from_month()),
            year: node.year,
            position: node.position,
        }
    }

    fn class_decl(node: ClassNode) -> ClassDecl {
        ClassDecl {
            name: node.name,
            position: node.position,
            days: node.days.into_iter().map(day_decl).collect(),
        }
    }

    fn day_decl(node: DateDeclarationNode) -> DayDecl {
        DayDecl {
            weekday: node
                .day_of_week
                .map(|weekday| weekday.num_days_from_monday()),
            day_of_month: node.day_of_month,
            position: node.position,
            tasks: node
                .tasks
                .into_iter()
                .map(|TaskNode { text, position }| TaskDecl { text, position })
                .collect(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::syntax::parse;

        #[test]
        fn maps_weekdays_and_months_to_numbers() {
            let tree = parse("30 December 2024 - 5 January 2025\n# Art\n- Sun 5\nPaint\n")
                .expect("parse");
            let schedule = transform(tree);

            assert_eq!(schedule.metadata.start_date.month.value, 12);
            assert_eq!(schedule.metadata.end_date.month.value, 1);
            assert_eq!(schedule.metadata.end_date.year.value, 2025);

            let day = &schedule.classes[0].days[0];
            assert_eq!(day.weekday.value, 6);
            assert_eq!(day.day_of_month.value, 5);
            assert_eq!(day.weekday.position, SourcePosition::new(3, 3, Some(6)));
            assert_eq!(day.tasks[0].text, "Paint");
        }
    }
}

pub mod validate {
    //! Semantic validation: resolves calendar dates, checks weekday agreement, range membership,
    //! uniqueness and completeness, and assembles the day-major schedule.
    //!
    //! Fatal problems (bad metadata dates, backwards or over-long range) stop immediately with a
    //! single diagnostic. Everything else is collected so one pass reports every problem.

    use crate::core::*;
    use crate::transform::{DateTokens, IntermediateSchedule};
    use chrono::{Datelike, NaiveDate};
    use std::collections::{BTreeMap, BTreeSet, HashSet};

    pub fn validate(
        schedule: &IntermediateSchedule,
        source_text: &str,
        file_name: &str,
    ) -> Result<NormalizedSchedule, DiagnosticSet> {
        let reporter = Reporter::new(source_text, file_name);
        let metadata = &schedule.metadata;

        let start = resolve_metadata_date(&metadata.start_date, "start", &reporter)?;
        let end = resolve_metadata_date(&metadata.end_date, "end", &reporter)?;
        if start > end {
            return Err(reporter.fatal(
                "end date cannot be before start date",
                metadata.end_date.position,
            ));
        }
        if !span_is_valid(start, end) {
            return Err(reporter.fatal(
                "date range cannot span more than one month boundary",
                metadata.position,
            ));
        }

        let required: BTreeSet<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();
        let mut errors = DiagnosticSet::new();
        let mut seen_classes: HashSet<&str> = HashSet::new();
        let mut assembled: BTreeMap<NaiveDate, BTreeMap<&str, Vec<String>>> = BTreeMap::new();

        for class in &schedule.classes {
            let name = class.name.value.as_str();
            if !seen_classes.insert(name) {
                errors.push(reporter.diagnostic(
                    format!("duplicate class declaration: \"{name}\""),
                    class.name.position,
                ));
            }

            let mut declared: BTreeSet<NaiveDate> = BTreeSet::new();
            for day in &class.days {
                let dom = day.day_of_month.value;
                let (year, month) = candidate_month(start, end, dom);
                let Some(date) = NaiveDate::from_ymd_opt(year, month, dom) else {
                    errors.push(reporter.diagnostic(
                        format!("{dom} {} {year} is not a valid date", month_name(month)),
                        day.day_of_month.position,
                    ));
                    continue;
                };

                let actual = date.weekday().num_days_from_monday();
                if actual != day.weekday.value {
                    errors.push(reporter.diagnostic(
                        format!(
                            "day of week \"{}\" does not match date \"{date}\" ({})",
                            weekday_name(day.weekday.value),
                            weekday_name(actual),
                        ),
                        day.weekday.position,
                    ));
                }
                if date < start || date > end {
                    errors.push(reporter.diagnostic(
                        format!("date {date} is not in schedule range {start} to {end}"),
                        day.position,
                    ));
                }
                if !declared.insert(date) {
                    errors.push(reporter.diagnostic(
                        format!("duplicate class day: \"{date}\""),
                        day.position,
                    ));
                }

                assembled
                    .entry(date)
                    .or_default()
                    .entry(name)
                    .or_default()
                    .extend(day.tasks.iter().map(|task| task.text.clone()));
            }

            let missing: Vec<String> = required
                .difference(&declared)
                .map(NaiveDate::to_string)
                .collect();
            if !missing.is_empty() {
                errors.push(reporter.diagnostic(
                    format!("{name} is missing {}", missing.join(", ")),
                    class.name.position,
                ));
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(NormalizedSchedule {
            start_date: start,
            end_date: end,
            days: assembled
                .into_iter()
                .map(|(date, classes)| ScheduleDay {
                    date,
                    classes: classes
                        .into_iter()
                        .map(|(name, tasks)| ClassTasks {
                            name: name.to_string(),
                            tasks,
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    /// Month and year a bare day-of-month belongs to inside `[start, end]`.
    ///
    /// Days on or after the start day belong to the start month; earlier days wrap into the end
    /// month. Ranges inside one month (or one year) never wrap that component.
    pub fn candidate_month(start: NaiveDate, end: NaiveDate, day_of_month: u32) -> (i32, u32) {
        let in_start = day_of_month >= start.day();
        let month = if start.month() == end.month() || in_start {
            start.month()
        } else {
            end.month()
        };
        let year = if start.year() == end.year() || in_start {
            start.year()
        } else {
            end.year()
        };
        (year, month)
    }

    /// A range may stay inside one month, or cross exactly one boundary into an earlier day
    /// of the following month.
    fn span_is_valid(start: NaiveDate, end: NaiveDate) -> bool {
        let month_index = |d: NaiveDate| i64::from(d.year()) * 12 + i64::from(d.month0());
        match month_index(end) - month_index(start) {
            0 => true,
            1 => end.day() < start.day(),
            _ => false,
        }
    }

    fn resolve_metadata_date(
        tokens: &DateTokens,
        which: &str,
        reporter: &Reporter<'_>,
    ) -> Result<NaiveDate, DiagnosticSet> {
        NaiveDate::from_ymd_opt(tokens.year.value, tokens.month.value, tokens.day.value).ok_or_else(
            || {
                reporter.fatal(
                    &format!(
                        "invalid {which} date: {} {} {} is not a calendar date",
                        tokens.day.value,
                        month_name(tokens.month.value),
                        tokens.year.value
                    ),
                    tokens.position,
                )
            },
        )
    }

    /// Builds diagnostics that carry the offending source line.
    struct Reporter<'a> {
        lines: Vec<&'a str>,
        file_name: &'a str,
    }

    impl<'a> Reporter<'a> {
        fn new(source_text: &'a str, file_name: &'a str) -> Self {
            Self {
                lines: source_text.lines().collect(),
                file_name,
            }
        }

        fn diagnostic(&self, message: String, position: SourcePosition) -> Diagnostic {
            let source_line = self
                .lines
                .get(position.line.saturating_sub(1))
                .copied()
                .unwrap_or_default();
            Diagnostic {
                message,
                position,
                file_name: self.file_name.to_string(),
                source_line: source_line.to_string(),
            }
        }

        fn fatal(&self, message: &str, position: SourcePosition) -> DiagnosticSet {
            DiagnosticSet {
                diagnostics: vec![self.diagnostic(message.to_string(), position)],
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::{syntax::parse, transform::transform};

        fn check(text: &str) -> Result<NormalizedSchedule, DiagnosticSet> {
            let tree = parse(text).expect("parse");
            validate(&transform(tree), text, "test.ptsched")
        }

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("date")
        }

        const FULL_WEEK: &str = "29 January 2024 - 4 February 2024\n\n\
            # Science\n- Mon 29\nLab report\n- Tue 30\n- Wed 31\n- Thu 1\n- Fri 2\n- Sat 3\n- Sun 4\n\n\
            # Math\n- Mon 29\nProblem set 1\nProblem set 2\n- Tue 30\n- Wed 31\n- Thu 1\nQuiz\n- Fri 2\n- Sat 3\n- Sun 4\n";

        #[test]
        fn complete_range_produces_every_day_sorted() {
            let schedule = check(FULL_WEEK).expect("valid");
            assert_eq!(schedule.start_date, date(2024, 1, 29));
            assert_eq!(schedule.end_date, date(2024, 2, 4));
            assert_eq!(schedule.days.len(), 7);
            assert!(schedule.days.windows(2).all(|w| w[0].date < w[1].date));

            let monday = schedule.day(date(2024, 1, 29)).expect("monday");
            let names: Vec<&str> = monday.classes.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, ["Math", "Science"]);
            assert_eq!(monday.classes[0].tasks, ["Problem set 1", "Problem set 2"]);

            let thursday = schedule.day(date(2024, 2, 1)).expect("thursday");
            assert_eq!(thursday.classes[0].tasks, ["Quiz"]);
            assert!(thursday.classes[1].tasks.is_empty());
        }

        #[test]
        fn range_may_cross_year_boundary() {
            let text = "30 December 2024 - 5 January 2025\n# A\n- Mon 30\n- Tue 31\n- Wed 1\n- Thu 2\n- Fri 3\n- Sat 4\n- Sun 5\n";
            let schedule = check(text).expect("valid");
            assert_eq!(schedule.days.len(), 7);
            assert_eq!(schedule.days[6].date, date(2025, 1, 5));
        }

        #[test]
        fn backwards_range_is_single_fatal_diagnostic() {
            let text = "7 January 2024 - 1 January 2024\n\n# Math\n\n- Mon 1\n";
            let errors = check(text).unwrap_err();
            assert_eq!(errors.messages(), ["end date cannot be before start date"]);
            assert_eq!(
                errors.diagnostics[0].position,
                SourcePosition::new(1, 18, Some(32))
            );
            assert_eq!(errors.diagnostics[0].source_line, "7 January 2024 - 1 January 2024");
        }

        #[test]
        fn over_long_range_is_fatal() {
            for text in [
                "1 January 2024 - 1 February 2024\n# A\n- Mon 1\n",
                "1 January 2024 - 1 March 2024\n# A\n- Mon 1\n",
                "1 January 2024 - 1 January 2025\n# A\n- Mon 1\n",
            ] {
                let errors = check(text).unwrap_err();
                assert_eq!(
                    errors.messages(),
                    ["date range cannot span more than one month boundary"],
                    "{text}"
                );
            }
        }

        #[test]
        fn impossible_metadata_date_is_fatal() {
            let errors = check("31 February 2024 - 1 March 2024\n# A\n- Fri 1\n").unwrap_err();
            assert_eq!(errors.len(), 1);
            assert!(errors.diagnostics[0].message.starts_with("invalid start date"));
        }

        #[test]
        fn weekday_mismatch_names_both_days_and_keeps_going() {
            let text = "1 January 2024 - 2 January 2024\n# A\n- Tue 1\n- Wed 2\n";
            let errors = check(text).unwrap_err();
            assert_eq!(
                errors.messages(),
                [
                    "day of week \"Tuesday\" does not match date \"2024-01-01\" (Monday)",
                    "day of week \"Wednesday\" does not match date \"2024-01-02\" (Tuesday)",
                ]
            );
            assert_eq!(errors.diagnostics[0].position, SourcePosition::new(3, 3, Some(6)));
        }

        #[test]
        fn missing_days_listed_once_per_class() {
            let text = "1 January 2024 - 7 January 2024\n\n# Math\n\n- Mon 1\nRead ch.1\n";
            let errors = check(text).unwrap_err();
            assert_eq!(
                errors.messages(),
                ["Math is missing 2024-01-02, 2024-01-03, 2024-01-04, 2024-01-05, 2024-01-06, 2024-01-07"]
            );
        }

        #[test]
        fn duplicates_and_out_of_range_days_are_reported() {
            let text = "1 January 2024 - 2 January 2024\n# A\n- Mon 1\n- Tue 2\n- Mon 1\n# A\n- Mon 1\n- Tue 2\n- Wed 3\n";
            let errors = check(text).unwrap_err();
            assert_eq!(
                errors.messages(),
                [
                    "duplicate class day: \"2024-01-01\"",
                    "duplicate class declaration: \"A\"",
                    "date 2024-01-03 is not in schedule range 2024-01-01 to 2024-01-02",
                ]
            );
        }

        #[test]
        fn impossible_day_is_reported_and_skipped() {
            let text = "1 April 2024 - 1 April 2024\n# A\n- Mon 1\n- Sun 31\n";
            let errors = check(text).unwrap_err();
            assert_eq!(errors.messages(), ["31 April 2024 is not a valid date"]);
        }

        #[test]
        fn candidate_month_wraps_after_boundary() {
            let start = date(2024, 12, 30);
            let end = date(2025, 1, 5);
            assert_eq!(candidate_month(start, end, 31), (2024, 12));
            assert_eq!(candidate_month(start, end, 2), (2025, 1));
        }
    }
}

pub mod diagnostics {
    //! Snippet rendering and syntax-error classification.

    use crate::core::{Diagnostic, SourcePosition};
    use crate::syntax::{self, SyntaxError};

    pub const UNEXPECTED_INPUT: &str = "Unexpected input.";

    /// A named family of syntax errors and bad inputs that reproduce it.
    #[derive(Debug, Clone, Copy)]
    pub struct Category {
        pub name: &'static str,
        pub examples: &'static [&'static str],
    }

    /// Checked in order; the first category whose example fails the same way wins.
    pub const CATEGORIES: &[Category] = &[
        Category {
            name: "Empty schedule",
            examples: &["", "   ", "\n\n\n"],
        },
        Category {
            name: "No metadata",
            examples: &["\n# Class A\n\n- Tue 20\n", "\n- Tue 20\n"],
        },
        Category {
            name: "Reserved date line",
            examples: &["2024-01-20:\n", "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Sat 20\n2024-01-20:\n"],
        },
        Category {
            name: "Missing required newlines",
            examples: &["1 January 2024 - 31 January 2024# Class A\n- Tue 20\n"],
        },
        Category {
            name: "Missing dash in metadata",
            examples: &[
                "1 January 2024 31 January 2024\n\n# Class A\n\n- Tue 20\n",
                "1 January 2024\n\n# Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Invalid whitespace in metadata",
            examples: &[
                "1  January  2024  -  31  January  2024\n\n# Class A\n\n- Tue 20\n",
                "1\tJanuary\t2024\t-\t31\tJanuary\t2024\n\n# Class A\n\n- Wed 21\n",
                "1 January 2024 -  31 January 2024\n\n# Class A\n\n- Wed 21\n",
            ],
        },
        Category {
            name: "Missing space in metadata",
            examples: &[
                "1 January 2024 -31 January 2024\n\n# Class A\n\n- Tue 20\n",
                "1 January 2024-31 January 2024\n\n# Class A\n\n- Tue 20\n",
                "1January 2024 - 31 January 2024\n\n# Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Invalid date format in metadata",
            examples: &[
                "January 1 2024 - February 1 2024\n\n# Class A\n\n- Tue 20\n",
                "1/1/2024 - 2/1/2024\n\n# Class A\n\n- Tue 20\n",
                "32 January 2024 - 1 February 2024\n\n# Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Incomplete metadata dates",
            examples: &[
                "1 January - 31 January 2024\n\n# Class A\n\n- Tue 20\n",
                "1 January 2024 - 31 January\n\n# Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Invalid month name",
            examples: &[
                "1 Janvier 2024 - 1 February 2024\n\n# Class A\n\n- Tue 20\n",
                "1 Janaury 2024 - 1 February 2024\n\n# Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Invalid year format",
            examples: &[
                "1 January 24 - 1 February 2024\n\n# Class A\n\n- Tue 20\n",
                "1 January 202 - 1 February 2024\n\n# Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Only metadata, no body",
            examples: &["1 January 2024 - 31 January 2024", "15 February 2024 - 20 February 2024\n\n"],
        },
        Category {
            name: "Missing class declaration hash",
            examples: &[
                "1 January 2024 - 31 January 2024\n\nClass A\n\n- Tue 20\n",
                "1 January 2024 - 31 January 2024\n\n Class A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Missing class name",
            examples: &["1 January 2024 - 31 January 2024\n\n#\n\n- Tue 20\n"],
        },
        Category {
            name: "Multiple consecutive hashes",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n## Class A\n\n- Tue 20\n",
                "1 January 2024 - 31 January 2024\n\n# # Class A\n\n- Wed 21\n",
            ],
        },
        Category {
            name: "Missing space in class declaration",
            examples: &["1 January 2024 - 31 January 2024\n\n#Class A\n\n- Tue 20\n"],
        },
        Category {
            name: "Invalid whitespace in class declaration",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n#  Class A\n\n- Tue 20\n",
                "1 January 2024 - 31 January 2024\n\n#\tClass A\n\n- Tue 20\n",
            ],
        },
        Category {
            name: "Class with no days",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n# Class B\n\n- Wed 21\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n",
            ],
        },
        Category {
            name: "Missing day declaration dash",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\nTue 20\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n Tue 20\n",
            ],
        },
        Category {
            name: "Multiple consecutive dashes",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n-- Tue 20\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- - Wed 21\n",
            ],
        },
        Category {
            name: "Missing space in date declaration",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n-Tue 20\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Tue20\n",
            ],
        },
        Category {
            name: "Invalid whitespace in date declaration",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Tue  20\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n-\tTue 20\n",
            ],
        },
        Category {
            name: "Invalid day of week",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Tues 20\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Wenesday 20\n",
            ],
        },
        Category {
            name: "Missing day of month in date declaration",
            examples: &["1 January 2024 - 31 January 2024\n\n# Class A\n\n- Fri\n"],
        },
        Category {
            name: "Invalid day of month",
            examples: &[
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Tue 32\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Wed 0\n",
                "1 January 2024 - 31 January 2024\n\n# Class A\n\n- Thu 100\n",
            ],
        },
    ];

    /// Name of the first category whose examples fail with the same signature as `error`.
    pub fn classify(error: &SyntaxError) -> Option<&'static str> {
        let signature = error.signature();
        CATEGORIES
            .iter()
            .find(|category| {
                category.examples.iter().any(|example| {
                    matches!(syntax::parse(example), Err(other) if other.signature() == signature)
                })
            })
            .map(|category| category.name)
    }

    /// Classified diagnostic for a syntax error in `source_text`.
    pub fn syntax_diagnostic(error: &SyntaxError, source_text: &str, file_name: &str) -> Diagnostic {
        let message = classify(error).unwrap_or(UNEXPECTED_INPUT);
        let source_line = source_text
            .lines()
            .nth(error.position.line.saturating_sub(1))
            .unwrap_or_default();
        Diagnostic {
            message: message.to_string(),
            position: error.position,
            file_name: file_name.to_string(),
            source_line: source_line.to_string(),
        }
    }

    /// `<file>:<line> - <message>`, the source line, and a caret underline.
    pub fn format(diagnostic: &Diagnostic, source_text: &str) -> String {
        let line = source_text
            .lines()
            .nth(diagnostic.position.line.saturating_sub(1))
            .unwrap_or(&diagnostic.source_line);
        render_snippet(
            &diagnostic.file_name,
            diagnostic.position,
            &diagnostic.message,
            line,
        )
    }

    pub fn render_snippet(
        file_name: &str,
        position: SourcePosition,
        message: &str,
        source_line: &str,
    ) -> String {
        format!(
            "{file_name}:{} - {message}\n{source_line}\n{}",
            position.line,
            caret_line(source_line, position)
        )
    }

    /// Carets under `[column, end_column)`; tabs before the span are kept so the carets line up.
    pub fn caret_line(source_line: &str, position: SourcePosition) -> String {
        let chars: Vec<char> = source_line.chars().collect();
        let prefix: String = (0..position.column.saturating_sub(1))
            .map(|idx| match chars.get(idx) {
                Some('\t') => '\t',
                _ => ' ',
            })
            .collect();
        let width = position
            .end_column
            .map_or(1, |end| end.saturating_sub(position.column).max(1));
        format!("{prefix}{}", "^".repeat(width))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn classify_text(text: &str) -> &'static str {
            let err = syntax::parse(text).expect_err("syntax error");
            classify(&err).unwrap_or(UNEXPECTED_INPUT)
        }

        #[test]
        fn every_example_classifies_as_its_own_category() {
            for category in CATEGORIES {
                for example in category.examples {
                    assert_eq!(classify_text(example), category.name, "{example:?}");
                }
            }
        }

        #[test]
        fn unseen_inputs_match_by_failure_shape() {
            assert_eq!(
                classify_text("3 Mars 2024 - 9 March 2024\n# A\n- Sun 3\n"),
                "Invalid month name"
            );
            assert_eq!(
                classify_text("1 May 2024 - 2 May 2024\n# Biology\n- Wed 1\n- Thursday 2\n"),
                "Invalid day of week"
            );
            assert_eq!(classify_text("\n\n   \n"), "Empty schedule");
        }

        #[test]
        fn spacing_mistakes_are_named() {
            let body = "\n# A\n- Wed 1\n";
            for (header, expected) in [
                ("1 May 2024 -1 May 2024", "Missing space in metadata"),
                ("1 May 2024-1 May 2024", "Missing space in metadata"),
                ("1 May 2024 -  1 May 2024", "Invalid whitespace in metadata"),
                ("1 May  2024 - 1 May 2024", "Invalid whitespace in metadata"),
            ] {
                assert_eq!(classify_text(&format!("{header}{body}")), expected, "{header}");
            }

            for (day, expected) in [
                ("-Wed 1", "Missing space in date declaration"),
                ("- Wed1", "Missing space in date declaration"),
                ("- Wed  1", "Invalid whitespace in date declaration"),
                ("-  Wed 1", "Invalid whitespace in date declaration"),
                ("-- Wed 1", "Multiple consecutive dashes"),
            ] {
                let text = format!("1 May 2024 - 1 May 2024\n# A\n{day}\n");
                assert_eq!(classify_text(&text), expected, "{day}");
            }

            assert_eq!(
                classify_text("1 May 2024 - 1 May 2024\n#A\n- Wed 1\n"),
                "Missing space in class declaration"
            );
        }

        #[test]
        fn unknown_shape_falls_back() {
            assert_eq!(
                classify_text("1 May 2024 - 2 May 2024\n# A\n- Wed 1x\n"),
                UNEXPECTED_INPUT
            );
        }

        #[test]
        fn snippet_underlines_span() {
            let diagnostic = Diagnostic {
                message: "end date cannot be before start date".into(),
                position: SourcePosition::new(1, 18, Some(32)),
                file_name: "week.ptsched".into(),
                source_line: String::new(),
            };
            let text = "7 January 2024 - 1 January 2024\n\n# Math\n";
            assert_eq!(
                format(&diagnostic, text),
                format!(
                    "week.ptsched:1 - end date cannot be before start date\n7 January 2024 - 1 January 2024\n{}{}",
                    " ".repeat(17),
                    "^".repeat(14)
                )
            );
        }

        #[test]
        fn caret_keeps_tabs_and_defaults_to_one() {
            let line = "\t\tRead";
            assert_eq!(caret_line(line, SourcePosition::point(1, 3)), "\t\t^");
            assert_eq!(
                caret_line(line, SourcePosition::new(1, 3, Some(7))),
                "\t\t^^^^"
            );
        }

        #[test]
        fn syntax_diagnostic_captures_line() {
            let text = "1 May 2024 - 1 May 2024\n\n# A\n\n- Wed 40\n";
            let err = syntax::parse(text).expect_err("syntax error");
            let diagnostic = syntax_diagnostic(&err, text, "a.ptsched");
            assert_eq!(diagnostic.message, "Invalid day of month");
            assert_eq!(diagnostic.source_line, "- Wed 40");
            assert_eq!(
                diagnostic.to_string(),
                "a.ptsched:5 - Invalid day of month\n- Wed 40\n      ^^"
            );
        }
    }
}

pub mod render {
    //! Text renderings of a [`NormalizedSchedule`], one block per day.

    use crate::core::{ClassTasks, NormalizedSchedule};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum OutputFormat {
        #[default]
        Default,
        Markdown,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RenderedDay {
        pub date: NaiveDate,
        pub text: String,
    }

    pub fn render(schedule: &NormalizedSchedule, format: OutputFormat) -> Vec<RenderedDay> {
        schedule
            .days
            .iter()
            .map(|day| RenderedDay {
                date: day.date,
                text: match format {
                    OutputFormat::Default => render_default_day(&day.classes),
                    OutputFormat::Markdown => render_markdown_day(day.date, &day.classes),
                },
            })
            .collect()
    }

    /// Whole-file rendering: every day block, separated by a blank line.
    pub fn render_document(schedule: &NormalizedSchedule, format: OutputFormat) -> String {
        render(schedule, format)
            .into_iter()
            .map(|day| match format {
                OutputFormat::Default => format!("{}:\n\n{}", day.date, day.text),
                OutputFormat::Markdown => day.text,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render_default_day(classes: &[ClassTasks]) -> String {
        classes
            .iter()
            .map(|class| {
                let mut block = format!("{}:\n", class.name);
                for task in &class.tasks {
                    block.push_str(task);
                    block.push('\n');
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render_markdown_day(date: NaiveDate, classes: &[ClassTasks]) -> String {
        let body = classes
            .iter()
            .map(|class| {
                let mut block = format!("## {}\n", class.name);
                if !class.tasks.is_empty() {
                    block.push('\n');
                }
                for task in &class.tasks {
                    block.push_str("- [ ] ");
                    block.push_str(task);
                    block.push('\n');
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("# Tasks: {date}\n\n{body}")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::ScheduleDay;

        fn sample() -> NormalizedSchedule {
            let d1 = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
            let d2 = NaiveDate::from_ymd_opt(2024, 1, 2).expect("date");
            NormalizedSchedule {
                start_date: d1,
                end_date: d2,
                days: vec![
                    ScheduleDay {
                        date: d1,
                        classes: vec![
                            ClassTasks {
                                name: "Art".into(),
                                tasks: vec![],
                            },
                            ClassTasks {
                                name: "Math".into(),
                                tasks: vec!["Read ch.1".into(), "Exercises".into()],
                            },
                        ],
                    },
                    ScheduleDay {
                        date: d2,
                        classes: vec![ClassTasks {
                            name: "Math".into(),
                            tasks: vec!["Quiz".into()],
                        }],
                    },
                ],
            }
        }

        #[test]
        fn default_blocks_list_classes_and_tasks() {
            let days = render(&sample(), OutputFormat::Default);
            assert_eq!(days.len(), 2);
            assert_eq!(days[0].text, "Art:\n\nMath:\nRead ch.1\nExercises\n");
            assert_eq!(days[1].text, "Math:\nQuiz\n");
        }

        #[test]
        fn markdown_blocks_use_checkboxes() {
            let days = render(&sample(), OutputFormat::Markdown);
            assert_eq!(
                days[0].text,
                "# Tasks: 2024-01-01\n\n## Art\n\n## Math\n\n- [ ] Read ch.1\n- [ ] Exercises\n"
            );
        }

        #[test]
        fn documents_join_days_with_blank_line() {
            assert_eq!(
                render_document(&sample(), OutputFormat::Default),
                "2024-01-01:\n\nArt:\n\nMath:\nRead ch.1\nExercises\n\n2024-01-02:\n\nMath:\nQuiz\n"
            );
            let markdown = render_document(&sample(), OutputFormat::Markdown);
            assert!(markdown.contains("- [ ] Exercises\n\n# Tasks: 2024-01-02\n"));
            assert!(markdown.ends_with("- [ ] Quiz\n"));
        }
    }
}

pub mod merge {
    //! Carries checkbox state from a previously written file into a fresh rendering.
    //!
    //! The old file is unchecked, diffed line-by-line against the new rendering (LCS), and
    //! every line the two share is taken from the old file when the user had checked it.

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Edit {
        /// Line present in both; indices into old and new.
        Equal(usize, usize),
        Insert(usize),
        Delete(usize),
    }

    pub fn merge(new_text: &str, old_text: &str) -> String {
        let old_lines: Vec<&str> = old_text.lines().collect();
        let stripped: Vec<String> = old_lines.iter().map(|line| uncheck(line)).collect();
        let stripped_refs: Vec<&str> = stripped.iter().map(String::as_str).collect();
        let new_lines: Vec<&str> = new_text.lines().collect();

        let merged: Vec<&str> = diff_lines(&stripped_refs, &new_lines)
            .into_iter()
            .filter_map(|edit| match edit {
                Edit::Equal(old, _) if is_checked(old_lines[old]) => Some(old_lines[old]),
                Edit::Equal(_, new) | Edit::Insert(new) => Some(new_lines[new]),
                Edit::Delete(_) => None,
            })
            .collect();

        let mut out = merged.join("\n");
        if new_text.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    /// Shortest edit script turning `old` into `new`, in file order.
    ///
    /// The shared head and tail are matched directly, so the LCS table only spans the region
    /// that actually changed.
    pub fn diff_lines(old: &[&str], new: &[&str]) -> Vec<Edit> {
        let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();
        let (old_end, new_end) = (old.len() - suffix, new.len() - suffix);

        let mut edits = Vec::with_capacity(old.len().max(new.len()));
        edits.extend((0..prefix).map(|k| Edit::Equal(k, k)));
        edits.extend(
            lcs_edits(&old[prefix..old_end], &new[prefix..new_end])
                .into_iter()
                .map(|edit| match edit {
                    Edit::Equal(i, j) => Edit::Equal(i + prefix, j + prefix),
                    Edit::Delete(i) => Edit::Delete(i + prefix),
                    Edit::Insert(j) => Edit::Insert(j + prefix),
                }),
        );
        edits.extend((0..suffix).map(|k| Edit::Equal(old_end + k, new_end + k)));
        edits
    }

    fn lcs_edits(old: &[&str], new: &[&str]) -> Vec<Edit> {
        let (n, m) = (old.len(), new.len());
        // lcs[i][j] = longest common subsequence of old[i..] and new[j..]
        let mut lcs = vec![vec![0usize; m + 1]; n + 1];
        for i in (0..n).rev() {
            for j in (0..m).rev() {
                lcs[i][j] = if old[i] == new[j] {
                    lcs[i + 1][j + 1] + 1
                } else {
                    lcs[i + 1][j].max(lcs[i][j + 1])
                };
            }
        }

        let mut edits = Vec::with_capacity(n.max(m));
        let (mut i, mut j) = (0, 0);
        while i < n && j < m {
            if old[i] == new[j] {
                edits.push(Edit::Equal(i, j));
                i += 1;
                j += 1;
            } else if lcs[i + 1][j] >= lcs[i][j + 1] {
                edits.push(Edit::Delete(i));
                i += 1;
            } else {
                edits.push(Edit::Insert(j));
                j += 1;
            }
        }
        edits.extend((i..n).map(Edit::Delete));
        edits.extend((j..m).map(Edit::Insert));
        edits
    }

    pub fn is_checked(line: &str) -> bool {
        line.contains("[x]") || line.contains("[X]")
    }

    pub fn uncheck(line: &str) -> String {
        line.replace("[x]", "[ ]").replace("[X]", "[ ]")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const RENDERED: &str =
            "# Tasks: 2024-01-01\n\n## Math\n\n- [ ] Read ch.1\n- [ ] Exercises\n";

        #[test]
        fn merging_identical_text_is_identity() {
            assert_eq!(merge(RENDERED, RENDERED), RENDERED);
        }

        #[test]
        fn checked_lines_survive_regeneration() {
            let checked = RENDERED.replace("- [ ] Read", "- [x] Read");
            assert_eq!(merge(RENDERED, &checked), checked);
        }

        #[test]
        fn appended_task_is_unchecked() {
            let old = "## Math\n\n- [x] A\n";
            let new = "## Math\n\n- [ ] A\n- [ ] B\n";
            assert_eq!(merge(new, old), "## Math\n\n- [x] A\n- [ ] B\n");
        }

        #[test]
        fn removed_tasks_are_dropped_and_capital_x_counts() {
            let old = "- [X] A\n- [x] B\n- [ ] C\n";
            let new = "- [ ] A\n- [ ] C\n- [ ] D";
            assert_eq!(merge(new, old), "- [X] A\n- [ ] C\n- [ ] D");
        }

        #[test]
        fn edited_task_loses_its_check() {
            let old = "- [x] Read ch.1\n";
            let new = "- [ ] Read ch.2\n";
            assert_eq!(merge(new, old), "- [ ] Read ch.2\n");
        }

        #[test]
        fn diff_script_orders_edits_by_position() {
            let edits = diff_lines(&["a", "b", "c"], &["a", "c", "d"]);
            assert_eq!(
                edits,
                [
                    Edit::Equal(0, 0),
                    Edit::Delete(1),
                    Edit::Equal(2, 1),
                    Edit::Insert(2),
                ]
            );
        }

        #[test]
        fn shared_head_and_tail_are_matched_around_the_change() {
            let edits = diff_lines(&["h", "a", "x", "t1", "t2"], &["h", "a", "y", "t1", "t2"]);
            assert_eq!(
                edits,
                [
                    Edit::Equal(0, 0),
                    Edit::Equal(1, 1),
                    Edit::Delete(2),
                    Edit::Insert(2),
                    Edit::Equal(3, 3),
                    Edit::Equal(4, 4),
                ]
            );
            assert_eq!(
                diff_lines(&["a", "a"], &["a", "a", "a"]),
                [Edit::Equal(0, 0), Edit::Equal(1, 1), Edit::Insert(2)]
            );
        }

        #[test]
        fn long_file_with_one_new_task_merges() {
            let old: String = (0..50_000)
                .map(|i| {
                    if i % 7 == 0 {
                        format!("- [x] Task {i}\n")
                    } else {
                        format!("- [ ] Task {i}\n")
                    }
                })
                .collect();
            let mut new = uncheck_all(&old);
            new.insert_str(new.find("- [ ] Task 24997\n").expect("task"), "- [ ] Extra\n");

            let merged = merge(&new, &old);
            assert_eq!(merged.lines().count(), 50_001);
            assert!(merged.contains("- [ ] Task 24996\n- [ ] Extra\n- [x] Task 24997\n"));
            assert_eq!(uncheck_all(&merged), new);
        }

        fn uncheck_all(text: &str) -> String {
            text.lines().map(|line| uncheck(line) + "\n").collect()
        }
    }
}

/* ------------------------------ Public entry points ------------------------------ */

pub use crate::core::{
    ClassTasks, Diagnostic, DiagnosticSet, NormalizedSchedule, ParseFailure, ScheduleDay,
    SourcePosition,
};
pub use crate::merge::merge;
pub use crate::render::{OutputFormat, RenderedDay, render, render_document};

/// Parse, transform and validate one schedule source.
///
/// Syntax errors come back classified with a snippet-ready diagnostic; semantic problems come
/// back as the full [`DiagnosticSet`].
pub fn parse_source(text: &str, file_name: &str) -> Result<NormalizedSchedule, ParseFailure> {
    let tree = syntax::parse(text).map_err(|err| {
        ParseFailure::Syntax(diagnostics::syntax_diagnostic(&err, text, file_name))
    })?;
    validate::validate(&transform::transform(tree), text, file_name).map_err(ParseFailure::Invalid)
}

pub mod storage {
    use anyhow::Result;
    use std::path::{Path, PathBuf};

    /// Source discovery and output persistence for the scheduling run.
    pub trait ScheduleRepository: Sync {
        /// Every schedule source under the repository, in a stable order.
        fn sources(&self) -> Result<Vec<PathBuf>>;

        fn read_source(&self, source: &Path) -> Result<String>;

        /// Where the rendered output for `source` is kept.
        fn output_path(&self, source: &Path) -> Result<PathBuf>;

        /// Previously written output, or `None` if there is none yet.
        fn read_output(&self, output: &Path) -> Result<Option<String>>;

        fn write_output(&self, output: &Path, text: &str) -> Result<()>;

        /// Name used in diagnostics.
        fn display_name(&self, source: &Path) -> String;
    }

    pub trait VersionControl {
        /// Stage `paths` and commit them. `Ok(false)` means there was nothing to commit; a
        /// failed commit is an error.
        fn commit(&self, paths: &[PathBuf], message: &str) -> Result<bool>;
    }
}

pub mod config {
    //! Per-user configuration file (`~/.ptsched.json`).

    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        io::ErrorKind,
        path::{Path, PathBuf},
    };

    pub const CONFIG_ENV: &str = "PTSCHED_CONFIG";
    pub const CONFIG_FILE_NAME: &str = ".ptsched.json";

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct UserConfig {
        #[serde(
            rename = "defaultDirectory",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        pub default_directory: Option<PathBuf>,
        /// Keys this tool does not know about; written back untouched.
        #[serde(flatten)]
        pub extra: IndexMap<String, serde_json::Value>,
    }

    /// `$PTSCHED_CONFIG`, else `$HOME/.ptsched.json`.
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let home = std::env::var_os("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(CONFIG_FILE_NAME))
    }

    impl UserConfig {
        /// Load the config at `path`; a missing file is an empty config.
        pub fn load(path: &Path) -> Result<Self> {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
                Err(err) => {
                    return Err(err).with_context(|| format!("reading config {:?}", path));
                }
            };
            serde_json::from_str(&text).with_context(|| format!("parsing config {:?}", path))
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating config directory {:?}", parent))?;
            }
            let text = serde_json::to_string_pretty(self)?;
            fs::write(path, text).with_context(|| format!("writing config {:?}", path))
        }
    }

}

pub mod workspace {
    //! Filesystem side of a schedule directory: scanning, output paths, the `.ptscheddir`
    //! marker, nearest-schedule lookup and git commits.

    use crate::storage::{ScheduleRepository, VersionControl};
    use crate::syntax;
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::HashSet,
        ffi::OsStr,
        fs,
        io::{ErrorKind, Write},
        path::{Path, PathBuf},
        process::{Command, Output},
    };
    use uuid::Uuid;

    pub const SOURCE_EXTENSION: &str = "ptsched";
    pub const OUTPUT_EXTENSION: &str = "md";
    pub const OUTPUT_DIR: &str = "out";
    pub const MARKER_FILE: &str = ".ptscheddir";
    pub const IGNORE_FILE: &str = ".ptschedignore";

    /* ------------------------------ Scanning ------------------------------ */

    /// Every `*.ptsched` file under `root`, sorted.
    ///
    /// Files directly inside a directory holding `.ptschedignore` are skipped (its
    /// subdirectories are still visited); `<root>/out` is never entered.
    pub fn scan(root: &Path) -> Result<Vec<PathBuf>> {
        let root = fs::canonicalize(root).with_context(|| format!("resolving path {:?}", root))?;
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visit_dir(&root, &root.join(OUTPUT_DIR), &mut out, &mut visited)?;
        out.sort();
        Ok(out)
    }

    fn visit_dir(
        path: &Path,
        output_dir: &Path,
        out: &mut Vec<PathBuf>,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        let canonical = fs::canonicalize(path)?;
        if canonical == output_dir || !visited.insert(canonical.clone()) {
            return Ok(());
        }

        let ignored = canonical.join(IGNORE_FILE).is_file();
        if ignored {
            tracing::debug!("ignoring schedule files in {:?}", canonical);
        }
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            let entry_path = entry.path();
            if file_type.is_dir() {
                visit_dir(&entry_path, output_dir, out, visited)?;
            } else if file_type.is_file()
                && !ignored
                && entry_path
                    .extension()
                    .map(|ext| ext == SOURCE_EXTENSION)
                    .unwrap_or(false)
            {
                tracing::debug!("found schedule {:?}", entry_path);
                out.push(entry_path);
            }
        }
        Ok(())
    }

    /* ----------------------------- Repository ----------------------------- */

    /// Schedule directory on disk; outputs mirror sources under `<root>/out`.
    #[derive(Debug, Clone)]
    pub struct FsScheduleRepository {
        root: PathBuf,
    }

    impl FsScheduleRepository {
        pub fn open(root: &Path) -> Result<Self> {
            let root =
                fs::canonicalize(root).with_context(|| format!("resolving path {:?}", root))?;
            Ok(Self { root })
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn relative<'a>(&self, path: &'a Path) -> Result<&'a Path> {
            path.strip_prefix(&self.root)
                .with_context(|| format!("{:?} is outside {:?}", path, self.root))
        }
    }

    impl ScheduleRepository for FsScheduleRepository {
        fn sources(&self) -> Result<Vec<PathBuf>> {
            scan(&self.root)
        }

        fn read_source(&self, source: &Path) -> Result<String> {
            fs::read_to_string(source).with_context(|| format!("reading {:?}", source))
        }

        fn output_path(&self, source: &Path) -> Result<PathBuf> {
            let rel = self.relative(source)?;
            Ok(self
                .root
                .join(OUTPUT_DIR)
                .join(rel)
                .with_extension(OUTPUT_EXTENSION))
        }

        fn read_output(&self, output: &Path) -> Result<Option<String>> {
            match fs::read_to_string(output) {
                Ok(text) => Ok(Some(text)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {:?}", output)),
            }
        }

        fn write_output(&self, output: &Path, text: &str) -> Result<()> {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {:?}", parent))?;
            }
            fs::write(output, text).with_context(|| format!("writing {:?}", output))
        }

        fn display_name(&self, source: &Path) -> String {
            self.relative(source)
                .unwrap_or(source)
                .display()
                .to_string()
        }
    }

    /* ---------------------------- Directory marker ---------------------------- */

    /// Contents of `.ptscheddir`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DirectoryMarker {
        #[serde(rename = "directoryID")]
        pub directory_id: String,
        #[serde(default)]
        pub files: Vec<String>,
    }

    impl DirectoryMarker {
        pub fn new() -> Self {
            Self {
                directory_id: Uuid::new_v4().simple().to_string().to_uppercase(),
                files: Vec::new(),
            }
        }
    }

    impl Default for DirectoryMarker {
        fn default() -> Self {
            Self::new()
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum InitError {
        #[error("a ptsched directory already exists in {0:?}")]
        AlreadyInitialized(PathBuf),
        #[error(transparent)]
        Other(#[from] anyhow::Error),
    }

    /// Create `.ptscheddir` in `dir`, refusing to overwrite an existing one.
    pub fn init_directory(dir: &Path) -> Result<DirectoryMarker, InitError> {
        let path = dir.join(MARKER_FILE);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(InitError::AlreadyInitialized(dir.to_path_buf()));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("creating {:?}", path))
                    .into());
            }
        };
        let marker = DirectoryMarker::new();
        let text = serde_json::to_string(&marker).context("serializing directory marker")?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("writing {:?}", path))?;
        tracing::info!("initialized schedule directory {:?}", dir);
        Ok(marker)
    }

    /* ------------------------------ Nearest file ------------------------------ */

    /// The schedule under `dir` whose start or end date is closest to `today`.
    ///
    /// Files whose first line is not a readable date range are skipped.
    pub fn nearest_schedule(dir: &Path, today: NaiveDate) -> Result<Option<PathBuf>> {
        let mut best: Option<(i64, PathBuf)> = None;
        for path in scan(dir)? {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            let Some((start, end)) = syntax::parse_header(&text).ok().and_then(|h| h.dates())
            else {
                tracing::debug!("skipping {:?}: no readable date range", path);
                continue;
            };
            let distance = (start - today)
                .num_days()
                .abs()
                .min((end - today).num_days().abs());
            if best.as_ref().is_none_or(|(d, _)| distance < *d) {
                best = Some((distance, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    /* -------------------------------- Git -------------------------------- */

    /// Commits through the `git` executable in `repo_dir`.
    #[derive(Debug, Clone)]
    pub struct GitVersionControl {
        pub repo_dir: PathBuf,
    }

    impl GitVersionControl {
        fn git(&self, args: &[&OsStr]) -> Result<Output> {
            Command::new("git")
                .current_dir(&self.repo_dir)
                .args(args)
                .output()
                .with_context(|| format!("running git in {:?}", self.repo_dir))
        }

        fn run(&self, args: &[&OsStr]) -> Result<()> {
            let output = self.git(args)?;
            if !output.status.success() {
                anyhow::bail!(
                    "git {} failed in {:?}: {}",
                    args.first().map(|a| a.to_string_lossy()).unwrap_or_default(),
                    self.repo_dir,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        }

        fn with_paths<'a>(head: &[&'a str], paths: &'a [PathBuf]) -> Vec<&'a OsStr> {
            head.iter()
                .map(|arg| OsStr::new(*arg))
                .chain(std::iter::once(OsStr::new("--")))
                .chain(paths.iter().map(|p| p.as_os_str()))
                .collect()
        }
    }

    impl VersionControl for GitVersionControl {
        fn commit(&self, paths: &[PathBuf], message: &str) -> Result<bool> {
            if paths.is_empty() {
                return Ok(false);
            }
            self.run(&Self::with_paths(&["add"], paths))?;

            // `diff --quiet` exits 1 when the index differs from HEAD.
            let staged = self.git(&Self::with_paths(&["diff", "--cached", "--quiet"], paths))?;
            match staged.status.code() {
                Some(0) => {
                    tracing::debug!("nothing to commit in {:?}", self.repo_dir);
                    return Ok(false);
                }
                Some(1) => {}
                _ => anyhow::bail!(
                    "git diff failed in {:?}: {}",
                    self.repo_dir,
                    String::from_utf8_lossy(&staged.stderr).trim()
                ),
            }

            self.run(&Self::with_paths(&["commit", "-m", message], paths))?;
            Ok(true)
        }
    }

}

pub mod scheduler {
    //! Batch regeneration: every source is parsed, rendered as markdown and merged into its
    //! output on a fixed-size worker pool.

    use crate::core::ParseFailure;
    use crate::storage::{ScheduleRepository, VersionControl};
    use crate::{OutputFormat, merge, parse_source, render_document};
    use anyhow::{Context, Result};
    use chrono::NaiveDateTime;
    use rayon::prelude::*;
    use std::{
        fmt,
        path::{Path, PathBuf},
    };

    pub const DEFAULT_WORKERS: usize = 5;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum UpdateStatus {
        Created,
        Updated,
        Unchanged,
    }

    impl fmt::Display for UpdateStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                UpdateStatus::Created => "created",
                UpdateStatus::Updated => "updated",
                UpdateStatus::Unchanged => "unchanged",
            })
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum UpdateError {
        #[error("{0}")]
        Invalid(ParseFailure),
        #[error(transparent)]
        Io(#[from] anyhow::Error),
    }

    #[derive(Debug)]
    pub struct FileOutcome {
        pub source: PathBuf,
        pub result: Result<(PathBuf, UpdateStatus), UpdateError>,
    }

    impl FileOutcome {
        /// Output path if this file's output was written.
        pub fn written(&self) -> Option<&Path> {
            match &self.result {
                Ok((output, UpdateStatus::Created | UpdateStatus::Updated)) => Some(output.as_path()),
                _ => None,
            }
        }
    }

    /// Regenerate one source's output, keeping the user's checkmarks.
    pub fn update_file(
        repo: &dyn ScheduleRepository,
        source: &Path,
    ) -> Result<(PathBuf, UpdateStatus), UpdateError> {
        let text = repo.read_source(source)?;
        let schedule =
            parse_source(&text, &repo.display_name(source)).map_err(UpdateError::Invalid)?;
        let rendered = render_document(&schedule, OutputFormat::Markdown);
        let output = repo.output_path(source)?;

        let status = match repo.read_output(&output)? {
            None => {
                repo.write_output(&output, &rendered)?;
                UpdateStatus::Created
            }
            Some(existing) => {
                let merged = merge(&rendered, &existing);
                if merged == existing {
                    UpdateStatus::Unchanged
                } else {
                    repo.write_output(&output, &merged)?;
                    UpdateStatus::Updated
                }
            }
        };
        tracing::debug!("{:?}: {}", output, status);
        Ok((output, status))
    }

    /// Regenerate every source in `repo` on a pool of `workers` threads.
    pub fn update_all(repo: &dyn ScheduleRepository, workers: usize) -> Result<Vec<FileOutcome>> {
        let sources = repo.sources()?;
        tracing::info!("updating {} schedule file(s)", sources.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .context("building worker pool")?;
        Ok(pool.install(|| {
            sources
                .par_iter()
                .map(|source| FileOutcome {
                    source: source.clone(),
                    result: update_file(repo, source),
                })
                .collect()
        }))
    }

    pub fn commit_message(now: NaiveDateTime) -> String {
        format!("Schedule edit at {}", now.format("%a %d %b %Y, %I:%M %p"))
    }

    /// Commit every scanned source together with the outputs this run wrote.
    ///
    /// Sources are included whether or not they parsed, so edits are versioned even while a
    /// file is broken. Returns whether a commit was made.
    pub fn commit_changes(
        vcs: &dyn VersionControl,
        outcomes: &[FileOutcome],
        now: NaiveDateTime,
    ) -> Result<bool> {
        let paths: Vec<PathBuf> = outcomes
            .iter()
            .map(|o| o.source.clone())
            .chain(outcomes.iter().filter_map(|o| o.written().map(Path::to_path_buf)))
            .collect();
        vcs.commit(&paths, &commit_message(now))
    }

}

pub mod generate {
    //! Blank schedule template for the current school week.

    use chrono::{Datelike, Days, NaiveDate, Weekday};

    /// Today through Friday, starting next Monday when today is a weekend day.
    pub fn week_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let monday = match today.weekday() {
            Weekday::Sat => today + Days::new(2),
            Weekday::Sun => today + Days::new(1),
            _ => today,
        };
        let to_friday = 4 - u64::from(monday.weekday().num_days_from_monday());
        (monday, monday + Days::new(to_friday))
    }

    /// One empty day declaration per date for each class.
    pub fn template(start: NaiveDate, end: NaiveDate, classes: &[String]) -> String {
        let mut out = format!(
            "{} - {}\n\n",
            start.format("%-d %B %Y"),
            end.format("%-d %B %Y")
        );
        for class in classes {
            out.push_str(&format!("# {class}\n\n"));
            for date in start.iter_days().take_while(|d| *d <= end) {
                out.push_str(&format!("- {}\n\n", date.format("%a %-d")));
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("date")
        }

        #[test]
        fn weekends_roll_to_next_monday() {
            assert_eq!(week_range(date(2024, 1, 3)), (date(2024, 1, 3), date(2024, 1, 5)));
            assert_eq!(week_range(date(2024, 1, 6)), (date(2024, 1, 8), date(2024, 1, 12)));
            assert_eq!(week_range(date(2024, 1, 7)), (date(2024, 1, 8), date(2024, 1, 12)));
        }

        #[test]
        fn template_parses_back() {
            let (start, end) = week_range(date(2024, 1, 31));
            let text = template(start, end, &["Math".to_string(), "Art".to_string()]);
            assert!(text.starts_with("31 January 2024 - 2 February 2024\n\n# Math\n\n- Wed 31\n\n"));

            let schedule = crate::parse_source(&text, "generated").expect("template parses");
            assert_eq!(schedule.days.len(), 3);
            assert_eq!(schedule.class_names(), ["Art", "Math"]);
        }
    }
}
