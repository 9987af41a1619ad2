//! Declarative scraping of values and tables out of tool output.
//!
//! Registrations are applied in order against the text a command produced:
//!
//! - value rules match once against the whole output; the first match of the
//!   single capture group wins, and no match leaves the target untouched
//!   (optional fields are not errors)
//! - table rules run line by line; rules registered with a header pattern
//!   share one "active table" cursor, so a single linear scan can
//!   demultiplex several differently-shaped tables embedded in one output
//!
//! A parser holds no per-run state and can be reused across many commands.

use regex::{Captures, Regex};

type ValueSetter<T> = Box<dyn Fn(&mut T, &str) + Send + Sync>;
type RowHandler<T> = Box<dyn Fn(&mut T, &Captures<'_>) + Send + Sync>;

struct ValueRule<T> {
    pattern: Regex,
    set: ValueSetter<T>,
}

struct TableRule<T> {
    header: Option<Regex>,
    row: Regex,
    on_row: RowHandler<T>,
}

/// Ordered collection of extraction rules applied to command output.
pub struct OutputParser<T> {
    values: Vec<ValueRule<T>>,
    tables: Vec<TableRule<T>>,
}

impl<T> Default for OutputParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputParser<T> {
    pub fn new() -> Self {
        Self { values: Vec::new(), tables: Vec::new() }
    }

    /// Register a value rule: the first match of `pattern`'s first capture
    /// group anywhere in the output is handed to `set`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regex; patterns are compiled at
    /// registration time, which happens at provider construction.
    pub fn value(mut self, pattern: &str, set: impl Fn(&mut T, &str) + Send + Sync + 'static) -> Self {
        self.values.push(ValueRule {
            pattern: Regex::new(pattern).expect("value pattern must compile"),
            set: Box::new(set),
        });
        self
    }

    /// Register a headerless table rule: every line matching `row` is handed
    /// to `on_row` with its captures.
    pub fn table(
        mut self,
        row: &str,
        on_row: impl Fn(&mut T, &Captures<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.tables.push(TableRule {
            header: None,
            row: Regex::new(row).expect("row pattern must compile"),
            on_row: Box::new(on_row),
        });
        self
    }

    /// Register a headered table rule. Rules with headers share one cursor:
    /// a line matching some header makes that rule active and subsequent
    /// non-header lines are parsed against its row pattern until the next
    /// header switch.
    pub fn table_with_header(
        mut self,
        header: &str,
        row: &str,
        on_row: impl Fn(&mut T, &Captures<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.tables.push(TableRule {
            header: Some(Regex::new(header).expect("header pattern must compile")),
            row: Regex::new(row).expect("row pattern must compile"),
            on_row: Box::new(on_row),
        });
        self
    }

    /// Apply every registered rule to `output`, mutating `target`.
    pub fn parse(&self, target: &mut T, output: &str) {
        for rule in &self.values {
            if let Some(caps) = rule.pattern.captures(output) {
                if let Some(group) = caps.get(1) {
                    (rule.set)(target, group.as_str());
                }
            }
        }

        if self.tables.is_empty() {
            return;
        }

        // Index into `tables` of the rule whose header matched most recently.
        let mut active: Option<usize> = None;

        'line: for line in output.lines() {
            for (idx, rule) in self.tables.iter().enumerate() {
                if let Some(header) = &rule.header {
                    if header.is_match(line) {
                        active = Some(idx);
                        continue 'line;
                    }
                }
            }

            for rule in self.tables.iter().filter(|r| r.header.is_none()) {
                if let Some(caps) = rule.row.captures(line) {
                    (rule.on_row)(target, &caps);
                }
            }

            if let Some(idx) = active {
                let rule = &self.tables[idx];
                if let Some(caps) = rule.row.captures(line) {
                    (rule.on_row)(target, &caps);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
