//! A small typed command-line option parser: short (`-x`), long (`--name`),
//! grouped shorts (`-abc`), `--key=value`, the `--` positional separator,
//! countable flags, data-unit sizes (`10M` = 10 MiB), multi-valued options,
//! per-option validators, and help-flag detection.

use std::collections::HashMap;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// A flag with no value; the count of how many times it was passed.
    Count(u32),
    Text(String),
    /// Bytes, after parsing a `B`/`K`/`M`/`G`/`T`/`P`/`E` suffix.
    DataSize(u64),
    List(Vec<String>),
}

impl OptionValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u32> {
        match self {
            OptionValue::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_data_size(&self) -> Option<u64> {
        match self {
            OptionValue::DataSize(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            OptionValue::List(items) => Some(items),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// No value; every occurrence just bumps a counter.
    Countable,
    Text,
    DataSize,
    /// Text, but repeatable occurrences accumulate into a list.
    List,
}

type Validator = std::sync::Arc<dyn Fn(&str) -> Result<(), CoreError> + Send + Sync>;

pub struct OptionSpec {
    name: &'static str,
    short: Option<char>,
    long: Option<&'static str>,
    kind: ValueKind,
    validator: Option<Validator>,
    is_help: bool,
}

impl OptionSpec {
    pub fn new(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            short: None,
            long: None,
            kind,
            validator: None,
            is_help: false,
        }
    }

    pub fn short(mut self, c: char) -> Self {
        self.short = Some(c);
        self
    }

    pub fn long(mut self, s: &'static str) -> Self {
        self.long = Some(s);
        self
    }

    pub fn validator(mut self, f: impl Fn(&str) -> Result<(), CoreError> + Send + Sync + 'static) -> Self {
        self.validator = Some(std::sync::Arc::new(f));
        self
    }

    pub fn help_flag(mut self) -> Self {
        self.is_help = true;
        self
    }
}

pub struct ParsedOptions {
    pub values: HashMap<&'static str, OptionValue>,
    pub positionals: Vec<String>,
    pub help_requested: bool,
}

impl ParsedOptions {
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }
}

/// Parses a data-unit size like `10M`, `512`, `2G`. Suffix is one of
/// `B K M G T P E`, each 1024x the previous; no suffix means raw bytes.
pub fn parse_data_size(input: &str) -> Result<u64, CoreError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CoreError::invalid_input("empty data-size value"));
    }
    let (digits, suffix) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c.to_ascii_uppercase())),
        _ => (input, None),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| CoreError::invalid_input(format!("invalid data-size number: {input}")))?;
    let multiplier = match suffix {
        None | Some('B') => 1u64,
        Some('K') => 1024,
        Some('M') => 1024 * 1024,
        Some('G') => 1024 * 1024 * 1024,
        Some('T') => 1024u64.pow(4),
        Some('P') => 1024u64.pow(5),
        Some('E') => 1024u64.pow(6),
        Some(other) => return Err(CoreError::invalid_input(format!("unknown data-size suffix: {other}"))),
    };
    Ok(base.saturating_mul(multiplier))
}

pub struct Parser {
    specs: Vec<OptionSpec>,
}

impl Parser {
    pub fn new() -> Self {
        Self { specs: Vec::new() }
    }

    pub fn option(mut self, spec: OptionSpec) -> Self {
        self.specs.push(spec);
        self
    }

    fn find_by_short(&self, c: char) -> Option<&OptionSpec> {
        self.specs.iter().find(|s| s.short == Some(c))
    }

    fn find_by_long(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.iter().find(|s| s.long == Some(name))
    }

    pub fn parse<S: AsRef<str>>(&self, args: &[S]) -> Result<ParsedOptions, CoreError> {
        let mut values: HashMap<&'static str, OptionValue> = HashMap::new();
        let mut positionals = Vec::new();
        let mut help_requested = false;
        let mut args_only = false;
        let mut iter = args.iter().map(|s| s.as_ref()).peekable();

        while let Some(arg) = iter.next() {
            if args_only {
                positionals.push(arg.to_string());
                continue;
            }
            if arg == "--" {
                args_only = true;
                continue;
            }
            if let Some(rest) = arg.strip_prefix("--") {
                let (name, inline_value) = match rest.split_once('=') {
                    Some((n, v)) => (n, Some(v.to_string())),
                    None => (rest, None),
                };
                let spec = self
                    .find_by_long(name)
                    .ok_or_else(|| CoreError::invalid_input(format!("unknown option --{name}")))?;
                self.consume(spec, inline_value, &mut iter, &mut values, &mut help_requested)?;
            } else if let Some(rest) = arg.strip_prefix('-') {
                if rest.is_empty() {
                    positionals.push(arg.to_string());
                    continue;
                }
                let chars: Vec<char> = rest.chars().collect();
                let mut i = 0;
                while i < chars.len() {
                    let c = chars[i];
                    let spec = self
                        .find_by_short(c)
                        .ok_or_else(|| CoreError::invalid_input(format!("unknown option -{c}")))?;
                    if spec.kind == ValueKind::Countable {
                        self.consume(spec, None, &mut iter, &mut values, &mut help_requested)?;
                        i += 1;
                        continue;
                    }
                    // Value-taking short option: the rest of this token (if
                    // any) is the value, e.g. `-oVALUE`; otherwise the next
                    // argument is.
                    let rest_of_token: String = chars[i + 1..].iter().collect();
                    let inline = if rest_of_token.is_empty() { None } else { Some(rest_of_token) };
                    self.consume(spec, inline, &mut iter, &mut values, &mut help_requested)?;
                    break;
                }
            } else {
                positionals.push(arg.to_string());
            }
        }

        Ok(ParsedOptions {
            values,
            positionals,
            help_requested,
        })
    }

    fn consume<'a, I: Iterator<Item = &'a str>>(
        &self,
        spec: &OptionSpec,
        inline_value: Option<String>,
        iter: &mut std::iter::Peekable<I>,
        values: &mut HashMap<&'static str, OptionValue>,
        help_requested: &mut bool,
    ) -> Result<(), CoreError> {
        if spec.is_help {
            *help_requested = true;
        }
        match spec.kind {
            ValueKind::Countable => {
                let entry = values.entry(spec.name).or_insert(OptionValue::Count(0));
                if let OptionValue::Count(n) = entry {
                    *n += 1;
                }
            }
            ValueKind::Text | ValueKind::DataSize | ValueKind::List => {
                let raw = match inline_value {
                    Some(v) => v,
                    None => iter
                        .next()
                        .ok_or_else(|| CoreError::invalid_input(format!("option {} requires a value", spec.name)))?
                        .to_string(),
                };
                if let Some(validator) = &spec.validator {
                    validator(&raw)?;
                }
                match spec.kind {
                    ValueKind::Text => {
                        values.insert(spec.name, OptionValue::Text(raw));
                    }
                    ValueKind::DataSize => {
                        values.insert(spec.name, OptionValue::DataSize(parse_data_size(&raw)?));
                    }
                    ValueKind::List => {
                        match values.entry(spec.name).or_insert_with(|| OptionValue::List(Vec::new())) {
                            OptionValue::List(list) => list.push(raw),
                            _ => unreachable!(),
                        }
                    }
                    ValueKind::Countable => unreachable!(),
                }
            }
        }
        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parser() -> Parser {
        Parser::new()
            .option(OptionSpec::new("verbose", ValueKind::Countable).short('v'))
            .option(OptionSpec::new("help", ValueKind::Countable).short('h').long("help").help_flag())
            .option(OptionSpec::new("name", ValueKind::Text).short('n').long("name"))
            .option(OptionSpec::new("size", ValueKind::DataSize).long("size"))
            .option(OptionSpec::new("tag", ValueKind::List).long("tag"))
    }

    #[test]
    fn grouped_shorts_each_count_independently() {
        let parsed = sample_parser().parse(&["-vvv"]).unwrap();
        assert_eq!(parsed.get("verbose").unwrap().as_count(), Some(3));
    }

    #[test]
    fn long_option_with_equals_and_separate_value_both_work() {
        let parsed = sample_parser().parse(&["--name=alice", "--size", "10M"]).unwrap();
        assert_eq!(parsed.get("name").unwrap().as_text(), Some("alice"));
        assert_eq!(parsed.get("size").unwrap().as_data_size(), Some(10 * 1024 * 1024));
    }

    #[test]
    fn separator_stops_option_parsing() {
        let parsed = sample_parser().parse(&["--name", "bob", "--", "--size", "5"]).unwrap();
        assert_eq!(parsed.positionals, vec!["--size".to_string(), "5".to_string()]);
    }

    #[test]
    fn multi_option_collects_a_list() {
        let parsed = sample_parser().parse(&["--tag", "a", "--tag", "b"]).unwrap();
        assert_eq!(parsed.get("tag").unwrap().as_list(), Some(&["a".to_string(), "b".to_string()][..]));
    }

    #[test]
    fn help_flag_is_detected() {
        let parsed = sample_parser().parse(&["-h"]).unwrap();
        assert!(parsed.help_requested);
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(sample_parser().parse(&["--bogus"]).is_err());
    }

    #[test]
    fn data_size_suffixes_scale_by_1024() {
        assert_eq!(parse_data_size("1K").unwrap(), 1024);
        assert_eq!(parse_data_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_data_size("42").unwrap(), 42);
    }
}
