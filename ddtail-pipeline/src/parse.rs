// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decomposes merged records into structured fields.
//!
//! Five parser modes behind one closed enum: raw, regex capture, delimiter,
//! JSON object, and the bracketed operator format
//! (`[ts] [LEVEL] [thread] [file:line]\tk:v\tk:v`). Parsing never aborts the
//! pipeline: a regex mismatch or a bad timestamp is a per-record outcome.
//!
//! Timestamp recovery is deliberately lenient. A candidate that equals or is
//! a prefix of the previously parsed time string reuses the previous time,
//! which keeps sub-format-width fields working but can mask clock skew;
//! operators should know both knobs exist.

use crate::Record;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use ddtail_config::{MismatchPolicy, ParserConfig, SourceConfig};
use regex::Regex;

const KEY_LEVEL: &str = "__LEVEL__";
const KEY_THREAD: &str = "__THREAD__";
const KEY_FILE: &str = "__FILE__";
const KEY_LINE: &str = "__LINE__";
const KEY_MICROTIME: &str = "microtime";
const RAW_CONTENT_KEY: &str = "content";

/// Per-reader parse counters, flushed into the self-monitor profile.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParserStats {
    pub parse_failures: u64,
    pub time_failures: u64,
    /// Times the previous record's time was reused for a partial match.
    pub time_fallbacks: u64,
    pub outdated_dropped: u64,
}

#[derive(Debug)]
enum ParserKind {
    Raw {
        key: String,
        time_format: Option<String>,
    },
    Regex {
        regex: Regex,
        time_key: Option<String>,
        time_format: Option<String>,
        precise_key: Option<String>,
        on_mismatch: MismatchPolicy,
    },
    Delimiter {
        delimiter: char,
        quote: Option<char>,
        keys: Vec<String>,
        time_key: Option<String>,
        time_format: Option<String>,
    },
    Json {
        time_key: Option<String>,
        time_format: Option<String>,
    },
    Bracketed,
}

#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    Record(Record),
    /// Parsed fine but older than the discard cutoff.
    Outdated,
    /// Dropped by the mismatch policy.
    Dropped,
}

/// One compiled parser per reader. Holds the previous-time fallback state.
pub struct CompiledParser {
    kind: ParserKind,
    tz_offset_secs: i64,
    discard_old: ChronoDuration,
    last_time: Option<(String, DateTime<Utc>)>,
    stats: ParserStats,
}

impl CompiledParser {
    pub fn compile(source: &SourceConfig) -> Result<CompiledParser, regex::Error> {
        let kind = match &source.parser {
            ParserConfig::Raw { key, time_format } => ParserKind::Raw {
                key: key.clone(),
                time_format: time_format.clone(),
            },
            ParserConfig::Regex {
                pattern,
                time_key,
                time_format,
                precise_key,
                on_mismatch,
            } => ParserKind::Regex {
                regex: Regex::new(pattern)?,
                time_key: time_key.clone(),
                time_format: time_format.clone(),
                precise_key: precise_key.clone(),
                on_mismatch: *on_mismatch,
            },
            ParserConfig::Delimiter {
                delimiter,
                quote,
                keys,
                time_key,
                time_format,
            } => ParserKind::Delimiter {
                delimiter: *delimiter,
                quote: *quote,
                keys: keys.clone(),
                time_key: time_key.clone(),
                time_format: time_format.clone(),
            },
            ParserConfig::Json {
                time_key,
                time_format,
            } => ParserKind::Json {
                time_key: time_key.clone(),
                time_format: time_format.clone(),
            },
            ParserConfig::Bracketed => ParserKind::Bracketed,
        };
        Ok(CompiledParser {
            kind,
            tz_offset_secs: i64::from(source.tz_offset_secs.unwrap_or(0)),
            discard_old: ChronoDuration::seconds(source.discard_old_secs as i64),
            last_time: None,
            stats: ParserStats::default(),
        })
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Parse one merged record. `now` is the wall clock used both as the
    /// fallback timestamp and as the reference for the discard cutoff.
    pub fn parse(&mut self, raw: &[u8], now: DateTime<Utc>) -> ParseOutcome {
        let outcome = self.parse_inner(raw, now);
        match outcome {
            ParseOutcome::Record(record) if record.time < now - self.discard_old => {
                self.stats.outdated_dropped += 1;
                ParseOutcome::Outdated
            }
            other => other,
        }
    }

    fn parse_inner(&mut self, raw: &[u8], now: DateTime<Utc>) -> ParseOutcome {
        let content = String::from_utf8_lossy(raw);
        match &self.kind {
            ParserKind::Raw { key, time_format } => {
                let key = key.clone();
                let time = match time_format.clone() {
                    Some(format) => match NaiveDateTime::parse_and_remainder(&content, &format) {
                        Ok((naive, _rest)) => self.adjust(naive),
                        Err(_) => {
                            self.stats.time_failures += 1;
                            now
                        }
                    },
                    None => now,
                };
                ParseOutcome::Record(Record::new(
                    time,
                    vec![(key, content.into_owned())],
                ))
            }
            ParserKind::Regex {
                regex,
                time_key,
                time_format,
                precise_key,
                on_mismatch,
            } => {
                let regex = regex.clone();
                let time_key = time_key.clone();
                let time_format = time_format.clone();
                let precise_key = precise_key.clone();
                let on_mismatch = *on_mismatch;
                let Some(captures) = regex.captures(&content) else {
                    return self.mismatch(&content, now, on_mismatch);
                };
                let mut fields = Vec::new();
                for name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        fields.push((name.to_owned(), m.as_str().to_owned()));
                    }
                }
                let mut time = now;
                if let (Some(tk), Some(tf)) = (time_key.as_deref(), time_format.as_deref()) {
                    let candidate = fields
                        .iter()
                        .find(|(k, _)| k == tk)
                        .map(|(_, v)| v.clone());
                    match candidate {
                        Some(value) => match self.parse_time(&value, tf) {
                            Some(t) => time = t,
                            None => {
                                self.stats.time_failures += 1;
                            }
                        },
                        None => self.stats.time_failures += 1,
                    }
                }
                let mut record = Record::new(time, fields);
                if let Some(pk) = precise_key.as_deref() {
                    if let Some(frac) = record.field(pk) {
                        record.precise_us =
                            Some(time.timestamp() * 1_000_000 + fraction_to_micros(frac));
                    }
                }
                ParseOutcome::Record(record)
            }
            ParserKind::Delimiter {
                delimiter,
                quote,
                keys,
                time_key,
                time_format,
            } => {
                let (delimiter, quote) = (*delimiter, *quote);
                let keys = keys.clone();
                let time_key = time_key.clone();
                let time_format = time_format.clone();
                let parts = split_delimited(&content, delimiter, quote);
                if parts.len() != keys.len() {
                    return self.mismatch(&content, now, MismatchPolicy::Keep);
                }
                let fields: Vec<(String, String)> =
                    keys.into_iter().zip(parts).collect();
                let mut time = now;
                if let (Some(tk), Some(tf)) = (time_key.as_deref(), time_format.as_deref()) {
                    if let Some(value) = fields
                        .iter()
                        .find(|(k, _)| k == tk)
                        .map(|(_, v)| v.clone())
                    {
                        match self.parse_time(&value, tf) {
                            Some(t) => time = t,
                            None => self.stats.time_failures += 1,
                        }
                    }
                }
                ParseOutcome::Record(Record::new(time, fields))
            }
            ParserKind::Json {
                time_key,
                time_format,
            } => {
                let time_key = time_key.clone();
                let time_format = time_format.clone();
                let Ok(serde_json::Value::Object(object)) =
                    serde_json::from_slice::<serde_json::Value>(raw)
                else {
                    return self.mismatch(&content, now, MismatchPolicy::Keep);
                };
                let mut fields = Vec::with_capacity(object.len());
                for (key, value) in object {
                    let rendered = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => "null".to_owned(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        serde_json::Value::Number(n) => n.to_string(),
                        // Nested structures are rendered back to strings.
                        nested => nested.to_string(),
                    };
                    fields.push((key, rendered));
                }
                let mut time = now;
                if let (Some(tk), Some(tf)) = (time_key.as_deref(), time_format.as_deref()) {
                    if let Some(value) = fields
                        .iter()
                        .find(|(k, _)| k == tk)
                        .map(|(_, v)| v.clone())
                    {
                        match self.parse_time(&value, tf) {
                            Some(t) => time = t,
                            None => self.stats.time_failures += 1,
                        }
                    }
                }
                ParseOutcome::Record(Record::new(time, fields))
            }
            ParserKind::Bracketed => self.parse_bracketed(&content, now),
        }
    }

    fn mismatch(
        &mut self,
        content: &str,
        now: DateTime<Utc>,
        policy: MismatchPolicy,
    ) -> ParseOutcome {
        self.stats.parse_failures += 1;
        match policy {
            MismatchPolicy::Keep => ParseOutcome::Record(Record::new(
                now,
                vec![(RAW_CONTENT_KEY.to_owned(), content.to_owned())],
            )),
            MismatchPolicy::Drop => ParseOutcome::Dropped,
        }
    }

    /// strftime-style parse with the previous-time fallback. Returns `None`
    /// only when the candidate neither parses nor relates to the previous
    /// time string.
    fn parse_time(&mut self, value: &str, format: &str) -> Option<DateTime<Utc>> {
        if let Some((last_str, last_time)) = &self.last_time {
            if value == last_str {
                return Some(*last_time);
            }
        }
        match NaiveDateTime::parse_from_str(value, format) {
            Ok(naive) => {
                let time = self.adjust(naive);
                self.last_time = Some((value.to_owned(), time));
                Some(time)
            }
            Err(_) => {
                // Partial match: a candidate shorter than the format string
                // falls back to the previous record's parsed time.
                if let Some((last_str, last_time)) = &self.last_time {
                    if !value.is_empty() && last_str.starts_with(value) {
                        self.stats.time_fallbacks += 1;
                        return Some(*last_time);
                    }
                }
                None
            }
        }
    }

    /// Apply the source's fixed zone offset: a log written in UTC+8 with
    /// naive timestamps is 8 hours behind once normalized to UTC.
    fn adjust(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&naive) - ChronoDuration::seconds(self.tz_offset_secs)
    }

    fn parse_bracketed(&mut self, content: &str, now: DateTime<Utc>) -> ParseOutcome {
        let Some(rest) = content.strip_prefix('[') else {
            return self.mismatch(content, now, MismatchPolicy::Keep);
        };
        let Some(close) = rest.find(']') else {
            return self.mismatch(content, now, MismatchPolicy::Keep);
        };
        let ts = &rest[..close];
        let Some((time, micros)) = self.parse_bracketed_time(ts) else {
            self.stats.time_failures += 1;
            return self.mismatch(content, now, MismatchPolicy::Keep);
        };

        let mut fields = Vec::new();
        let mut cursor = &rest[close + 1..];
        // Up to three more bracketed header fields, recognized by content:
        // level is uppercase letters, thread is digits, file contains a path
        // separator or a dot and may carry a trailing :line.
        for _ in 0..3 {
            let trimmed = cursor.trim_start_matches([' ', '\t']);
            let Some(inner) = trimmed.strip_prefix('[') else {
                cursor = trimmed;
                break;
            };
            let Some(end) = inner.find(']') else {
                cursor = trimmed;
                break;
            };
            let value = &inner[..end];
            if !value.is_empty() && value.chars().all(|c| c.is_ascii_uppercase()) {
                fields.push((KEY_LEVEL.to_owned(), value.to_owned()));
            } else if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
                fields.push((KEY_THREAD.to_owned(), value.to_owned()));
            } else if value.contains('/') || value.contains('.') {
                match value.rsplit_once(':') {
                    Some((file, line)) if line.chars().all(|c| c.is_ascii_digit()) => {
                        fields.push((KEY_FILE.to_owned(), file.to_owned()));
                        fields.push((KEY_LINE.to_owned(), line.to_owned()));
                    }
                    _ => fields.push((KEY_FILE.to_owned(), value.to_owned())),
                }
            }
            cursor = &inner[end + 1..];
        }

        // Trailing tab-separated key:value pairs.
        for pair in cursor.split('\t') {
            let pair = pair.trim_matches([' ', '\r']);
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((k, v)) if !k.is_empty() => {
                    fields.push((k.to_owned(), v.to_owned()));
                }
                _ => fields.push((RAW_CONTENT_KEY.to_owned(), pair.to_owned())),
            }
        }

        fields.push((KEY_MICROTIME.to_owned(), micros.to_string()));
        let mut record = Record::new(time, fields);
        record.precise_us = Some(micros);
        ParseOutcome::Record(record)
    }

    /// Bracketed timestamps come in two shapes: 10 epoch-second digits
    /// optionally followed by up to 6 microsecond digits, or
    /// `%Y-%m-%d %H:%M:%S` with an optional `.micros` suffix.
    fn parse_bracketed_time(&mut self, ts: &str) -> Option<(DateTime<Utc>, i64)> {
        if ts.starts_with('1') && ts.chars().all(|c| c.is_ascii_digit()) && ts.len() >= 10 {
            let secs: i64 = ts[..10].parse().ok()?;
            let frac = &ts[10..ts.len().min(16)];
            let mut micros = frac.parse::<i64>().unwrap_or(0);
            for _ in frac.len()..6 {
                micros *= 10;
            }
            let time = Utc.timestamp_opt(secs, 0).single()?;
            return Some((time, secs * 1_000_000 + micros));
        }
        if ts.len() < 19 {
            // Same-second shortcut against the previous record.
            if let Some((last_str, last_time)) = &self.last_time {
                if last_str.starts_with(ts) && !ts.is_empty() {
                    self.stats.time_fallbacks += 1;
                    return Some((*last_time, last_time.timestamp() * 1_000_000));
                }
            }
            return None;
        }
        let (date_part, frac) = match ts[19..].strip_prefix('.') {
            Some(frac) => (&ts[..19], frac),
            None => (&ts[..19], ""),
        };
        let time = match self.parse_time(date_part, "%Y-%m-%d %H:%M:%S") {
            Some(t) => t,
            None => return None,
        };
        let digits: String = frac.chars().take_while(|c| c.is_ascii_digit()).collect();
        let micros = time.timestamp() * 1_000_000 + fraction_to_micros(&digits);
        Some((time, micros))
    }
}

/// `"123"` as a fraction of a second is 123000 microseconds.
fn fraction_to_micros(frac: &str) -> i64 {
    let digits: String = frac.chars().take(6).take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    let mut micros: i64 = digits.parse().unwrap_or(0);
    for _ in digits.len()..6 {
        micros *= 10;
    }
    micros
}

fn split_delimited(s: &str, delimiter: char, quote: Option<char>) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for c in s.chars() {
        if let Some(q) = quote {
            if c == q {
                in_quote = !in_quote;
                continue;
            }
        }
        if c == delimiter && !in_quote {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source(parser: serde_json::Value) -> SourceConfig {
        serde_json::from_value(serde_json::json!({
            "name": "test",
            "path_glob": "/logs/*.log",
            "destination": "main",
            "parser": parser,
        }))
        .unwrap()
    }

    fn parser(config: serde_json::Value) -> CompiledParser {
        CompiledParser::compile(&source(config)).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_raw_parser() {
        let mut p = parser(serde_json::json!({ "type": "raw", "key": "content" }));
        let out = p.parse(b"alpha", now());
        match out {
            ParseOutcome::Record(r) => {
                assert_eq!(r.field("content"), Some("alpha"));
                assert_eq!(r.time, now());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_raw_parser_leading_time() {
        let mut p = parser(serde_json::json!({
            "type": "raw", "key": "content", "time_format": "%Y-%m-%d %H:%M:%S"
        }));
        let out = p.parse(b"2025-06-01 11:59:00 something happened", now());
        match out {
            ParseOutcome::Record(r) => {
                assert_eq!(r.time, Utc.with_ymd_and_hms(2025, 6, 1, 11, 59, 0).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_regex_parser_named_captures() {
        let mut p = parser(serde_json::json!({
            "type": "regex",
            "pattern": r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) (?P<level>\w+) (?P<msg>.*)$",
            "time_key": "ts",
            "time_format": "%Y-%m-%d %H:%M:%S",
        }));
        let out = p.parse(b"2025-06-01 11:30:00 INFO started", now());
        match out {
            ParseOutcome::Record(r) => {
                assert_eq!(r.field("level"), Some("INFO"));
                assert_eq!(r.field("msg"), Some("started"));
                assert_eq!(r.time, Utc.with_ymd_and_hms(2025, 6, 1, 11, 30, 0).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_regex_mismatch_policies() {
        let mut keep = parser(serde_json::json!({
            "type": "regex", "pattern": r"^\d+$", "on_mismatch": "keep"
        }));
        match keep.parse(b"not a number", now()) {
            ParseOutcome::Record(r) => assert_eq!(r.field("content"), Some("not a number")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(keep.stats().parse_failures, 1);

        let mut drop = parser(serde_json::json!({
            "type": "regex", "pattern": r"^\d+$", "on_mismatch": "drop"
        }));
        assert_eq!(drop.parse(b"not a number", now()), ParseOutcome::Dropped);
    }

    #[test]
    fn test_time_failure_falls_back_to_wall_clock() {
        let mut p = parser(serde_json::json!({
            "type": "regex",
            "pattern": r"^(?P<ts>\S+) (?P<msg>.*)$",
            "time_key": "ts",
            "time_format": "%Y-%m-%d %H:%M:%S",
        }));
        match p.parse(b"garbage-time hello", now()) {
            ParseOutcome::Record(r) => assert_eq!(r.time, now()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.stats().time_failures, 1);
    }

    #[test]
    fn test_partial_time_reuses_previous() {
        let mut p = parser(serde_json::json!({
            "type": "regex",
            "pattern": r"^\[(?P<ts>[^\]]*)\] (?P<msg>.*)$",
            "time_key": "ts",
            "time_format": "%Y-%m-%d %H:%M:%S",
        }));
        let full = Utc.with_ymd_and_hms(2025, 6, 1, 11, 30, 0).unwrap();
        match p.parse(b"[2025-06-01 11:30:00] first", now()) {
            ParseOutcome::Record(r) => assert_eq!(r.time, full),
            other => panic!("unexpected {other:?}"),
        }
        // Truncated field: prefix of the previous candidate.
        match p.parse(b"[2025-06-01 11:3] second", now()) {
            ParseOutcome::Record(r) => assert_eq!(r.time, full),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.stats().time_fallbacks, 1);
    }

    #[test]
    fn test_outdated_record_dropped() {
        let mut p = parser(serde_json::json!({
            "type": "regex",
            "pattern": r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) (?P<msg>.*)$",
            "time_key": "ts",
            "time_format": "%Y-%m-%d %H:%M:%S",
        }));
        // Default cutoff is 43200 s; two days is well past it.
        assert_eq!(
            p.parse(b"2025-05-30 11:00:00 old", now()),
            ParseOutcome::Outdated
        );
        assert_eq!(p.stats().outdated_dropped, 1);
    }

    #[test]
    fn test_delimiter_parser() {
        let mut p = parser(serde_json::json!({
            "type": "delimiter",
            "delimiter": ",",
            "quote": "\"",
            "keys": ["a", "b", "c"],
        }));
        match p.parse(b"1,\"two, with comma\",3", now()) {
            ParseOutcome::Record(r) => {
                assert_eq!(r.field("a"), Some("1"));
                assert_eq!(r.field("b"), Some("two, with comma"));
                assert_eq!(r.field("c"), Some("3"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Wrong column count keeps the raw content.
        match p.parse(b"only,two", now()) {
            ParseOutcome::Record(r) => assert_eq!(r.field("content"), Some("only,two")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_json_parser_scalars_and_nesting() {
        let mut p = parser(serde_json::json!({ "type": "json" }));
        match p.parse(
            br#"{"msg":"hi","count":3,"ok":true,"nested":{"a":1},"none":null}"#,
            now(),
        ) {
            ParseOutcome::Record(r) => {
                assert_eq!(r.field("msg"), Some("hi"));
                assert_eq!(r.field("count"), Some("3"));
                assert_eq!(r.field("ok"), Some("true"));
                assert_eq!(r.field("nested"), Some(r#"{"a":1}"#));
                assert_eq!(r.field("none"), Some("null"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Non-object JSON keeps the raw content.
        match p.parse(b"[1,2,3]", now()) {
            ParseOutcome::Record(r) => assert_eq!(r.field("content"), Some("[1,2,3]")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bracketed_parser_datetime_form() {
        let mut p = parser(serde_json::json!({ "type": "bracketed" }));
        let line =
            b"[2025-06-01 11:30:00.123456]\t[WARNING]\t[12345]\t[src/app.cpp:42]\tkey:value\tmode:fast";
        match p.parse(line, now()) {
            ParseOutcome::Record(r) => {
                assert_eq!(r.time, Utc.with_ymd_and_hms(2025, 6, 1, 11, 30, 0).unwrap());
                assert_eq!(r.field(KEY_LEVEL), Some("WARNING"));
                assert_eq!(r.field(KEY_THREAD), Some("12345"));
                assert_eq!(r.field(KEY_FILE), Some("src/app.cpp"));
                assert_eq!(r.field(KEY_LINE), Some("42"));
                assert_eq!(r.field("key"), Some("value"));
                assert_eq!(r.field("mode"), Some("fast"));
                let micros = r.field(KEY_MICROTIME).unwrap().parse::<i64>().unwrap();
                assert_eq!(micros % 1_000_000, 123456);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bracketed_parser_epoch_form() {
        let mut p = parser(serde_json::json!({ "type": "bracketed" }));
        // now() is 2025-06-01T12:00:00Z == 1748779200.
        let line = b"[1748779200123456]\t[INFO]\tstatus:ok";
        match p.parse(line, now()) {
            ParseOutcome::Record(r) => {
                assert_eq!(r.time.timestamp(), 1_748_779_200);
                assert_eq!(r.field(KEY_LEVEL), Some("INFO"));
                assert_eq!(r.field("status"), Some("ok"));
                assert_eq!(r.precise_us, Some(1_748_779_200_123_456));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bracketed_parser_garbage_keeps_raw() {
        let mut p = parser(serde_json::json!({ "type": "bracketed" }));
        match p.parse(b"no brackets here", now()) {
            ParseOutcome::Record(r) => {
                assert_eq!(r.field("content"), Some("no brackets here"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.stats().parse_failures, 1);
    }

    #[test]
    fn test_tz_offset_applied() {
        let cfg = serde_json::from_value::<SourceConfig>(serde_json::json!({
            "name": "test",
            "path_glob": "/logs/*.log",
            "destination": "main",
            "tz_offset_secs": 28800,
            "parser": {
                "type": "regex",
                "pattern": r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})$",
                "time_key": "ts",
                "time_format": "%Y-%m-%d %H:%M:%S",
            },
        }))
        .unwrap();
        let mut p = CompiledParser::compile(&cfg).unwrap();
        // A UTC+8 log written at 19:30 local is 11:30 UTC.
        match p.parse(b"2025-06-01 19:30:00", now()) {
            ParseOutcome::Record(r) => {
                assert_eq!(r.time, Utc.with_ymd_and_hms(2025, 6, 1, 11, 30, 0).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
