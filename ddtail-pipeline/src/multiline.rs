// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merges logical lines into records.
//!
//! Five modes: every line its own record, start-anchored, start+continue,
//! start+end, continue+end, and the container-runtime flag protocol where
//! each line arrives with a "partial" bit. The regex modes run a two-state
//! machine (`Idle` / `InRecord`); lines the machine cannot attach follow the
//! source's unmatched policy.

use ddtail_config::{MultilineConfig, UnmatchedPolicy};
use regex::bytes::Regex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum CompiledMultiline {
    Single,
    Start(Regex),
    StartContinue(Regex, Regex),
    StartEnd(Regex, Regex),
    ContinueEnd(Regex, Regex),
    Flag,
}

impl CompiledMultiline {
    pub fn compile(config: &MultilineConfig) -> Result<CompiledMultiline, regex::Error> {
        Ok(match config {
            MultilineConfig::Single => CompiledMultiline::Single,
            MultilineConfig::Start { start } => CompiledMultiline::Start(Regex::new(start)?),
            MultilineConfig::StartContinue { start, cont } => {
                CompiledMultiline::StartContinue(Regex::new(start)?, Regex::new(cont)?)
            }
            MultilineConfig::StartEnd { start, end } => {
                CompiledMultiline::StartEnd(Regex::new(start)?, Regex::new(end)?)
            }
            MultilineConfig::ContinueEnd { cont, end } => {
                CompiledMultiline::ContinueEnd(Regex::new(cont)?, Regex::new(end)?)
            }
            MultilineConfig::Flag => CompiledMultiline::Flag,
        })
    }
}

/// Line-to-record state machine for one reader.
pub struct Assembler {
    mode: CompiledMultiline,
    policy: UnmatchedPolicy,
    timeout: Duration,
    pending: Vec<Vec<u8>>,
    opened_at: Option<Instant>,
    discarded_unmatched: u64,
}

impl Assembler {
    pub fn new(mode: CompiledMultiline, policy: UnmatchedPolicy, timeout: Duration) -> Assembler {
        Assembler {
            mode,
            policy,
            timeout,
            pending: Vec::new(),
            opened_at: None,
            discarded_unmatched: 0,
        }
    }

    /// Feed one logical line; returns the records it completed.
    pub fn push_line(&mut self, line: Vec<u8>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        // The borrow checker dislikes matching on self.mode while mutating
        // state, so the regexes are cloned handles (regex::Regex is an Arc).
        let mode = self.mode.clone();
        match mode {
            CompiledMultiline::Single => out.push(line),
            CompiledMultiline::Flag => {
                // Without runtime flags every line is final.
                out.extend(self.push_flagged(line, false));
            }
            CompiledMultiline::Start(start) => {
                if self.pending.is_empty() {
                    if start.is_match(&line) {
                        self.open(line);
                    } else {
                        self.orphan(line, &mut out);
                    }
                } else if start.is_match(&line) {
                    out.push(self.close());
                    self.open(line);
                } else {
                    self.pending.push(line);
                }
            }
            CompiledMultiline::StartContinue(start, cont) => {
                if self.pending.is_empty() {
                    if start.is_match(&line) {
                        self.open(line);
                    } else {
                        self.orphan(line, &mut out);
                    }
                } else if cont.is_match(&line) {
                    self.pending.push(line);
                } else {
                    // The record that was open is complete; the closing line
                    // either starts the next record or is an orphan.
                    out.push(self.close());
                    if start.is_match(&line) {
                        self.open(line);
                    } else {
                        self.orphan(line, &mut out);
                    }
                }
            }
            CompiledMultiline::StartEnd(start, end) => {
                if self.pending.is_empty() {
                    if start.is_match(&line) {
                        self.open(line);
                    } else {
                        // Includes a stray end line with no open record.
                        self.orphan(line, &mut out);
                    }
                } else if end.is_match(&line) {
                    self.pending.push(line);
                    out.push(self.close());
                } else if start.is_match(&line) {
                    out.push(self.close());
                    self.open(line);
                } else {
                    self.pending.push(line);
                }
            }
            CompiledMultiline::ContinueEnd(cont, end) => {
                if self.pending.is_empty() {
                    if cont.is_match(&line) {
                        self.open(line);
                    } else if end.is_match(&line) {
                        out.push(line);
                    } else {
                        self.orphan(line, &mut out);
                    }
                } else if cont.is_match(&line) {
                    self.pending.push(line);
                } else if end.is_match(&line) {
                    self.pending.push(line);
                    out.push(self.close());
                } else {
                    // The open run never saw its end line.
                    self.close_unmatched(&mut out);
                    self.orphan(line, &mut out);
                }
            }
        }
        out
    }

    /// Flag-protocol entry point: `partial` lines concatenate into the first
    /// following full line, with no separator (the runtime split one line).
    pub fn push_flagged(&mut self, line: Vec<u8>, partial: bool) -> Vec<Vec<u8>> {
        if partial {
            if self.pending.is_empty() {
                self.opened_at = Some(Instant::now());
            }
            self.pending.push(line);
            return Vec::new();
        }
        if self.pending.is_empty() {
            return vec![line];
        }
        let mut merged = Vec::new();
        for part in self.pending.drain(..) {
            merged.extend_from_slice(&part);
        }
        merged.extend_from_slice(&line);
        self.opened_at = None;
        vec![merged]
    }

    /// File-boundary flush: rotation, truncation, reader teardown. The open
    /// record is emitted even if its closing condition never arrived.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(match self.mode {
            CompiledMultiline::Flag => {
                let mut merged = Vec::new();
                for part in self.pending.drain(..) {
                    merged.extend_from_slice(&part);
                }
                self.opened_at = None;
                merged
            }
            _ => self.close(),
        })
    }

    /// Force-emit an open record that has been waiting longer than the
    /// multiline timeout, so a never-closing tail cannot stall the pipeline.
    /// This is the assembler's only time-based behavior.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.opened_at {
            Some(opened) if now.duration_since(opened) >= self.timeout => self.flush(),
            _ => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Lines dropped by the `discard` unmatched policy.
    pub fn discarded_unmatched(&self) -> u64 {
        self.discarded_unmatched
    }

    fn open(&mut self, line: Vec<u8>) {
        self.opened_at = Some(Instant::now());
        self.pending.push(line);
    }

    fn close(&mut self) -> Vec<u8> {
        let mut merged = Vec::new();
        for (i, part) in self.pending.drain(..).enumerate() {
            if i > 0 {
                merged.push(b'\n');
            }
            merged.extend_from_slice(&part);
        }
        self.opened_at = None;
        merged
    }

    fn close_unmatched(&mut self, out: &mut Vec<Vec<u8>>) {
        match self.policy {
            UnmatchedPolicy::Keep => out.push(self.close()),
            UnmatchedPolicy::Discard => {
                self.discarded_unmatched += self.pending.len() as u64;
                self.pending.clear();
                self.opened_at = None;
            }
        }
    }

    fn orphan(&mut self, line: Vec<u8>, out: &mut Vec<Vec<u8>>) {
        match self.policy {
            UnmatchedPolicy::Keep => out.push(line),
            UnmatchedPolicy::Discard => self.discarded_unmatched += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(config: MultilineConfig, policy: UnmatchedPolicy) -> Assembler {
        Assembler::new(
            CompiledMultiline::compile(&config).unwrap(),
            policy,
            Duration::from_secs(3),
        )
    }

    fn push_all(asm: &mut Assembler, lines: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for line in lines {
            for rec in asm.push_line(line.as_bytes().to_vec()) {
                out.push(String::from_utf8(rec).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_single_mode() {
        let mut asm = assembler(MultilineConfig::Single, UnmatchedPolicy::Keep);
        let out = push_all(&mut asm, &["alpha", "beta"]);
        assert_eq!(out, vec!["alpha", "beta"]);
        assert!(asm.flush().is_none());
    }

    #[test]
    fn test_start_mode_stack_traces() {
        // Scenario from a Java-style stack trace source.
        let mut asm = assembler(
            MultilineConfig::Start {
                start: "^E: ".into(),
            },
            UnmatchedPolicy::Keep,
        );
        let mut out = push_all(&mut asm, &["E: one", "  at x", "  at y", "E: two", "  at z"]);
        assert_eq!(out, vec!["E: one\n  at x\n  at y"]);
        // File boundary closes the last record.
        out.push(String::from_utf8(asm.flush().unwrap()).unwrap());
        assert_eq!(out[1], "E: two\n  at z");
    }

    #[test]
    fn test_start_mode_leading_orphans() {
        let mut asm = assembler(
            MultilineConfig::Start {
                start: "^E: ".into(),
            },
            UnmatchedPolicy::Keep,
        );
        let out = push_all(&mut asm, &["noise", "E: one", "tail"]);
        assert_eq!(out, vec!["noise"]);
        assert_eq!(String::from_utf8(asm.flush().unwrap()).unwrap(), "E: one\ntail");
    }

    #[test]
    fn test_start_end_with_discard() {
        let mut asm = assembler(
            MultilineConfig::StartEnd {
                start: "^E: ".into(),
                end: r"^\.\.\.".into(),
            },
            UnmatchedPolicy::Discard,
        );
        let out = push_all(&mut asm, &["junk", "E: one", "junk2", "... more", "junk3"]);
        assert_eq!(out, vec!["E: one\njunk2\n... more"]);
        assert_eq!(asm.discarded_unmatched(), 2);
    }

    #[test]
    fn test_start_end_stray_end_keep_policy() {
        let mut asm = assembler(
            MultilineConfig::StartEnd {
                start: "^BEGIN".into(),
                end: "^END".into(),
            },
            UnmatchedPolicy::Keep,
        );
        let out = push_all(&mut asm, &["END"]);
        assert_eq!(out, vec!["END"]);
    }

    #[test]
    fn test_start_continue_mode() {
        let mut asm = assembler(
            MultilineConfig::StartContinue {
                start: "^REQ ".into(),
                cont: r"^\s".into(),
            },
            UnmatchedPolicy::Discard,
        );
        let out = push_all(
            &mut asm,
            &["REQ a", " h1", " h2", "stray", "REQ b", " h3"],
        );
        // "stray" closes the first record and is itself discarded.
        assert_eq!(out, vec!["REQ a\n h1\n h2"]);
        assert_eq!(asm.discarded_unmatched(), 1);
        assert_eq!(String::from_utf8(asm.flush().unwrap()).unwrap(), "REQ b\n h3");
    }

    #[test]
    fn test_continue_end_mode() {
        let mut asm = assembler(
            MultilineConfig::ContinueEnd {
                cont: r"^\+".into(),
                end: "^=".into(),
            },
            UnmatchedPolicy::Keep,
        );
        let out = push_all(&mut asm, &["+a", "+b", "=sum", "=lone"]);
        assert_eq!(out, vec!["+a\n+b\n=sum", "=lone"]);
    }

    #[test]
    fn test_continue_end_broken_run_follows_policy() {
        let mut asm = assembler(
            MultilineConfig::ContinueEnd {
                cont: r"^\+".into(),
                end: "^=".into(),
            },
            UnmatchedPolicy::Discard,
        );
        let out = push_all(&mut asm, &["+a", "+b", "junk"]);
        assert!(out.is_empty());
        // Both continue lines and the junk line are discarded.
        assert_eq!(asm.discarded_unmatched(), 3);
    }

    #[test]
    fn test_flag_mode_concatenates_partials() {
        let mut asm = assembler(MultilineConfig::Flag, UnmatchedPolicy::Keep);
        assert!(asm.push_flagged(b"par".to_vec(), true).is_empty());
        assert!(asm.push_flagged(b"tial ".to_vec(), true).is_empty());
        let out = asm.push_flagged(b"line".to_vec(), false);
        assert_eq!(out, vec![b"partial line".to_vec()]);
        // A full line with no pending partials passes straight through.
        let direct = asm.push_flagged(b"whole".to_vec(), false);
        assert_eq!(direct, vec![b"whole".to_vec()]);
    }

    #[test]
    fn test_flag_mode_flush_merges_pending() {
        let mut asm = assembler(MultilineConfig::Flag, UnmatchedPolicy::Keep);
        let _ = asm.push_flagged(b"dangling".to_vec(), true);
        assert_eq!(asm.flush().unwrap(), b"dangling".to_vec());
    }

    #[test]
    fn test_timeout_flushes_open_record() {
        let mut asm = Assembler::new(
            CompiledMultiline::compile(&MultilineConfig::Start {
                start: "^E: ".into(),
            })
            .unwrap(),
            UnmatchedPolicy::Keep,
            Duration::from_millis(1),
        );
        assert!(asm.push_line(b"E: slow".to_vec()).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let flushed = asm.poll_timeout(Instant::now()).unwrap();
        assert_eq!(flushed, b"E: slow".to_vec());
        assert!(!asm.has_pending());
    }

    #[test]
    fn test_emission_preserves_bytes_keep_policy() {
        // Invariant: concatenated emitted bytes equal concatenated input
        // lines when nothing is discarded.
        let lines = ["E: a", "x", "E: b", "y", "z"];
        let mut asm = assembler(
            MultilineConfig::Start {
                start: "^E: ".into(),
            },
            UnmatchedPolicy::Keep,
        );
        let mut emitted = push_all(&mut asm, &lines);
        if let Some(last) = asm.flush() {
            emitted.push(String::from_utf8(last).unwrap());
        }
        let emitted_lines: Vec<&str> = emitted.iter().flat_map(|r| r.split('\n')).collect();
        assert_eq!(emitted_lines, lines);
    }
}
