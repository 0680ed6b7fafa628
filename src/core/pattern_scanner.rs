//! Line-assembling pattern matcher (component C).
//!
//! Ingests the same byte stream as the output log. Maintains a per-task
//! carry buffer of bytes since the last newline; on each complete line it
//! strips ANSI CSI sequences and evaluates rules in descending priority,
//! firing at most one rule per line.

use std::time::{Duration, Instant};

use regex::Regex;

/// What happens when a rule fires.
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Write `payload` + `\r` to the child's stdin.
    Inject(String),
    /// Send SIGINT to the child.
    Interrupt,
    /// Emit the `pattern-hit` event; no child-side effect.
    RecordOnly,
    /// Timer-driven: evaluated by the stall ticker, not the line
    /// scanner. A rule with this action carries no `pattern`.
    Stall,
}

/// Process-wide rule configuration, resolved from [`crate::config::RuleConfig`].
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub pattern: Option<Regex>,
    pub action: RuleAction,
    pub priority: i32,
    pub cooldown: Duration,
}

/// Outcome of feeding a chunk through the scanner: the lines it completed
/// and, for each, the rule (if any) that fired.
pub struct ScanResult {
    pub hits: Vec<LineHit>,
}

pub struct LineHit {
    pub rule_id: String,
    pub matched_text: String,
}

/// Per-task line assembler and rule evaluator. One instance per task,
/// owned by the task's registry record.
pub struct PatternScanner {
    rules: Vec<Rule>,
    max_line_bytes: usize,
    carry: Vec<u8>,
    /// Last firing time per rule id, for cooldown accounting.
    last_fired: std::collections::HashMap<String, Instant>,
}

impl PatternScanner {
    pub fn new(rules: Vec<Rule>, max_line_bytes: usize) -> Self {
        Self {
            rules,
            max_line_bytes,
            carry: Vec::new(),
            last_fired: std::collections::HashMap::new(),
        }
    }

    /// Feeds a chunk of child output through line assembly and matching.
    /// Returns at most one hit per completed line.
    pub fn feed(&mut self, chunk: &[u8]) -> ScanResult {
        self.carry.extend_from_slice(chunk);

        let mut hits = Vec::new();
        loop {
            let newline_pos = self.carry.iter().position(|&b| b == b'\n');
            match newline_pos {
                Some(pos) => {
                    let line: Vec<u8> = self.carry.drain(..=pos).collect();
                    // Drop the trailing newline (and a preceding \r if present).
                    let line = &line[..line.len().saturating_sub(1)];
                    let line = if line.ends_with(b"\r") {
                        &line[..line.len() - 1]
                    } else {
                        line
                    };
                    if let Some(hit) = self.evaluate_line(line) {
                        hits.push(hit);
                    }
                }
                None => break,
            }
        }

        if self.carry.len() > self.max_line_bytes {
            // Synthetic flush: emit what we have as a line to avoid
            // unbounded growth, then reset carry.
            let line = std::mem::take(&mut self.carry);
            if let Some(hit) = self.evaluate_line(&line) {
                hits.push(hit);
            }
        }

        ScanResult { hits }
    }

    fn evaluate_line(&mut self, line: &[u8]) -> Option<LineHit> {
        let stripped = strip_ansi_escapes::strip(line);
        let text = String::from_utf8_lossy(&stripped);

        let now = Instant::now();
        for rule in &self.rules {
            let Some(pattern) = &rule.pattern else {
                continue; // Stall rule: not line-driven.
            };
            let Some(m) = pattern.find(&text) else {
                continue;
            };
            let ready = match self.last_fired.get(&rule.id) {
                Some(last) => now.duration_since(*last) >= rule.cooldown,
                None => true,
            };
            if !ready {
                // Cooldown not elapsed: this rule does not fire again yet.
                // At most one rule fires per line, so a suppressed rule
                // does not fall through to a lower-priority rule — the
                // line simply produces no hit from this rule.
                continue;
            }
            self.last_fired.insert(rule.id.clone(), now);
            return Some(LineHit {
                rule_id: rule.id.clone(),
                matched_text: m.as_str().to_string(),
            });
        }
        None
    }

    /// Whether `rule_id`'s cooldown has elapsed for this task, as of now.
    /// Used by the stall ticker, which bypasses `evaluate_line`.
    pub fn cooldown_elapsed(&self, rule_id: &str, cooldown: Duration) -> bool {
        match self.last_fired.get(rule_id) {
            Some(last) => last.elapsed() >= cooldown,
            None => true,
        }
    }

    pub fn record_fired(&mut self, rule_id: &str) {
        self.last_fired.insert(rule_id.to_string(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, pattern: &str, priority: i32, cooldown_ms: u64) -> Rule {
        Rule {
            id: id.to_string(),
            pattern: Some(Regex::new(pattern).unwrap()),
            action: RuleAction::RecordOnly,
            priority,
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    #[test]
    fn matches_complete_line_only() {
        let mut scanner = PatternScanner::new(vec![rule("todo", r"TODO", 0, 0)], 8192);
        let result = scanner.feed(b"no newline yet TODO");
        assert!(result.hits.is_empty(), "partial line must not match");

        let result = scanner.feed(b"\n");
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].rule_id, "todo");
    }

    #[test]
    fn strips_ansi_before_matching() {
        let mut scanner = PatternScanner::new(vec![rule("todo", r"TODO", 0, 0)], 8192);
        let result = scanner.feed(b"\x1b[31mTODO\x1b[0m\n");
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn at_most_one_rule_per_line() {
        let rules = vec![
            rule("high", r"TODO", 10, 0),
            rule("low", r"TODO|FIXME", 1, 0),
        ];
        let mut scanner = PatternScanner::new(rules, 8192);
        let result = scanner.feed(b"TODO and FIXME\n");
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].rule_id, "high");
    }

    #[test]
    fn cooldown_suppresses_repeat_firing() {
        let mut scanner = PatternScanner::new(vec![rule("todo", r"TODO", 0, 10_000)], 8192);
        let first = scanner.feed(b"TODO\n");
        assert_eq!(first.hits.len(), 1);
        let second = scanner.feed(b"TODO\n");
        assert!(second.hits.is_empty(), "cooldown should suppress the second hit");
    }

    #[test]
    fn oversized_carry_flushes_synthetically() {
        let mut scanner = PatternScanner::new(vec![rule("todo", r"TODO", 0, 0)], 16);
        let result = scanner.feed(b"xxxxxxxxxxxxxxxxxxxxTODO");
        assert_eq!(result.hits.len(), 1, "oversized carry without a newline must still flush");
    }

    #[test]
    fn carriage_return_trimmed_from_line() {
        let mut scanner = PatternScanner::new(vec![rule("todo", r"TODO$", 0, 0)], 8192);
        let result = scanner.feed(b"TODO\r\n");
        assert_eq!(result.hits.len(), 1);
    }
}
