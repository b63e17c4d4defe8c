//! Tool-call policy engine.
//!
//! Decides whether a proposed tool call may run unattended, needs the user's
//! confirmation, or is refused. Evaluation is a pure function of the tool name,
//! its arguments and the configured rules.
//!
//! # Precedence
//!
//! 1. Any matching `deny` rule wins.
//! 2. Otherwise any matching `allow` rule wins.
//! 3. Otherwise a matching `ask` rule, or the engine default (`ask`).
//!
//! Within one verdict the first matching rule is reported.
//!
//! # Matching
//!
//! A rule's `tool` is an exact name or a glob (`*` any run, `?` one
//! character). Argument matchers select a value by JSON pointer and compare it
//! against a glob; all matchers of a rule must hold.

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    Allow,
    Ask,
    Deny,
}

impl PolicyVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ask => "ask",
            Self::Deny => "deny",
        }
    }
}

impl std::fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus the identity of the rule that produced it (`None` = default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub verdict: PolicyVerdict,
    pub matched_rule: Option<String>,
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        self.verdict == PolicyVerdict::Allow
    }

    pub fn is_deny(&self) -> bool {
        self.verdict == PolicyVerdict::Deny
    }

    /// Rule identity for audit logs.
    pub fn rule_label(&self) -> &str {
        self.matched_rule.as_deref().unwrap_or("<default>")
    }
}

/// Constraint on one argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentMatcher {
    /// JSON pointer into the arguments, e.g. `/command`
    pub pointer: String,
    /// Glob the value must match; non-string values are matched on their JSON text
    pub pattern: String,
}

/// A configured rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Exact tool name or glob
    pub tool: String,
    pub verdict: PolicyVerdict,
    #[serde(default)]
    pub arguments: Vec<ArgumentMatcher>,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, verdict: PolicyVerdict) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            verdict,
            arguments: Vec::new(),
        }
    }

    pub fn allow(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, tool, PolicyVerdict::Allow)
    }

    pub fn ask(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, tool, PolicyVerdict::Ask)
    }

    pub fn deny(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, tool, PolicyVerdict::Deny)
    }

    /// Adds an argument constraint.
    pub fn when_arg(mut self, pointer: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.arguments.push(ArgumentMatcher {
            pointer: pointer.into(),
            pattern: pattern.into(),
        });
        self
    }
}

/// Compiles a glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?s)^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| Error::config(format!("invalid glob '{}': {}", glob, e)))
}

#[derive(Debug)]
struct CompiledRule {
    rule: PolicyRule,
    tool: Regex,
    arguments: Vec<(String, Regex)>,
}

impl CompiledRule {
    fn compile(rule: PolicyRule) -> Result<Self> {
        let tool = glob_to_regex(&rule.tool)?;
        let arguments = rule
            .arguments
            .iter()
            .map(|m| Ok((m.pointer.clone(), glob_to_regex(&m.pattern)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rule,
            tool,
            arguments,
        })
    }

    fn matches(&self, tool_name: &str, args: &Value) -> bool {
        if !self.tool.is_match(tool_name) {
            return false;
        }
        self.arguments.iter().all(|(pointer, pattern)| {
            match args.pointer(pointer) {
                Some(Value::String(s)) => pattern.is_match(s),
                Some(other) => pattern.is_match(&other.to_string()),
                None => false,
            }
        })
    }
}

/// Evaluates tool calls against a rule set.
#[derive(Debug)]
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    default_verdict: PolicyVerdict,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_verdict: PolicyVerdict::Ask,
        }
    }
}

impl PolicyEngine {
    /// Builds an engine; fails if a glob does not compile.
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            ..Self::default()
        })
    }

    /// Loads rules from a JSON array.
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<PolicyRule> = serde_json::from_str(json)?;
        Self::new(rules)
    }

    /// Verdict used when no rule matches.
    pub fn with_default(mut self, verdict: PolicyVerdict) -> Self {
        self.default_verdict = verdict;
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    pub fn evaluate(&self, tool_name: &str, args: &Value) -> PolicyDecision {
        let first = |verdict: PolicyVerdict| {
            self.rules
                .iter()
                .find(|c| c.rule.verdict == verdict && c.matches(tool_name, args))
        };

        for verdict in [PolicyVerdict::Deny, PolicyVerdict::Allow, PolicyVerdict::Ask] {
            if let Some(compiled) = first(verdict) {
                return PolicyDecision {
                    verdict,
                    matched_rule: Some(compiled.rule.id.clone()),
                };
            }
        }

        PolicyDecision {
            verdict: self.default_verdict,
            matched_rule: None,
        }
    }
}
