//! Command extraction from an edify-style flashing script.
//!
//! Only the call shape `name(arg, arg, ...)` is recognised. The first `)`
//! closes a call, so nested parentheses inside arguments are not supported.
//! Malformed text yields fewer (or no) commands rather than an error.

use std::sync::LazyLock;

use regex::Regex;

static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\((.*?)\)").expect("call regex"));

static ARG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)"|(\b\d+\b)|(\b\S+\b)"#).expect("argument regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ScriptCommand {
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

pub fn parse(script: &str) -> Vec<ScriptCommand> {
    let flat = script.replace(['\r', '\n'], "");
    CALL_RE
        .captures_iter(&flat)
        .map(|call| ScriptCommand {
            name: call[1].to_string(),
            args: split_args(&call[2]),
        })
        .collect()
}

fn split_args(raw: &str) -> Vec<String> {
    ARG_RE
        .captures_iter(raw)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .map(|m| m.as_str().to_string())
        .collect()
}
