//! Project configuration loading.
//!
//! A project is described by a `config.mcy` file with INI-like sections:
//! `[options]`, `[script]` (the generator script body), `[logic]` (the
//! per-mutation decision procedure), `[report]` (the final aggregation
//! procedure), and one `[test NAME]` section per test. Decision and report
//! bodies are parsed into [`script::Program`]s at load time so syntax
//! errors surface before any work starts.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use thiserror::Error;

use crate::script::{self, Program, ScriptError};

/// Default target mutation count.
pub const DEFAULT_SIZE: u32 = 20;

/// Configuration errors; all fatal at load.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file is missing or unreadable.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Malformed configuration line.
    #[error("syntax error in line {line} of {path}")]
    Syntax {
        /// Configuration file path.
        path: String,
        /// 1-based line number.
        line: usize,
    },
    /// Decision or report body failed to parse.
    #[error("in [{section}] of {path}: {source}")]
    Script {
        /// Section carrying the procedure.
        section: &'static str,
        /// Configuration file path.
        path: String,
        /// Parse failure.
        #[source]
        source: ScriptError,
    },
}

/// Per-test-name settings, shared by every identity with that base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    /// Largest number of mutations dispatched to one runner invocation.
    pub max_batch_size: usize,
    /// Allowed result tokens, when restricted.
    pub expect: Option<BTreeSet<String>>,
    /// Verbatim run-command template.
    pub run: Option<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            expect: None,
            run: None,
        }
    }
}

/// Parsed, validated project configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Target live mutation count.
    pub size: u32,
    /// Optional global tag allow-list.
    pub tags: Option<BTreeSet<String>>,
    /// Optional explicit global seed.
    pub seed: Option<u32>,
    /// Generator script body, verbatim.
    pub script: Vec<String>,
    /// Decision procedure.
    pub logic: Program,
    /// Report procedure.
    pub report: Program,
    /// Test settings by base name.
    pub tests: BTreeMap<String, TestConfig>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse configuration text. `path` is used in diagnostics only.
    pub fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let mut size = DEFAULT_SIZE;
        let mut tags: Option<BTreeSet<String>> = None;
        let mut seed: Option<u32> = None;
        let mut script: Vec<String> = Vec::new();
        let mut logic_lines: Vec<(usize, String)> = Vec::new();
        let mut report_lines: Vec<(usize, String)> = Vec::new();
        let mut tests: BTreeMap<String, TestConfig> = BTreeMap::new();

        let syntax = |line: usize| ConfigError::Syntax {
            path: path.to_string(),
            line,
        };

        #[derive(PartialEq)]
        enum Section {
            None,
            Options,
            Script,
            Logic,
            Report,
            Test(String),
        }

        let mut section = Section::None;

        for (idx, raw) in text.lines().enumerate() {
            let linenr = idx + 1;

            if let Some(header) = raw
                .trim_end()
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                let entries: Vec<&str> = header.split_whitespace().collect();
                match entries.as_slice() {
                    ["options"] => section = Section::Options,
                    ["script"] => section = Section::Script,
                    ["logic"] => section = Section::Logic,
                    ["report"] => section = Section::Report,
                    ["test", name] => {
                        tests.entry((*name).to_string()).or_default();
                        section = Section::Test((*name).to_string());
                    }
                    _ => return Err(syntax(linenr)),
                }
                continue;
            }

            match &section {
                Section::Options => {
                    let entries: Vec<&str> = raw.split_whitespace().collect();
                    match entries.as_slice() {
                        [] => {}
                        ["size", value] => {
                            size = value.parse().map_err(|_| syntax(linenr))?;
                        }
                        ["seed", value] => {
                            seed = Some(value.parse().map_err(|_| syntax(linenr))?);
                        }
                        ["tags", names @ ..] if !names.is_empty() => {
                            tags = Some(names.iter().map(|n| (*n).to_string()).collect());
                        }
                        _ => return Err(syntax(linenr)),
                    }
                }
                Section::Script => {
                    let line = raw.trim_end();
                    if !line.is_empty() {
                        script.push(line.to_string());
                    }
                }
                Section::Logic => logic_lines.push((linenr, raw.to_string())),
                Section::Report => report_lines.push((linenr, raw.to_string())),
                Section::Test(name) => {
                    let entries: Vec<&str> = raw.split_whitespace().collect();
                    match entries.as_slice() {
                        [] => {}
                        ["maxbatchsize", value] => {
                            let parsed: usize = value.parse().map_err(|_| syntax(linenr))?;
                            if parsed == 0 {
                                return Err(syntax(linenr));
                            }
                            tests
                                .get_mut(name)
                                .map(|t| t.max_batch_size = parsed)
                                .ok_or_else(|| syntax(linenr))?;
                        }
                        ["expect", tokens @ ..] if !tokens.is_empty() => {
                            let set = tokens.iter().map(|t| (*t).to_string()).collect();
                            tests
                                .get_mut(name)
                                .map(|t| t.expect = Some(set))
                                .ok_or_else(|| syntax(linenr))?;
                        }
                        ["run", ..] => {
                            let command = raw
                                .trim_start()
                                .strip_prefix("run")
                                .map(str::trim)
                                .filter(|c| !c.is_empty())
                                .ok_or_else(|| syntax(linenr))?;
                            tests
                                .get_mut(name)
                                .map(|t| t.run = Some(command.to_string()))
                                .ok_or_else(|| syntax(linenr))?;
                        }
                        _ => return Err(syntax(linenr)),
                    }
                }
                Section::None => {
                    if !raw.trim().is_empty() {
                        return Err(syntax(linenr));
                    }
                }
            }
        }

        let logic = script::parse_program(&logic_lines).map_err(|source| ConfigError::Script {
            section: "logic",
            path: path.to_string(),
            source,
        })?;
        let report = script::parse_program(&report_lines).map_err(|source| ConfigError::Script {
            section: "report",
            path: path.to_string(),
            source,
        })?;

        Ok(Self {
            size,
            tags,
            seed,
            script,
            logic,
            report,
            tests,
        })
    }

    /// Settings for the base name of a test identity, if configured.
    pub fn test_for_identity(&self, identity: &str) -> Option<(&str, &TestConfig)> {
        let base = identity.split_whitespace().next()?;
        self.tests.get_key_value(base).map(|(k, v)| (k.as_str(), v))
    }
}

/// Split a test identity into its base name and verbatim argument suffix.
pub fn split_identity(identity: &str) -> (&str, &str) {
    let trimmed = identity.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((base, args)) => (base, args.trim_start()),
        None => (trimmed, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[options]
size 100
tags COVERED UNCOVERED
seed 42

[script]
read_verilog top.v
prep -top top

[logic]
r = result("smoke")
if r == "FAIL": tag("COVERED")

[report]
print("covered:", tags("COVERED"))

[test smoke]
maxbatchsize 4
expect PASS FAIL
run bash scripts/smoke.sh
"#;

    #[test]
    fn full_config_parses() {
        let cfg = Config::parse(SAMPLE, "config.mcy").expect("config should parse");
        assert_eq!(cfg.size, 100);
        assert_eq!(cfg.seed, Some(42));
        let tags = cfg.tags.expect("tags should be set");
        assert!(tags.contains("COVERED") && tags.contains("UNCOVERED"));
        assert_eq!(cfg.script, vec!["read_verilog top.v", "prep -top top"]);
        assert!(!cfg.logic.is_empty());
        assert!(!cfg.report.is_empty());

        let smoke = cfg.tests.get("smoke").expect("smoke test should exist");
        assert_eq!(smoke.max_batch_size, 4);
        let expect = smoke.expect.as_ref().expect("expect should be set");
        assert!(expect.contains("PASS") && expect.contains("FAIL"));
        assert_eq!(smoke.run.as_deref(), Some("bash scripts/smoke.sh"));
    }

    #[test]
    fn blank_script_lines_are_dropped() {
        let cfg = Config::parse(
            "[script]\nread_verilog top.v\n\nprep -top top\n\n",
            "config.mcy",
        )
        .expect("config should parse");
        assert_eq!(cfg.script, vec!["read_verilog top.v", "prep -top top"]);
    }

    #[test]
    fn defaults_apply_when_options_are_omitted() {
        let cfg = Config::parse("[test t]\nrun true\n", "config.mcy").expect("should parse");
        assert_eq!(cfg.size, DEFAULT_SIZE);
        assert_eq!(cfg.seed, None);
        assert!(cfg.tags.is_none());
        let t = cfg.tests.get("t").expect("test should exist");
        assert_eq!(t.max_batch_size, 1);
        assert!(t.expect.is_none());
    }

    #[test]
    fn run_command_keeps_verbatim_tail() {
        let cfg = Config::parse(
            "[test sim]\nrun bash run.sh --flag \"a b\"   \n",
            "config.mcy",
        )
        .expect("should parse");
        let sim = cfg.tests.get("sim").expect("sim test should exist");
        assert_eq!(sim.run.as_deref(), Some("bash run.sh --flag \"a b\""));
    }

    #[test]
    fn unknown_line_reports_its_number() {
        let err = Config::parse("[options]\nsize 5\nbogus line here\n", "config.mcy")
            .expect_err("parse should fail");
        assert!(matches!(err, ConfigError::Syntax { line: 3, .. }));
    }

    #[test]
    fn text_outside_any_section_is_rejected() {
        let err = Config::parse("hello\n[options]\n", "config.mcy").expect_err("should fail");
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn logic_parse_failure_is_a_config_error() {
        let err = Config::parse("[logic]\ntag(\n", "config.mcy").expect_err("should fail");
        assert!(matches!(
            err,
            ConfigError::Script {
                section: "logic",
                ..
            }
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err =
            Config::parse("[test t]\nmaxbatchsize 0\n", "config.mcy").expect_err("should fail");
        assert!(matches!(err, ConfigError::Syntax { line: 2, .. }));
    }

    #[test]
    fn identity_splits_into_base_and_args() {
        assert_eq!(split_identity("smoke"), ("smoke", ""));
        assert_eq!(
            split_identity("formal -depth 20"),
            ("formal", "-depth 20")
        );
    }

    #[test]
    fn identity_lookup_uses_base_name() {
        let cfg = Config::parse("[test sim]\nmaxbatchsize 3\n", "config.mcy")
            .expect("config should parse");
        let (name, test) = cfg
            .test_for_identity("sim -seed 9")
            .expect("identity should resolve");
        assert_eq!(name, "sim");
        assert_eq!(test.max_batch_size, 3);
        assert!(cfg.test_for_identity("other").is_none());
    }
}
