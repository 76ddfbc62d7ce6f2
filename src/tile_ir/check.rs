//! FileCheck-style validation of tile IR test files.
//!
//! A test file is tile IR text with `; RUN:` lines naming `tilegen` options
//! and `; CHECK...` lines matched against the printed low-level IR:
//!
//! ```text
//! ; RUN: tilegen --target sm80 --num-warps 4
//! ; CHECK-LABEL: kernel void @copy(
//! ; CHECK: call i32 @tid.x()
//! ; CHECK-NOT: bar.sync
//! ```
//!
//! `--expect-error` makes the error message the checked output.

use super::parse_module;
use crate::codegen;
use crate::core::CodegenConfig;
use crate::target::target_from_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// Pattern on some later line.
    Check(String),
    /// Like `Check`, marks the start of a section.
    CheckLabel(String),
    /// Pattern on the line right after the previous match.
    CheckNext(String),
    /// Pattern absent up to the next positive match.
    CheckNot(String),
    /// Next line is empty.
    CheckEmpty,
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    /// Whole file; directives are comments to the tile IR parser.
    pub source: String,
}

impl TestSpec {
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();

        for (number, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            let Some(comment) = trimmed.strip_prefix(';') else {
                continue;
            };
            let comment = comment.trim_start();
            if let Some(cmd) = comment.strip_prefix("RUN:") {
                let mut parts = cmd.split_whitespace().map(str::to_string);
                let Some(command) = parts.next() else {
                    return Err(format!("line {}: empty RUN directive", number + 1));
                };
                run_directives.push(RunDirective {
                    command,
                    args: parts.collect(),
                });
            } else if let Some(p) = comment.strip_prefix("CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(p.trim().to_string()));
            } else if let Some(p) = comment.strip_prefix("CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(p.trim().to_string()));
            } else if let Some(p) = comment.strip_prefix("CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(p.trim().to_string()));
            } else if comment.starts_with("CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(p) = comment.strip_prefix("CHECK:") {
                check_directives.push(CheckDirective::Check(p.trim().to_string()));
            } else if let Some(p) = comment.strip_prefix("COM:") {
                check_directives.push(CheckDirective::Comment(p.trim().to_string()));
            }
        }

        if run_directives.is_empty() {
            return Err("test has no RUN directive".to_string());
        }
        Ok(TestSpec {
            run_directives,
            check_directives,
            source: content.to_string(),
        })
    }
}

/// Options of one RUN line.
#[derive(Debug, Clone)]
struct RunOptions {
    target: String,
    config: CodegenConfig,
    print_ir: bool,
    expect_error: bool,
}

impl RunOptions {
    fn from_args(args: &[String]) -> Result<Self, String> {
        let mut options = RunOptions {
            target: "sm80".to_string(),
            config: CodegenConfig::default(),
            print_ir: false,
            expect_error: false,
        };
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--target" => {
                    options.target = args
                        .next()
                        .ok_or("--target needs a value")?
                        .to_string();
                }
                "--num-warps" => {
                    let value = args.next().ok_or("--num-warps needs a value")?;
                    let num_warps = value
                        .parse()
                        .map_err(|_| format!("bad --num-warps value '{value}'"))?;
                    options.config = options.config.with_num_warps(num_warps);
                }
                "--no-async-copy" => options.config = options.config.with_async_copy(false),
                "--no-verify" => options.config = options.config.with_verify(false),
                "--print-ir" => options.print_ir = true,
                "--expect-error" => options.expect_error = true,
                "%s" => {}
                other => return Err(format!("unknown RUN option '{other}'")),
            }
        }
        Ok(options)
    }
}

pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run in &spec.run_directives {
            if run.command != "tilegen" {
                return Err(format!("unknown RUN command '{}'", run.command));
            }
            let output = self.execute(&spec.source, run)?;
            if self.verbose {
                println!("{output}");
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    fn execute(&self, source: &str, run: &RunDirective) -> Result<String, String> {
        let options = RunOptions::from_args(&run.args)?;
        let target = target_from_name(&options.target).map_err(|e| e.to_string())?;

        let result = parse_module(source).and_then(|parsed| {
            codegen::compile(&parsed, target.as_ref(), &options.config)
                .map(|compiled| (parsed, compiled))
        });
        match (result, options.expect_error) {
            (Ok((parsed, compiled)), false) => {
                let mut output = String::new();
                if options.print_ir {
                    output.push_str(&parsed.module.to_string());
                    output.push('\n');
                }
                output.push_str(&compiled.module.to_string());
                Ok(output)
            }
            (Ok(_), true) => Err("expected compilation to fail".to_string()),
            (Err(err), true) => Ok(format!("error: {err}")),
            (Err(err), false) => Err(format!("compilation failed: {err}")),
        }
    }

    pub fn validate_output(
        &self,
        output: &str,
        directives: &[CheckDirective],
    ) -> Result<(), String> {
        let lines: Vec<&str> = output.lines().collect();
        // Matching resumes at `pos` (line, byte column), so several patterns
        // may match on one line in order.
        let mut pos = Position::default();
        let mut last_line: Option<usize> = None;
        let mut pending_not: Vec<&str> = Vec::new();

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => {}
                CheckDirective::CheckNot(pattern) => pending_not.push(pattern),
                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let Some(found) = find_from(&lines, pos, pattern) else {
                        return Err(format!("CHECK: pattern '{pattern}' not found in output"));
                    };
                    check_not(&mut pending_not, &region(&lines, pos, found))?;
                    if self.verbose {
                        println!("CHECK: '{pattern}' found at line {}", found.line);
                    }
                    last_line = Some(found.line);
                    pos = Position {
                        line: found.line,
                        column: found.column + pattern.len(),
                    };
                }
                CheckDirective::CheckNext(pattern) => {
                    let next = last_line.map_or(0, |l| l + 1);
                    let Some(line) = lines.get(next) else {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{pattern}'"));
                    };
                    let Some(column) = line.find(pattern.as_str()) else {
                        return Err(format!(
                            "CHECK-NEXT: expected '{pattern}' but got '{line}'"
                        ));
                    };
                    let found = Position { line: next, column };
                    check_not(&mut pending_not, &region(&lines, pos, found))?;
                    last_line = Some(next);
                    pos = Position {
                        line: next,
                        column: column + pattern.len(),
                    };
                }
                CheckDirective::CheckEmpty => {
                    let next = last_line.map_or(0, |l| l + 1);
                    if let Some(line) = lines.get(next) {
                        if !line.trim().is_empty() {
                            return Err(format!(
                                "CHECK-EMPTY: expected empty line but got '{line}'"
                            ));
                        }
                        last_line = Some(next);
                        pos = Position {
                            line: next,
                            column: line.len(),
                        };
                    }
                }
            }
        }
        let end = Position {
            line: lines.len(),
            column: 0,
        };
        check_not(&mut pending_not, &region(&lines, pos, end))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Position {
    line: usize,
    column: usize,
}

/// First occurrence of `pattern` at or after `from`.
fn find_from(lines: &[&str], from: Position, pattern: &str) -> Option<Position> {
    let first = lines.get(from.line)?;
    if let Some(column) = first.get(from.column..).and_then(|rest| rest.find(pattern)) {
        return Some(Position {
            line: from.line,
            column: from.column + column,
        });
    }
    lines[from.line + 1..]
        .iter()
        .enumerate()
        .find_map(|(i, line)| {
            line.find(pattern).map(|column| Position {
                line: from.line + 1 + i,
                column,
            })
        })
}

/// Text between `from` and `to`, one slice per line.
fn region<'o>(lines: &[&'o str], from: Position, to: Position) -> Vec<&'o str> {
    let mut out = Vec::new();
    for (i, &line) in lines.iter().enumerate().take(to.line + 1).skip(from.line) {
        let begin = if i == from.line { from.column } else { 0 };
        let end = if i == to.line { to.column } else { line.len() };
        if let Some(part) = line.get(begin..end.max(begin)) {
            out.push(part);
        }
    }
    out
}

fn check_not(pending: &mut Vec<&str>, range: &[&str]) -> Result<(), String> {
    for pattern in pending.drain(..) {
        if let Some(line) = range.iter().find(|line| line.contains(pattern)) {
            return Err(format!("CHECK-NOT: '{pattern}' found in '{line}'"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let content = r#"; RUN: tilegen --target sm80 --num-warps 2 %s
; CHECK-LABEL: kernel void @k(
; CHECK-NEXT: entry:
; CHECK-NOT: bar.sync
; COM: directives are ordinary comments to the parser
func @k() {
entry:
  ret
}"#;
        let spec = TestSpec::parse(content).unwrap();
        assert_eq!(spec.run_directives.len(), 1);
        assert_eq!(spec.run_directives[0].args.len(), 5);
        assert_eq!(spec.check_directives.len(), 4);
        assert!(spec.source.contains("func @k()"));
    }

    #[test]
    fn test_missing_run_line_is_rejected() {
        assert!(TestSpec::parse("; CHECK: x\n").is_err());
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output = "kernel void @k() {\nentry:\n  ret void\n}\n";
        let directives = vec![
            CheckDirective::CheckLabel("@k(".to_string()),
            CheckDirective::CheckNext("entry:".to_string()),
            CheckDirective::CheckNot("bar.sync".to_string()),
            CheckDirective::Check("ret void".to_string()),
        ];
        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_check_not_failure() {
        let runner = TestRunner::new(false);
        let output = "entry:\n  call void @bar.sync()\n  ret void\n";
        let directives = vec![
            CheckDirective::Check("entry:".to_string()),
            CheckDirective::CheckNot("bar.sync".to_string()),
            CheckDirective::Check("ret void".to_string()),
        ];
        let err = runner.validate_output(output, &directives).unwrap_err();
        assert!(err.contains("CHECK-NOT"));
    }

    #[test]
    fn test_check_next_failure() {
        let runner = TestRunner::new(false);
        let directives = vec![
            CheckDirective::Check("Line 1".to_string()),
            CheckDirective::CheckNext("Line 3".to_string()),
        ];
        let err = runner
            .validate_output("Line 1\nLine 2\nLine 3\n", &directives)
            .unwrap_err();
        assert!(err.contains("CHECK-NEXT"));
    }

    #[test]
    fn test_checks_resume_on_the_same_line() {
        let runner = TestRunner::new(false);
        let output = "kernel void @copy(ptr %x) maxntid(128) {\nentry:\n  ret void\n}\n";
        let directives = vec![
            CheckDirective::CheckLabel("kernel void @copy(".to_string()),
            CheckDirective::Check("maxntid(128)".to_string()),
            CheckDirective::CheckNext("entry:".to_string()),
        ];
        runner.validate_output(output, &directives).unwrap();

        // Order within a line still matters.
        let reversed = vec![
            CheckDirective::Check("maxntid(128)".to_string()),
            CheckDirective::Check("@copy(".to_string()),
        ];
        assert!(runner.validate_output(output, &reversed).is_err());
    }

    #[test]
    fn test_check_not_sees_rest_of_matched_line() {
        let runner = TestRunner::new(false);
        let output = "kernel void @k() maxntid(64) {\n  ret void\n";
        let directives = vec![
            CheckDirective::Check("@k(".to_string()),
            CheckDirective::CheckNot("maxntid".to_string()),
            CheckDirective::Check("ret void".to_string()),
        ];
        let err = runner.validate_output(output, &directives).unwrap_err();
        assert!(err.contains("maxntid"), "{err}");
    }
}
