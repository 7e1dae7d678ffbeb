//! Structural tests for architectural boundary enforcement.
//!
//! These tests scan source files to verify that the layer boundaries
//! (domain → application → infra → commands) are maintained.

use std::path::{Path, PathBuf};

/// Collect all `.rs` files under a directory recursively.
fn collect_rs_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(collect_rs_files(&path));
            } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
                files.push(path);
            }
        }
    }
    files
}

/// Track brace depth and return whether a line is inside a `#[cfg(test)]` block.
struct CfgTestTracker {
    in_test_block: bool,
    brace_depth: i32,
    test_block_start_depth: i32,
}

impl CfgTestTracker {
    fn new() -> Self {
        Self {
            in_test_block: false,
            brace_depth: 0,
            test_block_start_depth: 0,
        }
    }

    fn process_line(&mut self, line: &str) -> bool {
        if line.trim().contains("#[cfg(test)]") {
            self.in_test_block = true;
            self.test_block_start_depth = self.brace_depth;
        }
        for ch in line.chars() {
            match ch {
                '{' => self.brace_depth += 1,
                '}' => {
                    self.brace_depth -= 1;
                    if self.in_test_block && self.brace_depth <= self.test_block_start_depth {
                        self.in_test_block = false;
                    }
                }
                _ => {}
            }
        }
        self.in_test_block
    }
}

fn src(layer: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("src").join(layer)
}

/// Every non-comment, non-test line under `dir` containing one of `needles`.
fn find_outside_tests(dir: &Path, needles: &[&str]) -> Vec<String> {
    let mut violations = Vec::new();
    for file in collect_rs_files(dir) {
        let rel = file
            .strip_prefix(env!("CARGO_MANIFEST_DIR"))
            .unwrap_or(&file)
            .display()
            .to_string();
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        let mut tracker = CfgTestTracker::new();
        for (i, line) in content.lines().enumerate() {
            let in_test = tracker.process_line(line);
            let trimmed = line.trim();
            if in_test || trimmed.starts_with("//") {
                continue;
            }
            for needle in needles {
                if line.contains(needle) {
                    violations.push(format!("{rel}:{}: `{needle}`: {trimmed}", i + 1));
                }
            }
        }
    }
    violations
}

// ── Domain is pure ────────────────────────────────────────────────────────────

#[test]
fn domain_has_no_io_or_outer_layer_imports() {
    let violations = find_outside_tests(
        &src("domain"),
        &[
            "crate::infra",
            "crate::application",
            "crate::commands",
            "tokio::",
            "std::fs",
            "std::process",
            "std::net",
        ],
    );
    assert!(
        violations.is_empty(),
        "domain/ must stay synchronous and free of I/O:\n{}",
        violations.join("\n")
    );
}

// ── Application talks to ports only ───────────────────────────────────────────

#[test]
fn application_has_no_infra_or_command_imports() {
    let violations = find_outside_tests(
        &src("application"),
        &["crate::infra", "crate::commands", "crate::app::"],
    );
    assert!(
        violations.is_empty(),
        "application/ must depend on port traits, not adapters:\n{}",
        violations.join("\n")
    );
}

#[test]
fn application_services_take_trait_bounds_not_adapters() {
    let violations = find_outside_tests(
        &src("application").join("services"),
        &["ValkeyStore", "NginxDriver", "FsHostState", "HttpHealthProbe", "TokioCommandRunner"],
    );
    assert!(
        violations.is_empty(),
        "Found concrete adapter types in application services — use trait bounds instead:\n{}",
        violations.join("\n")
    );
}

#[test]
fn application_has_no_blocking_io() {
    let violations = find_outside_tests(&src("application"), &["std::fs::", "std::process::Command"]);
    assert!(
        violations.is_empty(),
        "application/ must not block the runtime:\n{}",
        violations.join("\n")
    );
}

// ── Infra stays below commands ────────────────────────────────────────────────

#[test]
fn infra_has_no_imports_from_commands() {
    let violations = find_outside_tests(&src("infra"), &["crate::commands", "crate::cli"]);
    assert!(
        violations.is_empty(),
        "infra/ must not import from commands/:\n{}",
        violations.join("\n")
    );
}

#[test]
fn infra_has_no_print_macros_outside_tests() {
    let violations = find_outside_tests(&src("infra"), &["println!", "eprintln!"]);
    assert!(
        violations.is_empty(),
        "infra/ logs through tracing, never println!/eprintln!:\n{}",
        violations.join("\n")
    );
}

#[test]
fn store_keys_come_from_press_common() {
    let violations = find_outside_tests(&src("infra"), &["\"press:"]);
    assert!(
        violations.is_empty(),
        "Valkey key literals belong in press_common::redis_keys:\n{}",
        violations.join("\n")
    );
}
