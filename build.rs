use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "examples", "local_data"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock", "spec.md", "SPEC_FULL.md"];

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");

    let sha = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=USAGE_SYNC_GIT_SHA={}", sha);

    let root = PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set"),
    );
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    let rust_files: Vec<&PathBuf> = files
        .iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("rs"))
        .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some("build.rs"))
        .collect();

    enforce_line_limits(&root, &files);
    enforce_no_dead_code_allows(&root, &rust_files);
    enforce_serial_for_env_mutations(&root, &rust_files);
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    walk_directory(root, &mut files);
    files
        .into_iter()
        .filter(|path| {
            let rel = path.strip_prefix(root).unwrap_or(path);
            !EXCLUDED_FILES.contains(&rel.to_string_lossy().as_ref())
        })
        .collect()
}

fn walk_directory(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let excluded = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| EXCLUDED_DIRS.contains(&name));
            if !excluded {
                walk_directory(&path, files);
            }
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| CHECKED_EXTENSIONS.contains(&ext))
        {
            files.push(path);
        }
    }
}

fn report_and_fail(title: &str, violations: &[String], hint: &str) {
    eprintln!("\n========================================");
    eprintln!("{}", title);
    eprintln!("========================================");
    for v in violations {
        eprintln!("  {}", v);
    }
    eprintln!("========================================");
    eprintln!("{}\n", hint);
    panic!("Build failed: {} ({} violation(s))", title, violations.len());
}

fn enforce_line_limits(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
        if lines > MAX_LINES {
            let rel = file.strip_prefix(root).unwrap_or(file);
            violations.push(format!("{} - {} lines", rel.display(), lines));
        }
    }
    if !violations.is_empty() {
        report_and_fail(
            &format!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES),
            &violations,
            "Please split these files into smaller modules.",
        );
    }
}

fn enforce_no_dead_code_allows(root: &Path, files: &[&PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                && trimmed.contains("dead_code")
            {
                let rel = file.strip_prefix(root).unwrap_or(file);
                violations.push(format!("{}:{}", rel.display(), idx + 1));
            }
        }
    }
    if !violations.is_empty() {
        report_and_fail(
            "#[allow(dead_code)] IS NOT ALLOWED",
            &violations,
            "Delete unused code, or gate test-only code behind #[cfg(test)].",
        );
    }
}

/// Tests that mutate process environment must be `#[serial]`, otherwise they
/// race with every other test reading the same variables.
fn enforce_serial_for_env_mutations(root: &Path, files: &[&PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let lines: Vec<&str> = content.lines().collect();
        let mut attrs: Vec<&str> = Vec::new();
        let mut current_test: Option<(String, bool)> = None;

        for (idx, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("#[") {
                attrs.push(trimmed);
                continue;
            }
            if trimmed.starts_with("fn ") || trimmed.starts_with("async fn ") {
                let is_test = attrs.iter().any(|a| *a == "#[test]" || a.starts_with("#[tokio::test"));
                let is_serial = attrs.iter().any(|a| a.starts_with("#[serial"));
                current_test = is_test.then(|| (trimmed.to_string(), is_serial));
            }
            attrs.clear();

            if let Some((name, serial)) = &current_test {
                let mutates = !trimmed.starts_with("//")
                    && (trimmed.contains("env::set_var") || trimmed.contains("env::remove_var"));
                if mutates && !serial {
                    let rel = file.strip_prefix(root).unwrap_or(file);
                    violations.push(format!("{}:{} in `{}`", rel.display(), idx + 1, name));
                    current_test = None;
                }
            }
        }
    }
    if !violations.is_empty() {
        report_and_fail(
            "ENV MUTATION IN NON-SERIAL TEST",
            &violations,
            "Add #[serial] (serial_test) to tests that call env::set_var/remove_var.",
        );
    }
}
