use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed. Anything else under the root
// (vendored reference material, target/) is ignored.
const POLICED_DIRS: [&str; 6] = ["damds", "parallel", "shared", "src", "tests", "benches"];

// Collects every matching line for one file so a single error lists all of them.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    skip_comments_and_strings: bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, skip_comments_and_strings: bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            skip_comments_and_strings,
        }
    }

    fn into_error(self, rule: &str) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} violation(s) of '{}' in {}:\n",
            self.violations.len(),
            rule,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_comments_and_strings {
            let trimmed = line_text.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
            {
                return Ok(true);
            }
            // Odd-numbered segments between quotes are string contents.
            let in_string = line_text
                .split('"')
                .enumerate()
                .any(|(i, part)| i % 2 == 1 && part.contains('_'));
            if in_string {
                return Ok(true);
            }
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn policed_sources() -> impl Iterator<Item = PathBuf> {
    POLICED_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.path().to_path_buf())
    })
}

fn scan(pattern: &str, rule: &str, skip_comments_and_strings: bool) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for path in policed_sources() {
        let mut collector = ViolationCollector::new(&path, skip_comments_and_strings);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.into_error(rule) {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in POLICED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    // Underscore-prefixed bindings hide unused values instead of removing them.
    if let Err(e) = scan(
        r"\b(_[a-zA-Z0-9_]+)\b",
        "no underscore-prefixed bindings",
        true,
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = scan(
        r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        "no #[allow(dead_code)]",
        false,
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    // Change-log chatter belongs in version control, not in comments.
    if let Err(e) = scan(
        r"//.*\b(FIXED|CORRECTED|CHANGED|MODIFIED|UPDATED)\b",
        "no change-log comments",
        false,
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
