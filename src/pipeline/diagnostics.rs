//! Structured diagnostics parsed from build tool output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static LOCATED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?):(\d+):(?:(\d+):)?\s*(error|warning):\s*(.+)$").unwrap()
});

static FLASH_USAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Sketch uses (\d+) bytes \((\d+)%\) of program storage space\. Maximum is (\d+) bytes")
        .unwrap()
});

static RAM_USAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Global variables use (\d+) bytes \((\d+)%\) of dynamic memory.*?Maximum is (\d+) bytes")
        .unwrap()
});

/// One located compiler message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// File name without directories.
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub message: String,
    pub raw: String,
}

/// Bytes used out of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub used: u64,
    pub total: u64,
    pub percent: u8,
}

/// Memory figures reported after a successful build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub flash: Option<Usage>,
    pub ram: Option<Usage>,
}

impl MemoryUsage {
    pub fn is_empty(&self) -> bool {
        self.flash.is_none() && self.ram.is_none()
    }
}

/// Errors, warnings and memory usage extracted from build output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub errors: Vec<DiagnosticEntry>,
    pub warnings: Vec<DiagnosticEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
}

impl Diagnostics {
    /// Parses raw tool output. Never fails; unrecognised lines are ignored.
    pub fn parse(output: &str) -> Self {
        let mut diagnostics = Self::default();

        for line in output.lines() {
            let line = line.trim();
            let Some(caps) = LOCATED_REGEX.captures(line) else {
                continue;
            };
            let Ok(line_no) = caps[2].parse() else {
                continue;
            };
            let entry = DiagnosticEntry {
                file: base_name(&caps[1]).to_string(),
                line: line_no,
                column: caps.get(3).and_then(|c| c.as_str().parse().ok()),
                message: caps[5].trim().to_string(),
                raw: line.to_string(),
            };
            if caps[4].eq_ignore_ascii_case("error") {
                diagnostics.errors.push(entry);
            } else {
                diagnostics.warnings.push(entry);
            }
        }

        let memory = parse_memory(output);
        if !memory.is_empty() {
            diagnostics.memory = Some(memory);
        }
        diagnostics
    }

    /// Guarantees at least one error entry after a failed build.
    ///
    /// Tool failures without a source location (an unknown board profile, a
    /// missing core) are attributed to line 1 of the sketch, carrying the
    /// last line of output that mentions an error.
    pub fn ensure_error(&mut self, sketch_file: &str, output: &str) {
        if !self.errors.is_empty() {
            return;
        }
        let message = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.to_lowercase().contains("error"))
            .or_else(|| output.lines().rev().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or("build failed")
            .to_string();
        self.errors.push(DiagnosticEntry {
            file: base_name(sketch_file).to_string(),
            line: 1,
            column: None,
            raw: message.clone(),
            message,
        });
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Extracts program-storage and dynamic-memory figures.
pub fn parse_memory(output: &str) -> MemoryUsage {
    let usage = |re: &Regex| {
        let caps = re.captures(output)?;
        Some(Usage {
            used: caps[1].parse().ok()?,
            percent: caps[2].parse().ok()?,
            total: caps[3].parse().ok()?,
        })
    };
    MemoryUsage {
        flash: usage(&FLASH_USAGE_REGEX),
        ram: usage(&RAM_USAGE_REGEX),
    }
}
