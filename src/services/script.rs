use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// One spoken turn of the script.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
}

impl DialogueLine {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
        }
    }
}

// Label must start with a letter so timestamps like "10:30" are not speakers.
static SPEAKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9 ]*):\s*(.*)$").expect("valid regex"));
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(https?|ftp):").expect("valid regex"));

/// Parses `Speaker: text` lines. Unlabelled lines continue the previous turn.
pub fn parse_text(content: &str) -> Vec<DialogueLine> {
    let mut lines = Vec::new();
    let mut current_speaker: Option<String> = None;
    let mut current_text: Vec<String> = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let captures = if URL_RE.is_match(line) {
            None
        } else {
            SPEAKER_RE.captures(line)
        };

        match captures {
            Some(caps) => {
                if let Some(speaker) = current_speaker.take() {
                    if !current_text.is_empty() {
                        lines.push(DialogueLine::new(speaker, current_text.join(" ")));
                    }
                }
                current_text.clear();

                current_speaker = Some(caps[1].trim().to_string());
                let dialogue = caps[2].trim();
                if !dialogue.is_empty() {
                    current_text.push(dialogue.to_string());
                }
            }
            None => {
                if current_speaker.is_some() {
                    current_text.push(line.to_string());
                }
            }
        }
    }

    if let Some(speaker) = current_speaker {
        if !current_text.is_empty() {
            lines.push(DialogueLine::new(speaker, current_text.join(" ")));
        }
    }

    lines
}

#[derive(Deserialize)]
struct JsonLine {
    #[serde(default)]
    speaker: String,
    #[serde(default)]
    text: String,
}

/// Parses `[{"speaker": ..., "text": ...}]`. Records missing either field are skipped.
pub fn parse_json(content: &str) -> Result<Vec<DialogueLine>> {
    let clean = strip_code_blocks(content);
    let records: Vec<JsonLine> =
        serde_json::from_str(&clean).context("Failed to parse dialogue JSON")?;

    Ok(records
        .into_iter()
        .filter_map(|r| {
            let speaker = r.speaker.trim();
            let text = r.text.trim();
            if speaker.is_empty() || text.is_empty() {
                None
            } else {
                Some(DialogueLine::new(speaker, text))
            }
        })
        .collect())
}

/// Picks the format from the extension: `.json` is JSON, everything else is text.
pub fn parse_file(path: &Path) -> Result<Vec<DialogueLine>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

    let is_json = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        parse_json(&content)
    } else {
        Ok(parse_text(&content))
    }
}

/// Speakers in order of first appearance.
pub fn unique_speakers(lines: &[DialogueLine]) -> Vec<String> {
    let mut seen = HashSet::new();
    lines
        .iter()
        .filter(|l| seen.insert(l.speaker.as_str()))
        .map(|l| l.speaker.clone())
        .collect()
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}
