//! UCI wire format: command formatting and info-line decoding.
//!
//! This is the only module that knows the protocol's vocabulary. Commands
//! are single ASCII lines (`position fen ...`, `go depth 20`, `stop`);
//! search progress arrives as `info ...` lines which [`parse_search_info`]
//! turns into typed records, and `bestmove ...` marks the end of a search.

use serde::Serialize;

/// Engine evaluation: hundredths of a pawn, or a forced mate in N moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

/// One decoded search-progress line. Immutable once constructed; newer
/// output for the same `(depth, multipv)` key replaces the whole record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub depth: u32,
    pub seldepth: Option<u32>,
    pub time_ms: Option<u64>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    /// Ranked-line index when MultiPV is active; 1 is the best line.
    pub multipv: Option<u32>,
    pub score: Score,
    /// Principal variation, ordered from the current position.
    pub pv: Vec<String>,
}

impl AnalysisRecord {
    /// Key used for de-duplication in a session's result set.
    pub fn result_key(&self) -> (u32, u32) {
        (self.depth, self.multipv.unwrap_or(1))
    }
}

/// How a search should terminate. Exactly one mode applies; precedence is
/// depth, then movetime, then node limit, with infinite as the default.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub depth: Option<u32>,
    pub movetime_ms: Option<u64>,
    pub nodes: Option<u64>,
    pub infinite: bool,
}

impl SearchOptions {
    pub fn go_command(&self) -> String {
        if let Some(depth) = self.depth {
            format!("go depth {}", depth)
        } else if let Some(ms) = self.movetime_ms {
            format!("go movetime {}", ms)
        } else if let Some(nodes) = self.nodes {
            format!("go nodes {}", nodes)
        } else {
            "go infinite".to_string()
        }
    }
}

pub fn position_command(fen: &str) -> String {
    format!("position fen {}", fen)
}

pub fn set_option_command(name: &str, value: impl std::fmt::Display) -> String {
    format!("setoption name {} value {}", name, value)
}

/// Decode one `info` line into an [`AnalysisRecord`].
///
/// Tokenizes on whitespace and scans for keyed fields. The `score` field is
/// a two-token pair (`cp <n>` or `mate <n>`); everything after `pv` is the
/// move list, consumed greedily to end of line. Returns `None` unless depth,
/// score and pv are all present — callers never see a half-populated record.
pub fn parse_search_info(line: &str) -> Option<AnalysisRecord> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    let mut depth: Option<u32> = None;
    let mut seldepth: Option<u32> = None;
    let mut time_ms: Option<u64> = None;
    let mut nodes: Option<u64> = None;
    let mut nps: Option<u64> = None;
    let mut multipv: Option<u32> = None;
    let mut score: Option<Score> = None;
    let mut pv: Option<Vec<String>> = None;

    let mut i = 0;
    while i < parts.len() {
        match parts[i] {
            "depth" => {
                depth = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "seldepth" => {
                seldepth = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "time" => {
                time_ms = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "nodes" => {
                nodes = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "nps" => {
                nps = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "multipv" => {
                multipv = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "score" => {
                let kind = parts.get(i + 1).copied();
                let value = parts.get(i + 2).and_then(|v| v.parse::<i32>().ok());
                score = match (kind, value) {
                    (Some("cp"), Some(v)) => Some(Score::Cp(v)),
                    (Some("mate"), Some(v)) => Some(Score::Mate(v)),
                    _ => None,
                };
                i += 3;
            }
            "pv" => {
                pv = Some(parts[i + 1..].iter().map(|s| s.to_string()).collect());
                break;
            }
            _ => {
                i += 1;
            }
        }
    }

    match (depth, score, pv) {
        (Some(depth), Some(score), Some(pv)) if !pv.is_empty() => Some(AnalysisRecord {
            depth,
            seldepth,
            time_ms,
            nodes,
            nps,
            multipv,
            score,
            pv,
        }),
        _ => None,
    }
}
