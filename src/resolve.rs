//! Fuzzy tool-name resolution.
//!
//! Models paraphrase tool names: a transposed character, a dropped server
//! prefix, a singular where the server says plural. Resolution is
//! conservative: exact match wins, a fuzzy match must be unambiguously best,
//! and anything else passes through unchanged so the downstream call fails
//! with a tool-not-found diagnostic instead of silently hitting the wrong
//! tool.

/// Minimum similarity before a fuzzy candidate is considered at all.
const SCORE_THRESHOLD: f64 = 0.6;
/// A winner must be clear of the runner-up by at least this much.
const SCORE_MARGIN: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Exact(String),
    Fuzzy { name: String, score: f64 },
    /// Left as supplied; the caller surfaces tool-not-found.
    Unresolved,
}

impl Resolution {
    pub fn name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self {
            Self::Exact(name) | Self::Fuzzy { name, .. } => name.as_str(),
            Self::Unresolved => fallback,
        }
    }
}

/// Resolve `requested` against candidate tool names. `server_key` contributes
/// stopwords: its tokens are stripped before scoring so "github_search_code"
/// and "search_code" compare equal on a server keyed "github".
pub fn resolve<'a, I>(requested: &str, candidates: I, server_key: &str) -> Resolution
where
    I: IntoIterator<Item = &'a str>,
{
    let candidates: Vec<&str> = candidates.into_iter().collect();

    if candidates.iter().any(|c| *c == requested) {
        return Resolution::Exact(requested.to_string());
    }

    let stopwords = tokenize(server_key, &[]);
    let requested_tokens = tokenize(requested, &stopwords);

    let mut scored: Vec<(&str, f64)> = candidates
        .iter()
        .map(|c| {
            let candidate_tokens = tokenize(c, &stopwords);
            (*c, token_overlap(&requested_tokens, &candidate_tokens))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(&(best, best_score)) = scored.first() {
        let runner_up = scored.get(1).map(|s| s.1).unwrap_or(0.0);
        if best_score >= SCORE_THRESHOLD && best_score - runner_up >= SCORE_MARGIN {
            return Resolution::Fuzzy {
                name: best.to_string(),
                score: best_score,
            };
        }
    }

    // Ties and sub-threshold scores fall through to containment, which must
    // also be unique to count.
    let lowered = requested.to_lowercase();
    let contained: Vec<&str> = candidates
        .iter()
        .filter(|c| {
            let candidate = c.to_lowercase();
            candidate.contains(&lowered) || lowered.contains(&candidate)
        })
        .copied()
        .collect();
    if let [only] = contained.as_slice() {
        return Resolution::Fuzzy {
            name: only.to_string(),
            score: 0.0,
        };
    }

    Resolution::Unresolved
}

/// Lowercased tokens split on `_`, `-`, `.` and camelCase boundaries, with
/// stopwords removed.
fn tokenize(name: &str, stopwords: &[String]) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == '.' || ch == ' ' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else if ch.is_uppercase() && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
            current.push(ch.to_ascii_lowercase());
        } else {
            current.push(ch.to_ascii_lowercase());
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens.retain(|t| !stopwords.contains(t));
    tokens
}

/// Dice-style overlap where tokens match exactly or within one edit
/// (transpositions count as one). Short tokens must match exactly.
fn token_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut used = vec![false; b.len()];
    let mut matched = 0usize;
    for token in a {
        for (i, other) in b.iter().enumerate() {
            if used[i] {
                continue;
            }
            let close = token == other
                || (token.len() > 3 && other.len() > 3 && osa_distance(token, other) <= 1);
            if close {
                used[i] = true;
                matched += 1;
                break;
            }
        }
    }

    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

/// Optimal string alignment distance (Levenshtein plus adjacent
/// transposition).
fn osa_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in table.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        table[0][j] = j;
    }

    for i in 1..=n {
        for j in 1..=m {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (table[i - 1][j] + 1)
                .min(table[i][j - 1] + 1)
                .min(table[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(table[i - 2][j - 2] + 1);
            }
            table[i][j] = best;
        }
    }
    table[n][m]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        let candidates = ["search_files", "read_file"];
        assert_eq!(
            resolve("read_file", candidates, "fs"),
            Resolution::Exact("read_file".to_string())
        );
    }

    #[test]
    fn single_transposition_resolves() {
        let candidates = ["search_files", "list_directory", "create_directory"];
        match resolve("serach_files", candidates, "fs") {
            Resolution::Fuzzy { name, score } => {
                assert_eq!(name, "search_files");
                assert!(score >= SCORE_THRESHOLD);
            }
            other => panic!("expected fuzzy match, got {:?}", other),
        }
    }

    #[test]
    fn equally_close_candidates_stay_unresolved() {
        // Both candidates are one edit away and both contain the request,
        // so neither scoring nor containment can pick a unique winner.
        let candidates = ["get_users", "get_usera"];
        assert_eq!(resolve("get_user", candidates, "crm"), Resolution::Unresolved);
    }

    #[test]
    fn server_prefix_is_a_stopword() {
        let candidates = ["github_search_code", "github_list_commits"];
        match resolve("search_code", candidates, "github") {
            Resolution::Fuzzy { name, .. } => assert_eq!(name, "github_search_code"),
            other => panic!("expected fuzzy match, got {:?}", other),
        }
    }

    #[test]
    fn containment_breaks_subthreshold_when_unique() {
        let candidates = ["fetch_weather_forecast_hourly", "list_stations"];
        match resolve("forecast", candidates, "weather") {
            Resolution::Fuzzy { name, .. } => assert_eq!(name, "fetch_weather_forecast_hourly"),
            other => panic!("expected containment match, got {:?}", other),
        }
    }

    #[test]
    fn garbage_passes_through_unresolved() {
        let candidates = ["search_files", "read_file"];
        assert_eq!(
            resolve("launch_missiles", candidates, "fs"),
            Resolution::Unresolved
        );
    }

    #[test]
    fn osa_counts_transposition_as_one() {
        assert_eq!(osa_distance("serach", "search"), 1);
        assert_eq!(osa_distance("abc", "abc"), 0);
        assert_eq!(osa_distance("", "abc"), 3);
    }
}
