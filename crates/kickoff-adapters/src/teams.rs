//! Source club name to canonical team resolution.
//!
//! Matching runs in order and the first stage with a hit wins:
//! exact (raw or alias, case-insensitive), normalized exact, normalized substring.
//! Substring matching is a heuristic and can pick the wrong club for short or shared
//! names; when several teams qualify the closest by Jaro-Winkler is taken.

use kickoff_core::Team;
use strsim::jaro_winkler;

/// Fixed source-name aliases, compared case-insensitively.
const ALIASES: &[(&str, &str)] = &[
    ("Man City", "Manchester City"),
    ("Man United", "Manchester United"),
    ("Man Utd", "Manchester United"),
    ("Spurs", "Tottenham Hotspur"),
    ("Tottenham", "Tottenham Hotspur"),
    ("Wolves", "Wolverhampton Wanderers"),
    ("Nott'm Forest", "Nottingham Forest"),
    ("Forest", "Nottingham Forest"),
    ("Newcastle", "Newcastle United"),
    ("Sheffield Utd", "Sheffield United"),
    ("Sheffield United", "Sheffield United"),
    ("West Brom", "West Bromwich Albion"),
    ("Brighton", "Brighton & Hove Albion"),
    ("Luton", "Luton Town"),
    ("Ath Madrid", "Atletico Madrid"),
    ("Atletico", "Atletico Madrid"),
    ("Ath Bilbao", "Athletic Club"),
    ("Athletic Bilbao", "Athletic Club"),
    ("Betis", "Real Betis"),
    ("Sociedad", "Real Sociedad"),
    ("Celta", "Celta Vigo"),
    ("Espanol", "Espanyol"),
    ("Inter", "Internazionale"),
    ("Inter Milan", "Internazionale"),
    ("Milan", "AC Milan"),
    ("Bayern Munich", "Bayern München"),
    ("Dortmund", "Borussia Dortmund"),
    ("M'gladbach", "Borussia Mönchengladbach"),
    ("Gladbach", "Borussia Mönchengladbach"),
    ("Leverkusen", "Bayer 04 Leverkusen"),
    ("Paris SG", "Paris Saint-Germain"),
    ("PSG", "Paris Saint-Germain"),
    ("Paris Saint Germain", "Paris Saint-Germain"),
];

/// Substrings stripped after lowercasing and dropping punctuation, in this order.
const NOISE: &[&str] = &["footballclub", "afc", "fc", "cf"];

/// Normalized names shorter than this never take part in substring matching.
const MIN_SUBSTRING_LEN: usize = 3;

pub fn alias_for(name: &str) -> Option<&'static str> {
    let trimmed = name.trim();
    ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        .map(|(_, canonical)| *canonical)
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}

pub fn normalize_team_name(name: &str) -> String {
    let mut normalized: String = name
        .to_lowercase()
        .chars()
        .map(fold_accent)
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    for noise in NOISE {
        normalized = normalized.replace(noise, "");
    }
    normalized
}

fn team_names(team: &Team) -> impl Iterator<Item = &str> {
    std::iter::once(team.name.as_str()).chain(team.short_name.as_deref())
}

pub fn resolve_team<'a>(source_name: &str, candidates: &'a [Team]) -> Option<&'a Team> {
    let source_name = source_name.trim();
    if source_name.is_empty() {
        return None;
    }
    let mut targets = vec![source_name];
    if let Some(alias) = alias_for(source_name) {
        targets.push(alias);
    }

    for target in &targets {
        if let Some(team) = candidates
            .iter()
            .find(|t| team_names(t).any(|n| n.trim().eq_ignore_ascii_case(target)))
        {
            return Some(team);
        }
    }

    let normalized_targets: Vec<String> = targets
        .iter()
        .map(|t| normalize_team_name(t))
        .filter(|t| !t.is_empty())
        .collect();

    for target in &normalized_targets {
        if let Some(team) = candidates
            .iter()
            .find(|t| team_names(t).any(|n| normalize_team_name(n) == *target))
        {
            return Some(team);
        }
    }

    let mut best: Option<(&Team, f64)> = None;
    for target in normalized_targets
        .iter()
        .filter(|t| t.len() >= MIN_SUBSTRING_LEN)
    {
        for team in candidates {
            let hit = team_names(team)
                .map(normalize_team_name)
                .filter(|n| n.len() >= MIN_SUBSTRING_LEN)
                .any(|n| n.contains(target.as_str()) || target.contains(n.as_str()));
            if !hit {
                continue;
            }
            let score = jaro_winkler(target, &normalize_team_name(&team.name));
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((team, score));
            }
        }
    }
    best.map(|(team, _)| team)
}
