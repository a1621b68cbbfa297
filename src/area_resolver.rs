//! Matching free-text or coded area references to `Area` rows.
//!
//! A hierarchy such as council → ward is resolved one hop at a time. Each hop
//! searches inside the polygon of the previous hop's match, so a ward can be
//! found through a council that no longer exists.

use crate::area_store::AreaQuery;
use crate::geocoding_config::{GeocodingComponent, GeocodingConfig};
use crate::loaders::Loaders;
use crate::models::{Area, AreaTypeFilter, Step};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Minimum trigram similarity for a fuzzy name match (pg_trgm's default).
pub const SIMILARITY_THRESHOLD: f64 = 0.3;

const COUNCIL_SUFFIXES: [&str; 5] = [
    " council",
    " city council",
    " borough council",
    " district council",
    " county council",
];

const COUNCIL_LIH_CODES: [&str; 2] = ["STC", "DIS"];
const COUNCIL_MAPIT_TYPES: [&str; 8] = ["CTY", "DIS", "LBO", "MTD", "UTA", "COI", "LGD", "NMD"];

/// "herefordshire, county of" → "herefordshire county"
static TITLE_REWRITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+),\s*(.+) of$").expect("valid title regex"));
/// "herefordshire, county of" → "herefordshire"
static TITLE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*[^,]+ of$").expect("valid title clause regex"));

/// Whether an area type filter plausibly targets councils, in which case
/// names are also tried with council suffixes.
pub fn is_council_type(filter: &AreaTypeFilter) -> bool {
    filter
        .lih_codes
        .iter()
        .any(|c| COUNCIL_LIH_CODES.contains(&c.as_str()))
        || filter
            .mapit_types
            .iter()
            .any(|t| COUNCIL_MAPIT_TYPES.contains(&t.as_str()))
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

/// Raw value, lowercased form, `X, Y of` rewrite and sans-title form.
pub fn name_variants(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let lower = raw.to_lowercase();
    let rewritten = TITLE_REWRITE.replace(&lower, "$1 $2").into_owned();
    let sans_title = TITLE_CLAUSE.replace(&lower, "").trim().to_string();

    let mut variants = Vec::with_capacity(4);
    for value in [raw.to_string(), lower, rewritten, sans_title] {
        push_unique(&mut variants, value);
    }
    variants
}

/// Every string an area's name or code is compared against.
pub fn search_candidates(raw: &str, filter: &AreaTypeFilter) -> Vec<String> {
    let variants = name_variants(raw);
    let council = is_council_type(filter);

    let mut candidates = Vec::new();
    for variant in &variants {
        push_unique(&mut candidates, variant.clone());
        if council {
            for suffix in COUNCIL_SUFFIXES {
                push_unique(&mut candidates, format!("{}{}", variant, suffix));
            }
        }
    }
    candidates
}

/// Strips diacritics, matching Postgres `unaccent` for Latin letters.
pub fn fold_accents(value: &str) -> String {
    let mut folded = String::with_capacity(value.len());
    for c in value.nfd().filter(|c| !is_combining_mark(*c)) {
        // Letters with no canonical decomposition.
        match c {
            'ß' => folded.push_str("ss"),
            'æ' => folded.push_str("ae"),
            'Æ' => folded.push_str("AE"),
            'œ' => folded.push_str("oe"),
            'Œ' => folded.push_str("OE"),
            'þ' => folded.push_str("th"),
            'Þ' => folded.push_str("TH"),
            'ø' => folded.push('o'),
            'Ø' => folded.push('O'),
            'ł' => folded.push('l'),
            'Ł' => folded.push('L'),
            'đ' | 'ð' => folded.push('d'),
            'Đ' | 'Ð' => folded.push('D'),
            'ı' => folded.push('i'),
            other => folded.push(other),
        }
    }
    folded
}

/// Case- and accent-insensitive comparison form.
pub fn match_key(value: &str) -> String {
    fold_accents(&value.trim().to_lowercase())
}

fn trigrams(value: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    for word in value
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain([' ']).collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

/// Trigram similarity with pg_trgm semantics: shared trigrams over the union,
/// each word padded with two leading spaces and one trailing space.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = trigrams(a);
    let right = trigrams(b);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// A candidate area together with the evidence used to rank it.
#[derive(Debug, Clone)]
pub struct AreaMatch {
    pub area: Area,
    pub gss_exact: bool,
    pub similarity: f64,
}

impl AreaMatch {
    /// Scores `area` against the candidate strings, `None` if it does not match.
    pub fn score(area: &Area, candidates: &[String]) -> Option<Self> {
        let keys: Vec<String> = candidates.iter().map(|c| match_key(c)).collect();
        let gss_exact = area
            .gss
            .as_deref()
            .is_some_and(|gss| candidates.iter().any(|c| c.trim().eq_ignore_ascii_case(gss)));
        let name_key = match_key(&area.name);
        let name_exact = keys.contains(&name_key);
        let similarity = keys
            .iter()
            .map(|k| trigram_similarity(&name_key, k))
            .fold(0.0_f64, f64::max);

        (gss_exact || name_exact || similarity > SIMILARITY_THRESHOLD).then(|| Self {
            area: area.clone(),
            gss_exact,
            similarity,
        })
    }

    fn rounded_similarity(&self) -> i64 {
        (self.similarity * 10.0).round() as i64
    }
}

/// Orders matches best first: exact GSS, then similarity rounded to one
/// decimal place, then most recent boundary generation.
pub fn rank_matches(mut matches: Vec<AreaMatch>) -> Vec<AreaMatch> {
    matches.sort_by(|a, b| {
        b.gss_exact
            .cmp(&a.gss_exact)
            .then_with(|| b.rounded_similarity().cmp(&a.rounded_similarity()))
            .then_with(|| {
                b.area
                    .mapit_generation_high
                    .cmp(&a.area.mapit_generation_high)
            })
    });
    matches
}

fn area_summary(area: &Area) -> Value {
    json!({
        "id": area.id,
        "gss": area.gss,
        "name": area.name,
        "area_type": area.area_type,
        "mapit_generation_high": area.mapit_generation_high,
    })
}

/// Area-name strategy: resolves each component in order, narrowing by the
/// previous match. Returns `None` as soon as a hop finds nothing.
pub async fn resolve_area_chain(
    config: &GeocodingConfig,
    record: &Map<String, Value>,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<Area> {
    let mut matched: Option<Area> = None;

    for component in &config.components {
        let Some(raw) = component.text_value(record) else {
            tracing::debug!(
                "Skipping area component {:?}: no value on record",
                component.field()
            );
            continue;
        };

        let hop = resolve_hop(component, &raw, matched.as_ref(), loaders).await;
        let found = hop.result.is_some();
        steps.push(hop.step);
        if !found {
            return None;
        }
        matched = hop.result;
    }

    matched
}

struct Hop {
    step: Step,
    result: Option<Area>,
}

async fn resolve_hop(
    component: &GeocodingComponent,
    raw: &str,
    parent: Option<&Area>,
    loaders: &Loaders,
) -> Hop {
    let candidates = search_candidates(raw, &component.area_types);
    let query = AreaQuery {
        candidates: &candidates,
        area_types: &component.area_types,
        parent,
    };
    let search_term = Some(json!(raw));
    let mut data = json!({
        "candidates": candidates,
        "lih_area_type__code": component.area_types.lih_codes,
        "mapit_type": component.area_types.mapit_types,
        "parent_gss": parent.and_then(|p| p.gss.clone()),
    });

    match loaders.area_by_name(&query).await {
        Ok(Some(area)) => {
            tracing::debug!("Matched '{}' to {} ({:?})", raw, area.name, area.gss);
            data["area"] = area_summary(&area);
            Hop {
                step: Step::success("area_name_matching", "areas", search_term, Some(data)),
                result: Some(area),
            }
        }
        Ok(None) => {
            tracing::debug!("No area matched '{}'", raw);
            Hop {
                step: Step::failed("area_name_matching", "areas", search_term, Some(data)),
                result: None,
            }
        }
        Err(e) => {
            tracing::warn!("Area lookup failed for '{}': {}", raw, e);
            data["error"] = json!(e.to_string());
            Hop {
                step: Step::failed("area_name_matching", "areas", search_term, Some(data)),
                result: None,
            }
        }
    }
}

/// Area-code strategy: one exact, case-insensitive code lookup.
pub async fn resolve_area_code(
    component: &GeocodingComponent,
    record: &Map<String, Value>,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<Area> {
    let code = component.text_value(record)?;
    let search_term = Some(json!(code));

    match loaders.area_by_code(&code, &component.area_types).await {
        Ok(Some(area)) => {
            steps.push(Step::success(
                "area_code_matching",
                "areas",
                search_term,
                Some(area_summary(&area)),
            ));
            Some(area)
        }
        Ok(None) => {
            steps.push(Step::failed("area_code_matching", "areas", search_term, None));
            None
        }
        Err(e) => {
            tracing::warn!("Area code lookup failed for '{}': {}", code, e);
            steps.push(Step::failed(
                "area_code_matching",
                "areas",
                search_term,
                Some(json!({ "error": e.to_string() })),
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(id: i64, name: &str, gss: &str, generation_high: i32) -> Area {
        Area {
            id,
            gss: Some(gss.to_string()),
            name: name.to_string(),
            area_type: "WD23".to_string(),
            mapit_type: None,
            mapit_generation_low: Some(1),
            mapit_generation_high: Some(generation_high),
            polygon: None,
            point: None,
        }
    }

    #[test]
    fn test_name_variants_handle_titles() {
        let variants = name_variants("Herefordshire, County of");
        assert_eq!(
            variants,
            vec![
                "Herefordshire, County of",
                "herefordshire, county of",
                "herefordshire county",
                "herefordshire",
            ]
        );
    }

    #[test]
    fn test_council_suffixes_only_for_council_types() {
        let council = AreaTypeFilter {
            lih_codes: vec!["STC".into(), "DIS".into()],
            mapit_types: vec![],
        };
        let ward = AreaTypeFilter {
            lih_codes: vec!["WD23".into()],
            mapit_types: vec![],
        };

        let with = search_candidates("Barnsley", &council);
        assert!(with.contains(&"Barnsley".to_string()));
        assert!(with.contains(&"barnsley council".to_string()));
        assert!(with.contains(&"Barnsley borough council".to_string()));

        let without = search_candidates("Barnsley", &ward);
        assert_eq!(without, vec!["Barnsley", "barnsley"]);
    }

    #[test]
    fn test_trigram_similarity_bounds() {
        assert_eq!(trigram_similarity("barnsley", "barnsley"), 1.0);
        assert_eq!(trigram_similarity("", "barnsley"), 0.0);
        let partial = trigram_similarity("barnsley", "barnsley council");
        assert!(partial > SIMILARITY_THRESHOLD && partial < 1.0);
        assert!(trigram_similarity("st helens", "wigan") < SIMILARITY_THRESHOLD);
    }

    #[test]
    fn test_accent_insensitive_match() {
        let ynys = area(1, "Ynys Môn", "W06000001", 10);
        let matched = AreaMatch::score(&ynys, &["ynys mon".to_string()]).unwrap();
        assert!(matched.similarity == 1.0);
        assert!(!matched.gss_exact);
    }

    #[test]
    fn test_fold_accents_handles_undecomposable_letters() {
        assert_eq!(fold_accents("Llanfair Pwllgwyngyll Môn"), "Llanfair Pwllgwyngyll Mon");
        assert_eq!(fold_accents("Straße"), "Strasse");
        assert_eq!(fold_accents("Ærø Łódź"), "AEro Lodz");
        assert_eq!(fold_accents("Ŵyddgrug"), "Wyddgrug");
        assert_eq!(match_key("  CAFÉ Nœud "), "cafe noeud");
    }

    #[test]
    fn test_gss_match_is_case_insensitive() {
        let ward = area(1, "St Helens", "E05000993", 10);
        let matched = AreaMatch::score(&ward, &["e05000993".to_string()]).unwrap();
        assert!(matched.gss_exact);
        assert!(AreaMatch::score(&ward, &["nowhere at all".to_string()]).is_none());
    }

    #[test]
    fn test_rounded_similarity_ties_break_on_generation() {
        let older = AreaMatch {
            area: area(1, "Amotherby", "E05000001", 40),
            gss_exact: false,
            similarity: 0.82,
        };
        let newer = AreaMatch {
            area: area(2, "Amotherby & Ampleforth", "E05014252", 50),
            gss_exact: false,
            similarity: 0.80,
        };
        let ranked = rank_matches(vec![older, newer]);
        assert_eq!(ranked[0].area.id, 2);
    }

    #[test]
    fn test_exact_gss_beats_similarity() {
        let by_code = AreaMatch {
            area: area(1, "Old Name", "E05000993", 1),
            gss_exact: true,
            similarity: 0.1,
        };
        let by_name = AreaMatch {
            area: area(2, "St Helens", "E05999999", 60),
            gss_exact: false,
            similarity: 1.0,
        };
        let ranked = rank_matches(vec![by_name, by_code]);
        assert_eq!(ranked[0].area.id, 1);
    }

    #[test]
    fn test_higher_rounded_similarity_wins_over_generation() {
        let close = AreaMatch {
            area: area(1, "A", "E1", 1),
            gss_exact: false,
            similarity: 0.9,
        };
        let far = AreaMatch {
            area: area(2, "B", "E2", 99),
            gss_exact: false,
            similarity: 0.7,
        };
        let ranked = rank_matches(vec![far, close]);
        assert_eq!(ranked[0].area.id, 1);
    }
}
