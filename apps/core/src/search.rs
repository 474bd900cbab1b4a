use crate::model::{normalize_for_search, VaultItem};

pub const DEFAULT_THRESHOLD: f64 = 0.5;

// A match starting this many characters into a field costs a full point.
const PROXIMITY_DISTANCE: f64 = 100.0;
const COVERAGE_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Name,
    Username,
}

impl SearchField {
    fn extract(self, item: &VaultItem) -> Option<&str> {
        match self {
            Self::Name => Some(item.name.as_str()),
            Self::Username => item.username(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedField {
    pub field: SearchField,
    pub weight: f64,
}

/// Where a query landed inside one field. `start..end` are offsets in the
/// normalized field text.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMatch {
    pub field: SearchField,
    pub distance: f64,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    pub item: VaultItem,
    /// 0.0 is a perfect match, 1.0 the worst that still passed the threshold.
    pub distance: f64,
    pub matches: Vec<FieldMatch>,
}

impl SearchMatch {
    pub fn relevance(&self) -> f64 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct FuzzySearchIndex {
    fields: Vec<WeightedField>,
    threshold: f64,
}

impl Default for FuzzySearchIndex {
    fn default() -> Self {
        Self {
            fields: vec![
                WeightedField {
                    field: SearchField::Name,
                    weight: 1.0,
                },
                WeightedField {
                    field: SearchField::Username,
                    weight: 0.4,
                },
            ],
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl FuzzySearchIndex {
    pub fn new(fields: Vec<WeightedField>, threshold: f64) -> Self {
        Self { fields, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn search(&self, query: &str, items: &[VaultItem]) -> Vec<SearchMatch> {
        let needle: Vec<char> = normalize_for_search(query).chars().collect();
        if needle.is_empty() || items.is_empty() {
            return Vec::new();
        }

        let total_weight: f64 = self.fields.iter().map(|f| f.weight).sum();
        if total_weight <= 0.0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, SearchMatch)> = items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                self.score_item(item, &needle, total_weight)
                    .map(|found| (index, found))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.distance
                .partial_cmp(&b.1.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        scored.into_iter().map(|(_, found)| found).collect()
    }

    fn score_item(&self, item: &VaultItem, needle: &[char], total_weight: f64) -> Option<SearchMatch> {
        let mut matches = Vec::new();
        let mut distance = 1.0_f64;

        for weighted in &self.fields {
            let Some(raw) = weighted.field.extract(item) else {
                continue;
            };
            let haystack: Vec<char> = normalize_for_search(raw).chars().collect();
            if haystack.is_empty() {
                continue;
            }

            let alignment = best_substring_alignment(&haystack, needle);
            if match_distance(&alignment, needle.len()) > self.threshold {
                continue;
            }
            let field_distance = field_distance(&alignment, haystack.len(), needle.len());

            let norm_weight = weighted.weight / total_weight;
            distance *= field_distance.max(f64::EPSILON).powf(norm_weight);
            matches.push(FieldMatch {
                field: weighted.field,
                distance: field_distance,
                start: alignment.start,
                end: alignment.end,
            });
        }

        if matches.is_empty() {
            return None;
        }

        Some(SearchMatch {
            item: item.clone(),
            distance: distance.clamp(0.0, 1.0),
            matches,
        })
    }
}

/// Maps a raw distance (0 best) to the 0..=100 score the launcher ranks by.
/// Inputs outside `[0, 1]` (including NaN) score 0.
pub fn display_score(raw: f64) -> u32 {
    if (0.0..=1.0).contains(&raw) {
        (100.0 - raw * 100.0).round() as u32
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Alignment {
    errors: usize,
    start: usize,
    end: usize,
}

/// What the threshold is checked against.
fn match_distance(alignment: &Alignment, query_len: usize) -> f64 {
    let error_ratio = alignment.errors as f64 / query_len as f64;
    let proximity = alignment.start as f64 / PROXIMITY_DISTANCE;
    error_ratio + proximity
}

/// Ranking distance of a field that already passed the threshold; longer
/// fields rank slightly lower.
fn field_distance(alignment: &Alignment, field_len: usize, query_len: usize) -> f64 {
    let coverage = field_len.saturating_sub(query_len) as f64 / field_len as f64 * COVERAGE_WEIGHT;
    match_distance(alignment, query_len) + coverage
}

/// Edit distance between `needle` and its best-matching substring of
/// `haystack` (Sellers' variant of Levenshtein: leading and trailing
/// haystack characters are free).
fn best_substring_alignment(haystack: &[char], needle: &[char]) -> Alignment {
    let m = needle.len();
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut prev_start: Vec<usize> = vec![0; m + 1];
    let mut curr: Vec<usize> = vec![0; m + 1];
    let mut curr_start: Vec<usize> = vec![0; m + 1];

    let mut best = Alignment {
        errors: m,
        start: 0,
        end: 0,
    };

    for (j, hay_char) in haystack.iter().enumerate() {
        curr[0] = 0;
        curr_start[0] = j + 1;
        for (i, needle_char) in needle.iter().enumerate() {
            let row = i + 1;
            let cost = usize::from(needle_char != hay_char);
            let mut value = prev[row - 1] + cost;
            let mut start = prev_start[row - 1];
            if curr[row - 1] + 1 < value {
                value = curr[row - 1] + 1;
                start = curr_start[row - 1];
            }
            if prev[row] + 1 < value {
                value = prev[row] + 1;
                start = prev_start[row];
            }
            curr[row] = value;
            curr_start[row] = start;
        }

        if curr[m] < best.errors {
            best = Alignment {
                errors: curr[m],
                start: curr_start[m],
                end: j + 1,
            };
        }

        std::mem::swap(&mut prev, &mut curr);
        std::mem::swap(&mut prev_start, &mut curr_start);
    }

    best
}
