use std::cmp::Ordering;

use regex::Regex;
use serde::Serialize;

use crate::domain::{DateKey, EntityLevel};
use crate::error::EpiError;
use crate::pipeline::{DateWindow, Pipeline, PipelineContext, ResultSeries, ValueKind};
use crate::tree::{EntityId, EntityTree, PopulationRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesRequest {
    pub kind: ValueKind,
    pub window: DateWindow,
    pub population: PopulationRange,
}

impl SeriesRequest {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            window: DateWindow::default(),
            population: PopulationRange::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub full_code: String,
    pub name: String,
    pub level: EntityLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RankGroup {
    Highest,
    Lowest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub full_code: String,
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub group: RankGroup,
}

fn resolve(tree: &EntityTree, full_code: &str) -> Result<EntityId, EpiError> {
    tree.get_entity(full_code)
        .ok_or_else(|| EpiError::EntityNotFound(full_code.to_string()))
}

fn effective_population(tree: &EntityTree, id: EntityId, range: &PopulationRange) -> u64 {
    if !range.is_active() {
        return tree.population(id).total();
    }
    tree.walk(id)
        .into_iter()
        .filter(|member| tree.node(*member).is_some_and(|node| node.is_leaf()))
        .map(|member| tree.population(member).total())
        .filter(|total| range.contains(*total))
        .sum()
}

fn series_for(
    tree: &EntityTree,
    id: EntityId,
    pipeline: &Pipeline,
    request: &SeriesRequest,
    last_trusted: Option<DateKey>,
    today: DateKey,
) -> ResultSeries {
    let (raw, scanned) = tree.raw_series(id, pipeline.source(), &request.population);
    let context = PipelineContext {
        population: effective_population(tree, id, &request.population),
        today,
        last_trusted,
        window: request.window,
    };
    let mut series = pipeline.run(&raw, &context);
    series.scanned = scanned;
    series.full_code = tree.full_code(id);
    series.name = tree
        .node(id)
        .map(|node| node.name().to_string())
        .unwrap_or_default();
    series
}

pub fn series(
    tree: &EntityTree,
    full_code: &str,
    request: &SeriesRequest,
    today: DateKey,
) -> Result<ResultSeries, EpiError> {
    let id = resolve(tree, full_code)?;
    let pipeline = request.kind.pipeline();
    Ok(series_for(
        tree,
        id,
        &pipeline,
        request,
        tree.newest_trusted_date(),
        today,
    ))
}

fn split_level_prefix(text: &str) -> (Option<EntityLevel>, &str) {
    if let Some((prefix, rest)) = text.split_once(':')
        && let Ok(level) = prefix.trim().parse::<EntityLevel>()
    {
        return (Some(level), rest.trim());
    }
    (None, text.trim())
}

fn wildcard_regex(pattern: &str) -> Result<Regex, EpiError> {
    let mut source = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|err| EpiError::InvalidPattern(err.to_string()))
}

pub fn search_entities(tree: &EntityTree, text: &str) -> Result<Vec<SearchHit>, EpiError> {
    let (level, needle) = split_level_prefix(text);
    let candidates: Vec<EntityId> = tree
        .walk(tree.root())
        .into_iter()
        .filter(|id| {
            tree.node(*id)
                .is_some_and(|node| level.is_none_or(|level| node.level() == level))
        })
        .collect();
    let name_of = |id: &EntityId| {
        tree.node(*id)
            .map(|node| node.name().to_string())
            .unwrap_or_default()
    };

    let matched: Vec<EntityId> = if needle.contains(['*', '?']) {
        let regex = wildcard_regex(needle)?;
        candidates
            .into_iter()
            .filter(|id| regex.is_match(&name_of(id)))
            .collect()
    } else {
        let needle = needle.to_lowercase();
        let prefixed: Vec<EntityId> = candidates
            .iter()
            .copied()
            .filter(|id| name_of(id).to_lowercase().starts_with(&needle))
            .collect();
        if prefixed.is_empty() {
            candidates
                .into_iter()
                .filter(|id| name_of(id).to_lowercase().contains(&needle))
                .collect()
        } else {
            prefixed
        }
    };

    let mut hits: Vec<SearchHit> = matched
        .into_iter()
        .filter_map(|id| {
            tree.node(id).map(|node| SearchHit {
                full_code: tree.full_code(id),
                name: node.name().to_string(),
                level: node.level(),
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.full_code.cmp(&b.full_code))
    });
    Ok(hits)
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: EntityId,
    min: f64,
    max: f64,
}

fn by_max_desc(a: &Candidate, b: &Candidate) -> Ordering {
    b.max.total_cmp(&a.max)
}

fn by_min_asc(a: &Candidate, b: &Candidate) -> Ordering {
    a.min.total_cmp(&b.min)
}

fn rerank(candidates: &mut [Candidate], highest: usize) {
    candidates.sort_by(by_max_desc);
    let split = highest.min(candidates.len());
    candidates[split..].sort_by(by_min_asc);
}

pub fn ranked_analytics(
    tree: &EntityTree,
    full_code: &str,
    level: EntityLevel,
    highest: usize,
    lowest: usize,
    request: &SeriesRequest,
    today: DateKey,
) -> Result<Vec<RankedEntry>, EpiError> {
    let root = resolve(tree, full_code)?;
    let pipeline = request.kind.pipeline();
    let last_trusted = tree.newest_trusted_date();
    let bound = highest + lowest;
    let mut candidates: Vec<Candidate> = Vec::with_capacity(bound + 1);

    for id in tree.children_of_level(root, level, |_| true) {
        let series = series_for(tree, id, &pipeline, request, last_trusted, today);
        let Some((min, max)) = series.min_max() else {
            continue;
        };
        candidates.push(Candidate { id, min, max });
        rerank(&mut candidates, highest);
        candidates.truncate(bound);
    }

    Ok(candidates
        .into_iter()
        .enumerate()
        .filter_map(|(position, candidate)| {
            let node = tree.node(candidate.id)?;
            Some(RankedEntry {
                full_code: tree.full_code(candidate.id),
                name: node.name().to_string(),
                min: candidate.min,
                max: candidate.max,
                group: if position < highest {
                    RankGroup::Highest
                } else {
                    RankGroup::Lowest
                },
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_prefix_is_case_insensitive() {
        assert_eq!(
            split_level_prefix("District: Brno"),
            (Some(EntityLevel::District), "Brno")
        );
        assert_eq!(split_level_prefix("Brno"), (None, "Brno"));
        assert_eq!(split_level_prefix("foo:bar"), (None, "foo:bar"));
    }

    #[test]
    fn wildcards_cover_the_whole_name() {
        let regex = wildcard_regex("pra?a*").unwrap();
        assert!(regex.is_match("Praha 5"));
        assert!(!regex.is_match("Old Praha"));
        assert!(wildcard_regex("a.b").unwrap().is_match("A.B"));
    }

    #[test]
    fn rerank_keeps_highest_then_lowest() {
        let root = EntityTree::new().root();
        let candidate = |min: f64, max: f64| Candidate { id: root, min, max };
        let mut candidates = vec![
            candidate(5.0, 10.0),
            candidate(1.0, 3.0),
            candidate(2.0, 30.0),
            candidate(0.5, 4.0),
        ];
        rerank(&mut candidates, 2);
        let maxes: Vec<f64> = candidates.iter().map(|c| c.max).collect();
        assert_eq!(maxes, vec![30.0, 10.0, 4.0, 3.0]);
    }
}
