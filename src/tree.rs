use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::domain::{DateKey, EntityLevel, Observation, Population, SourceFields};
use crate::error::EpiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    Structure,
    Data,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentInfo {
    pub saved_on: Option<DateKey>,
    pub last_content_date: Option<DateKey>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl PopulationRange {
    pub fn is_active(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    pub fn contains(&self, total: u64) -> bool {
        self.min.is_none_or(|min| total >= min) && self.max.is_none_or(|max| total <= max)
    }
}

#[derive(Debug)]
pub struct EntityNode {
    code: String,
    name: String,
    level: EntityLevel,
    parent: Option<EntityId>,
    children: BTreeMap<String, EntityId>,
    records: BTreeMap<DateKey, Observation>,
    direct_population: Option<Population>,
    population_cache: OnceCell<Population>,
}

impl EntityNode {
    fn new(code: &str, name: String, level: EntityLevel, parent: Option<EntityId>) -> Self {
        Self {
            code: code.to_string(),
            name,
            level,
            parent,
            children: BTreeMap::new(),
            records: BTreeMap::new(),
            direct_population: None,
            population_cache: OnceCell::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> EntityLevel {
        self.level
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.children.values().copied()
    }

    pub fn child(&self, code: &str) -> Option<EntityId> {
        self.children.get(code).copied()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn records(&self) -> &BTreeMap<DateKey, Observation> {
        &self.records
    }

    pub fn direct_population(&self) -> Option<Population> {
        self.direct_population
    }
}

#[derive(Debug)]
pub struct EntityTree {
    nodes: Vec<Option<EntityNode>>,
    free: Vec<usize>,
    code_index: HashMap<(EntityLevel, String), EntityId>,
    content_info: ContentInfo,
}

impl Default for EntityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(EntityNode::new(
                "",
                "World".to_string(),
                EntityLevel::World,
                None,
            ))],
            free: Vec::new(),
            code_index: HashMap::new(),
            content_info: ContentInfo::default(),
        }
    }

    pub fn root(&self) -> EntityId {
        EntityId(0)
    }

    pub fn node(&self, id: EntityId) -> Option<&EntityNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: EntityId) -> Option<&mut EntityNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn require_mut(&mut self, id: EntityId) -> Result<&mut EntityNode, EpiError> {
        self.node_mut(id)
            .ok_or_else(|| EpiError::EntityNotFound(format!("#{}", id.0)))
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    pub fn content_info(&self) -> ContentInfo {
        self.content_info
    }

    pub fn set_content_info(&mut self, info: ContentInfo) {
        self.content_info = info;
    }

    pub fn add_or_create_child(
        &mut self,
        parent: EntityId,
        code: &str,
        name: impl FnOnce() -> String,
    ) -> Result<EntityId, EpiError> {
        let parent_node = self.require_mut(parent)?;
        if let Some(existing) = parent_node.child(code) {
            return Ok(existing);
        }
        let level = parent_node.level.child().ok_or_else(|| {
            EpiError::InvalidLevel(format!("settlement {} cannot have children", parent_node.code))
        })?;

        let node = EntityNode::new(code, name(), level, Some(parent));
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                EntityId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                EntityId(self.nodes.len() - 1)
            }
        };
        self.require_mut(parent)?
            .children
            .insert(code.to_string(), id);
        self.code_index
            .entry((level, code.to_string()))
            .or_insert(id);
        self.invalidate_population_from(parent);
        Ok(id)
    }

    pub fn set_name(&mut self, id: EntityId, name: &str) -> Result<(), EpiError> {
        self.require_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_code(&mut self, id: EntityId, code: &str) -> Result<(), EpiError> {
        if id != self.root() {
            return Err(EpiError::InvalidLevel(
                "only the root code can be renamed in place".to_string(),
            ));
        }
        self.require_mut(id)?.code = code.to_string();
        Ok(())
    }

    pub fn set_population(&mut self, id: EntityId, population: Population) -> Result<(), EpiError> {
        self.require_mut(id)?.direct_population = Some(population);
        self.invalidate_population_from(id);
        Ok(())
    }

    pub fn add_observation(
        &mut self,
        id: EntityId,
        date: DateKey,
        observation: Observation,
    ) -> Result<(), EpiError> {
        self.require_mut(id)?
            .records
            .entry(date)
            .or_default()
            .accumulate(observation);
        Ok(())
    }

    pub fn full_code(&self, id: EntityId) -> String {
        let mut codes = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.node(current) else {
                break;
            };
            if node.parent.is_some() {
                codes.push(node.code.as_str());
            }
            cursor = node.parent;
        }
        codes.reverse();
        codes.join(".")
    }

    pub fn get_entity(&self, full_code: &str) -> Option<EntityId> {
        let trimmed = full_code.trim();
        let mut cursor = self.root();
        if trimmed.is_empty() {
            return Some(cursor);
        }
        for segment in trimmed.split('.') {
            cursor = self.node(cursor)?.child(segment)?;
        }
        Some(cursor)
    }

    pub fn find_by_code(&self, level: EntityLevel, code: &str) -> Option<EntityId> {
        self.code_index
            .get(&(level, code.to_string()))
            .copied()
            .filter(|id| self.node(*id).is_some())
    }

    pub fn children_of_level<F>(&self, id: EntityId, level: EntityLevel, predicate: F) -> Vec<EntityId>
    where
        F: Fn(&EntityNode) -> bool,
    {
        let mut found = Vec::new();
        self.collect_level(id, level, &predicate, &mut found);
        found
    }

    fn collect_level<F>(&self, id: EntityId, level: EntityLevel, predicate: &F, out: &mut Vec<EntityId>)
    where
        F: Fn(&EntityNode) -> bool,
    {
        let Some(node) = self.node(id) else {
            return;
        };
        if node.level >= level {
            return;
        }
        for child_id in node.children() {
            let Some(child) = self.node(child_id) else {
                continue;
            };
            if child.level == level {
                if predicate(child) {
                    out.push(child_id);
                }
            } else {
                self.collect_level(child_id, level, predicate, out);
            }
        }
    }

    pub fn walk(&self, id: EntityId) -> Vec<EntityId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            order.push(current);
            let children: Vec<EntityId> = node.children().collect();
            stack.extend(children.into_iter().rev());
        }
        order
    }

    pub fn population(&self, id: EntityId) -> Population {
        let Some(node) = self.node(id) else {
            return Population::default();
        };
        *node.population_cache.get_or_init(|| {
            node.direct_population
                .unwrap_or_else(|| node.children().map(|child| self.population(child)).sum())
        })
    }

    fn invalidate_population_from(&mut self, id: EntityId) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.node_mut(current) else {
                break;
            };
            node.population_cache = OnceCell::new();
            cursor = node.parent;
        }
    }

    fn invalidate_population(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.population_cache = OnceCell::new();
        }
    }

    pub fn clear(&mut self, id: EntityId, mode: ClearMode) -> Result<(), EpiError> {
        match mode {
            ClearMode::Data => {
                for member in self.walk(id) {
                    if let Some(node) = self.node_mut(member) {
                        node.records.clear();
                    }
                }
            }
            ClearMode::Structure => {
                let subtree = self.walk(id);
                for member in subtree.into_iter().skip(1) {
                    if let Some(node) = self.nodes[member.0].take() {
                        let key = (node.level, node.code);
                        if self.code_index.get(&key) == Some(&member) {
                            self.code_index.remove(&key);
                        }
                        self.free.push(member.0);
                    }
                }
                let node = self.require_mut(id)?;
                node.children.clear();
                node.records.clear();
                if id == self.root() {
                    self.content_info = ContentInfo::default();
                }
                self.invalidate_population();
            }
        }
        Ok(())
    }

    pub fn clear_fields(&mut self, fields: SourceFields) {
        for node in self.nodes.iter_mut().flatten() {
            node.records.retain(|_, record| {
                record.clear_fields(fields);
                !record.is_zero()
            });
        }
    }

    pub fn record_count(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .map(|node| node.records.len())
            .sum()
    }

    pub fn newest_trusted_date(&self) -> Option<DateKey> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.as_ref().map(|node| (EntityId(index), node)))
            .filter(|(id, _)| self.population(*id).total() > 0)
            .filter_map(|(_, node)| {
                node.records
                    .iter()
                    .rev()
                    .find(|(_, record)| !record.is_zero())
                    .map(|(date, _)| *date)
            })
            .max()
    }

    /// Sums the selected fields per date over the subtree of `id`. When the
    /// range is active, leaves outside it are skipped; records held directly
    /// by inner nodes are always counted.
    pub fn raw_series(
        &self,
        id: EntityId,
        fields: SourceFields,
        range: &PopulationRange,
    ) -> (BTreeMap<DateKey, i64>, usize) {
        let mut series = BTreeMap::new();
        let mut scanned = 0usize;
        for member in self.walk(id) {
            let Some(node) = self.node(member) else {
                continue;
            };
            if node.records.is_empty() {
                continue;
            }
            if range.is_active() && node.is_leaf() && !range.contains(self.population(member).total())
            {
                continue;
            }
            for (date, record) in &node.records {
                scanned += 1;
                *series.entry(*date).or_insert(0) += record.select(fields);
            }
        }
        (series, scanned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (EntityTree, EntityId, EntityId) {
        let mut tree = EntityTree::new();
        let country = tree
            .add_or_create_child(tree.root(), "CZ", || "Czechia".to_string())
            .unwrap();
        let region = tree
            .add_or_create_child(country, "CZ010", || "Prague".to_string())
            .unwrap();
        (tree, country, region)
    }

    #[test]
    fn add_or_create_is_idempotent() {
        let (mut tree, country, region) = sample();
        let again = tree
            .add_or_create_child(country, "CZ010", || "ignored".to_string())
            .unwrap();
        assert_eq!(again, region);
        assert_eq!(tree.node(region).unwrap().name(), "Prague");
        assert_eq!(tree.node(region).unwrap().level(), EntityLevel::Region);
    }

    #[test]
    fn full_code_round_trips_through_lookup() {
        let (tree, _, region) = sample();
        assert_eq!(tree.full_code(region), "CZ.CZ010");
        assert_eq!(tree.get_entity("CZ.CZ010"), Some(region));
        assert_eq!(tree.get_entity("CZ.XX"), None);
        assert_eq!(tree.get_entity(""), Some(tree.root()));
    }

    #[test]
    fn structure_clear_recycles_slots() {
        let (mut tree, country, _) = sample();
        tree.clear(country, ClearMode::Structure).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.find_by_code(EntityLevel::Region, "CZ010"), None);
        let region = tree
            .add_or_create_child(country, "CZ020", || "Central".to_string())
            .unwrap();
        assert_eq!(tree.full_code(region), "CZ.CZ020");
    }

    #[test]
    fn population_is_summed_lazily() {
        let (mut tree, country, region) = sample();
        let other = tree
            .add_or_create_child(country, "CZ020", || "Central".to_string())
            .unwrap();
        tree.set_population(region, Population::new(10, 8, 12, 9))
            .unwrap();
        tree.set_population(other, Population::new(1, 1, 1, 1)).unwrap();
        assert_eq!(tree.population(country).total(), 24);
        tree.set_population(country, Population::new(5, 5, 5, 5))
            .unwrap();
        assert_eq!(tree.population(country).total(), 10);
    }
}
