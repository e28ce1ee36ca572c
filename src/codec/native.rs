use std::collections::HashSet;
use std::io::Write;

use csv::ByteRecord;

use super::{DATA_HEADER, Dialect, Loader, PACK_HEADER, STRUCTURE_HEADER, parse_count};
use crate::domain::{DateKey, EntityLevel, Observation, Population, SaveFormat};
use crate::error::EpiError;
use crate::tree::{ContentInfo, EntityId, EntityTree};

pub(super) fn apply_line(loader: &mut Loader<'_>, record: &ByteRecord) -> Result<(), EpiError> {
    let tag = Loader::field(record, 0);
    match tag {
        "I" => apply_observation(loader, record),
        "P" => apply_population(loader, record),
        "C" => apply_content_info(loader, record),
        "H" => Ok(()),
        _ => match EntityLevel::from_tag(tag) {
            Some(level) => apply_entity(loader, level, record),
            None => {
                loader.stats.malformed += 1;
                Ok(())
            }
        },
    }
}

fn parse_population(record: &ByteRecord, from: usize) -> Option<Population> {
    let mut values = [0u64; 4];
    for (offset, slot) in values.iter_mut().enumerate() {
        let count = parse_count(Loader::field(record, from + offset))?;
        *slot = u64::try_from(count).ok()?;
    }
    Some(Population::new(values[0], values[1], values[2], values[3]))
}

fn apply_entity(
    loader: &mut Loader<'_>,
    level: EntityLevel,
    record: &ByteRecord,
) -> Result<(), EpiError> {
    if !matches!(record.len(), 2 | 3 | 7) {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let code = Loader::field(record, 1).to_string();
    let name = Loader::field(record, 2).to_string();
    let population = if record.len() == 7 {
        match parse_population(record, 3) {
            Some(population) => Some(population),
            None => {
                loader.stats.malformed += 1;
                return Ok(());
            }
        }
    } else {
        None
    };

    let root = loader.tree.root();
    if level == EntityLevel::World {
        loader.tree.set_code(root, &code)?;
        if !name.is_empty() {
            loader.tree.set_name(root, &name)?;
        }
        if let Some(population) = population {
            loader.tree.set_population(root, population)?;
        }
        loader.context.enter(level, Some(root));
        return Ok(());
    }

    let Some(parent) = loader.context.parent_for(level, root) else {
        loader.stats.unknown("parent entities", &code);
        loader.context.enter(level, None);
        return Ok(());
    };

    let id = if loader.dialect == Dialect::Data {
        let found = loader.tree.node(parent).and_then(|node| node.child(&code));
        if found.is_none() {
            loader.stats.unknown("entity codes", &code);
        }
        found
    } else {
        let fallback = name.clone();
        let id = loader
            .tree
            .add_or_create_child(parent, &code, move || fallback)?;
        if !name.is_empty() {
            loader.tree.set_name(id, &name)?;
        }
        if let Some(population) = population {
            loader.tree.set_population(id, population)?;
        }
        loader.stats.entities += 1;
        Some(id)
    };
    loader.context.enter(level, id);
    Ok(())
}

fn apply_population(loader: &mut Loader<'_>, record: &ByteRecord) -> Result<(), EpiError> {
    if record.len() != 7 {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let code = Loader::field(record, 1);
    let Some(population) = parse_population(record, 3) else {
        loader.stats.malformed += 1;
        return Ok(());
    };
    let current = loader
        .context
        .current()
        .filter(|id| loader.tree.node(*id).is_some_and(|node| node.code() == code));
    match current.or_else(|| loader.tree.find_by_code(EntityLevel::Settlement, code)) {
        Some(id) => loader.tree.set_population(id, population),
        None => {
            loader.stats.unknown("settlement codes", code);
            Ok(())
        }
    }
}

fn apply_observation(loader: &mut Loader<'_>, record: &ByteRecord) -> Result<(), EpiError> {
    if !matches!(record.len(), 4 | 5) {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let Some(id) = loader.context.current() else {
        loader.stats.unknown("entities for observations", Loader::field(record, 1));
        return Ok(());
    };
    let counts = (
        parse_count(Loader::field(record, 2)),
        parse_count(Loader::field(record, 3)),
        parse_count(Loader::field(record, 4)),
    );
    let (Some(new_count), Some(current_count), Some(deaths)) = counts else {
        loader.stats.malformed += 1;
        return Ok(());
    };
    let Some(date) = loader.final_date(Loader::field(record, 1)) else {
        return Ok(());
    };
    loader.tree.add_observation(
        id,
        date,
        Observation {
            new_count,
            current_count,
            deaths,
        },
    )?;
    loader.stats.records += 1;
    Ok(())
}

fn apply_content_info(loader: &mut Loader<'_>, record: &ByteRecord) -> Result<(), EpiError> {
    if record.len() != 3 {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let saved_on = DateKey::parse(Loader::field(record, 1)).ok();
    let last_content_date = DateKey::parse(Loader::field(record, 2)).ok();
    loader.tree.set_content_info(ContentInfo {
        saved_on,
        last_content_date,
    });
    Ok(())
}

fn sanitize(text: &str) -> String {
    text.replace([';', '\n', '\r'], ",")
}

fn entity_line(tree: &EntityTree, id: EntityId, with_details: bool) -> Option<String> {
    let node = tree.node(id)?;
    let mut line = format!("{};{}", node.level().tag(), sanitize(node.code()));
    if with_details {
        line.push(';');
        line.push_str(&sanitize(node.name()));
        if let Some(population) = node.direct_population() {
            line.push_str(&format!(
                ";{};{};{};{}",
                population.male(),
                population.male_adult(),
                population.female(),
                population.female_adult()
            ));
        }
    }
    Some(line)
}

fn observation_lines(tree: &EntityTree, id: EntityId) -> Vec<String> {
    let Some(node) = tree.node(id) else {
        return Vec::new();
    };
    node.records()
        .iter()
        .filter(|(_, record)| !record.is_zero())
        .map(|(date, record)| {
            let day = match date.day_index() {
                index if index >= 0 => index.to_string(),
                _ => date.key().to_string(),
            };
            let mut line = format!("I;{day};{};{}", record.new_count, record.current_count);
            if record.deaths != 0 {
                line.push_str(&format!(";{}", record.deaths));
            }
            line
        })
        .collect()
}

fn nodes_with_data(tree: &EntityTree) -> HashSet<EntityId> {
    let mut marked = HashSet::new();
    for id in tree.walk(tree.root()) {
        let has_data = tree
            .node(id)
            .is_some_and(|node| node.records().values().any(|record| !record.is_zero()));
        if !has_data {
            continue;
        }
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !marked.insert(current) {
                break;
            }
            cursor = tree.node(current).and_then(|node| node.parent());
        }
    }
    marked
}

pub fn write_native<W: Write>(
    tree: &EntityTree,
    format: SaveFormat,
    today: DateKey,
    out: &mut W,
) -> Result<usize, EpiError> {
    let io_err = |err: std::io::Error| EpiError::Filesystem(err.to_string());
    let header = match format {
        SaveFormat::Structure => STRUCTURE_HEADER,
        SaveFormat::Data => DATA_HEADER,
        SaveFormat::Pack => PACK_HEADER,
    };
    let mut lines = vec![header.to_string()];

    if format != SaveFormat::Structure {
        let last = tree
            .newest_trusted_date()
            .or(tree.content_info().last_content_date)
            .map(|date| date.to_string())
            .unwrap_or_default();
        lines.push(format!("C;{today};{last}"));
    }

    let with_data = nodes_with_data(tree);
    for id in tree.walk(tree.root()) {
        let include = match format {
            SaveFormat::Data => with_data.contains(&id),
            SaveFormat::Structure | SaveFormat::Pack => true,
        };
        if !include {
            continue;
        }
        if let Some(line) = entity_line(tree, id, format != SaveFormat::Data) {
            lines.push(line);
        }
        if format != SaveFormat::Structure {
            lines.extend(observation_lines(tree, id));
        }
    }

    for line in &lines {
        out.write_all(line.as_bytes()).map_err(io_err)?;
        out.write_all(b"\n").map_err(io_err)?;
    }
    out.flush().map_err(io_err)?;
    Ok(lines.len())
}
