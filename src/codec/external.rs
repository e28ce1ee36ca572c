use csv::ByteRecord;

use super::{Dialect, Loader, parse_count};
use crate::domain::{EntityLevel, Observation, Population};
use crate::error::EpiError;

struct CaseColumns {
    fields: usize,
    date: usize,
    settlement: usize,
    new_cases: usize,
    active_cases: usize,
}

fn case_columns(dialect: Dialect) -> CaseColumns {
    match dialect {
        Dialect::CasesV3 => CaseColumns {
            fields: 15,
            date: 2,
            settlement: 9,
            new_cases: 11,
            active_cases: 12,
        },
        Dialect::CasesV2 => CaseColumns {
            fields: 12,
            date: 1,
            settlement: 8,
            new_cases: 10,
            active_cases: 11,
        },
        _ => CaseColumns {
            fields: 14,
            date: 1,
            settlement: 8,
            new_cases: 10,
            active_cases: 11,
        },
    }
}

pub(super) fn apply_cases(loader: &mut Loader<'_>, record: &ByteRecord) -> Result<(), EpiError> {
    let columns = case_columns(loader.dialect);
    if record.len() != columns.fields {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let code = Loader::field(record, columns.settlement);
    let Some(id) = loader.tree.find_by_code(EntityLevel::Settlement, code) else {
        loader.stats.unknown("settlement codes", code);
        return Ok(());
    };
    let (Some(new_count), Some(current_count)) = (
        parse_count(Loader::field(record, columns.new_cases)),
        parse_count(Loader::field(record, columns.active_cases)),
    ) else {
        loader.stats.malformed += 1;
        return Ok(());
    };
    let Some(date) = loader.final_date(Loader::field(record, columns.date)) else {
        return Ok(());
    };
    loader.tree.add_observation(
        id,
        date,
        Observation {
            new_count,
            current_count,
            deaths: 0,
        },
    )?;
    loader.stats.records += 1;
    Ok(())
}

pub(super) fn apply_population(
    loader: &mut Loader<'_>,
    record: &ByteRecord,
) -> Result<(), EpiError> {
    if record.len() != 11 {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let code = Loader::field(record, 3);
    let mut counts = [0u64; 4];
    for (offset, slot) in counts.iter_mut().enumerate() {
        match parse_count(Loader::field(record, 5 + offset)).and_then(|v| u64::try_from(v).ok()) {
            Some(value) => *slot = value,
            None => {
                loader.stats.malformed += 1;
                return Ok(());
            }
        }
    }
    let Some(id) = loader.tree.find_by_code(EntityLevel::Settlement, code) else {
        loader.stats.unknown("settlement codes", code);
        return Ok(());
    };
    loader.tree.set_population(
        id,
        Population::new(counts[0], counts[1], counts[2], counts[3]),
    )?;
    loader.stats.records += 1;
    Ok(())
}

pub(super) fn apply_mortality(
    loader: &mut Loader<'_>,
    record: &ByteRecord,
) -> Result<(), EpiError> {
    if record.len() < 5 {
        loader.stats.malformed += 1;
        return Ok(());
    }
    let district = Loader::field(record, 4);
    let region = Loader::field(record, 3);
    let (level, code, what) = if district.is_empty() {
        (EntityLevel::Region, region, "region codes")
    } else {
        (EntityLevel::District, district, "district codes")
    };
    let Some(id) = loader.tree.find_by_code(level, code) else {
        loader.stats.unknown(what, code);
        return Ok(());
    };
    let Some(date) = loader.final_date(Loader::field(record, 0)) else {
        return Ok(());
    };
    loader.tree.add_observation(
        id,
        date,
        Observation {
            deaths: 1,
            ..Observation::default()
        },
    )?;
    loader.stats.records += 1;
    Ok(())
}
