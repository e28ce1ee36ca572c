mod external;
mod native;

use std::collections::BTreeMap;
use std::io::BufRead;

use csv::{ByteRecord, ReaderBuilder};

use crate::domain::{ContentKind, DateKey, EntityLevel};
use crate::error::EpiError;
use crate::tree::{EntityId, EntityTree};

pub use native::write_native;

pub const STRUCTURE_HEADER: &str = "H;Structure;EpiTrend;V1;";
pub const DATA_HEADER: &str = "H;Data;EpiTrend;V1;";
pub const PACK_HEADER: &str = "H;EpiTrend;V1;";
pub const CASES_V1_HEADER: &str = "day;date;region_code;region_name;district_code;district_name;subdistrict_code;subdistrict_name;settlement_code;settlement_name;new_cases;active_cases;new_cases_65;new_cases_7d";
pub const CASES_V2_HEADER: &str = "day,date,region_code,region_name,district_code,district_name,subdistrict_code,subdistrict_name,settlement_code,settlement_name,new_cases,active_cases";
pub const CASES_V3_HEADER: &str = "id,day,date,region_code,region_name,district_code,district_name,subdistrict_code,subdistrict_name,settlement_code,settlement_name,new_cases,active_cases,new_cases_65,new_cases_7d";
pub const POPULATION_HEADER: &str = ";region;city;code;name;male;male_15;female;female_15;total;total_15";
pub const MORTALITY_HEADER: &str = "date,age,sex,region_code,district_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Structure,
    Data,
    Pack,
    CasesV1,
    CasesV2,
    CasesV3,
    Population,
    Mortality,
}

impl Dialect {
    pub fn detect(first_line: &str) -> Result<Self, EpiError> {
        let line = first_line
            .trim_start_matches('\u{feff}')
            .trim_end_matches(['\r', '\n']);
        let exact = [
            (STRUCTURE_HEADER, Dialect::Structure),
            (DATA_HEADER, Dialect::Data),
            (PACK_HEADER, Dialect::Pack),
            (CASES_V1_HEADER, Dialect::CasesV1),
            (CASES_V2_HEADER, Dialect::CasesV2),
            (CASES_V3_HEADER, Dialect::CasesV3),
        ];
        if let Some((_, dialect)) = exact.iter().find(|(header, _)| *header == line) {
            return Ok(*dialect);
        }
        if line.starts_with(POPULATION_HEADER) {
            return Ok(Dialect::Population);
        }
        if line.starts_with(MORTALITY_HEADER) {
            return Ok(Dialect::Mortality);
        }
        let preview: String = line.chars().take(80).collect();
        Err(EpiError::UnknownFormat(preview))
    }

    pub fn delimiter(self) -> u8 {
        match self {
            Dialect::CasesV2 | Dialect::CasesV3 | Dialect::Mortality => b',',
            _ => b';',
        }
    }

    pub fn content_kind(self) -> ContentKind {
        match self {
            Dialect::Structure => ContentKind::Structure,
            Dialect::Data => ContentKind::Data,
            Dialect::Pack => ContentKind::Pack,
            Dialect::CasesV1 | Dialect::CasesV2 | Dialect::CasesV3 => ContentKind::Cases,
            Dialect::Population => ContentKind::Population,
            Dialect::Mortality => ContentKind::Mortality,
        }
    }

    fn is_native(self) -> bool {
        matches!(self, Dialect::Structure | Dialect::Data | Dialect::Pack)
    }
}

#[derive(Debug, Default)]
pub struct LoadContext {
    ancestors: [Option<EntityId>; 7],
    current: Option<EntityId>,
}

impl LoadContext {
    pub fn current(&self) -> Option<EntityId> {
        self.current
    }

    fn parent_for(&self, level: EntityLevel, root: EntityId) -> Option<EntityId> {
        match level.depth() {
            0 => None,
            1 => Some(root),
            depth => self.ancestors[depth - 1],
        }
    }

    fn enter(&mut self, level: EntityLevel, id: Option<EntityId>) {
        let depth = level.depth();
        self.ancestors[depth] = id;
        for slot in self.ancestors.iter_mut().skip(depth + 1) {
            *slot = None;
        }
        self.current = id;
    }
}

#[derive(Debug, Clone, Default)]
struct UnknownRef {
    count: usize,
    first: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    pub lines: usize,
    pub records: usize,
    pub entities: usize,
    pub malformed: usize,
    pub not_final: usize,
    unknown: BTreeMap<&'static str, UnknownRef>,
}

impl LoadStats {
    fn unknown(&mut self, what: &'static str, code: &str) {
        let entry = self.unknown.entry(what).or_default();
        if entry.count == 0 {
            entry.first = code.to_string();
        }
        entry.count += 1;
    }

    pub fn unknown_count(&self) -> usize {
        self.unknown.values().map(|entry| entry.count).sum()
    }

    pub fn warnings(&self, label: &str) -> Vec<String> {
        self.unknown
            .iter()
            .map(|(what, entry)| {
                format!(
                    "{label}: {} rows reference unknown {what} (first: {})",
                    entry.count, entry.first
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub dialect: Dialect,
    pub stats: LoadStats,
}

pub(crate) struct Loader<'a> {
    tree: &'a mut EntityTree,
    today: DateKey,
    dialect: Dialect,
    context: LoadContext,
    stats: LoadStats,
}

impl Loader<'_> {
    fn field<'r>(record: &'r ByteRecord, index: usize) -> &'r str {
        record
            .get(index)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .map(|value| value.trim().trim_matches('"'))
            .unwrap_or("")
    }

    fn final_date(&mut self, text: &str) -> Option<DateKey> {
        match DateKey::parse(text) {
            Ok(date) if date < self.today => Some(date),
            Ok(_) => {
                self.stats.not_final += 1;
                None
            }
            Err(_) => {
                self.stats.malformed += 1;
                None
            }
        }
    }
}

fn parse_count(text: &str) -> Option<i64> {
    if text.is_empty() {
        return Some(0);
    }
    let compact: String = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    compact.parse().ok()
}

pub fn load_stream(
    tree: &mut EntityTree,
    mut reader: Box<dyn BufRead + Send>,
    expected: Option<ContentKind>,
    today: DateKey,
    progress: &mut dyn FnMut(usize),
) -> Result<LoadSummary, EpiError> {
    let mut first_line = String::new();
    reader
        .read_line(&mut first_line)
        .map_err(|err| EpiError::InputRead {
            path: "stream".to_string(),
            message: err.to_string(),
        })?;
    let dialect = Dialect::detect(&first_line)?;
    if let Some(kind) = expected
        && kind != dialect.content_kind()
    {
        return Err(EpiError::UnknownFormat(format!(
            "expected {kind} content, found {} header",
            dialect.content_kind()
        )));
    }

    let mut csv_reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .quoting(!dialect.is_native())
        .delimiter(dialect.delimiter())
        .from_reader(reader);

    let mut loader = Loader {
        tree,
        today,
        dialect,
        context: LoadContext::default(),
        stats: LoadStats::default(),
    };

    let mut record = ByteRecord::new();
    loop {
        match csv_reader.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                if matches!(err.kind(), csv::ErrorKind::Io(_)) {
                    return Err(EpiError::InputRead {
                        path: "stream".to_string(),
                        message: err.to_string(),
                    });
                }
                loader.stats.malformed += 1;
                continue;
            }
        }
        loader.stats.lines += 1;
        if record.len() == 1 && record.get(0).is_some_and(|field| field.is_empty()) {
            continue;
        }
        match dialect {
            Dialect::Structure | Dialect::Data | Dialect::Pack => {
                native::apply_line(&mut loader, &record)?
            }
            Dialect::CasesV1 | Dialect::CasesV2 | Dialect::CasesV3 => {
                external::apply_cases(&mut loader, &record)?
            }
            Dialect::Population => external::apply_population(&mut loader, &record)?,
            Dialect::Mortality => external::apply_mortality(&mut loader, &record)?,
        }
        progress(loader.stats.records);
    }

    Ok(LoadSummary {
        dialect,
        stats: loader.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_known_headers() {
        assert_eq!(
            Dialect::detect("H;Structure;EpiTrend;V1;\r\n").unwrap(),
            Dialect::Structure
        );
        assert_eq!(Dialect::detect(PACK_HEADER).unwrap(), Dialect::Pack);
        assert_eq!(Dialect::detect(CASES_V3_HEADER).unwrap(), Dialect::CasesV3);
        assert_eq!(
            Dialect::detect("date,age,sex,region_code,district_code,extra").unwrap(),
            Dialect::Mortality
        );
        assert_eq!(
            Dialect::detect(&format!("\u{feff}{POPULATION_HEADER}")).unwrap(),
            Dialect::Population
        );
    }

    #[test]
    fn unknown_header_is_fatal() {
        let err = Dialect::detect("name,value").unwrap_err();
        assert!(err.is_fatal_format());
    }

    #[test]
    fn counts_accept_blank_and_spaced_numbers() {
        assert_eq!(parse_count(""), Some(0));
        assert_eq!(parse_count("1 234"), Some(1234));
        assert_eq!(parse_count("x"), None);
    }
}
