use std::io::{BufRead, Cursor, Write};

use assert_matches::assert_matches;

use epitrend::codec::{self, Dialect};
use epitrend::domain::{ContentKind, DateKey, EntityLevel, Observation, Population, SaveFormat};
use epitrend::error::EpiError;
use epitrend::stream::{self, StreamWriter};
use epitrend::tree::EntityTree;

const STRUCTURE: &str = "H;Structure;EpiTrend;V1;
W;;World
Z;CZ;Czechia
K;CZ010;Prague
O;CZ0100;Praha
M;CZ01001;Praha A
B;CZ010011;Praha A1
V;554782;Praha 1;500;400;500;400
V;554783;Praha 2;300;250;320;260
";

const DATA: &str = "H;Data;EpiTrend;V1;
W;
Z;CZ
K;CZ010
O;CZ0100
I;3;0;0;2
M;CZ01001
B;CZ010011
V;554782
I;0;10;5
I;1;4;9
V;554783
I;1;2;2
";

fn today() -> DateKey {
    DateKey::from_ymd(2019, 3, 1).unwrap()
}

fn reader(text: &str) -> Box<dyn BufRead + Send> {
    Box::new(Cursor::new(text.as_bytes().to_vec()))
}

fn load(tree: &mut EntityTree, text: &str) -> Result<codec::LoadSummary, EpiError> {
    codec::load_stream(tree, reader(text), None, today(), &mut |_| {})
}

type Snapshot = Vec<(String, String, EntityLevel, Option<Population>, Vec<(DateKey, Observation)>)>;

fn snapshot(tree: &EntityTree) -> Snapshot {
    tree.walk(tree.root())
        .into_iter()
        .filter_map(|id| {
            let node = tree.node(id)?;
            Some((
                tree.full_code(id),
                node.name().to_string(),
                node.level(),
                node.direct_population(),
                node.records().iter().map(|(d, o)| (*d, *o)).collect(),
            ))
        })
        .collect()
}

fn sample_tree() -> EntityTree {
    let mut tree = EntityTree::new();
    load(&mut tree, STRUCTURE).unwrap();
    load(&mut tree, DATA).unwrap();
    tree
}

#[test]
fn structure_then_data_builds_tree() {
    let tree = sample_tree();
    assert_eq!(tree.len(), 8);
    let settlement = tree
        .get_entity("CZ.CZ010.CZ0100.CZ01001.CZ010011.554782")
        .unwrap();
    let node = tree.node(settlement).unwrap();
    assert_eq!(node.name(), "Praha 1");
    assert_eq!(tree.population(settlement).total(), 1000);
    assert_eq!(node.records().len(), 2);

    let district = tree.find_by_code(EntityLevel::District, "CZ0100").unwrap();
    let day3 = DateKey::from_day_index(3).unwrap();
    assert_eq!(tree.node(district).unwrap().records()[&day3].deaths, 2);
    assert_eq!(tree.population(district).total(), 1620);
}

#[test]
fn pack_round_trip_preserves_tree() {
    let tree = sample_tree();
    let mut writer = StreamWriter::new(Vec::new(), true);
    codec::write_native(&tree, SaveFormat::Pack, today(), &mut writer).unwrap();
    let bytes = writer.finish().unwrap();

    let opened = stream::open_bytes(bytes, "snapshot").unwrap();
    let mut restored = EntityTree::new();
    let summary = codec::load_stream(
        &mut restored,
        opened.reader,
        Some(ContentKind::Pack),
        today(),
        &mut |_| {},
    )
    .unwrap();
    assert_eq!(summary.dialect, Dialect::Pack);
    assert_eq!(snapshot(&restored), snapshot(&tree));
    assert_eq!(
        restored.content_info().last_content_date,
        DateKey::from_day_index(3)
    );
}

#[test]
fn structure_and_data_round_trip_separately() {
    let tree = sample_tree();
    let mut structure = Vec::new();
    codec::write_native(&tree, SaveFormat::Structure, today(), &mut structure).unwrap();
    let mut data = Vec::new();
    codec::write_native(&tree, SaveFormat::Data, today(), &mut data).unwrap();

    let mut restored = EntityTree::new();
    load(&mut restored, &String::from_utf8(structure).unwrap()).unwrap();
    assert_eq!(restored.record_count(), 0);
    load(&mut restored, &String::from_utf8(data).unwrap()).unwrap();
    assert_eq!(snapshot(&restored), snapshot(&tree));
}

#[test]
fn unknown_header_is_fatal() {
    let mut tree = EntityTree::new();
    let err = load(&mut tree, "name,value\n1,2\n").unwrap_err();
    assert_matches!(err, EpiError::UnknownFormat(_));
    assert!(err.is_fatal_format());
}

#[test]
fn expected_kind_mismatch_is_rejected() {
    let mut tree = EntityTree::new();
    let err = codec::load_stream(
        &mut tree,
        reader(STRUCTURE),
        Some(ContentKind::Data),
        today(),
        &mut |_| {},
    )
    .unwrap_err();
    assert_matches!(err, EpiError::UnknownFormat(_));
}

#[test]
fn external_cases_need_known_settlements() {
    let mut tree = EntityTree::new();
    load(&mut tree, STRUCTURE).unwrap();
    let cases = format!(
        "{}\n\
         Tue,2019-01-02,CZ010,Prague,CZ0100,Praha,CZ01001,Praha A,554782,Praha 1,7,12\n\
         Tue,2019-01-02,CZ010,Prague,CZ0100,Praha,CZ01001,Praha A,999999,Nowhere,1,1\n\
         Wed,2019-01-03,CZ010,Prague,CZ0100,Praha,CZ01001,Praha A,888888,Nowhere,1,1\n\
         Fri,2019-03-01,CZ010,Prague,CZ0100,Praha,CZ01001,Praha A,554782,Praha 1,3,3\n\
         short,row\n",
        codec::CASES_V2_HEADER
    );
    let summary = load(&mut tree, &cases).unwrap();
    assert_eq!(summary.dialect, Dialect::CasesV2);
    assert_eq!(summary.stats.records, 1);
    assert_eq!(summary.stats.not_final, 1);
    assert_eq!(summary.stats.malformed, 1);
    assert_eq!(summary.stats.unknown_count(), 2);
    assert_eq!(
        summary.stats.warnings("cases.csv"),
        vec!["cases.csv: 2 rows reference unknown settlement codes (first: 999999)".to_string()]
    );
}

#[test]
fn population_table_sets_settlement_population() {
    let mut tree = EntityTree::new();
    load(&mut tree, STRUCTURE).unwrap();
    let table = format!(
        "{}\n;CZ010;Praha;554782;Praha 1;600;500;700;600;1300;1100\n",
        codec::POPULATION_HEADER
    );
    let summary = load(&mut tree, &table).unwrap();
    assert_eq!(summary.dialect, Dialect::Population);
    let settlement = tree.find_by_code(EntityLevel::Settlement, "554782").unwrap();
    assert_eq!(tree.population(settlement).total(), 1300);
}

#[test]
fn mortality_rows_land_on_districts() {
    let mut tree = EntityTree::new();
    load(&mut tree, STRUCTURE).unwrap();
    let table = "date,age,sex,region_code,district_code\n\
                 2019-01-05,81,M,CZ010,CZ0100\n\
                 2019-01-05,77,Z,CZ010,CZ0100\n\
                 2019-01-06,90,M,CZ010,\n";
    let summary = load(&mut tree, table).unwrap();
    assert_eq!(summary.dialect, Dialect::Mortality);
    assert_eq!(summary.stats.records, 3);

    let district = tree.find_by_code(EntityLevel::District, "CZ0100").unwrap();
    let day = DateKey::from_ymd(2019, 1, 5).unwrap();
    assert_eq!(tree.node(district).unwrap().records()[&day].deaths, 2);
    let region = tree.find_by_code(EntityLevel::Region, "CZ010").unwrap();
    assert_eq!(tree.node(region).unwrap().records().len(), 1);
}

#[test]
fn mortality_warnings_name_the_level_looked_up() {
    let mut tree = EntityTree::new();
    load(&mut tree, STRUCTURE).unwrap();
    let table = "date,age,sex,region_code,district_code\n\
                 2019-01-05,81,M,CZ099,\n\
                 2019-01-05,77,Z,CZ010,CZ0999\n";
    let summary = load(&mut tree, table).unwrap();
    assert_eq!(summary.stats.records, 0);
    assert_eq!(
        summary.stats.warnings("deaths.csv"),
        vec![
            "deaths.csv: 1 rows reference unknown district codes (first: CZ0999)".to_string(),
            "deaths.csv: 1 rows reference unknown region codes (first: CZ099)".to_string(),
        ]
    );
}

#[test]
fn gzip_file_is_detected_by_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("structure.bin");
    let mut writer = StreamWriter::new(Vec::new(), true);
    writer.write_all(STRUCTURE.as_bytes()).unwrap();
    std::fs::write(&path, writer.finish().unwrap()).unwrap();

    let opened = stream::open_file(&path).unwrap();
    let mut tree = EntityTree::new();
    codec::load_stream(&mut tree, opened.reader, None, today(), &mut |_| {}).unwrap();
    assert_eq!(tree.len(), 8);
}
