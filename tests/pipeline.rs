use std::collections::BTreeMap;

use proptest::prelude::*;

use epitrend::domain::DateKey;
use epitrend::pipeline::{
    DateWindow, Pipeline, PipelineContext, Stage, ValueFlags, ValueKind, relative_to,
};

fn day(index: i64) -> DateKey {
    DateKey::from_day_index(index).unwrap()
}

fn context(population: u64, today: i64, trusted: i64) -> PipelineContext {
    PipelineContext {
        population,
        today: day(today),
        last_trusted: Some(day(trusted)),
        window: DateWindow::default(),
    }
}

#[test]
fn presets_parse_from_kebab_case() {
    use clap::ValueEnum;
    let kind = ValueKind::from_str("new-cases-per100k", true).unwrap();
    assert_eq!(kind, ValueKind::NewCasesPer100k);
    assert_eq!(kind.to_string(), "new-cases-per100k");
}

#[test]
fn window_is_half_open() {
    let raw: BTreeMap<DateKey, i64> = (0..10).map(|i| (day(i), i)).collect();
    let context = PipelineContext {
        window: DateWindow::new(Some(day(2)), Some(day(5))),
        ..context(1000, 30, 9)
    };
    let series = ValueKind::NewCases.pipeline().run(&raw, &context);
    let dates: Vec<DateKey> = series.records.keys().copied().collect();
    assert_eq!(dates, vec![day(2), day(3), day(4)]);
    assert_eq!(series.loaded, 10);
    assert_eq!(series.shown, 3);
}

#[test]
fn missing_population_empties_normalized_series() {
    let raw = BTreeMap::from([(day(0), 10)]);
    let series = ValueKind::NewCasesPer100k
        .pipeline()
        .run(&raw, &context(0, 5, 0));
    assert!(series.records.is_empty());
}

#[test]
fn growth_carries_last_ratio_over_gaps() {
    let mut raw: BTreeMap<DateKey, i64> = (0..12).map(|i| (day(i), 10)).collect();
    raw.insert(day(14), 5);
    raw.insert(day(20), 7);
    let pipeline = Pipeline::from_flags(ValueFlags::NEW | ValueFlags::GROWTH_5);
    let series = pipeline.run(&raw, &context(1000, 40, 25));
    assert_eq!(series.records[&day(11)].value, 1.0);
    assert_eq!(series.records[&day(14)].value, 0.5);
    assert_eq!(series.records[&day(20)].value, 0.5);
    assert!(!series.records.contains_key(&day(4)));
    assert!(!series.records.contains_key(&day(17)));
}

#[test]
fn missing_days_stay_missing_outside_trailing_sum() {
    let raw = BTreeMap::from([(day(0), 4), (day(3), 8)]);
    let plain = ValueKind::NewCases.pipeline().run(&raw, &context(1000, 30, 3));
    assert_eq!(plain.values().collect::<Vec<_>>(), vec![(day(0), 4.0), (day(3), 8.0)]);

    let averaged = Pipeline::from_flags(ValueFlags::NEW | ValueFlags::AVERAGE_7)
        .run(&raw, &context(1000, 30, 3));
    assert_eq!(averaged.records[&day(3)].value, 6.0);

    let summed = Pipeline::from_flags(ValueFlags::NEW | ValueFlags::SUM_7)
        .run(&raw, &context(1000, 30, 3));
    let totals: Vec<f64> = summed.values().map(|(_, value)| value).collect();
    assert_eq!(totals, vec![4.0, 4.0, 4.0, 12.0]);
}

#[test]
fn rounding_prefers_coarsest_precision() {
    let raw = BTreeMap::from([(day(0), 1), (day(1), 2)]);
    let pipeline = Pipeline::from_flags(
        ValueFlags::NEW | ValueFlags::PER_100K | ValueFlags::ROUND_1 | ValueFlags::ROUND_2,
    );
    let series = pipeline.run(&raw, &context(3, 5, 1));
    assert_eq!(series.records[&day(0)].value, 33333.3);
}

proptest! {
    #[test]
    fn stages_follow_fixed_order(bits in 0u32..0x8000) {
        let pipeline = Pipeline::from_flags(ValueFlags::from_bits(bits));
        let ranks: Vec<u8> = pipeline.stages().iter().map(Stage::rank).collect();
        prop_assert_eq!(ranks[0], 0);
        prop_assert!(ranks.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn per_100k_matches_formula(value in 0u32..1_000_000, population in 1u64..10_000_000) {
        let expected = f64::from(value) * 100_000.0 / population as f64;
        prop_assert_eq!(relative_to(f64::from(value), 100_000, population), expected);
    }

    #[test]
    fn constant_series_grows_by_one(value in 1i64..10_000, length in 30i64..90) {
        let raw: BTreeMap<DateKey, i64> = (0..length).map(|i| (day(i), value)).collect();
        let series = ValueKind::Growth5.pipeline().run(&raw, &context(1000, length + 5, length - 1));
        prop_assert!(series.shown > 0);
        for (_, ratio) in series.values() {
            prop_assert_eq!(ratio, 1.0);
        }
    }

    #[test]
    fn trailing_sum_of_single_observation(value in 1i64..100_000, start in 0i64..300) {
        let raw = BTreeMap::from([(day(start), value)]);
        let pipeline = Pipeline::from_flags(ValueFlags::NEW | ValueFlags::SUM_7);
        let series = pipeline.run(&raw, &context(1000, start + 40, start + 20));
        for offset in 0..=20 {
            let expected = if offset < 7 { value as f64 } else { 0.0 };
            prop_assert_eq!(series.records[&day(start + offset)].value, expected);
        }
    }
}
