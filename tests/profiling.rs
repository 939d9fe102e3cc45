use std::sync::Arc;

use rust_tabular_api::profile::{BasicProfiler, Profiler};
use rust_tabular_api::service::TabularService;
use rust_tabular_api::types::Table;
use rust_tabular_api::{Error, Result};
use serde_json::json;
use tempfile::TempDir;

const VILLES: &[u8] = b"ville;population\nLyon;500\nLyon;300\nNantes;100\nLille;\n";

fn service(profiler: Option<Arc<dyn Profiler>>) -> (TempDir, TabularService) {
    rust_tabular_api::logging::init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let service = TabularService::open(dir.path())
        .unwrap()
        .with_profiler(profiler);
    (dir, service)
}

#[test]
fn describe_includes_persisted_profile() {
    let (_dir, service) = service(Some(Arc::new(BasicProfiler)));
    let dataset = service.upload(VILLES.to_vec()).unwrap();

    let description = service.describe(&dataset.identity).unwrap();
    assert_eq!(description.meta.row_count, 4);

    let general = &description.general_infos;
    assert_eq!(general["encoding"], json!("UTF-8"));
    assert_eq!(general["separator"], json!(";"));
    assert_eq!(general["header_row_idx"], json!(0));
    assert_eq!(general["total_lines"], json!(4));
    assert_eq!(general["nb_columns"], json!(2));
    assert_eq!(general["nb_cells_missing"], json!(1));
    assert_eq!(general["nb_vars_with_missing"], json!(1));
    assert_eq!(general["nb_vars_all_missing"], json!(0));
    assert!(general["date_last_check"].is_string());

    let ville = &description.columns_infos["ville"];
    assert_eq!(ville["format"], json!("text"));
    assert_eq!(ville["type"], json!("Categorical"));
    assert_eq!(ville["nb_distinct"], json!(3));
    assert_eq!(
        ville["categorical_infos"],
        json!([
            {"value": "Lyon", "count": 2},
            {"value": "Lille", "count": 1},
            {"value": "Nantes", "count": 1},
        ])
    );
    assert_eq!(ville["numeric_infos"], json!({}));

    let population = &description.columns_infos["population"];
    assert_eq!(population["format"], json!("number"));
    assert_eq!(population["type"], json!("Numeric"));
    assert_eq!(population["nb_missing"], json!(1));
    assert_eq!(population["count"], json!(3));
    assert_eq!(
        population["numeric_infos"],
        json!({"mean": 300.0, "std": 200.0, "min": 100.0, "max": 500.0})
    );
    assert_eq!(
        population["numeric_plot_infos"]["counts"],
        json!([1, 0, 0, 0, 0, 1, 0, 0, 0, 1])
    );
    assert_eq!(population["categorical_infos"], json!([]));
    assert_eq!(population["top_infos"].as_array().unwrap().len(), 3);
}

#[test]
fn describe_without_profile_has_empty_sections() {
    let (_dir, service) = service(None);
    let dataset = service.upload(VILLES.to_vec()).unwrap();

    let description = service.describe(&dataset.identity).unwrap();
    assert_eq!(description.meta.identity, dataset.identity);
    assert_eq!(description.meta.schema.len(), 2);
    assert!(description.general_infos.is_empty());
    assert!(description.columns_infos.is_empty());
}

struct BrokenProfiler;

impl Profiler for BrokenProfiler {
    fn profile(&self, _table: &Table) -> Result<serde_json::Value> {
        Ok(json!({ "table": { "n": 4 } }))
    }
}

struct FailingProfiler;

impl Profiler for FailingProfiler {
    fn profile(&self, _table: &Table) -> Result<serde_json::Value> {
        Err(Error::InvalidProfile {
            message: "profiler crashed".to_string(),
        })
    }
}

#[test]
fn profile_failures_do_not_fail_ingestion() {
    for profiler in [
        Arc::new(BrokenProfiler) as Arc<dyn Profiler>,
        Arc::new(FailingProfiler) as Arc<dyn Profiler>,
    ] {
        let (_dir, service) = service(Some(profiler));
        let dataset = service.upload(VILLES.to_vec()).unwrap();

        let description = service.describe(&dataset.identity).unwrap();
        assert!(description.general_infos.is_empty());
        assert_eq!(description.meta.row_count, 4);
    }
}
