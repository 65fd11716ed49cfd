mod common;

use common::*;
use efaps::select::leaf_classifications;
use efaps::value::Value;

#[test]
fn only_the_deepest_assigned_classification_is_printed() {
    let s = seeded();
    classify(s.db, s.alice, &["Sector", "Retail", "Online"]);
    let rows = print(
        s.db,
        &format!("print obj {} select classification.name as name, classification.label as label", s.alice),
    );
    assert_eq!(rows[0].get("name"), Some(&text("Online")));
    assert_eq!(rows[0].get("label"), Some(&text("Online shop")));
}

#[test]
fn unrelated_branches_are_all_kept() {
    let s = seeded();
    classify(s.db, s.bob, &["Online", "Wholesale"]);
    let rows = print(s.db, &format!("print obj {} select classification.name as name", s.bob));
    assert_eq!(rows[0].get("name"), Some(&Value::List(vec![text("Online"), text("Wholesale")])));
}

#[test]
fn unclassified_instances_print_null() {
    let s = seeded();
    classify(s.db, s.alice, &["Retail"]);
    let rows = print(
        s.db,
        &format!(
            "print list ({}, {}, {}) select classification.name as name",
            s.alice, s.bob, s.carol
        ),
    );
    assert_eq!(column(&rows, "name"), vec![text("Retail"), Value::Null, Value::Null]);
}

#[test]
fn ancestors_are_nearest_first() {
    let db = database();
    let cache = db.cache().unwrap();
    let id = |name: &str| cache.classifications().find_by_name(name).unwrap().id();
    assert_eq!(
        cache.classification_ancestors(id("Online")).unwrap(),
        vec![id("Retail"), id("Sector")]
    );
    assert!(cache.classification_ancestors(id("Sector")).unwrap().is_empty());

    let leaves = leaf_classifications(cache, &[id("Sector"), id("Retail")]).unwrap();
    let names: Vec<&str> = leaves.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["Retail"]);

    let tree = cache.classification_tree(id("Retail")).unwrap();
    let names: Vec<&str> = tree.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["Retail", "Online"]);
}

#[test]
fn child_classifications_share_the_root_relation() {
    let db = database();
    let cache = db.cache().unwrap();
    let online = cache.classifications().find_by_name("Online").unwrap();
    let sector = cache.classifications().find_by_name("Sector").unwrap();
    assert_eq!(online.relation(), sector.relation());
    assert_eq!(online.relation().sql_name, "T_CLASSREL");
}

#[test]
fn a_skipped_level_still_prints_only_the_leaf() {
    let s = seeded();
    classify(s.db, s.alice, &["Sector", "Online"]);
    let rows = print(s.db, &format!("print obj {} select classification.name as name", s.alice));
    assert_eq!(rows[0].get("name"), Some(&text("Online")));

    let cache = s.db.cache().unwrap();
    let id = |name: &str| cache.classifications().find_by_name(name).unwrap().id();
    let leaves = leaf_classifications(cache, &[id("Sector"), id("Online")]).unwrap();
    let names: Vec<&str> = leaves.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["Online"]);
}
