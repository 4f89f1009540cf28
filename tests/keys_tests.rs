//! Sidecar key-file parsing tests.

use std::io::Write;

use pg_unveil::keys::load_key_file;

fn write_sidecar(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write sidecar");
    file
}

const TPCH_SUBSET: &str = "\
child_table,child_column,is_pk,seq,parent_table,parent_column
customer,c_custkey,Y,1,,
orders,o_orderkey,Y,1,,
orders,o_custkey,N,2,customer,c_custkey
lineitem,l_orderkey,Y,1,orders,o_orderkey
lineitem,l_linenumber,Y,2,,
partsupp,ps_partkey,Y,1,part,p_partkey
partsupp,ps_suppkey,Y,2,supplier,s_suppkey
";

fn relations() -> Vec<String> {
    ["customer", "orders", "lineitem", "partsupp", "part", "supplier"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[test]
fn test_primary_keys_collected_in_order() {
    let file = write_sidecar(TPCH_SUBSET);
    let sidecar = load_key_file(file.path(), &relations()).unwrap();

    assert_eq!(sidecar.primary_keys["customer"], vec!["c_custkey"]);
    assert_eq!(
        sidecar.primary_keys["lineitem"],
        vec!["l_orderkey", "l_linenumber"]
    );
    assert_eq!(
        sidecar.primary_keys["partsupp"],
        vec!["ps_partkey", "ps_suppkey"]
    );
}

#[test]
fn test_cliques_from_fk_edges() {
    let file = write_sidecar(TPCH_SUBSET);
    let sidecar = load_key_file(file.path(), &relations()).unwrap();

    // custkey edge, orderkey edge, and the two partsupp edges.
    assert_eq!(sidecar.cliques.len(), 4);
    assert!(sidecar.cliques.iter().any(|c| {
        c.contains(&("customer".into(), "c_custkey".into()))
            && c.contains(&("orders".into(), "o_custkey".into()))
    }));
    assert!(sidecar.cliques.iter().any(|c| {
        c.contains(&("lineitem".into(), "l_orderkey".into()))
            && c.contains(&("orders".into(), "o_orderkey".into()))
    }));
}

#[test]
fn test_every_clique_has_at_least_two_members() {
    let file = write_sidecar(TPCH_SUBSET);
    let sidecar = load_key_file(file.path(), &relations()).unwrap();
    assert!(sidecar.cliques.iter().all(|c| c.len() >= 2));
}

#[test]
fn test_unknown_relations_filtered() {
    let file = write_sidecar(TPCH_SUBSET);
    // Without part/supplier in the database, those clique sides vanish.
    let known: Vec<String> = ["customer", "orders", "lineitem", "partsupp"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let sidecar = load_key_file(file.path(), &known).unwrap();

    assert_eq!(sidecar.cliques.len(), 2);
    for clique in &sidecar.cliques {
        for (table, _) in clique {
            assert!(known.contains(table));
        }
    }
}

#[test]
fn test_transitive_chain_closes_into_one_clique() {
    let file = write_sidecar(
        "\
child_table,child_column,is_pk,seq,parent_table,parent_column
b,b_key,N,1,a,a_key
c,c_key,N,1,b,b_key
",
    );
    let rels: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let sidecar = load_key_file(file.path(), &rels).unwrap();

    assert_eq!(sidecar.cliques.len(), 1);
    assert_eq!(sidecar.cliques[0].len(), 3);
}

#[test]
fn test_missing_file_is_a_config_error() {
    let err = load_key_file(std::path::Path::new("/nonexistent/pkfk.csv"), &relations())
        .unwrap_err();
    assert_eq!(err.kind(), pg_unveil::UnveilErrorKind::Config);
}
