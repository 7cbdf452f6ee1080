//! Resource-list parsing against a realistic document.

use chrono::{DateTime, TimeZone, Utc};
use harvester_manifest::*;

const FIXTURE: &str = include_str!("fixtures/resourcelist.xml");

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn parse_fixture(watermark: DateTime<Utc>) -> ResourceList {
    ResourceListParser::new("DST", watermark)
        .parse_bytes(FIXTURE.as_bytes())
        .expect("fixture should parse")
}

// ============================================================================
// Graph shape
// ============================================================================

#[test]
fn test_fixture_produces_all_entity_maps() {
    let list = parse_fixture(epoch());

    assert_eq!(list.projects.len(), 1);
    assert_eq!(list.experiments.len(), 1);
    assert_eq!(list.samples.len(), 2);
    assert_eq!(list.data_sets.len(), 2);
    assert_eq!(list.materials.len(), 1);
    assert_eq!(
        list.resource_list_timestamp,
        Some(Utc.with_ymd_and_hms(2016, 7, 1, 8, 0, 0).unwrap())
    );
}

#[test]
fn test_identifiers_are_rewritten_into_local_space() {
    let list = parse_fixture(epoch());

    let project = &list.projects["20160630100000000-1"];
    assert_eq!(project.entity.identifier, "/DST/P1");
    assert_eq!(project.entity.space, "DST");
    assert_eq!(project.entity.description.as_deref(), Some("Harvested project"));

    let experiment = &list.experiments["20160630100000000-2"];
    assert_eq!(experiment.entity.identifier, "/DST/P1/E1");
    assert_eq!(experiment.entity.project_identifier(), "/DST/P1");
    assert_eq!(experiment.entity.experiment_type, "SIRNA_HCS");

    let sample = &list.samples["20160630100000000-3"];
    assert_eq!(sample.entity.identifier, "/DST/S1");
    assert!(sample.entity.experiment_identifier.is_none());
    assert!(sample.entity.parent_identifiers.is_none());
}

#[test]
fn test_properties_are_unescaped() {
    let list = parse_fixture(epoch());

    let experiment = &list.experiments["20160630100000000-2"];
    assert_eq!(
        experiment.entity.properties.get("DESCRIPTION").map(String::as_str),
        Some("screen & follow-up")
    );

    let sample = &list.samples["20160630100000000-3"];
    assert_eq!(
        sample.entity.properties.get("COMMENT").map(String::as_str),
        Some("<raw> text")
    );

    let material = &list.materials[0];
    assert_eq!(material.material.identifier(), "GENE_1 (GENE)");
    assert_eq!(material.material.properties["SYMBOL"], "BRCA1");
}

#[test]
fn test_connections_keep_their_kind() {
    let list = parse_fixture(epoch());

    let experiment = &list.experiments["20160630100000000-2"];
    assert_eq!(experiment.connections.len(), 3);
    assert!(experiment
        .connections
        .iter()
        .all(|c| c.kind == ConnectionKind::Connection && c.from == "20160630100000000-2"));

    let s1 = &list.samples["20160630100000000-3"];
    assert_eq!(
        s1.connections,
        vec![Connection::new(
            "20160630100000000-3",
            "20160630100000000-4",
            ConnectionKind::Child
        )]
    );

    let container = &list.data_sets["20160630100000000-6"];
    assert!(container.entity.is_container());
    assert_eq!(container.connections[0].kind, ConnectionKind::Component);

    let physical = &list.data_sets["20160630100000000-5"];
    assert!(physical.entity.is_physical());
}

// ============================================================================
// Watermark handling
// ============================================================================

#[test]
fn test_entities_older_than_watermark_are_still_parsed() {
    let list = parse_fixture(ts("2016-06-30T10:10:00Z"));

    // S1 sits exactly on the watermark: kept, but not modified.
    let s1 = &list.samples["20160630100000000-3"];
    assert!(!s1.is_modified_since(list.watermark));
    let s2 = &list.samples["20160630100000000-4"];
    assert!(s2.is_modified_since(list.watermark));

    let summary = list.summary();
    assert_eq!(summary.samples.total, 2);
    assert_eq!(summary.samples.modified, 1);
    assert_eq!(summary.projects.modified, 0);
    assert_eq!(summary.data_sets.modified, 2);
    assert_eq!(summary.physical_data_sets, 1);
    assert_eq!(summary.container_data_sets, 1);
    assert_eq!(summary.connections, 7);
}

#[test]
fn test_physical_filter_honors_retry_and_black_list() {
    use std::collections::HashSet;

    let list = parse_fixture(ts("2016-07-01T00:00:00Z"));
    let none = HashSet::new();
    assert!(list.physical_data_sets_to_register(&none, &none).is_empty());

    let retry: HashSet<String> = ["20160630100000000-5".to_string()].into();
    let selected = list.physical_data_sets_to_register(&retry, &none);
    assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["20160630100000000-5"]);

    let selected = list.physical_data_sets_to_register(&retry, &retry);
    assert!(selected.is_empty(), "black-list wins over retry");
}

#[test]
fn test_attachment_holders_follow_watermark_and_retry() {
    use std::collections::HashSet;

    let list = parse_fixture(epoch());
    assert!(list.experiments["20160630100000000-2"].has_attachments);
    assert!(!list.projects["20160630100000000-1"].has_attachments);

    let holders = list.attachment_holders(&HashSet::new());
    let keys: Vec<String> = holders.iter().map(|h| h.key()).collect();
    assert_eq!(
        keys,
        vec![
            "PROJECT-20160630100000000-1",
            "EXPERIMENT-20160630100000000-2",
            "SAMPLE-20160630100000000-3",
            "SAMPLE-20160630100000000-4",
        ]
    );
    assert_eq!(holders[1].identifier, "/DST/P1/E1");

    let list = parse_fixture(ts("2016-07-01T00:00:00Z"));
    assert!(list.attachment_holders(&HashSet::new()).is_empty());
    let retry: HashSet<String> = ["EXPERIMENT-20160630100000000-2".to_string()].into();
    let holders = list.attachment_holders(&retry);
    assert_eq!(holders.len(), 1);
    assert!(holders[0].has_attachments);
}

// ============================================================================
// Malformed documents
// ============================================================================

fn parse(xml: &str) -> Result<ResourceList, ManifestError> {
    ResourceListParser::new("DST", epoch()).parse_bytes(xml.as_bytes())
}

#[test]
fn test_missing_lastmod_is_a_format_error() {
    let err = parse(
        r#"<urlset><url><loc>https://h/SAMPLE/1/M</loc>
           <x:xd kind="SAMPLE" code="S" type="T"/></url></urlset>"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ManifestError::MissingElement {
            index: 1,
            element: "lastmod"
        }
    ));
}

#[test]
fn test_unknown_kind_is_a_format_error() {
    let err = parse(
        r#"<urlset><url><loc>https://h/X/1/M</loc><lastmod>2016-06-30T10:00:00Z</lastmod>
           <x:xd kind="SPACESHIP" code="S"/></url></urlset>"#,
    )
    .unwrap_err();
    assert!(matches!(err, ManifestError::UnknownKind { ref kind, .. } if kind == "SPACESHIP"));
}

#[test]
fn test_unknown_connection_type_is_a_format_error() {
    let err = parse(
        r#"<urlset><url><loc>https://h/SAMPLE/1/M</loc><lastmod>2016-06-30T10:00:00Z</lastmod>
           <x:xd kind="SAMPLE" code="S" type="T"><x:connections>
           <x:connection to="2" type="Sibling"/></x:connections></x:xd></url></urlset>"#,
    )
    .unwrap_err();
    assert!(matches!(err, ManifestError::UnknownConnectionType { .. }));
}

#[test]
fn test_bad_timestamp_is_a_format_error() {
    let err = parse(
        r#"<urlset><url><loc>https://h/SAMPLE/1/M</loc><lastmod>yesterday</lastmod>
           <x:xd kind="SAMPLE" code="S" type="T"/></url></urlset>"#,
    )
    .unwrap_err();
    assert!(matches!(err, ManifestError::InvalidTimestamp { ref value, .. } if value == "yesterday"));
}

#[test]
fn test_duplicate_perm_id_is_a_format_error() {
    let url = r#"<url><loc>https://h/SAMPLE/1/M</loc><lastmod>2016-06-30T10:00:00Z</lastmod>
                 <x:xd kind="SAMPLE" code="S" type="T"/></url>"#;
    let err = parse(&format!("<urlset>{url}{url}</urlset>")).unwrap_err();
    assert!(matches!(
        err,
        ManifestError::DuplicatePermId {
            kind: EntityKind::Sample,
            ..
        }
    ));
}

#[test]
fn test_truncated_document_is_an_xml_error() {
    let err = parse(r#"<urlset><url><loc>https://h/SAMPLE/1/M</loc>"#).unwrap_err();
    assert!(matches!(err, ManifestError::Xml { .. }));
}

#[test]
fn test_summary_serializes() {
    let list = parse_fixture(epoch());
    let json = serde_json::to_value(list.summary()).unwrap();
    assert_eq!(json["local_space"], "DST");
    assert_eq!(json["materials"]["total"], 1);
}
