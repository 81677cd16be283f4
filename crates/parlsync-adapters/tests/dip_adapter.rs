use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parlsync_adapters::{
    AdapterError, CountProbe, DipAdapter, DrucksacheMapper, FetchOptions, RecordMapper,
    SourceAdapter,
};
use parlsync_core::{Drucksache, FetchParameter, RecordKind};
use parlsync_transport::{Auth, RetrySchedule, TransportClient, TransportConfig};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn drucksache(id: u32, typ: &str) -> Value {
    json!({
        "id": id.to_string(),
        "drucksachetyp": typ,
        "dokumentnummer": format!("20/{id}"),
        "datum": "2023-01-10",
        "aktualisiert": "2023-01-11T08:00:00+01:00",
        "titel": format!("Drucksache {id}"),
        "wahlperiode": 20
    })
}

fn transport(server: &MockServer) -> Arc<TransportClient> {
    Arc::new(TransportClient::new(
        TransportConfig::new(server.uri())
            .with_auth(Auth::ApiKey("test-key".into()))
            .with_retry(RetrySchedule::from_secs(&[0, 0, 0])),
    ))
}

async fn mount_three_pages(server: &MockServer, second_page: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/api/v1/drucksache"))
        .and(header("Authorization", "ApiKey test-key"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "numFound": 3,
            "cursor": "c1",
            "documents": [drucksache(1, "Antrag"), drucksache(2, "Antrag")]
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drucksache"))
        .and(query_param("cursor", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "numFound": 3,
            "cursor": "c2",
            "documents": second_page
        })))
        .expect(1)
        .mount(server)
        .await;
    // Exhausted result sets echo the last cursor with the last page again.
    Mock::given(method("GET"))
        .and(path("/api/v1/drucksache"))
        .and(query_param("cursor", "c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "numFound": 3,
            "cursor": "c2",
            "documents": second_page
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn cursor_pagination_yields_each_document_once() {
    let server = MockServer::start().await;
    mount_three_pages(&server, vec![drucksache(3, "Beschluss")]).await;

    let adapter = DipAdapter::<Drucksache>::new(transport(&server));
    let items = adapter
        .stream(&FetchParameter::default(), &FetchOptions::default())
        .collect()
        .await
        .expect("stream drains");

    let ids: Vec<_> = items.iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(items[2].drucksachetyp, "Beschluss");
}

#[tokio::test]
async fn invalid_documents_are_skipped_by_default() {
    let server = MockServer::start().await;
    mount_three_pages(&server, vec![json!({"id": "99", "titel": "no type"}), drucksache(3, "Antrag")]).await;

    let adapter = DipAdapter::<Drucksache>::new(transport(&server));
    let mut stream = adapter.stream(&FetchParameter::default(), &FetchOptions::default());
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await.expect("lenient stream") {
        ids.push(item.id);
    }
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(stream.skipped(), 1);
}

#[tokio::test]
async fn strict_mode_raises_with_cursor_position() {
    let server = MockServer::start().await;
    mount_three_pages(&server, vec![json!({"id": "99", "titel": "no type"})]).await;

    let adapter = DipAdapter::<Drucksache>::new(transport(&server));
    let options = FetchOptions {
        raise_on_error: true,
        ..Default::default()
    };
    let mut stream = adapter.stream(&FetchParameter::default(), &options);
    assert!(stream.next().await.expect("first item").is_some());
    assert!(stream.next().await.expect("second item").is_some());

    match stream.next().await {
        Err(AdapterError::Validation { cursor, .. }) => assert_eq!(cursor, "cursor=c1"),
        other => panic!("expected validation error, got {other:?}"),
    }
    // The echo page is never requested once the stream stops.
    server.reset().await;
}

#[tokio::test]
async fn count_probe_reads_num_found_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drucksache"))
        .and(query_param("f.drucksachetyp", "Antrag"))
        .and(query_param("f.datum.start", "2023-01-09"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "numFound": 12,
            "cursor": "c1",
            "documents": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = DipAdapter::<Drucksache>::new(transport(&server));
    let params = FetchParameter::window(
        NaiveDate::from_ymd_opt(2023, 1, 9).unwrap(),
        NaiveDate::from_ymd_opt(2023, 1, 15).unwrap(),
    )
    .with_document_type("Antrag");
    assert_eq!(adapter.fetch_count(&params).await.expect("count"), 12);
}

#[tokio::test]
async fn drucksache_mapper_fetches_children_and_tags_process_types() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/vorgang"))
        .and(query_param("f.drucksache", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "numFound": 1,
            "documents": [{
                "id": "10",
                "vorgangstyp": "Gesetzgebung",
                "titel": "Ein Gesetz",
                "aktualisiert": "2023-01-11T08:00:00+01:00",
                "datum": "2023-01-10"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/vorgangsposition"))
        .and(query_param("f.vorgang", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "numFound": 1,
            "documents": [{
                "id": "100",
                "vorgang_id": "10",
                "vorgangsposition": "1. Beratung",
                "datum": "2023-01-12",
                "aktualisiert": "2023-01-12T10:00:00+01:00",
                "titel": "Beratung",
                "dokumentart": "Plenarprotokoll"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mapper = DrucksacheMapper::new(transport(&server), Duration::ZERO);
    let item: Drucksache = serde_json::from_value(drucksache(1, "Gesetzgebung")).unwrap();
    let record = mapper
        .map(item, &FetchOptions::default())
        .await
        .expect("mapped");

    assert_eq!(record.kind, RecordKind::Drucksache);
    assert_eq!(record.id, 1);
    assert_eq!(record.type_tag.as_deref(), Some("Gesetzgebung"));
    assert_eq!(record.tags, vec!["Gesetzgebung".to_string()]);
    assert_eq!(record.period_date, NaiveDate::from_ymd_opt(2023, 1, 10));
    assert_eq!(record.total_len(), 3);
    assert_eq!(record.children[0].children[0].kind, RecordKind::Vorgangsposition);
}
