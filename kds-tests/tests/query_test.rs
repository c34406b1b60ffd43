use kds_client::{ClientConfig, Cursor, FetchOptions, MoreResults, QueryOptions, QueryResultBatch};
use kds_core::{key_path, Entity, Error};
use kds_test_utils::{seed_people, BackendOp, TestClient, TEST_PROJECT};

fn ids(entities: &[Entity]) -> Vec<i64> {
    entities.iter().filter_map(Entity::id).collect()
}

#[test]
fn test_filter_items_across_pages() -> anyhow::Result<()> {
    let test = TestClient::new();
    seed_people(&test.backend, 10);
    test.backend.set_max_page_size(3);

    let mut query = test.client.query("Person")?;
    query.add_filter("age", ">", 21)?;
    let mut iter = query.fetch(FetchOptions::new());

    let results = iter.items()?.collect::<kds_core::Result<Vec<_>>>()?;
    // ages are 18, 21, 24, ...; everyone from the third person on matches
    assert_eq!(ids(&results), (3..=10).collect::<Vec<_>>());
    assert_eq!(iter.num_results(), 8);
    assert_eq!(iter.page_number(), 3);
    assert_eq!(test.backend.call_count(BackendOp::RunQuery), 3);
    Ok(())
}

#[test]
fn test_pages_report_sizes() {
    let test = TestClient::new();
    seed_people(&test.backend, 7);
    test.backend.set_max_page_size(3);

    let query = test.client.query("Person").unwrap();
    let mut iter = query.fetch(FetchOptions::new());
    let pages: Vec<usize> = iter
        .pages()
        .unwrap()
        .map(|page| page.unwrap().num_items())
        .collect();

    assert_eq!(pages, vec![3, 3, 1]);
    assert_eq!(iter.num_results(), 7);
    assert!(iter.next_page_token().is_none());
}

#[test]
fn test_iterator_single_use() {
    let test = TestClient::new();
    let query = test.client.query("Person").unwrap();

    let mut iter = query.fetch(FetchOptions::new());
    assert!(iter.pages().is_ok());
    assert!(matches!(iter.items(), Err(Error::Usage(_))));

    let mut iter = query.fetch(FetchOptions::new());
    iter.items().unwrap().for_each(drop);
    assert!(matches!(iter.pages(), Err(Error::Usage(_))));
}

#[test]
fn test_limit_and_offset() {
    let test = TestClient::new();
    seed_people(&test.backend, 10);
    test.backend.set_max_page_size(2);

    let query = test.client.query("Person").unwrap();
    let mut iter = query.fetch(FetchOptions::new().limit(4).offset(3));
    let results: Vec<Entity> = iter.items().unwrap().map(Result::unwrap).collect();

    assert_eq!(ids(&results), vec![4, 5, 6, 7]);
    assert_eq!(iter.skipped_results(), 3);

    let requests = test.backend.query_requests();
    assert_eq!(requests[0].limit, Some(4));
    assert_eq!(requests[0].offset, 3);
    assert_eq!(requests[1].limit, Some(2));
    assert_eq!(requests[1].offset, 0);
}

#[test]
fn test_resume_from_cursor() {
    let test = TestClient::new();
    seed_people(&test.backend, 6);

    let query = test.client.query("Person").unwrap();
    let mut first = query.fetch(FetchOptions::new().limit(2));
    let head: Vec<Entity> = first.items().unwrap().map(Result::unwrap).collect();
    assert_eq!(ids(&head), vec![1, 2]);
    let token = first.next_page_token().cloned().expect("more results");

    let encoded = token.to_urlsafe();
    let cursor = Cursor::from_urlsafe(&encoded).unwrap();
    let mut rest = query.fetch(FetchOptions::new().start_cursor(cursor));
    let tail: Vec<Entity> = rest.items().unwrap().map(Result::unwrap).collect();
    assert_eq!(ids(&tail), vec![3, 4, 5, 6]);
}

#[test]
fn test_page_size_caps_requests() {
    let test = TestClient::with_config(ClientConfig::new(TEST_PROJECT).with_page_size(4));
    seed_people(&test.backend, 10);

    let query = test.client.query("Person").unwrap();
    let mut iter = query.fetch(FetchOptions::new());
    assert_eq!(iter.items().unwrap().count(), 10);

    let limits: Vec<Option<usize>> = test
        .backend
        .query_requests()
        .iter()
        .map(|r| r.limit)
        .collect();
    assert_eq!(limits, vec![Some(4), Some(4), Some(4)]);
}

#[test]
fn test_scripted_pages_follow_protocol() {
    let test = TestClient::new();
    let person = |id: i64| Entity::with_key(test.client.key(key_path!["Person", id]).unwrap());
    test.backend.push_page(QueryResultBatch {
        entities: vec![person(1), person(2)],
        end_cursor: Some(Cursor::new(b"one".to_vec())),
        skipped_results: 0,
        more_results: MoreResults::NotFinished,
    });
    test.backend.push_page(QueryResultBatch {
        entities: vec![person(3)],
        end_cursor: Some(Cursor::new(b"two".to_vec())),
        skipped_results: 0,
        more_results: MoreResults::MoreResultsAfterCursor,
    });

    let query = test.client.query("Person").unwrap();
    let mut iter = query.fetch(FetchOptions::new());
    let results: Vec<Entity> = iter.items().unwrap().map(Result::unwrap).collect();

    assert_eq!(ids(&results), vec![1, 2, 3]);
    assert_eq!(iter.next_page_token().unwrap().as_bytes(), b"two");
    let requests = test.backend.query_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].start_cursor.as_ref().unwrap().as_bytes(), b"one");
}

#[test]
fn test_ancestor_query() {
    let test = TestClient::new();
    let org = test.client.key(key_path!["Org", "acme"]).unwrap();
    for id in 1..=3 {
        let key = test
            .client
            .key_with(
                key_path!["User", id],
                kds_client::KeyOptions::new().parent(org.clone()),
            )
            .unwrap();
        test.backend.seed(Entity::with_key(key));
    }
    seed_people(&test.backend, 2);

    let query = test
        .client
        .query_with(QueryOptions::new().kind("User").ancestor(org))
        .unwrap();
    let mut iter = query.fetch(FetchOptions::new());
    assert_eq!(iter.items().unwrap().count(), 3);
}

#[test]
fn test_keys_only_and_projection() {
    let test = TestClient::new();
    seed_people(&test.backend, 2);

    let mut query = test.client.query("Person").unwrap();
    query.keys_only();
    let keys: Vec<Entity> = query
        .fetch(FetchOptions::new())
        .items()
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert!(keys.iter().all(|e| e.is_empty() && e.key().is_some()));

    let mut query = test.client.query("Person").unwrap();
    query.set_projection("name").unwrap();
    let projected: Vec<Entity> = query
        .fetch(FetchOptions::new())
        .items()
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert!(projected.iter().all(|e| e.contains("name") && !e.contains("age")));
}

#[test]
fn test_descending_order() {
    let test = TestClient::new();
    seed_people(&test.backend, 4);

    let mut query = test.client.query("Person").unwrap();
    query.set_order("-age").unwrap();
    let results: Vec<Entity> = query
        .fetch(FetchOptions::new())
        .items()
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(ids(&results), vec![4, 3, 2, 1]);
}

#[test]
fn test_key_filter() {
    let test = TestClient::new();
    seed_people(&test.backend, 5);

    let mut query = test.client.query("Person").unwrap();
    query
        .key_filter(test.client.key(key_path!["Person", 3]).unwrap(), ">=")
        .unwrap();
    let results: Vec<Entity> = query
        .fetch(FetchOptions::new())
        .items()
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(ids(&results), vec![3, 4, 5]);
}

#[test]
fn test_eventual_query() {
    let test = TestClient::new();
    let query = test.client.query("Person").unwrap();
    query
        .fetch(FetchOptions::new().eventual(true))
        .items()
        .unwrap()
        .for_each(drop);
    assert_eq!(
        test.backend.query_requests()[0].read_options,
        kds_client::ReadOptions::Eventual
    );

    let _txn = test.client.transaction(false).enter(&test.client).unwrap();
    let mut iter = query.fetch(FetchOptions::new().eventual(true));
    let first = iter.items().unwrap().next();
    assert!(matches!(first, Some(Err(Error::Construction(_)))));
}

#[test]
fn test_backend_error_ends_iteration() {
    let test = TestClient::new();
    seed_people(&test.backend, 4);
    test.backend.set_max_page_size(2);
    test.backend.fail_next(
        BackendOp::RunQuery,
        kds_core::BackendError::Timeout("slow".into()),
    );

    let query = test.client.query("Person").unwrap();
    let mut iter = query.fetch(FetchOptions::new());
    let mut items = iter.items().unwrap();
    assert!(matches!(items.next(), Some(Err(Error::Backend(_)))));
    assert!(items.next().is_none());
}

#[test]
fn test_query_inherits_client_namespace() {
    let test = TestClient::with_config(ClientConfig::new(TEST_PROJECT).with_namespace("tenant"));
    let query = test.client.query("Person").unwrap();
    assert_eq!(query.namespace(), Some("tenant"));
    assert_eq!(query.project(), TEST_PROJECT);

    query.fetch(FetchOptions::new()).items().unwrap().for_each(drop);
    assert_eq!(
        test.backend.query_requests()[0].namespace.as_deref(),
        Some("tenant")
    );
}
