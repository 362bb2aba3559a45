#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use proptest::prelude::*;

use waterfall_lib::cache::CacheHandle;
use waterfall_lib::discovery::{FetchPolicy, MappingDiscovery};
use waterfall_lib::executor::QueryExecutor;
use waterfall_lib::model::{Keyword, WATERFALL_GROUP};
use waterfall_lib::sql::QueryKind;
use waterfall_lib::AppError;

#[path = "util.rs"]
mod util;

use util::{FakeSqlServer, FakeTable};

fn discovery(server: Arc<FakeSqlServer>) -> MappingDiscovery {
    MappingDiscovery::new(QueryExecutor::new(server), CacheHandle::in_memory())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn keywords_follow_fixed_order(
        present in prop::sample::subsequence(Keyword::ALL.to_vec(), 0..=4),
        noise in prop::collection::vec("[A-Z][a-z]{2,8}_(Code|Amount|Id)", 0..6),
        shuffled in any::<bool>(),
    ) {
        let mut columns: Vec<String> = noise
            .into_iter()
            .filter(|c| Keyword::ALL.iter().all(|kw| !c.contains(kw.as_str())))
            .collect();
        for keyword in &present {
            columns.push(keyword.group_field());
            columns.push(keyword.group_final_field());
        }
        if shuffled {
            columns.reverse();
        }
        let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        let server = Arc::new(FakeSqlServer::new().with_table("T", FakeTable::new(&refs)));
        let discovery = discovery(server);
        let instance = util::instance("T");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (first, second) = runtime.block_on(async {
            (
                discovery.discover_keywords(&instance).await.unwrap(),
                discovery.discover_keywords(&instance).await.unwrap(),
            )
        });
        prop_assert_eq!(&first, &present);
        prop_assert_eq!(first, second);
    }
}

#[tokio::test]
async fn discovery_is_never_cached() {
    let server = util::fake_server();
    let discovery = discovery(server.clone());
    let instance = util::instance("Claims");
    discovery.discover_keywords(&instance).await.unwrap();
    discovery.discover_keywords(&instance).await.unwrap();
    let lookups = QueryKind::ColumnLookup(Keyword::Procedure.as_str().to_string());
    assert_eq!(server.count_calls(&lookups), 2);
}

#[tokio::test]
async fn one_failed_lookup_drops_only_its_keyword() {
    let server = util::fake_server();
    server.fail(
        "Claims",
        QueryKind::ColumnLookup(Keyword::Provider.as_str().to_string()),
    );
    let keywords = discovery(server)
        .discover_keywords(&util::instance("Claims"))
        .await
        .unwrap();
    assert_eq!(keywords, vec![Keyword::Procedure, Keyword::Insurance]);
}

#[tokio::test]
async fn every_lookup_failing_is_an_error() {
    let server = util::fake_server();
    for keyword in Keyword::ALL {
        server.fail("Claims", QueryKind::ColumnLookup(keyword.as_str().to_string()));
    }
    let err = discovery(server)
        .discover_keywords(&util::instance("Claims"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::QUERY_TRANSIENT);
}

#[tokio::test]
async fn counts_are_memoized_per_keyword() {
    let server = util::fake_server();
    let discovery = discovery(server.clone());
    let instance = util::instance("Claims");

    let procedure = discovery
        .count_groups(&instance, Keyword::Procedure, FetchPolicy::UseCache)
        .await
        .unwrap();
    let again = discovery
        .count_groups(&instance, Keyword::Procedure, FetchPolicy::UseCache)
        .await
        .unwrap();
    let provider = discovery
        .count_groups(&instance, Keyword::Provider, FetchPolicy::UseCache)
        .await
        .unwrap();

    assert_eq!((procedure, again, provider), (4, 4, 3));
    assert_eq!(server.count_calls(&QueryKind::GroupCount(Keyword::Procedure)), 1);
    assert_eq!(server.count_calls(&QueryKind::GroupCount(Keyword::Provider)), 1);
}

#[tokio::test]
async fn fetched_rows_are_synced_and_cached() {
    let server = util::fake_server();
    let discovery = discovery(server.clone());
    let instance = util::instance("Claims");

    let rows = discovery
        .fetch_mapping_rows(&instance, Keyword::Procedure, FetchPolicy::UseCache)
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert_eq!(row.get(WATERFALL_GROUP), row.get("Procedure_Group_Final"));
    }
    assert_eq!(rows[0].text("Procedure_Group").as_deref(), Some("Consult"));
    assert_eq!(rows[0].text("Earliest_Min_DOS").as_deref(), Some("2024-01"));

    let cached = discovery
        .fetch_mapping_rows(&instance, Keyword::Procedure, FetchPolicy::UseCache)
        .await
        .unwrap();
    assert_eq!(cached, rows);
    assert_eq!(server.count_calls(&QueryKind::MappingRows(Keyword::Procedure)), 1);

    discovery
        .fetch_mapping_rows(&instance, Keyword::Procedure, FetchPolicy::Refresh)
        .await
        .unwrap();
    assert_eq!(server.count_calls(&QueryKind::MappingRows(Keyword::Procedure)), 2);
}

#[tokio::test]
async fn lexicographically_first_group_column_wins() {
    let table = FakeTable::new(&[
        "Provider_Group_Final",
        "Provider_Group_v2",
        "Provider_Group",
        "Provider_Group_Final_Old",
    ]);
    let server = Arc::new(FakeSqlServer::new().with_table("T", table));
    let columns = discovery(server)
        .resolve_group_columns(&util::instance("T"), Keyword::Provider)
        .await
        .unwrap();
    assert_eq!(columns.group, "Provider_Group");
    assert_eq!(columns.group_final, "Provider_Group_Final");
}

#[tokio::test]
async fn keyword_without_group_pair_is_a_schema_mismatch() {
    let table = FakeTable::new(&["Location_Code", "Location_Group"]);
    let server = Arc::new(FakeSqlServer::new().with_table("T", table));
    let discovery = discovery(server);
    let instance = util::instance("T");

    assert_eq!(
        discovery.discover_keywords(&instance).await.unwrap(),
        vec![Keyword::Location]
    );
    let err = discovery
        .count_groups(&instance, Keyword::Location, FetchPolicy::UseCache)
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::SCHEMA_MISMATCH);
}
