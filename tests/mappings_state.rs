#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use waterfall_lib::instance::INSTANCE_CHANGED;
use waterfall_lib::mappings::{MappingsOutcome, INDEX_OUT_OF_RANGE};
use waterfall_lib::model::{Keyword, WATERFALL_GROUP};
use waterfall_lib::sql::QueryKind;
use waterfall_lib::state::RefreshGuard;
use waterfall_lib::{AppError, Workspace};

#[path = "util.rs"]
mod util;

async fn loaded_workspace() -> (Workspace, Arc<util::FakeSqlServer>, Arc<util::FlakyPersistence>) {
    let server = util::fake_server();
    let (workspace, persistence) = util::workspace(server.clone());
    workspace.select_table(util::instance("Claims")).await;
    match workspace.open_mappings().await.unwrap() {
        MappingsOutcome::Loaded { errors, .. } => assert!(errors.is_empty()),
        other => panic!("expected a fresh load, got {other:?}"),
    }
    (workspace, server, persistence)
}

#[tokio::test]
async fn fresh_tabs_are_synced_and_sorted() {
    let (workspace, _, _) = loaded_workspace().await;
    let snapshot = workspace.snapshot();
    let names: Vec<&str> = snapshot
        .mappings
        .tabs
        .iter()
        .map(|tab| tab.tab_name.as_str())
        .collect();
    assert_eq!(names, vec!["Insurance", "Procedure", "Provider"]);

    for tab in &snapshot.mappings.tabs {
        let final_field = tab.keyword.group_final_field();
        assert!(!tab.data.is_empty());
        for row in &tab.data {
            assert_eq!(row.get(WATERFALL_GROUP), row.get(&final_field));
            for field in [
                tab.keyword.group_field(),
                "Total_Charge_Amount".to_string(),
                "Total_Payment_Amount".to_string(),
                "Earliest_Min_DOS".to_string(),
                "Latest_Max_DOS".to_string(),
            ] {
                assert!(row.get(&field).is_some(), "{} missing {field}", tab.tab_name);
            }
        }
    }
}

#[tokio::test]
async fn edit_touches_only_the_addressed_cell() {
    let (workspace, _, _) = loaded_workspace().await;
    let before = workspace.snapshot();

    workspace.modify_waterfall_group(1, 2, "Procedures").unwrap();
    let after = workspace.snapshot();

    for (m, (old_tab, new_tab)) in before
        .mappings
        .tabs
        .iter()
        .zip(after.mappings.tabs.iter())
        .enumerate()
    {
        if m != 1 {
            assert!(Arc::ptr_eq(old_tab, new_tab));
            continue;
        }
        for (r, (old_row, new_row)) in old_tab.data.iter().zip(new_tab.data.iter()).enumerate() {
            if r == 2 {
                assert_eq!(new_row.waterfall_group(), Some("Procedures"));
                let mut expected = (**old_row).clone();
                expected.set_waterfall_group("Procedures");
                assert_eq!(**new_row, expected);
            } else {
                assert!(Arc::ptr_eq(old_row, new_row));
            }
        }
    }
    // The previous snapshot still shows the original value.
    assert_eq!(
        before.mappings.tabs[1].data[2].waterfall_group(),
        before.mappings.tabs[1].data[2]
            .text("Procedure_Group_Final")
            .as_deref()
    );
    assert!(Arc::ptr_eq(&before.view, &after.view));
}

#[tokio::test]
async fn an_overlapping_open_does_not_overwrite_an_edit() {
    let server = util::fake_server();
    let (workspace, _) = util::workspace(server.clone());
    workspace.select_table(util::instance("Claims")).await;
    server.set_delay("Claims", Duration::from_millis(40));

    let first = async {
        let outcome = workspace.open_mappings().await.unwrap();
        workspace.modify_waterfall_group(0, 0, "EDITED").unwrap();
        outcome
    };
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        workspace.open_mappings().await.unwrap()
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, MappingsOutcome::Loaded { .. }));
    assert!(matches!(second, MappingsOutcome::AlreadyLoaded(_)));
    assert_eq!(
        workspace.snapshot().mappings.tabs[0].data[0].waterfall_group(),
        Some("EDITED")
    );
}

#[tokio::test]
async fn out_of_range_edit_changes_nothing() {
    let (workspace, _, _) = loaded_workspace().await;
    let before = workspace.snapshot();
    let err = workspace.modify_waterfall_group(0, 99, "X").unwrap_err();
    assert_eq!(err.code(), INDEX_OUT_OF_RANGE);
    let err = workspace.modify_waterfall_group(7, 0, "X").unwrap_err();
    assert_eq!(err.code(), INDEX_OUT_OF_RANGE);
    assert!(Arc::ptr_eq(&before, &workspace.snapshot()));
}

#[tokio::test]
async fn reopening_keeps_edits() {
    let (workspace, server, _) = loaded_workspace().await;
    workspace.modify_waterfall_group(0, 0, "Private").unwrap();

    let outcome = workspace.open_mappings().await.unwrap();
    assert!(matches!(outcome, MappingsOutcome::AlreadyLoaded(_)));
    assert_eq!(
        workspace.snapshot().mappings.tabs[0].data[0].waterfall_group(),
        Some("Private")
    );
    assert_eq!(server.count_calls(&QueryKind::MappingRows(Keyword::Insurance)), 1);
}

#[tokio::test]
async fn refresh_reverts_unsynced_edits() {
    let (workspace, server, _) = loaded_workspace().await;
    let original = workspace.snapshot().mappings.tabs[0].data[2].clone();

    workspace.modify_waterfall_group(0, 2, "Edited").unwrap();
    assert_eq!(
        workspace.snapshot().mappings.tabs[0].data[2].waterfall_group(),
        Some("Edited")
    );

    let outcome = workspace.refresh_mappings().await.unwrap();
    assert!(matches!(outcome, MappingsOutcome::Loaded { .. }));
    let refreshed = workspace.snapshot().mappings.tabs[0].data[2].clone();
    assert_eq!(refreshed, original);
    assert_eq!(
        refreshed.waterfall_group(),
        refreshed.text("Insurance_Group_Final").as_deref()
    );
    // Refresh re-queries instead of reading cached rows.
    assert_eq!(server.count_calls(&QueryKind::MappingRows(Keyword::Insurance)), 2);
}

#[tokio::test]
async fn edits_are_rejected_while_refreshing() {
    let (workspace, server, _) = loaded_workspace().await;
    server.set_delay("Claims", Duration::from_millis(50));

    let (refresh, edit) = tokio::join!(workspace.refresh_mappings(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        workspace.modify_waterfall_group(0, 0, "Too soon")
    });

    assert!(refresh.is_ok());
    assert_eq!(edit.unwrap_err().code(), RefreshGuard::IN_PROGRESS);
    workspace.modify_waterfall_group(0, 0, "After").unwrap();
}

#[tokio::test]
async fn a_failed_tab_is_kept_empty_and_reported() {
    let server = util::fake_server();
    server.fail("Claims", QueryKind::MappingRows(Keyword::Provider));
    let (workspace, _) = util::workspace(server);
    workspace.select_table(util::instance("Claims")).await;

    match workspace.open_mappings().await.unwrap() {
        MappingsOutcome::Loaded { snapshot, errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].code(), AppError::QUERY_TRANSIENT);
            let provider = snapshot.mappings.tab("Provider").unwrap();
            assert!(provider.data.is_empty());
            assert_eq!(snapshot.mappings.tab("Procedure").unwrap().data.len(), 4);
        }
        other => panic!("expected a load, got {other:?}"),
    }
}

#[tokio::test]
async fn upsync_persists_each_tab_and_updates_the_pivot() {
    let (workspace, _, persistence) = loaded_workspace().await;
    workspace.projects().init_projects(util::USER).await.unwrap();
    persistence.fail_tab("Provider");

    // Procedure rows are ordered E&M/Consult, E&M/Office Visit, Surgery/...
    workspace.modify_waterfall_group(1, 0, "Evaluation").unwrap();
    workspace.modify_waterfall_group(2, 0, "Ortho").unwrap();

    let report = workspace.upsync().await.unwrap();
    assert_eq!(report.persisted, vec!["Insurance", "Procedure"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].tab_name, "Provider");
    assert_eq!(report.failed[0].error.code(), AppError::PERSIST_CONFLICT);

    let key = util::instance("Claims").key();
    let saved = persistence
        .inner
        .saved_mapping(util::USER, &key, "Procedure")
        .unwrap();
    assert_eq!(saved.data[0].waterfall_group(), Some("Evaluation"));
    assert!(persistence
        .inner
        .saved_mapping(util::USER, &key, "Provider")
        .is_none());

    // The failed tab keeps its edit and every tab feeds the pivot.
    let snapshot = workspace.snapshot();
    assert_eq!(
        snapshot.mappings.tab("Provider").unwrap().data[0].waterfall_group(),
        Some("Ortho")
    );
    assert_eq!(
        report.view.column("Procedure").unwrap().values,
        vec!["Evaluation", "E&M", "Surgery"]
    );
    assert_eq!(
        snapshot.view.column("Provider").unwrap().values,
        vec!["Ortho", "Primary Care"]
    );
}

#[tokio::test]
async fn reselecting_a_table_carries_edited_groups_into_the_pivot() {
    let (workspace, _, _) = loaded_workspace().await;
    // Insurance rows are ordered Commercial/Aetna, Commercial/BCBS, Medicare/...
    workspace.modify_waterfall_group(0, 0, "Private").unwrap();

    let snapshot = workspace
        .select_table(util::instance("Claims"))
        .await
        .committed()
        .cloned()
        .unwrap();
    assert_eq!(
        snapshot.view.column("Insurance").unwrap().values,
        vec!["Private", "Commercial", "Medicare"]
    );
    assert!(!snapshot.mappings.loaded);
    assert!(snapshot.mappings.tabs.is_empty());
}

#[tokio::test]
async fn mappings_for_another_table_are_refused() {
    let (workspace, _, _) = loaded_workspace().await;
    let err = workspace
        .mappings()
        .set_mappings_state(&util::instance("Locations"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), waterfall_lib::mappings::INSTANCE_MISMATCH);
}

#[tokio::test]
async fn upsync_does_not_touch_a_table_selected_meanwhile() {
    let (workspace, _, persistence) = loaded_workspace().await;
    workspace.projects().init_projects(util::USER).await.unwrap();
    workspace.modify_waterfall_group(0, 0, "Private").unwrap();
    persistence.set_save_delay(Duration::from_millis(40));

    let (upsync, _) = tokio::join!(workspace.upsync(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        workspace.select_table(util::instance("Locations")).await
    });

    let err = upsync.unwrap_err();
    assert_eq!(err.code(), INSTANCE_CHANGED);
    // The writes already sent still landed.
    let claims = util::instance("Claims").key();
    assert!(persistence
        .inner
        .saved_mapping(util::USER, &claims, "Insurance")
        .is_some());

    let snapshot = workspace.snapshot();
    assert_eq!(snapshot.instance_key(), Some(util::instance("Locations").key()));
    if let Some(column) = snapshot.view.column("Insurance") {
        assert!(!column.values.iter().any(|v| v == "Private"));
    }
}
