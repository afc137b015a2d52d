use std::sync::Arc;
use std::time::Duration;

use super::fixtures::*;
use crate::catalog::CatalogItem;
use crate::config::{Config, SearchConfig};
use crate::jobs::{JobError, JobStatus};
use crate::semantic::{snapshot_name, SearchError, SearchRequest, VisualSearch};
use crate::storage::{BackendLocal, StorageManager};
use crate::store::{JsonStore, MetadataStore, TenantRecord, TenantStatus};

#[test]
fn test_full_catalog_is_indexed() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(25));

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.total, 25);
    assert_eq!(job.processed, 25);
    assert!(job.error.is_none());
    assert_eq!(h.index_len(&tenant), Some(25));
    assert_eq!(h.store.list_products(&tenant).unwrap().len(), 25);
    assert_eq!(h.snapshots.writes_of(&snapshot_name(&tenant)), 1);
}

#[test]
fn test_failed_download_is_skipped() {
    let h = Harness::new();
    let mut shop = FakeShop::with_products(3);
    shop.images.remove(&image_url(1));
    let tenant = h.add_shop("acme", shop);

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!((job.processed, job.total), (3, 3));
    assert_eq!(h.index_len(&tenant), Some(2));

    let slot = h.search.registry().get(&tenant).unwrap().unwrap();
    let index = slot.read().unwrap();
    assert!(index.contains(&item_id(0)));
    assert!(!index.contains(&item_id(1)));
    assert!(index.contains(&item_id(2)));
}

#[test]
fn test_corrupt_image_and_missing_image_are_skipped() {
    let h = Harness::new();
    let mut shop = FakeShop::with_products(4);
    shop.images.insert(image_url(0), b"definitely not a png".to_vec());
    shop.items[3].image_url = None;
    let tenant = h.add_shop("acme", shop);

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!((job.processed, job.total), (4, 4));
    assert_eq!(h.index_len(&tenant), Some(2));

    // imageless products are not recorded
    let products = h.store.list_products(&tenant).unwrap();
    assert_eq!(products.len(), 3);
    assert!(products.iter().all(|p| p.item_id != item_id(3)));
}

#[test]
fn test_invalid_credential_fails_job() {
    let h = Harness::new();
    let shop = FakeShop::with_products(5);
    let tenant = h.add_shop("acme", shop);
    h.orchestrator
        .register_tenant(TenantRecord::active(
            tenant.clone(),
            "acme.myshopify.com",
            "shpat_revoked",
        ))
        .unwrap();

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!((job.processed, job.total), (0, 0));
    let error = job.error.unwrap();
    assert!(error.contains("authentication"), "{error}");
    assert!(!h.search.registry().contains(&tenant));
}

#[test]
fn test_failed_rerun_keeps_existing_index() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(12));
    assert_eq!(h.index(&tenant).status, JobStatus::Done);

    h.orchestrator
        .register_tenant(TenantRecord::active(
            tenant.clone(),
            "acme.myshopify.com",
            "shpat_revoked",
        ))
        .unwrap();
    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(h.index_len(&tenant), Some(12));
    assert_eq!(h.snapshots.writes_of(&snapshot_name(&tenant)), 1);
}

#[test]
fn test_catalog_fetch_failure_fails_job() {
    let h = Harness::new();
    let mut shop = FakeShop::with_products(5);
    shop.fail_fetch = true;
    let tenant = h.add_shop("acme", shop);

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.unwrap().contains("502"));
    assert!(job.finished_at.is_some());
}

#[test]
fn test_empty_catalog_creates_empty_index() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(0));

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!((job.processed, job.total), (0, 0));
    assert_eq!(h.index_len(&tenant), Some(0));
    assert_eq!(h.snapshots.writes_of(&snapshot_name(&tenant)), 1);

    let response = h
        .search
        .query(&SearchRequest {
            tenant: tenant.clone(),
            image: product_png(0),
            limit: None,
        })
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.total, 0);
}

#[test]
fn test_rerun_is_idempotent() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(15));

    let first = h.index(&tenant);
    let second = h.index(&tenant);

    assert_ne!(first.id, second.id);
    assert_eq!(second.status, JobStatus::Done);
    assert_eq!(h.index_len(&tenant), Some(15));
    assert_eq!(h.store.list_products(&tenant).unwrap().len(), 15);
    assert_eq!(h.store.list_jobs(Some(&tenant)).unwrap().len(), 2);
    assert_eq!(
        h.store.latest_job(&tenant).unwrap().map(|j| j.id),
        Some(second.id)
    );
}

#[test]
fn test_pages_and_batches_are_paced() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(25));

    h.index(&tenant);

    // 3 pages at 2/s, then 3 batches one second apart
    let ms = Duration::from_millis;
    assert_eq!(
        h.clock.sleeps(),
        vec![ms(500), ms(500), ms(1000), ms(1000)]
    );
}

#[test]
fn test_progress_is_monotonic() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(25));

    let job = h.index(&tenant);
    let history = h.store.history_of(&job.id);

    let statuses: Vec<JobStatus> = history.iter().map(|j| j.status).collect();
    assert_eq!(statuses.first(), Some(&JobStatus::Queued));
    assert_eq!(statuses.last(), Some(&JobStatus::Done));

    let processed: Vec<usize> = history
        .iter()
        .filter(|j| j.status == JobStatus::Running && j.total > 0)
        .map(|j| j.processed)
        .collect();
    assert_eq!(processed, vec![0, 10, 20, 25]);

    for pair in history.windows(2) {
        assert!(pair[0].processed <= pair[1].processed);
    }
    assert!(history.iter().all(|j| j.processed <= j.total));
}

#[test]
fn test_store_failure_mid_run_fails_job() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(25));
    *h.store.product_budget.lock().unwrap() = Some(10);

    let job = h.index(&tenant);

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!((job.processed, job.total), (10, 25));
    assert!(job.error.unwrap().contains("database is locked"));
    assert!(job.finished_at.unwrap() >= job.started_at.unwrap());
    // nothing was persisted for the failed run
    assert_eq!(h.snapshots.writes_of(&snapshot_name(&tenant)), 0);
}

#[test]
fn test_catalog_over_ceiling_fails_job() {
    let mut config = Config::default();
    config.indexing.max_products = Some(20);
    let h = Harness::with_config(&config);
    let big = h.add_shop("acme", FakeShop::with_products(25));
    let small = h.add_shop("globex", FakeShop::with_products(20));

    let job = h.index(&big);

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!((job.processed, job.total), (0, 0));
    assert!(job.error.unwrap().contains("more than 20 products"));
    assert_eq!(h.index_len(&big), None);
    assert!(h.store.list_products(&big).unwrap().is_empty());

    let job = h.index(&small);
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(h.index_len(&small), Some(20));
}

#[test]
fn test_snapshots_survive_restart() {
    let h = Harness::new();
    let acme = h.add_shop("acme", FakeShop::with_products(12));
    let globex = h.add_shop("globex", FakeShop::with_products(3));
    h.index(&acme);
    h.index(&globex);

    let snapshots = Arc::new(BackendLocal::new(h.dir.path().join("indices")).unwrap());
    let (restarted, report) =
        VisualSearch::with_parts(histogram_generator(), snapshots, SearchConfig::default())
            .unwrap();

    assert_eq!(report.loaded.len(), 2);
    assert!(report.skipped.is_empty());
    assert_eq!(restarted.health().tenants, 2);
    assert_eq!(restarted.index_stats(&acme).unwrap().indexed_products, 12);
    assert_eq!(restarted.index_stats(&globex).unwrap().indexed_products, 3);
}

#[test]
fn test_search_finds_indexed_product() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(25));
    h.index(&tenant);

    let response = h
        .search
        .query(&SearchRequest {
            tenant: tenant.clone(),
            image: product_png(7),
            limit: Some(5),
        })
        .unwrap();

    let best = &response.results[0];
    assert_eq!(best.id, item_id(7));
    assert!((best.score - 1.0).abs() < 1e-5, "score {}", best.score);
    assert!(response.results.len() <= 5);
}

#[test]
fn test_tenants_do_not_see_each_other() {
    let h = Harness::new();
    let acme = h.add_shop("acme", FakeShop::with_products(5));
    let mut other = FakeShop::with_products(0);
    other.items.push(CatalogItem {
        item_id: "globex-1".to_string(),
        title: "Widget".to_string(),
        handle: "widget".to_string(),
        image_url: Some(image_url(100)),
    });
    other.images.insert(image_url(100), product_png(100));
    let globex = h.add_shop("globex", other);
    h.index(&acme);
    h.index(&globex);

    let response = h
        .search
        .query(&SearchRequest {
            tenant: acme.clone(),
            image: product_png(100),
            limit: None,
        })
        .unwrap();

    assert!(response.results.iter().all(|r| r.id != "globex-1"));

    let response = h
        .search
        .query(&SearchRequest {
            tenant: globex.clone(),
            image: product_png(100),
            limit: None,
        })
        .unwrap();
    assert_eq!(response.results[0].id, "globex-1");
}

#[test]
fn test_uninstall_removes_index_but_keeps_products() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(5));
    h.index(&tenant);

    assert!(h.orchestrator.uninstall(&tenant).unwrap());

    let err = h
        .search
        .query(&SearchRequest {
            tenant: tenant.clone(),
            image: product_png(1),
            limit: None,
        })
        .unwrap_err();
    assert!(matches!(err, SearchError::TenantNotInitialized(_)));
    assert!(!h.snapshots.exists(&snapshot_name(&tenant)));

    assert!(matches!(
        h.orchestrator.submit(&tenant),
        Err(JobError::TenantUninstalled(_))
    ));
    assert_eq!(
        h.store.get_tenant(&tenant).unwrap().unwrap().status,
        TenantStatus::Uninstalled
    );
    assert_eq!(h.store.list_products(&tenant).unwrap().len(), 5);
}

#[test]
fn test_submit_unknown_tenant() {
    let h = Harness::new();
    let tenant = crate::tenant::TenantId::new("nobody").unwrap();

    assert!(matches!(
        h.orchestrator.submit(&tenant),
        Err(JobError::UnknownTenant(_))
    ));
}

#[test]
fn test_report_includes_index_stats() {
    let h = Harness::new();
    let tenant = h.add_shop("acme", FakeShop::with_products(25));

    let before = h.orchestrator.report(&tenant).unwrap();
    assert_eq!(before.status, Some(TenantStatus::Active));
    assert!(before.latest_job.is_none());
    assert!(before.index.is_none());

    h.index(&tenant);
    let after = h.orchestrator.report(&tenant).unwrap();

    assert_eq!(after.latest_job.unwrap().status, JobStatus::Done);
    let stats = after.index.unwrap();
    assert_eq!(stats.indexed_products, 25);
    // 25 × 512 × 4 bytes
    assert_eq!(stats.index_size_mb, 0.05);
}

#[test]
fn test_json_store_records_a_full_run() {
    let store_dir = tempfile::tempdir().unwrap();
    let h = Harness::with_store(Box::new(JsonStore::open(store_dir.path()).unwrap()));
    let tenant = h.add_shop("acme", FakeShop::with_products(12));

    let job = h.index(&tenant);

    let reopened = JsonStore::open(store_dir.path()).unwrap();
    let stored = reopened.get_job(&job.id).unwrap().unwrap();
    assert_eq!(stored, job);
    assert_eq!(reopened.list_products(&tenant).unwrap().len(), 12);
    assert_eq!(
        reopened.get_tenant(&tenant).unwrap().unwrap().shop_domain,
        "acme.myshopify.com"
    );
}
