use std::sync::Arc;

use artsync_core::{BatchResult, CategoryNode, ColumnRow, MirrorKind, Record, SiteInfo};
use artsync_storage::{MemoryDestination, MemorySource};
use artsync_sync::{
    ArticleEvent, ConcurrencyStrategy, EventHandler, EventOutcome, MigrationConfig, Orchestrator, RunParams,
};
use tokio_util::sync::CancellationToken;

fn legacy_store(articles: usize) -> MemorySource {
    let mut source = MemorySource::new();
    source.add_site(
        "100",
        "Main",
        SiteInfo {
            domain_name: "www.a.edu,a.edu".into(),
            ..Default::default()
        },
    );
    source.add_column(ColumnRow {
        id: 10,
        site_id: 100,
        name: "News".into(),
        ..Default::default()
    });
    source.add_column(ColumnRow {
        id: 20,
        site_id: 100,
        name: "Home".into(),
        ..Default::default()
    });
    source.set_unique_folder_column(7, CategoryNode::new(10, "News"));
    source.add_mirror(10, MirrorKind::Column, CategoryNode::new(20, "Home"));

    for i in 1..=articles {
        source.insert_record(Record {
            id: i.to_string(),
            site_id: "100".into(),
            site_name: "Main".into(),
            folder_id: "7".into(),
            title: format!("Article {i}"),
            create_time: "2025-04-27 09:30:00".into(),
            content: "<p>body</p>".into(),
            ..Default::default()
        });
    }
    source
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovers_1350_articles_in_three_batches() {
    let dest = Arc::new(MemoryDestination::new());
    let orchestrator = Orchestrator::new(Arc::new(legacy_store(1350)), dest.clone(), MigrationConfig::default());

    for strategy in [ConcurrencyStrategy::WorkerPool, ConcurrencyStrategy::Semaphore] {
        let params = RunParams {
            batch_size: 500,
            concurrency: 4,
            strategy,
            ..RunParams::default()
        };
        let summary = orchestrator.run(&params, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.total_batches, 3);
        assert_eq!(summary.completed_batches, 3);
        assert!(!summary.cancelled);
        if strategy == ConcurrencyStrategy::WorkerPool {
            assert_eq!(summary.result, BatchResult { processed: 1350, skipped: 0, errors: 0 });
        } else {
            assert_eq!(summary.result, BatchResult { processed: 0, skipped: 1350, errors: 0 });
        }
    }

    let snap = dest.snapshot().await;
    assert_eq!(snap.articles.len(), 1350);
    let article = &snap.articles[&1350];
    assert_eq!(article.content, "<p>body</p>");
    assert_eq!(article.exposure_ids(), vec![10, 20]);
    assert_eq!(
        article.access_url.as_deref(),
        Some("http://www.a.edu/2025/0427/c10a1350/page.htm")
    );
    assert_eq!(snap.associations[&1350].len(), 2);
}

#[tokio::test]
async fn event_path_and_bulk_path_agree() {
    let source = Arc::new(legacy_store(3));
    let bulk = Arc::new(MemoryDestination::new());
    Orchestrator::new(source.clone(), bulk.clone(), MigrationConfig::default())
        .run(&RunParams::default(), CancellationToken::new())
        .await
        .unwrap();

    let evented = Arc::new(MemoryDestination::new());
    let handler = EventHandler::new(source, evented.clone());
    let event = ArticleEvent {
        operate: "1".into(),
        article_id: "2".into(),
        visit_url: "http://www.a.edu/2025/0427/c10a2/page.htm".into(),
        publish_column_id: "10".into(),
        site_id: "100".into(),
        ..Default::default()
    };
    assert_eq!(handler.handle(&event).await.unwrap(), EventOutcome::Replaced);

    let from_bulk = &bulk.snapshot().await.articles[&2];
    let from_event = &evented.snapshot().await.articles[&2];
    assert_eq!(from_bulk.title, from_event.title);
    assert_eq!(from_bulk.access_url, from_event.access_url);
}
