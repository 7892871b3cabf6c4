use artsync_core::{
    ArticleFilter, ArticleWrite, Attachment, ColumnRow, ExposureRow, PageRequest, Record, SiteRow,
    TableDiff,
};
use artsync_storage::{DestinationStore, PgDestination};
use sqlx::Row;

async fn destination_from_env() -> Option<PgDestination> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let dest = PgDestination::connect(&url, 2).await.ok()?;
    dest.migrate().await.ok()?;
    Some(dest)
}

fn record(id: i64, title: &str) -> Record {
    let mut record = Record {
        id: id.to_string(),
        site_id: "100".into(),
        title: title.into(),
        attachments: vec![Attachment {
            name: "report.pdf".into(),
            path: "http://files.example.edu/report.pdf".into(),
        }],
        ..Default::default()
    };
    record.extension.set("field12", "twelve");
    record
}

fn exposure(article_id: i64, column_id: i64) -> ExposureRow {
    ExposureRow {
        article_id,
        column_id,
        column_name: format!("col{column_id}"),
        site_id: "100".into(),
        site_name: "Main".into(),
        url: Some(format!("http://www.example.edu/c{column_id}a{article_id}/page.htm")),
    }
}

#[tokio::test]
async fn replace_is_full_row_replacement() {
    let Some(dest) = destination_from_env().await else {
        return;
    };
    let id = 9_000_001;
    dest.delete_article(id).await.unwrap();

    let first = record(id, "first");
    dest.replace_article(&ArticleWrite {
        article_id: id,
        record: &first,
        exposures: vec![exposure(id, 1), exposure(id, 2)],
    })
    .await
    .unwrap();
    assert!(dest.contains(id).await.unwrap());

    let mut second = record(id, "second");
    second.attachments.clear();
    dest.replace_article(&ArticleWrite {
        article_id: id,
        record: &second,
        exposures: vec![exposure(id, 3)],
    })
    .await
    .unwrap();

    let row = sqlx::query("SELECT title, field12 FROM article_static WHERE article_id = $1")
        .bind(id)
        .fetch_one(dest.pool())
        .await
        .unwrap();
    assert_eq!(row.try_get::<String, _>("title").unwrap(), "second");
    assert_eq!(row.try_get::<String, _>("field12").unwrap(), "twelve");

    assert!(!dest.has_association(id, 1).await.unwrap());
    assert!(dest.has_association(id, 3).await.unwrap());

    let attachments: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM article_attachment WHERE article_id = $1")
            .bind(id)
            .fetch_one(dest.pool())
            .await
            .unwrap();
    assert_eq!(attachments, 0);

    dest.delete_article(id).await.unwrap();
    assert!(!dest.contains(id).await.unwrap());
}

async fn row_counts(dest: &PgDestination, id: i64) -> (i64, i64, i64) {
    let mut counts = [0i64; 3];
    for (slot, table) in ["article_static", "article_dynamic", "article_attachment"]
        .iter()
        .enumerate()
    {
        counts[slot] = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE article_id = $1"))
            .bind(id)
            .fetch_one(dest.pool())
            .await
            .unwrap();
    }
    (counts[0], counts[1], counts[2])
}

/// The attachment name column is VARCHAR(255), so this insert fails after the static and
/// association rows were written inside the same transaction.
fn record_with_oversized_attachment(id: i64) -> Record {
    let mut broken = record(id, "broken");
    broken.attachments = vec![Attachment {
        name: "x".repeat(300),
        path: "/files/x.pdf".into(),
    }];
    broken
}

#[tokio::test]
async fn failed_first_write_leaves_no_rows() {
    let Some(dest) = destination_from_env().await else {
        return;
    };
    let id = 9_000_002;
    dest.delete_article(id).await.unwrap();

    let broken = record_with_oversized_attachment(id);
    let result = dest
        .replace_article(&ArticleWrite {
            article_id: id,
            record: &broken,
            exposures: vec![exposure(id, 1), exposure(id, 2)],
        })
        .await;

    assert!(result.is_err());
    assert!(!dest.contains(id).await.unwrap());
    assert_eq!(row_counts(&dest, id).await, (0, 0, 0));
}

#[tokio::test]
async fn failed_replace_keeps_previous_rows() {
    let Some(dest) = destination_from_env().await else {
        return;
    };
    let id = 9_000_003;
    dest.delete_article(id).await.unwrap();

    let first = record(id, "first");
    dest.replace_article(&ArticleWrite {
        article_id: id,
        record: &first,
        exposures: vec![exposure(id, 1)],
    })
    .await
    .unwrap();

    let broken = record_with_oversized_attachment(id);
    let result = dest
        .replace_article(&ArticleWrite {
            article_id: id,
            record: &broken,
            exposures: vec![exposure(id, 4), exposure(id, 5)],
        })
        .await;
    assert!(result.is_err());

    assert!(dest.contains(id).await.unwrap());
    assert_eq!(row_counts(&dest, id).await, (1, 1, 1));
    let title: String = sqlx::query_scalar("SELECT title FROM article_static WHERE article_id = $1")
        .bind(id)
        .fetch_one(dest.pool())
        .await
        .unwrap();
    assert_eq!(title, "first");
    assert!(dest.has_association(id, 1).await.unwrap());
    assert!(!dest.has_association(id, 4).await.unwrap());

    dest.delete_article(id).await.unwrap();
}

#[tokio::test]
async fn reference_diff_commits_both_tables_or_neither() {
    let Some(dest) = destination_from_env().await else {
        return;
    };
    let column_id = 9_000_010;
    let site_id = 9_000_020;
    let cleanup = (
        TableDiff::<ColumnRow> {
            deleted: vec![column_id],
            ..Default::default()
        },
        TableDiff::<SiteRow> {
            deleted: vec![site_id],
            ..Default::default()
        },
    );
    dest.apply_reference_diff(&cleanup.0, &cleanup.1).await.unwrap();

    let columns = TableDiff {
        added: vec![ColumnRow {
            id: column_id,
            name: "Staged".into(),
            parent_id: 1,
            ..Default::default()
        }],
        ..Default::default()
    };
    let site = SiteRow {
        id: site_id,
        name: "Twice".into(),
        ..Default::default()
    };
    // duplicate primary key inside one insert
    let sites = TableDiff {
        added: vec![site.clone(), site],
        ..Default::default()
    };
    assert!(dest.apply_reference_diff(&columns, &sites).await.is_err());
    assert!(!dest.load_columns().await.unwrap().iter().any(|c| c.id == column_id));

    dest.apply_reference_diff(&columns, &TableDiff::default()).await.unwrap();
    assert!(dest.load_columns().await.unwrap().iter().any(|c| c.id == column_id));
    dest.apply_reference_diff(&cleanup.0, &cleanup.1).await.unwrap();
}

#[tokio::test]
async fn article_query_filters_and_pages() {
    let Some(dest) = destination_from_env().await else {
        return;
    };
    let ids = [9_000_031, 9_000_032, 9_000_033];
    let column = 9_000_900;
    for (day, id) in ids.into_iter().enumerate() {
        dest.delete_article(id).await.unwrap();
        let mut rec = record(id, &format!("query {day}"));
        rec.publish_time = chrono::NaiveDate::from_ymd_opt(2025, 4, day as u32 + 1)
            .and_then(|d| d.and_hms_opt(8, 0, 0));
        dest.replace_article(&ArticleWrite {
            article_id: id,
            record: &rec,
            exposures: vec![exposure(id, column)],
        })
        .await
        .unwrap();
    }

    let filter = ArticleFilter::from_params(Some(&column.to_string()), None, None, None, None, None)
        .unwrap();
    let first = dest.query_articles(&filter, PageRequest::new(1, 2)).await.unwrap();
    assert_eq!(first.total, 3);
    assert!(first.has_next);
    let order: Vec<_> = first.items.iter().map(|a| a.article_id).collect();
    assert_eq!(order, vec![9_000_033, 9_000_032]);
    assert_eq!(
        first.items[0].visit_url.as_deref(),
        Some("http://www.example.edu/c9000900a9000033/page.htm")
    );
    assert_eq!(first.items[0].attachments.len(), 1);

    let titled = ArticleFilter {
        title: Some("query 0".into()),
        ..filter.clone()
    };
    let only = dest.query_articles(&titled, PageRequest::default()).await.unwrap();
    assert_eq!(only.items.len(), 1);
    assert_eq!(only.items[0].article_id, 9_000_031);

    for id in ids {
        dest.delete_article(id).await.unwrap();
    }
}
