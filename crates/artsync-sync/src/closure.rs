//! Exposure-set resolution over the category graph.

use std::collections::{BTreeMap, VecDeque};

use artsync_core::{CategoryNode, MirrorKind};
use artsync_storage::{parse_id, CategoryGraph, StoreResult};
use tracing::{debug, warn};

/// Discovered columns keyed by id. The first name seen for an id is kept.
#[derive(Debug, Default)]
struct Visited {
    nodes: BTreeMap<i64, CategoryNode>,
}

impl Visited {
    /// Returns true when `node` was not seen before.
    fn insert(&mut self, node: CategoryNode) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        self.nodes.insert(node.id, node);
        true
    }

    fn into_sorted(self) -> Vec<CategoryNode> {
        self.nodes.into_values().collect()
    }
}

fn seed(node: CategoryNode, visited: &mut Visited, frontier: &mut VecDeque<i64>) {
    let id = node.id;
    if visited.insert(node) {
        frontier.push_back(id);
    }
}

fn edges_or_empty<T: Default>(result: StoreResult<T>, step: &str, object_id: i64) -> T {
    result.unwrap_or_else(|err| {
        warn!(step, object_id, error = %err, "category lookup failed, treating as no edges");
        T::default()
    })
}

/// Every column through which the article is reachable, ascending by id.
///
/// Seeds are the unique-folder column, folder mirrors and direct article links. The seeds are
/// then expanded breadth-first over column mirrors until no new column appears. Lookup
/// failures are logged and contribute nothing. An id that does not parse skips the steps
/// that need it.
pub async fn resolve_exposure_set<G>(graph: &G, folder_id: &str, article_id: &str) -> Vec<CategoryNode>
where
    G: CategoryGraph + ?Sized,
{
    let mut visited = Visited::default();
    let mut frontier = VecDeque::new();

    if let Ok(folder) = parse_id(folder_id) {
        if let Some(column) = edges_or_empty(graph.unique_folder_column(folder).await, "unique_folder", folder) {
            seed(column, &mut visited, &mut frontier);
        }
        for column in edges_or_empty(graph.mirrors_of(folder, MirrorKind::Folder).await, "folder_mirrors", folder) {
            seed(column, &mut visited, &mut frontier);
        }
    } else {
        debug!(folder_id, "folder id is not numeric, skipping folder seeds");
    }

    if let Ok(article) = parse_id(article_id) {
        for column in edges_or_empty(graph.article_columns(article).await, "article_columns", article) {
            seed(column, &mut visited, &mut frontier);
        }
    } else {
        debug!(article_id, "article id is not numeric, skipping direct links");
    }

    expand_mirrors(graph, &mut visited, frontier).await;
    visited.into_sorted()
}

async fn expand_mirrors<G>(graph: &G, visited: &mut Visited, mut frontier: VecDeque<i64>)
where
    G: CategoryGraph + ?Sized,
{
    while let Some(column_id) = frontier.pop_front() {
        let mirrors = edges_or_empty(
            graph.mirrors_of(column_id, MirrorKind::Column).await,
            "column_mirrors",
            column_id,
        );
        for mirror in mirrors {
            seed(mirror, visited, &mut frontier);
        }
    }
}
