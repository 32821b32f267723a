// satchel-core/src/planner.rs
//! Query planner and executor.
//!
//! The planner turns a parsed filter into candidate sources:
//! - direct document lookups when `_id` is pinned (the synthetic `_id_`
//!   index),
//! - an index scan over the lookup keys a secondary index can derive from
//!   the filter, with tail-field conditions and sort/limit pushed into the
//!   entry iteration where the contract allows,
//! - a full list+scan of the collection's data prefix otherwise.
//!
//! `$or` branches are planned independently and their candidate sets
//! unioned; if any branch needs a full scan the whole query runs as one
//! scan, since the scan subsumes every branch.
//!
//! The executor materialises candidates with a bounded parallel fan-out,
//! re-applies the complete filter in-process (entry-side filtering may
//! over-approximate, never under-approximate), then applies whatever sort
//! and limit were not pushed down.

use crate::collection::{data_prefix, document_object_key};
use crate::document::{Document, DocumentId};
use crate::error::{Result, SatchelError};
use crate::find_options::{apply_limit, apply_sort, FindOptions};
use crate::index::entry::member_order_cmp;
use crate::index::{CollectionIndex, EntryScan, ScanDirection};
use crate::query::{Comparison, Filter};
use crate::storage::{ObjectStore, ObjectStoreError};
use crate::value_utils::compare_values;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Parallel document fetches per query
pub const DEFAULT_FETCH_FAN_OUT: usize = 8;

/// One way of producing candidate documents for a (branch of a) query
pub enum CandidateSource {
    /// The filter is unsatisfiable (e.g. `$in: []` on a key field)
    Empty,
    /// Direct lookups by document id
    IdLookup(Vec<DocumentId>),
    /// Entry scans on a chosen index
    IndexScan {
        index: Arc<CollectionIndex>,
        keys: Vec<String>,
        scan: EntryScan,
    },
    /// List + get everything under the data prefix
    FullScan,
}

/// A planned query: candidate sources (one per `$or` branch) plus what the
/// executor still has to do in-process.
pub struct QueryPlan {
    pub sources: Vec<CandidateSource>,
    /// Candidates already arrive in the requested order
    pub sort_pushed: bool,
    /// The requested limit is already enforced by the entry scans
    pub limit_pushed: bool,
}

impl CandidateSource {
    /// Explain output for one source
    fn describe(&self) -> Value {
        match self {
            CandidateSource::Empty => serde_json::json!({"stage": "EMPTY"}),
            CandidateSource::IdLookup(ids) => serde_json::json!({
                "stage": "IDHACK",
                "ids": ids.iter().map(DocumentId::to_value).collect::<Vec<_>>(),
            }),
            CandidateSource::IndexScan { index, keys, scan } => serde_json::json!({
                "stage": "IXSCAN",
                "indexName": index.name(),
                "lookupKeys": keys,
                "entryFilter": scan
                    .conditions
                    .iter()
                    .map(Comparison::name)
                    .collect::<Vec<_>>(),
                "direction": scan.direction.map(|d| match d {
                    ScanDirection::Forward => "forward",
                    ScanDirection::Reverse => "reverse",
                }),
                "orderById": scan.order_by_id,
                "limit": scan.limit,
            }),
            CandidateSource::FullScan => serde_json::json!({"stage": "COLLSCAN"}),
        }
    }
}

/// JSON description of a plan, for `explain` and the shell.
pub fn explain_plan(plan: &QueryPlan) -> Value {
    serde_json::json!({
        "sources": plan.sources.iter().map(CandidateSource::describe).collect::<Vec<_>>(),
        "sortPushed": plan.sort_pushed,
        "limitPushed": plan.limit_pushed,
    })
}

/// Parse a filter value into a document id, when it can identify one
fn document_id_from_value(value: &Value) -> Option<DocumentId> {
    match value {
        Value::Number(n) => n.as_i64().map(DocumentId::Int),
        Value::String(s) => Some(DocumentId::String(s.clone())),
        _ => None,
    }
}

/// Build the query plan for a filter against the given indexes.
pub fn plan_query(
    filter: &Filter,
    options: &FindOptions,
    indexes: &[Arc<CollectionIndex>],
) -> QueryPlan {
    if let Some(branches) = &filter.or_branches {
        // Branches are planned without pushdown; the union is sorted and
        // limited in-process.
        // Clauses beside $or only restrict the result further; the branch
        // sources over-approximate it and the residual filter finishes the
        // job, so they need no candidates of their own.
        let mut sources = Vec::with_capacity(branches.len());
        for branch in branches {
            sources.push(plan_branch(branch, None, indexes));
        }
        let scan_needed = sources
            .iter()
            .any(|s| matches!(s, CandidateSource::FullScan));
        return QueryPlan {
            sources: if scan_needed {
                vec![CandidateSource::FullScan]
            } else {
                sources
            },
            sort_pushed: false,
            limit_pushed: false,
        };
    }

    let source = plan_branch(filter, Some(options), indexes);
    let (sort_pushed, limit_pushed) = match &source {
        CandidateSource::IndexScan { scan, .. } => (
            scan.direction.is_some() || scan.order_by_id.is_some(),
            scan.limit.is_some(),
        ),
        _ => (false, false),
    };
    QueryPlan {
        sources: vec![source],
        sort_pushed,
        limit_pushed,
    }
}

/// Plan one branch. `options` enables sort/limit pushdown and is only
/// passed for single-branch queries.
fn plan_branch(
    filter: &Filter,
    options: Option<&FindOptions>,
    indexes: &[Arc<CollectionIndex>],
) -> CandidateSource {
    // The synthetic _id_ index: concrete _id values become direct lookups.
    if let Some(values) = filter.concrete_values_for("_id") {
        let ids: Vec<DocumentId> = values
            .iter()
            .filter_map(document_id_from_value)
            .collect();
        return if ids.is_empty() {
            CandidateSource::Empty
        } else {
            CandidateSource::IdLookup(ids)
        };
    }

    // Pick the index with the most covered key fields; ties go to the
    // longer (more specific) key.
    let mut best: Option<(usize, usize, &Arc<CollectionIndex>, Vec<String>)> = None;
    for index in indexes {
        let Some(keys) = index.keys_for_query(filter) else {
            continue;
        };
        let covered = index.bucket_fields().len();
        let total = index.definition().keys.len();
        let better = match &best {
            None => true,
            Some((best_covered, best_total, _, _)) => {
                covered > *best_covered || (covered == *best_covered && total > *best_total)
            }
        };
        if better {
            best = Some((covered, total, index, keys));
        }
    }

    let Some((_, _, index, keys)) = best else {
        return CandidateSource::FullScan;
    };
    if keys.is_empty() {
        return CandidateSource::Empty;
    }

    let scan = build_entry_scan(filter, options, index);
    CandidateSource::IndexScan {
        index: Arc::clone(index),
        keys,
        scan,
    }
}

/// Residual + pushdown for the chosen index: tail-field conditions always,
/// direction when the sort spec is the index's last field or `_id`, and the
/// limit when the entry-side conditions are exact.
fn build_entry_scan(
    filter: &Filter,
    options: Option<&FindOptions>,
    index: &Arc<CollectionIndex>,
) -> EntryScan {
    let last = index.last_field();
    let conditions: Vec<Comparison> = filter
        .conditions_for(&last.field)
        .into_iter()
        .cloned()
        .collect();

    let mut scan = EntryScan {
        conditions,
        direction: None,
        order_by_id: None,
        limit: None,
    };
    let Some(options) = options else {
        return scan;
    };

    let mut sort_pushed = false;
    match options.sort.as_deref() {
        None => {
            sort_pushed = true; // no requested order; any order is correct
        }
        Some([(field, direction)]) if field.as_str() == last.field => {
            let index_descending = last.order == crate::index::Order::Descending;
            let want_descending = *direction == -1;
            scan.direction = Some(if want_descending == index_descending {
                ScanDirection::Forward
            } else {
                ScanDirection::Reverse
            });
            sort_pushed = true;
        }
        Some([(field, direction)]) if field.as_str() == "_id" => {
            scan.order_by_id = Some(*direction);
            sort_pushed = true;
        }
        Some(_) => {}
    }

    // `$exists` cannot be decided inside the entry, so a pushed limit could
    // cut off real matches; only push when every condition is exact there.
    let conditions_exact = !scan
        .conditions
        .iter()
        .any(|c| matches!(c, Comparison::Exists(_)));
    if sort_pushed && conditions_exact {
        scan.limit = options.limit;
    }

    scan
}

/// Run a planned query to completion.
pub async fn execute_find(
    store: &Arc<dyn ObjectStore>,
    collection: &str,
    filter: &Filter,
    options: &FindOptions,
    indexes: &[Arc<CollectionIndex>],
) -> Result<Vec<Document>> {
    let plan = plan_query(filter, options, indexes);
    let fan_out = options
        .limit
        .map(|l| l.clamp(1, DEFAULT_FETCH_FAN_OUT))
        .unwrap_or(DEFAULT_FETCH_FAN_OUT);

    let mut docs = if plan
        .sources
        .iter()
        .any(|s| matches!(s, CandidateSource::FullScan))
    {
        debug!(collection, "executing full scan");
        scan_all_documents(store, collection, fan_out).await?
    } else {
        let mut candidate_ids: Vec<DocumentId> = Vec::new();
        let mut seen: HashSet<DocumentId> = HashSet::new();
        for source in &plan.sources {
            for id in candidates_for_source(source).await? {
                if seen.insert(id.clone()) {
                    candidate_ids.push(id);
                }
            }
        }
        debug!(collection, candidates = candidate_ids.len(), "materialising candidates");
        fetch_documents(store, collection, candidate_ids, fan_out).await?
    };

    // The index can over-approximate; the full filter never does.
    docs.retain(|doc| filter.matches(doc));

    if !plan.sort_pushed {
        if let Some(sort) = &options.sort {
            apply_sort(&mut docs, sort);
        }
    }
    // Harmless when already enforced by the entry scans
    apply_limit(&mut docs, options.limit);
    Ok(docs)
}

/// Candidate ids of one non-scan source, in source order
async fn candidates_for_source(source: &CandidateSource) -> Result<Vec<DocumentId>> {
    match source {
        CandidateSource::Empty => Ok(Vec::new()),
        CandidateSource::IdLookup(ids) => Ok(ids.clone()),
        CandidateSource::IndexScan { index, keys, scan } => {
            let mut per_key: Vec<Vec<(DocumentId, Value)>> = Vec::with_capacity(keys.len());
            for key in keys {
                per_key.push(index.scan_key(key, scan).await?);
            }
            Ok(merge_scans(per_key, scan, index))
        }
        CandidateSource::FullScan => unreachable!("full scans bypass candidate collection"),
    }
}

/// Merge per-key scan results, preserving the pushed-down order and limit
/// across entries.
fn merge_scans(
    mut per_key: Vec<Vec<(DocumentId, Value)>>,
    scan: &EntryScan,
    index: &Arc<CollectionIndex>,
) -> Vec<DocumentId> {
    let mut merged: Vec<(DocumentId, Value)> = if per_key.len() == 1 {
        per_key.pop().unwrap()
    } else {
        let mut all: Vec<(DocumentId, Value)> = per_key.into_iter().flatten().collect();
        if let Some(direction) = scan.order_by_id {
            all.sort_by(|(a, _), (b, _)| {
                let ord = compare_values(&a.to_value(), &b.to_value());
                if direction == -1 {
                    ord.reverse()
                } else {
                    ord
                }
            });
        } else if let Some(direction) = scan.direction {
            let descending = index.last_field().order == crate::index::Order::Descending;
            all.sort_by(|(_, a), (_, b)| {
                let ord = member_order_cmp(a, b, descending);
                if direction == ScanDirection::Reverse {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        all
    };

    if let Some(limit) = scan.limit {
        merged.truncate(limit);
    }
    merged.into_iter().map(|(id, _)| id).collect()
}

/// Load the referenced documents with a bounded, order-preserving fan-out.
/// Ids whose object is gone (index over-approximation) are skipped.
pub async fn fetch_documents(
    store: &Arc<dyn ObjectStore>,
    collection: &str,
    ids: Vec<DocumentId>,
    fan_out: usize,
) -> Result<Vec<Document>> {
    let fetched: Vec<Option<Document>> = stream::iter(ids.into_iter().map(|id| {
        let store = Arc::clone(store);
        let key = document_object_key(collection, &id);
        async move {
            match store.get(&key).await {
                Ok(body) => {
                    let value: Value = serde_json::from_slice(&body.bytes).map_err(|err| {
                        SatchelError::server(format!("corrupt document {}: {}", key, err))
                    })?;
                    let doc = Document::from_value(&value).map_err(|err| {
                        SatchelError::server(format!("corrupt document {}: {}", key, err))
                    })?;
                    Ok(Some(doc))
                }
                Err(ObjectStoreError::NotFound) => Ok(None),
                Err(err) => Err(SatchelError::from(err)),
            }
        }
    }))
    .buffered(fan_out.max(1))
    .try_collect()
    .await?;

    Ok(fetched.into_iter().flatten().collect())
}

/// List + get every document of the collection.
pub async fn scan_all_documents(
    store: &Arc<dyn ObjectStore>,
    collection: &str,
    fan_out: usize,
) -> Result<Vec<Document>> {
    let listed = store
        .list(&data_prefix(collection), None)
        .await
        .map_err(SatchelError::from)?;

    let fetched: Vec<Option<Document>> = stream::iter(listed.into_iter().map(|summary| {
        let store = Arc::clone(store);
        async move {
            match store.get(&summary.key).await {
                Ok(body) => {
                    let value: Value = serde_json::from_slice(&body.bytes).map_err(|err| {
                        SatchelError::server(format!("corrupt document {}: {}", summary.key, err))
                    })?;
                    let doc = Document::from_value(&value).map_err(|err| {
                        SatchelError::server(format!("corrupt document {}: {}", summary.key, err))
                    })?;
                    Ok(Some(doc))
                }
                // Deleted between list and get
                Err(ObjectStoreError::NotFound) => Ok(None),
                Err(err) => Err(SatchelError::from(err)),
            }
        }
    }))
    .buffered(fan_out.max(1))
    .try_collect()
    .await?;

    Ok(fetched.into_iter().flatten().collect())
}
