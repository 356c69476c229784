//! Per-report action metadata: newest action, sorted action ids, newest
//! visible action and unread state.
//!
//! A report's actions live in `reportActions_{reportID}`, where `reportID` is
//! read from the report record itself. The output keeps an index from each
//! actions key to the reports reading it, so an action change can be routed
//! to the right entries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::{
    id_field, str_field, ComputeContext, Dependency, DependencyValues, DerivedValue,
    ForeignKeyIndex, SourceValues,
};
use crate::store::keys::{self, REPORT, REPORT_ACTIONS};

pub const REPORT_METADATA: &str = "reportMetadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub report_id: String,
    pub last_report_action: Option<String>,
    /// Newest first.
    pub sorted_action_ids: Vec<String>,
    pub last_visible_action: Option<String>,
    pub last_visible_action_created: Option<String>,
    pub last_read_time: Option<String>,
    pub is_unread: bool,
    pub unread_count: usize,
}

/// Metadata for every report, keyed by the report's member id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReportMetadataMap {
    entries: BTreeMap<String, Arc<ReportMetadata>>,
    /// Entry id → actions key it was built from.
    #[serde(skip)]
    actions: ForeignKeyIndex,
}

impl ReportMetadataMap {
    pub fn get(&self, id: &str) -> Option<&Arc<ReportMetadata>> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<ReportMetadata>)> {
        self.entries.iter().map(|(id, meta)| (id.as_str(), meta))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derivation over `reportActions_` and `report_`.
#[derive(Debug, Default)]
pub struct ReportMetadataDerivation;

impl DerivedValue for ReportMetadataDerivation {
    type Output = ReportMetadataMap;

    fn key(&self) -> &str {
        REPORT_METADATA
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::collection(REPORT_ACTIONS),
            Dependency::collection(REPORT),
        ]
    }

    fn compute(
        &self,
        dependencies: &DependencyValues<'_>,
        context: ComputeContext<'_, ReportMetadataMap>,
    ) -> ReportMetadataMap {
        let actions = dependencies.collection(0);
        let reports = dependencies.collection(1);
        match context.delta() {
            Some((current, sources)) => delta(current, sources, reports, actions),
            None => full(context.current_value, reports, actions),
        }
    }
}

type Members<'a> = BTreeMap<&'a str, &'a Value>;

fn full(
    previous: Option<&ReportMetadataMap>,
    reports: &Members<'_>,
    actions: &Members<'_>,
) -> ReportMetadataMap {
    let mut out = ReportMetadataMap::default();
    for (key, report) in reports {
        let Some(id) = keys::member_id(REPORT, key) else {
            continue;
        };
        let prior = previous.and_then(|p| p.entries.get(id));
        rebuild_entry(&mut out, id, Some(report), actions, prior.cloned());
    }
    out
}

fn delta(
    current: &ReportMetadataMap,
    sources: &SourceValues,
    reports: &Members<'_>,
    actions: &Members<'_>,
) -> ReportMetadataMap {
    let mut affected: BTreeSet<String> = BTreeSet::new();
    if let Some(changed) = sources.get(REPORT) {
        affected.extend(
            changed
                .keys()
                .filter_map(|key| keys::member_id(REPORT, key))
                .map(str::to_string),
        );
    }
    if let Some(changed) = sources.get(REPORT_ACTIONS) {
        for actions_key in changed.keys() {
            affected.extend(current.actions.children(actions_key).map(str::to_string));
        }
    }

    let mut out = current.clone();
    for id in &affected {
        let report = reports.get(keys::member_key(REPORT, id).as_str()).copied();
        let prior = out.entries.get(id.as_str()).cloned();
        rebuild_entry(&mut out, id, report, actions, prior);
    }
    out
}

/// The per-report transform both paths share.
fn rebuild_entry(
    out: &mut ReportMetadataMap,
    id: &str,
    report: Option<&Value>,
    actions: &Members<'_>,
    prior: Option<Arc<ReportMetadata>>,
) {
    let Some(report) = report else {
        out.entries.remove(id);
        out.actions.unlink(id);
        return;
    };

    let report_id = id_field(report, "reportID").unwrap_or_else(|| id.to_string());
    let actions_key = keys::member_key(REPORT_ACTIONS, &report_id);
    let meta = build_metadata(
        report_id,
        report,
        actions.get(actions_key.as_str()).copied(),
    );

    out.actions.link(id, &actions_key);
    let meta = match prior {
        Some(prior) if *prior == meta => prior,
        _ => Arc::new(meta),
    };
    out.entries.insert(id.to_string(), meta);
}

struct ActionView<'a> {
    id: String,
    created: &'a str,
    visible: bool,
}

fn build_metadata(report_id: String, report: &Value, actions: Option<&Value>) -> ReportMetadata {
    let mut views: Vec<ActionView<'_>> = actions
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(_, action)| action.is_object())
                .map(|(key, action)| ActionView {
                    id: id_field(action, "reportActionID").unwrap_or_else(|| key.clone()),
                    created: str_field(action, "created").unwrap_or(""),
                    visible: is_visible(action),
                })
                .collect()
        })
        .unwrap_or_default();

    // Newest first; ties broken by id so the order is total.
    views.sort_by(|a, b| b.created.cmp(a.created).then_with(|| b.id.cmp(&a.id)));

    let last_read_time = str_field(report, "lastReadTime").map(str::to_string);
    let last_visible = views.iter().find(|v| v.visible);
    let unread_count = views
        .iter()
        .filter(|v| v.visible)
        .filter(|v| match &last_read_time {
            Some(read) => v.created > read.as_str(),
            None => true,
        })
        .count();

    ReportMetadata {
        report_id,
        last_report_action: views.first().map(|v| v.id.clone()),
        sorted_action_ids: views.iter().map(|v| v.id.clone()).collect(),
        last_visible_action: last_visible.map(|v| v.id.clone()),
        last_visible_action_created: last_visible.map(|v| v.created.to_string()),
        is_unread: unread_count > 0,
        unread_count,
        last_read_time,
    }
}

/// Hidden: `shouldShow: false`, pending offline deletion, or an empty
/// message on anything but a deleted thread parent.
fn is_visible(action: &Value) -> bool {
    if action.get("shouldShow").and_then(Value::as_bool) == Some(false) {
        return false;
    }
    if str_field(action, "pendingAction") == Some("delete") {
        return false;
    }
    let deleted_parent = action
        .get("isDeletedParentAction")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    deleted_parent || !message_is_empty(action)
}

fn message_is_empty(action: &Value) -> bool {
    match action.get("message") {
        Some(Value::Array(parts)) => parts
            .iter()
            .all(|part| str_field(part, "html").map_or(true, str::is_empty)),
        Some(Value::Object(_)) => action
            .get("message")
            .and_then(|m| str_field(m, "html"))
            .map_or(true, str::is_empty),
        // Actions without a message body (e.g. CREATED) are not deletions.
        None => false,
        Some(Value::String(text)) => text.is_empty(),
        Some(_) => true,
    }
}
