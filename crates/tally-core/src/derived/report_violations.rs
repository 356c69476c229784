//! Violations grouped by the report that owns each transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::{
    id_field, ComputeContext, Dependency, DependencyValues, DerivedValue, ForeignKeyIndex,
    SourceValues,
};
use crate::store::keys::{self, TRANSACTION, TRANSACTION_VIOLATIONS};

pub const REPORT_VIOLATIONS: &str = "reportViolations";

/// `reportID` of a transaction that is not on any report yet.
const UNREPORTED: &str = "0";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionViolations {
    pub transaction_id: String,
    pub violations: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReportViolationsMap {
    entries: BTreeMap<String, Arc<Vec<TransactionViolations>>>,
    /// Transaction member id → report id.
    #[serde(skip)]
    reports: ForeignKeyIndex,
    /// Transaction member id → violations key.
    #[serde(skip)]
    violations: ForeignKeyIndex,
}

impl ReportViolationsMap {
    pub fn get(&self, report_id: &str) -> Option<&Arc<Vec<TransactionViolations>>> {
        self.entries.get(report_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Vec<TransactionViolations>>)> {
        self.entries.iter().map(|(id, list)| (id.as_str(), list))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ReportViolationsDerivation;

impl DerivedValue for ReportViolationsDerivation {
    type Output = ReportViolationsMap;

    fn key(&self) -> &str {
        REPORT_VIOLATIONS
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::collection(TRANSACTION),
            Dependency::collection(TRANSACTION_VIOLATIONS),
        ]
    }

    fn compute(
        &self,
        dependencies: &DependencyValues<'_>,
        context: ComputeContext<'_, ReportViolationsMap>,
    ) -> ReportViolationsMap {
        let transactions = dependencies.collection(0);
        let violations = dependencies.collection(1);
        match context.delta() {
            Some((current, sources)) => delta(current, sources, transactions, violations),
            None => full(context.current_value, transactions, violations),
        }
    }
}

type Members<'a> = BTreeMap<&'a str, &'a Value>;

fn full(
    previous: Option<&ReportViolationsMap>,
    transactions: &Members<'_>,
    violations: &Members<'_>,
) -> ReportViolationsMap {
    let mut out = ReportViolationsMap::default();
    for (key, transaction) in transactions {
        if let Some(id) = keys::member_id(TRANSACTION, key) {
            relink(&mut out, id, Some(transaction));
        }
    }
    let reports: Vec<String> = out.reports.parents().map(str::to_string).collect();
    for report_id in &reports {
        let prior = previous.and_then(|p| p.entries.get(report_id)).cloned();
        rebuild_entry(&mut out, report_id, transactions, violations, prior);
    }
    out
}

fn delta(
    current: &ReportViolationsMap,
    sources: &SourceValues,
    transactions: &Members<'_>,
    violations: &Members<'_>,
) -> ReportViolationsMap {
    let mut out = current.clone();
    let mut affected: BTreeSet<String> = BTreeSet::new();

    if let Some(changed) = sources.get(TRANSACTION) {
        for key in changed.keys() {
            let Some(id) = keys::member_id(TRANSACTION, key) else {
                continue;
            };
            if let Some(previous) = out.reports.parent(id) {
                affected.insert(previous.to_string());
            }
            relink(&mut out, id, transactions.get(key.as_str()).copied());
            if let Some(report_id) = out.reports.parent(id) {
                affected.insert(report_id.to_string());
            }
        }
    }
    if let Some(changed) = sources.get(TRANSACTION_VIOLATIONS) {
        for violations_key in changed.keys() {
            for transaction_id in out.violations.children(violations_key) {
                if let Some(report_id) = out.reports.parent(transaction_id) {
                    affected.insert(report_id.to_string());
                }
            }
        }
    }

    for report_id in &affected {
        let prior = out.entries.get(report_id).cloned();
        rebuild_entry(&mut out, report_id, transactions, violations, prior);
    }
    out
}

/// Point the indexes at the transaction's current report and violations
/// key. Unreported or removed transactions are dropped from both.
fn relink(out: &mut ReportViolationsMap, id: &str, transaction: Option<&Value>) {
    let report_id = transaction
        .and_then(|t| id_field(t, "reportID"))
        .filter(|report_id| report_id != UNREPORTED);
    match (transaction, report_id) {
        (Some(transaction), Some(report_id)) => {
            let transaction_id = transaction_id(id, transaction);
            out.reports.link(id, &report_id);
            out.violations
                .link(id, &keys::member_key(TRANSACTION_VIOLATIONS, &transaction_id));
        }
        _ => {
            out.reports.unlink(id);
            out.violations.unlink(id);
        }
    }
}

/// The per-report transform both paths share.
fn rebuild_entry(
    out: &mut ReportViolationsMap,
    report_id: &str,
    transactions: &Members<'_>,
    violations: &Members<'_>,
    prior: Option<Arc<Vec<TransactionViolations>>>,
) {
    let mut list: Vec<TransactionViolations> = out
        .reports
        .children(report_id)
        .filter_map(|id| {
            let transaction = transactions
                .get(keys::member_key(TRANSACTION, id).as_str())
                .copied()?;
            let violations_key = out.violations.parent(id)?;
            let found = violations
                .get(violations_key)
                .and_then(|v| v.as_array())
                .filter(|list| !list.is_empty())?;
            Some(TransactionViolations {
                transaction_id: transaction_id(id, transaction),
                violations: found.clone(),
            })
        })
        .collect();

    if list.is_empty() {
        out.entries.remove(report_id);
        return;
    }
    list.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
    let list = match prior {
        Some(prior) if *prior == list => prior,
        _ => Arc::new(list),
    };
    out.entries.insert(report_id.to_string(), list);
}

fn transaction_id(member_id: &str, transaction: &Value) -> String {
    id_field(transaction, "transactionID").unwrap_or_else(|| member_id.to_string())
}
