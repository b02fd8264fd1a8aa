use std::time::Duration;

use bson::oid::ObjectId;

use crate::protocol::OperationResult;

/// Identifiers of the documents a create batch produced, by task index.
///
/// Slots whose create failed stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierSet {
    slots: Vec<Option<ObjectId>>,
}

impl IdentifierSet {
    pub fn get(&self, index: usize) -> Option<ObjectId> {
        self.slots.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn populated(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<ObjectId>> + '_ {
        self.slots.iter().copied()
    }
}

impl From<Vec<Option<ObjectId>>> for IdentifierSet {
    fn from(slots: Vec<Option<ObjectId>>) -> Self {
        Self { slots }
    }
}

impl From<&BatchReport> for IdentifierSet {
    fn from(report: &BatchReport) -> Self {
        report
            .results
            .iter()
            .map(|r| r.identifier)
            .collect::<Vec<_>>()
            .into()
    }
}

/// Every result of one batch, in task order.
#[derive(Debug)]
pub struct BatchReport {
    pub name: &'static str,
    pub results: Vec<OperationResult>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.total() - self.failed()
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub identifiers: IdentifierSet,
    pub batches: Vec<BatchReport>,
    /// Collection size checks, `None` where the count itself failed.
    pub counts: Vec<(&'static str, Option<i64>)>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        let batches: usize = self.batches.iter().map(BatchReport::failed).sum();
        batches + self.counts.iter().filter(|(_, c)| c.is_none()).count()
    }

    pub fn batch(&self, name: &str) -> Option<&BatchReport> {
        self.batches.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;

    #[test]
    fn identifier_set_slots() {
        let id = ObjectId::new();
        let ids = IdentifierSet::from(vec![Some(id), None]);

        assert_eq!(ids.len(), 2);
        assert_eq!(ids.populated(), 1);
        assert_eq!(ids.get(0), Some(id));
        assert_eq!(ids.get(1), None);
        assert_eq!(ids.get(7), None);
    }

    #[test]
    fn batch_report_counts() {
        let id = ObjectId::new();
        let report = BatchReport {
            name: "create",
            results: vec![
                OperationResult {
                    identifier: Some(id),
                    ..Default::default()
                },
                OperationResult::from_error(ClientError::Abandoned(1)),
                OperationResult {
                    error: "Not found".to_string(),
                    ..Default::default()
                },
            ],
            elapsed: Duration::ZERO,
        };

        assert_eq!(report.total(), 3);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(
            IdentifierSet::from(&report),
            IdentifierSet::from(vec![Some(id), None, None])
        );
    }
}
