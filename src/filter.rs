use std::collections::HashMap;

use crate::error::InsertError;
use crate::fields::MatchField;
use crate::warmup::WarmupIndex;

/// The host's view of a message being queued.
pub trait QueueContext {
    /// Local addresses the message may currently be sent from.
    fn local_ips(&self) -> Vec<String>;
    fn set_local_ips(&mut self, local_ips: Vec<String>);
    /// Value of a message attribute; the filter asks for each field at most once.
    fn message_attribute(&mut self, field: MatchField) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Candidate list left as the host supplied it.
    Unchanged,
    /// Candidate list replaced with the addresses that passed warm-up.
    Narrowed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub kept: Vec<String>,
    pub modified: bool,
}

/// Queue-insert hook vetoing local addresses that are still warming up.
#[derive(Debug, Clone)]
pub struct InsertFilter {
    index: WarmupIndex,
}

impl InsertFilter {
    pub fn new(index: WarmupIndex) -> Self {
        InsertFilter { index }
    }

    pub fn apply(&self, ctx: &mut dyn QueueContext) -> Result<FilterOutcome, InsertError> {
        let candidates = ctx.local_ips();
        let selection = self.select(&candidates, |field| ctx.message_attribute(field));

        if !selection.modified {
            return Ok(FilterOutcome::Unchanged);
        }
        if selection.kept.is_empty() {
            log::debug!(
                "No local address left after warm-up filtering of {:?}",
                candidates
            );
            return Err(InsertError::NoViableAddress);
        }

        log::debug!("Warm-up narrowed {:?} to {:?}", candidates, selection.kept);
        ctx.set_local_ips(selection.kept);
        Ok(FilterOutcome::Narrowed)
    }

    /// Splits `candidates` into the addresses to keep. An address without
    /// predicates is always kept; one with predicates is kept when any of
    /// them matches the message.
    pub fn select<F>(&self, candidates: &[String], mut attribute: F) -> Selection
    where
        F: FnMut(MatchField) -> String,
    {
        let mut cache: HashMap<MatchField, String> = HashMap::new();
        let mut selection = Selection {
            kept: Vec::with_capacity(candidates.len()),
            modified: false,
        };
        for address in candidates {
            match self.index.evaluate(address, &mut cache, &mut attribute) {
                Some(false) => selection.modified = true,
                Some(true) | None => selection.kept.push(address.clone()),
            }
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldMask;
    use crate::protocol::Identifier;
    use crate::warmup::WarmupPredicate;

    struct TestQueue {
        local_ips: Vec<String>,
        attributes: HashMap<MatchField, String>,
        fetches: Vec<MatchField>,
        writes: usize,
    }

    impl TestQueue {
        fn new(local_ips: &[&str], remote_ip: &str) -> Self {
            TestQueue {
                local_ips: local_ips.iter().map(|ip| ip.to_string()).collect(),
                attributes: HashMap::from([(MatchField::RemoteIp, remote_ip.to_string())]),
                fetches: Vec::new(),
                writes: 0,
            }
        }
    }

    impl QueueContext for TestQueue {
        fn local_ips(&self) -> Vec<String> {
            self.local_ips.clone()
        }

        fn set_local_ips(&mut self, local_ips: Vec<String>) {
            self.writes += 1;
            self.local_ips = local_ips;
        }

        fn message_attribute(&mut self, field: MatchField) -> String {
            self.fetches.push(field);
            self.attributes.get(&field).cloned().unwrap_or_default()
        }
    }

    fn filter_with_remote_ip_rule() -> (WarmupIndex, InsertFilter) {
        let index = WarmupIndex::new();
        index.upsert(WarmupPredicate::new(
            Identifier::policy("warm-1"),
            "10.0.0.1",
            FieldMask::EMPTY.with(MatchField::RemoteIp),
            vec!["1.2.3.4".to_string()],
        ));
        let filter = InsertFilter::new(index.clone());
        (index, filter)
    }

    #[test]
    fn test_matching_message_leaves_candidates_untouched() {
        let (_, filter) = filter_with_remote_ip_rule();
        let mut queue = TestQueue::new(&["10.0.0.1", "10.0.0.2"], "1.2.3.4");

        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Unchanged));
        assert_eq!(queue.local_ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(queue.writes, 0);
    }

    #[test]
    fn test_mismatching_message_excludes_address() {
        let (_, filter) = filter_with_remote_ip_rule();
        let mut queue = TestQueue::new(&["10.0.0.1", "10.0.0.2"], "5.6.7.8");

        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Narrowed));
        assert_eq!(queue.local_ips, vec!["10.0.0.2"]);
        assert_eq!(queue.writes, 1);
    }

    #[test]
    fn test_exhaustion_reports_no_ips() {
        let (_, filter) = filter_with_remote_ip_rule();
        let mut queue = TestQueue::new(&["10.0.0.1"], "5.6.7.8");

        let err = filter.apply(&mut queue).unwrap_err();
        assert_eq!(err, InsertError::NoViableAddress);
        assert_eq!(err.payload(), serde_json::json!({"error": "NO_IPS"}));
        assert_eq!(queue.local_ips, vec!["10.0.0.1"]);
        assert_eq!(queue.writes, 0);
    }

    #[test]
    fn test_removed_predicate_no_longer_excludes() {
        let (index, filter) = filter_with_remote_ip_rule();
        index.remove_by_identifier(&Identifier::policy("warm-1"));

        let mut queue = TestQueue::new(&["10.0.0.1", "10.0.0.2"], "5.6.7.8");
        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Unchanged));
        assert_eq!(queue.local_ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_any_predicate_may_admit_address() {
        let (index, filter) = filter_with_remote_ip_rule();
        index.upsert(WarmupPredicate::new(
            Identifier::policy("warm-2"),
            "10.0.0.1",
            FieldMask::EMPTY.with(MatchField::RemoteIp),
            vec!["5.6.7.8".to_string()],
        ));

        let mut queue = TestQueue::new(&["10.0.0.1"], "5.6.7.8");
        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Unchanged));
    }

    #[test]
    fn test_attributes_fetched_once_per_message() {
        let (index, filter) = filter_with_remote_ip_rule();
        index.upsert(WarmupPredicate::new(
            Identifier::policy("warm-3"),
            "10.0.0.3",
            FieldMask::EMPTY.with(MatchField::RemoteIp),
            vec!["9.9.9.9".to_string()],
        ));

        let mut queue = TestQueue::new(&["10.0.0.1", "10.0.0.3", "10.0.0.4"], "5.6.7.8");
        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Narrowed));
        assert_eq!(queue.local_ips, vec!["10.0.0.4"]);
        assert_eq!(queue.fetches, vec![MatchField::RemoteIp]);
    }

    #[test]
    fn test_no_predicates_fetches_nothing() {
        let filter = InsertFilter::new(WarmupIndex::new());
        let mut queue = TestQueue::new(&["10.0.0.1"], "1.2.3.4");
        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Unchanged));
        assert!(queue.fetches.is_empty());
    }

    #[test]
    fn test_empty_candidate_list_passes_through() {
        let (_, filter) = filter_with_remote_ip_rule();
        let mut queue = TestQueue::new(&[], "5.6.7.8");
        assert_eq!(filter.apply(&mut queue), Ok(FilterOutcome::Unchanged));
    }

    #[test]
    fn test_unconditional_predicate_always_admits() {
        let index = WarmupIndex::new();
        index.upsert(WarmupPredicate::new(
            Identifier::suspend("s-1"),
            "10.0.0.1",
            FieldMask::EMPTY,
            Vec::new(),
        ));
        let filter = InsertFilter::new(index);
        let selection = filter.select(&["10.0.0.1".to_string()], |_| String::new());
        assert_eq!(
            selection,
            Selection {
                kept: vec!["10.0.0.1".to_string()],
                modified: false
            }
        );
    }
}
