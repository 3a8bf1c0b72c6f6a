use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

/// Serialization key: one FIFO queue per `(user, workflow, branch)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BranchKey {
    pub user_id: String,
    pub workflow_id: Uuid,
    pub branch_id: String,
}

impl BranchKey {
    pub fn new(user_id: &str, workflow_id: Uuid, branch_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            workflow_id,
            branch_id: branch_id.to_string(),
        }
    }
}

/// Family of per-branch FIFO queues. Only the front element of each queue is
/// ever a dispatch candidate, which enforces branch FIFO without touching
/// the jobs themselves. Empty queues are removed so `head_candidates` never
/// yields a dead key.
///
/// Owned by the scheduler state and mutated only under the scheduler mutex.
#[derive(Debug, Default)]
pub struct BranchQueueSet {
    queues: BTreeMap<BranchKey, VecDeque<Uuid>>,
}

impl BranchQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the tail of the branch.
    pub fn append(&mut self, key: BranchKey, job_id: Uuid) {
        self.queues.entry(key).or_default().push_back(job_id);
    }

    pub fn head(&self, key: &BranchKey) -> Option<Uuid> {
        self.queues.get(key).and_then(|q| q.front().copied())
    }

    /// Remove the front element; drops the key when the queue drains.
    pub fn pop_head(&mut self, key: &BranchKey) -> Option<Uuid> {
        let q = self.queues.get_mut(key)?;
        let popped = q.pop_front();
        if q.is_empty() {
            self.queues.remove(key);
        }
        popped
    }

    /// Remove `job_id` from any position in its branch queue. Returns
    /// `Some(was_head)` if the entry was present.
    pub fn remove_if_present(&mut self, key: &BranchKey, job_id: Uuid) -> Option<bool> {
        let q = self.queues.get_mut(key)?;
        let pos = q.iter().position(|id| *id == job_id)?;
        q.remove(pos);
        if q.is_empty() {
            self.queues.remove(key);
        }
        Some(pos == 0)
    }

    /// Current head of every non-empty branch, in stable key order.
    pub fn head_candidates(&self) -> impl Iterator<Item = (&BranchKey, Uuid)> {
        self.queues
            .iter()
            .filter_map(|(key, q)| q.front().map(|id| (key, *id)))
    }

    /// True if the user has any queued entry, on any branch.
    pub fn user_has_entries(&self, user_id: &str) -> bool {
        self.queues
            .iter()
            .any(|(key, q)| key.user_id == user_id && !q.is_empty())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str, branch: &str) -> BranchKey {
        BranchKey::new(user, Uuid::nil(), branch)
    }

    #[test]
    fn fifo_within_a_branch() {
        let mut set = BranchQueueSet::new();
        let k = key("u1", "a");
        let (j1, j2, j3) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        set.append(k.clone(), j1);
        set.append(k.clone(), j2);
        set.append(k.clone(), j3);

        assert_eq!(set.head(&k), Some(j1));
        assert_eq!(set.pop_head(&k), Some(j1));
        assert_eq!(set.head(&k), Some(j2));
        assert_eq!(set.pop_head(&k), Some(j2));
        assert_eq!(set.pop_head(&k), Some(j3));
        assert_eq!(set.pop_head(&k), None);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn only_heads_are_candidates() {
        let mut set = BranchQueueSet::new();
        let ka = key("u1", "a");
        let kb = key("u2", "b");
        let (j1, j2, j3) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        set.append(ka.clone(), j1);
        set.append(ka.clone(), j2);
        set.append(kb.clone(), j3);

        let heads: Vec<Uuid> = set.head_candidates().map(|(_, id)| id).collect();
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(&j1));
        assert!(heads.contains(&j3));
        assert!(!heads.contains(&j2));
    }

    #[test]
    fn removing_the_head_promotes_the_next_entry() {
        let mut set = BranchQueueSet::new();
        let k = key("u1", "a");
        let (j1, j2) = (Uuid::now_v7(), Uuid::now_v7());
        set.append(k.clone(), j1);
        set.append(k.clone(), j2);

        assert_eq!(set.remove_if_present(&k, j1), Some(true));
        assert_eq!(set.head(&k), Some(j2));
    }

    #[test]
    fn removing_a_middle_entry_keeps_other_heads_stable() {
        let mut set = BranchQueueSet::new();
        let k = key("u1", "a");
        let (j1, j2, j3) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        set.append(k.clone(), j1);
        set.append(k.clone(), j2);
        set.append(k.clone(), j3);

        assert_eq!(set.remove_if_present(&k, j2), Some(false));
        assert_eq!(set.head(&k), Some(j1));
        assert_eq!(set.remove_if_present(&k, j2), None);

        set.pop_head(&k);
        assert_eq!(set.head(&k), Some(j3));
    }

    #[test]
    fn drained_branches_disappear() {
        let mut set = BranchQueueSet::new();
        let k = key("u1", "a");
        let j1 = Uuid::now_v7();
        set.append(k.clone(), j1);

        assert!(set.user_has_entries("u1"));
        assert_eq!(set.remove_if_present(&k, j1), Some(true));
        assert!(!set.user_has_entries("u1"));
        assert_eq!(set.head_candidates().count(), 0);
    }
}
