use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata recorded for one published commit.
///
/// `repository` and `commit_id` are identity fields: they travel with the
/// record in memory but are not serialized, and get reconstructed from
/// context when an index is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    #[serde(skip)]
    pub repository: String,
    #[serde(skip)]
    pub commit_id: String,
    /// Branch name without any `refs/heads/` prefix.
    pub branch: String,
    pub environment: String,
    #[serde(rename = "date")]
    pub timestamp: DateTime<Utc>,
}

impl CommitMeta {
    pub fn new(
        repository: impl Into<String>,
        commit_id: impl Into<String>,
        branch: impl Into<String>,
        environment: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        CommitMeta {
            repository: repository.into(),
            commit_id: commit_id.into(),
            branch: branch.into(),
            environment: environment.into(),
            timestamp,
        }
    }
}

/// The authoritative map from commit id to commit metadata for one
/// repository, persisted as a single YAML object in the tenant's bucket.
///
/// A missing index object deserializes to the empty index; it is never an
/// error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageIndex {
    entries: BTreeMap<String, CommitMeta>,
}

impl PageIndex {
    pub fn new() -> Self {
        PageIndex::default()
    }

    pub fn get_by_commit(&self, commit_id: &str) -> Option<&CommitMeta> {
        self.entries.get(commit_id)
    }

    /// The newest commit on `branch`: greatest timestamp, with equal
    /// timestamps broken by the lexicographically greatest commit id so the
    /// choice is deterministic.
    pub fn latest_for_branch(&self, branch: &str) -> Option<&CommitMeta> {
        self.entries
            .values()
            .filter(|meta| meta.branch == branch)
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.commit_id.cmp(&b.commit_id))
            })
    }

    /// Inserts or overwrites the entry for `meta.commit_id`.
    pub fn merge(&mut self, meta: CommitMeta) {
        self.entries.insert(meta.commit_id.clone(), meta);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restores the identity fields that serialization drops. Called after
    /// deserializing an index for `repository`.
    pub(crate) fn attach_identity(&mut self, repository: &str) {
        for (commit_id, meta) in &mut self.entries {
            meta.repository = repository.to_string();
            meta.commit_id = commit_id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn index() -> PageIndex {
        let mut index = PageIndex::new();
        index.merge(CommitMeta::new("org/repo", "aaa111", "main", "prod", at(10)));
        index.merge(CommitMeta::new("org/repo", "bbb222", "main", "prod", at(12)));
        index.merge(CommitMeta::new(
            "org/repo",
            "ccc333",
            "feature-x",
            "preview",
            at(11),
        ));
        index
    }

    #[test]
    fn test_get_by_commit() {
        let index = index();
        assert_eq!(index.get_by_commit("aaa111").unwrap().branch, "main");
        assert!(index.get_by_commit("zzz999").is_none());
    }

    #[test]
    fn test_latest_for_branch_picks_newest() {
        let index = index();
        let latest = index.latest_for_branch("main").unwrap();
        assert_eq!(latest.commit_id, "bbb222");

        assert_eq!(
            index.latest_for_branch("feature-x").unwrap().commit_id,
            "ccc333"
        );
        assert!(index.latest_for_branch("gone").is_none());
    }

    #[test]
    fn test_latest_for_branch_equal_timestamps() {
        let mut index = PageIndex::new();
        index.merge(CommitMeta::new("org/repo", "abc", "main", "", at(10)));
        index.merge(CommitMeta::new("org/repo", "abd", "main", "", at(10)));
        index.merge(CommitMeta::new("org/repo", "aaa", "main", "", at(10)));

        // equal timestamps: lexicographically greatest commit id wins
        assert_eq!(index.latest_for_branch("main").unwrap().commit_id, "abd");
    }

    #[test]
    fn test_merge_overwrites() {
        let mut index = index();
        index.merge(CommitMeta::new(
            "org/repo",
            "aaa111",
            "release",
            "prod",
            at(20),
        ));

        assert_eq!(index.len(), 3);
        assert_eq!(index.get_by_commit("aaa111").unwrap().branch, "release");
    }

    #[test]
    fn test_yaml_round_trip() {
        let before = index();
        let yaml = serde_yaml::to_string(&before).unwrap();

        // identity fields are not part of the wire format
        assert!(!yaml.contains("org/repo"));
        assert!(yaml.contains("branch: main"));

        let mut after: PageIndex = serde_yaml::from_str(&yaml).unwrap();
        after.attach_identity("org/repo");
        assert_eq!(before, after);
    }

    #[test]
    fn test_empty_document_is_empty_index() {
        let index: PageIndex = serde_yaml::from_str("{}").unwrap();
        assert!(index.is_empty());
    }
}
