//! Key lookup seam between the upload path and identity management.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use cohort_crypto::{StudyKey, StudyPrivateKey};

#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// The private key that unwraps this participant's upload envelopes.
    async fn private_key(&self, study_id: &str, participant_id: &str)
        -> anyhow::Result<StudyPrivateKey>;

    /// The study's at-rest storage key.
    async fn storage_key(&self, study_id: &str) -> anyhow::Result<StudyKey>;
}

/// Keys held in memory, one pairing per study.
#[derive(Debug, Default, Clone)]
pub struct StaticKeys {
    studies: HashMap<String, (StudyPrivateKey, StudyKey)>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_study(
        mut self,
        study_id: impl Into<String>,
        private: StudyPrivateKey,
        storage: StudyKey,
    ) -> Self {
        self.studies.insert(study_id.into(), (private, storage));
        self
    }
}

#[async_trait]
impl KeyProvider for StaticKeys {
    async fn private_key(
        &self,
        study_id: &str,
        _participant_id: &str,
    ) -> anyhow::Result<StudyPrivateKey> {
        self.studies
            .get(study_id)
            .map(|(private, _)| private.clone())
            .with_context(|| format!("no key pairing for study {study_id}"))
    }

    async fn storage_key(&self, study_id: &str) -> anyhow::Result<StudyKey> {
        self.studies
            .get(study_id)
            .map(|(_, storage)| storage.clone())
            .with_context(|| format!("no storage key for study {study_id}"))
    }
}
