//! Per-project reconciliation: poll every tracked number once, compare with
//! stored state, and write the resulting history, notification and status.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wqm_core::{
    map_limit_tier, map_quality, ChangeNotification, Direction, MappingError, QualityRating,
    TrackedNumber,
};
use wqm_provider::{Credential, NumberDetail, ProviderError, StatusProvider};
use wqm_storage::{
    CredentialRepository, HistoryStore, NewHistoryEntry, StatusChange, StatusUpdate, StorageError,
    Store,
};

/// Stored when a number is registered without a tier in the response.
pub const UNKNOWN_LIMIT_TIER: &str = "Unknown";

/// Result of polling a single number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PollOutcome {
    /// No usable credential. Nothing is written.
    Skipped,
    Unchanged,
    Changed { notified: bool },
    MappingError,
    ProviderError,
    PersistenceError,
}

impl PollOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PollOutcome::Skipped => "skipped",
            PollOutcome::Unchanged => "unchanged",
            PollOutcome::Changed { .. } => "changed",
            PollOutcome::MappingError => "mapping_error",
            PollOutcome::ProviderError => "provider_error",
            PollOutcome::PersistenceError => "persistence_error",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            PollOutcome::MappingError | PollOutcome::ProviderError | PollOutcome::PersistenceError
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Numbers that reached the provider call.
    pub checked: usize,
    pub updated: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl ReconcileSummary {
    pub fn record(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Skipped => {
                self.skipped += 1;
                return;
            }
            PollOutcome::Changed { .. } => self.updated += 1,
            PollOutcome::Unchanged => {}
            _ => self.errors += 1,
        }
        self.checked += 1;
    }

    pub fn merge(&mut self, other: ReconcileSummary) {
        self.checked += other.checked;
        self.updated += other.updated;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }

    /// Short line shown after a manual "update now".
    pub fn toast(&self) -> String {
        if self.errors == 0 {
            format!("{} checked, {} updated", self.checked, self.updated)
        } else {
            format!(
                "{} updated, {} errors - check the warning indicators",
                self.updated, self.errors
            )
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("phone number id must not be blank")]
    BlankPhoneNumberId,
    #[error("a business manager with a usable access token is required")]
    MissingCredential,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
enum ResolvedCredential {
    Usable(Credential),
    Missing,
    LookupFailed,
}

pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    provider: Arc<dyn StatusProvider>,
    number_concurrency: usize,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn StatusProvider>) -> Self {
        Self {
            store,
            provider,
            number_concurrency: 4,
        }
    }

    pub fn with_number_concurrency(mut self, limit: usize) -> Self {
        self.number_concurrency = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Polls every number of the project. Per-number failures are folded
    /// into the summary; only failing to list the numbers is an `Err`.
    pub async fn reconcile_project(
        &self,
        project_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let span = info_span!("reconcile_project", %project_id);
        self.reconcile_numbers(project_id, now).instrument(span).await
    }

    async fn reconcile_numbers(
        &self,
        project_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let numbers = self
            .store
            .numbers_for_projects(&[project_id])
            .await
            .with_context(|| format!("loading numbers for project {project_id}"))?;

        let credentials = self.resolve_credentials(&numbers).await;
        let polls = numbers.into_iter().map(|number| {
            let resolved = number
                .business_manager_id
                .and_then(|id| credentials.get(&id).cloned())
                .unwrap_or(ResolvedCredential::Missing);
            async move { self.poll_resolved(&number, resolved, now).await }
        });
        let outcomes: Vec<PollOutcome> = stream::iter(polls)
            .buffer_unordered(self.number_concurrency)
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        info!(
            checked = summary.checked,
            updated = summary.updated,
            errors = summary.errors,
            skipped = summary.skipped,
            "project reconciled"
        );
        Ok(summary)
    }

    /// One lookup per distinct business manager.
    async fn resolve_credentials(
        &self,
        numbers: &[TrackedNumber],
    ) -> HashMap<Uuid, ResolvedCredential> {
        let mut resolved = HashMap::new();
        for bm_id in numbers.iter().filter_map(|n| n.business_manager_id) {
            if resolved.contains_key(&bm_id) {
                continue;
            }
            let credential = match self.store.business_manager(bm_id).await {
                Ok(Some(bm)) if bm.has_usable_token() => {
                    ResolvedCredential::Usable(Credential::bearer(bm.access_token))
                }
                Ok(_) => ResolvedCredential::Missing,
                Err(err) => {
                    error!(business_manager_id = %bm_id, error = %err, "credential lookup failed");
                    ResolvedCredential::LookupFailed
                }
            };
            resolved.insert(bm_id, credential);
        }
        resolved
    }

    async fn poll_resolved(
        &self,
        number: &TrackedNumber,
        resolved: ResolvedCredential,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        match resolved {
            ResolvedCredential::Usable(credential) => {
                self.poll_number(number, Some(credential), now).await
            }
            ResolvedCredential::Missing => self.poll_number(number, None, now).await,
            ResolvedCredential::LookupFailed => PollOutcome::PersistenceError,
        }
    }

    pub async fn poll_number(
        &self,
        number: &TrackedNumber,
        credential: Option<Credential>,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        let Some(credential) = credential else {
            debug!(number_id = %number.id, "no usable credential; skipping");
            return PollOutcome::Skipped;
        };

        let detail = match self
            .provider
            .fetch_number_detail(&number.phone_number_id, &credential)
            .await
        {
            Ok(detail) => detail,
            Err(err) => {
                warn!(number_id = %number.id, error = %err, "provider call failed");
                return self
                    .record_failure(number, err.to_string(), PollOutcome::ProviderError, now)
                    .await;
            }
        };

        let quality = match map_quality(detail.quality_rating.as_deref()) {
            Ok(quality) => quality,
            Err(err) => {
                warn!(number_id = %number.id, error = %err, "unmappable quality rating");
                return self
                    .record_failure(number, err.to_string(), PollOutcome::MappingError, now)
                    .await;
            }
        };
        // A response without a tier keeps the stored one.
        let limit_tier = detail
            .messaging_limit_tier
            .as_deref()
            .map(map_limit_tier)
            .unwrap_or_else(|| number.messaging_limit_tier.clone());

        let written = if quality != number.quality_rating
            || limit_tier != number.messaging_limit_tier
        {
            self.apply_change(number, quality, limit_tier, &detail, now)
                .await
                .map(|notified| PollOutcome::Changed { notified })
        } else {
            self.record_steady(number, now)
                .await
                .map(|_| PollOutcome::Unchanged)
        };

        match written {
            Ok(outcome) => {
                debug!(number_id = %number.id, outcome = outcome.as_str(), "number polled");
                outcome
            }
            Err(err) => {
                error!(number_id = %number.id, error = %err, "persisting poll result failed");
                PollOutcome::PersistenceError
            }
        }
    }

    async fn apply_change(
        &self,
        number: &TrackedNumber,
        quality: QualityRating,
        limit_tier: String,
        detail: &NumberDetail,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let direction = Direction::between(number.quality_rating, quality);
        let notification = direction.map(|direction| ChangeNotification {
            id: Uuid::new_v4(),
            tracked_number_id: number.id,
            project_id: number.project_id,
            previous_quality: number.quality_rating,
            new_quality: quality,
            direction,
            created_at: now,
        });
        let observation = format!(
            "quality {} to {}, limit {} to {}",
            number.quality_rating, quality, number.messaging_limit_tier, limit_tier
        );

        self.store
            .record_change(&StatusChange {
                number_id: number.id,
                history: NewHistoryEntry::change(number, quality, limit_tier.clone())
                    .with_observation(observation),
                update: StatusUpdate {
                    quality_rating: quality,
                    messaging_limit_tier: limit_tier,
                    previous_quality: number.quality_rating,
                    verified_name: detail.verified_name.clone(),
                    display_number: detail.display_phone_number.clone(),
                    changed_at: now,
                },
                notification,
            })
            .await?;

        info!(
            number_id = %number.id,
            previous = %number.quality_rating,
            current = %quality,
            direction = direction.map(Direction::as_str).unwrap_or("none"),
            "status changed"
        );
        Ok(direction.is_some())
    }

    async fn record_steady(&self, number: &TrackedNumber, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.store
            .append_or_compact(NewHistoryEntry::steady(number), now)
            .await?;
        self.store.touch_checked(number.id, now).await
    }

    /// Audit row plus `last_checked_at`; stored quality and limit stay as they were.
    async fn record_failure(
        &self,
        number: &TrackedNumber,
        message: String,
        outcome: PollOutcome,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        let written = match self
            .store
            .append_or_compact(NewHistoryEntry::error(number, message), now)
            .await
        {
            Ok(_) => self.store.touch_checked(number.id, now).await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => outcome,
            Err(err) => {
                error!(number_id = %number.id, error = %err, "recording poll failure failed");
                PollOutcome::PersistenceError
            }
        }
    }

    /// Fetches the number once and stores it together with its first
    /// history row. Nothing is written when the fetch or mapping fails.
    pub async fn register_number(
        &self,
        project_id: Uuid,
        phone_number_id: &str,
        business_manager_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<TrackedNumber, RegistrationError> {
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(RegistrationError::BlankPhoneNumberId);
        }
        let bm_id = business_manager_id.ok_or(RegistrationError::MissingCredential)?;
        let bm = self
            .store
            .business_manager(bm_id)
            .await?
            .ok_or(StorageError::NotFound {
                entity: "business manager",
                id: bm_id,
            })?;
        if !bm.has_usable_token() {
            return Err(RegistrationError::MissingCredential);
        }
        let credential = Credential::bearer(bm.access_token);

        let detail = self
            .provider
            .fetch_number_detail(phone_number_id, &credential)
            .await?;
        let quality = map_quality(detail.quality_rating.as_deref())?;
        let limit_tier = detail
            .messaging_limit_tier
            .as_deref()
            .map(map_limit_tier)
            .unwrap_or_else(|| UNKNOWN_LIMIT_TIER.to_string());

        let number = TrackedNumber {
            id: Uuid::new_v4(),
            project_id,
            phone_number_id: phone_number_id.to_string(),
            business_manager_id: Some(bm_id),
            display_number: detail.display_phone_number,
            verified_name: detail.verified_name,
            quality_rating: quality,
            messaging_limit_tier: limit_tier,
            previous_quality: None,
            last_status_change: None,
            last_checked_at: Some(now),
            visible: true,
            created_at: now,
        };
        self.store.insert_number(&number).await?;
        self.store
            .append_or_compact(
                NewHistoryEntry::steady(&number).with_observation("registered"),
                now,
            )
            .await?;
        info!(
            %project_id,
            number_id = %number.id,
            quality = %number.quality_rating,
            credential = %credential.fingerprint(),
            "number registered"
        );
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_checked_but_not_skipped() {
        let mut summary = ReconcileSummary::default();
        for outcome in [
            PollOutcome::Skipped,
            PollOutcome::Unchanged,
            PollOutcome::Changed { notified: true },
            PollOutcome::Changed { notified: false },
            PollOutcome::ProviderError,
            PollOutcome::PersistenceError,
        ] {
            summary.record(outcome);
        }
        assert_eq!(
            summary,
            ReconcileSummary {
                checked: 5,
                updated: 2,
                errors: 2,
                skipped: 1,
            }
        );
    }

    #[test]
    fn toast_mentions_errors_only_when_present() {
        let clean = ReconcileSummary {
            checked: 3,
            updated: 1,
            ..Default::default()
        };
        assert_eq!(clean.toast(), "3 checked, 1 updated");

        let noisy = ReconcileSummary {
            checked: 3,
            updated: 1,
            errors: 2,
            skipped: 0,
        };
        assert!(noisy.toast().contains("2 errors"));
    }

    #[test]
    fn error_outcomes_are_flagged() {
        assert!(PollOutcome::MappingError.is_error());
        assert!(!PollOutcome::Skipped.is_error());
        assert!(!PollOutcome::Changed { notified: false }.is_error());
    }
}
