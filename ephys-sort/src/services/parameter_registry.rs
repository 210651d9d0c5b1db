//! Parameter registry
//!
//! Registration is idempotent on identical content and fails closed otherwise:
//! - same name, same (sorter, options) → existing id
//! - same name, different content → `DuplicateNameConflict`
//! - different name, same content → `DuplicateContentConflict`
//!
//! The UNIQUE constraints on `name` and `fingerprint` settle races between
//! concurrent registrations; the loser re-reads and applies the same rules.

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::db::parameter_sets::{self, NewParameterSet};
use crate::error::{Result, SortError};
use crate::models::{fingerprint, Fingerprint, Options, ParameterSet, ParameterSetId};
use crate::services::sorter_catalog::SorterCatalog;

#[derive(Clone)]
pub struct ParameterRegistry {
    db: SqlitePool,
    catalog: Arc<SorterCatalog>,
}

impl ParameterRegistry {
    pub fn new(db: SqlitePool, catalog: Arc<SorterCatalog>) -> Self {
        Self { db, catalog }
    }

    pub async fn register(
        &self,
        name: &str,
        sorter_name: &str,
        options: Options,
        description: &str,
    ) -> Result<ParameterSetId> {
        if name.trim().is_empty() {
            return Err(SortError::Common(ephys_common::Error::InvalidInput(
                "parameter set name must not be empty".to_string(),
            )));
        }
        self.catalog.require(sorter_name)?;

        let fp = fingerprint(sorter_name, &options);

        if let Some(id) = self.check_existing(name, &fp).await? {
            return Ok(id);
        }

        let inserted = parameter_sets::insert_parameter_set(
            &self.db,
            &NewParameterSet {
                name,
                sorter_name,
                description,
                options: &options,
                fingerprint: &fp,
                created_at: ephys_common::time::now(),
            },
        )
        .await?;

        match inserted {
            Some(id) => {
                info!(paramset = name, sorter = sorter_name, fingerprint = %fp, "Registered parameter set");
                Ok(id)
            }
            // Lost a race against a concurrent registration
            None => self.check_existing(name, &fp).await?.ok_or_else(|| {
                SortError::Common(ephys_common::Error::Internal(format!(
                    "parameter set '{}' neither inserted nor found",
                    name
                )))
            }),
        }
    }

    /// Apply the conflict rules against stored rows; `Some(id)` on an idempotent hit
    async fn check_existing(&self, name: &str, fp: &Fingerprint) -> Result<Option<ParameterSetId>> {
        if let Some(existing) = parameter_sets::load_parameter_set_by_name(&self.db, name).await? {
            return if &existing.fingerprint == fp {
                Ok(Some(existing.id))
            } else {
                Err(SortError::DuplicateNameConflict {
                    name: name.to_string(),
                })
            };
        }

        if let Some(existing) = parameter_sets::load_parameter_set_by_fingerprint(&self.db, fp).await? {
            return Err(SortError::DuplicateContentConflict {
                existing: existing.name,
            });
        }

        Ok(None)
    }

    pub async fn fingerprint(&self, id: ParameterSetId) -> Result<Fingerprint> {
        Ok(self.get(id).await?.fingerprint)
    }

    pub async fn get(&self, id: ParameterSetId) -> Result<ParameterSet> {
        parameter_sets::load_parameter_set(&self.db, id)
            .await?
            .ok_or_else(|| SortError::UnresolvedDependency(format!("parameter set {}", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<ParameterSet> {
        parameter_sets::load_parameter_set_by_name(&self.db, name)
            .await?
            .ok_or_else(|| SortError::UnresolvedDependency(format!("parameter set '{}'", name)))
    }

    pub async fn list(&self) -> Result<Vec<ParameterSet>> {
        Ok(parameter_sets::list_parameter_sets(&self.db).await?)
    }
}
