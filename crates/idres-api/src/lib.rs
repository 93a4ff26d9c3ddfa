use std::path::PathBuf;

use anyhow::Result;
use idres_core::{ConsolidatedContact, Contact, ContactId, Observation};
use idres_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// One identify request, using the published wire field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "phoneNumber")]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedContact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Embeddable facade over the contact store. Every call opens the store and
/// migrates to latest, so callers need no setup beyond a database path.
#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Reconcile one observation into its consolidated identity cluster.
    ///
    /// # Errors
    /// Returns [`idres_core::ReconcileError::InvalidRequest`] (as the anyhow
    /// source) when neither email nor phone number is supplied — checked
    /// before the store is opened — or a persistence error when any store
    /// read or write fails.
    pub fn identify(&self, request: IdentifyRequest) -> Result<IdentifyResponse> {
        let observation =
            Observation::new(request.email, request.phone_number).normalize();
        observation.validate().map_err(anyhow::Error::new)?;

        let mut store = self.open_store()?;
        store.migrate()?;
        let contact = store.reconcile(&observation)?;
        Ok(IdentifyResponse { contact })
    }

    /// Consolidated view of the cluster containing one contact id.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or queried; `Ok(None)`
    /// for an unknown or soft-deleted contact id.
    pub fn cluster_show(&self, id: ContactId) -> Result<Option<ConsolidatedContact>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.cluster_view(id)
    }

    /// List all non-deleted contacts in creation order.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn contact_list(&self) -> Result<Vec<Contact>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_contacts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idres_core::ReconcileError;

    fn unique_temp_db_path() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("idres-api-{nanos}.sqlite3"))
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_identify_and_cluster_show_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let first = api.identify(IdentifyRequest {
            email: Some("a@x.com".to_string()),
            phone_number: None,
        })?;
        let merged = api.identify(IdentifyRequest {
            email: Some("a@x.com".to_string()),
            phone_number: Some("555".to_string()),
        })?;

        assert_eq!(merged.contact.primary_contact_id, first.contact.primary_contact_id);
        assert_eq!(merged.contact.secondary_contact_ids.len(), 1);

        let shown = api.cluster_show(merged.contact.secondary_contact_ids[0])?;
        assert_eq!(shown, Some(merged.contact));

        let contacts = api.contact_list()?;
        assert_eq!(contacts.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_identify_rejects_empty_request_before_opening_the_store() {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let err = match api.identify(IdentifyRequest::default()) {
            Ok(_) => panic!("empty identify request should be rejected"),
            Err(err) => err,
        };
        assert!(err.downcast_ref::<ReconcileError>().is_some());
        assert!(!db_path.exists());
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert!(!applied.dry_run);
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn api_identify_response_uses_published_wire_names() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let response = api.identify(IdentifyRequest {
            email: Some("a@x.com".to_string()),
            phone_number: Some("555".to_string()),
        })?;
        let json = serde_json::to_value(&response)?;
        let contact = json
            .get("contact")
            .unwrap_or_else(|| panic!("response should carry a contact object"));
        assert!(contact.get("primaryContatctId").is_some());
        assert!(contact.get("phoneNumbers").is_some());
        assert!(contact.get("secondaryContactIds").is_some());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
