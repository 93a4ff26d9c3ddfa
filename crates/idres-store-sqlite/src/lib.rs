use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use idres_core::{
    consolidate, elect_primary, needs_new_record, relink_targets, ConsolidatedContact, Contact,
    ContactId, LinkPrecedence, Observation,
};
use rusqlite::{params, Connection, DatabaseName, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CONTACTS_FILE: &str = "contacts.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at, deleted_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_contacts: usize,
    pub skipped_existing_contacts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// Linkage invariant violation: a secondary pointing nowhere, pointing at a
/// missing row, or pointing at another secondary (forbidden chain).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkViolation {
    pub contact_id: i64,
    pub linked_id: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub link_violations: Vec<LinkViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run one full reconciliation for an observation: direct match lookup,
    /// cluster expansion, new-record decision, primary election with merge
    /// demotion, and consolidated response assembly.
    ///
    /// The whole pipeline executes in one IMMEDIATE transaction. The write
    /// lock is taken up front so two racing observations carrying the same
    /// unseen email or phone cannot both conclude "no match" and create
    /// competing primaries.
    ///
    /// # Errors
    /// Returns [`idres_core::ReconcileError::InvalidRequest`] (as the anyhow
    /// source) when the observation carries no identifying fact, before any
    /// query runs. Any failed read or write aborts the transaction; no
    /// partial state is visible afterwards.
    pub fn reconcile(&mut self, observation: &Observation) -> Result<ConsolidatedContact> {
        let observation = observation.clone().normalize();
        observation.validate().map_err(anyhow::Error::new)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reconcile transaction")?;

        let matches = find_by_email_or_phone(&tx, &observation)?;
        if matches.is_empty() {
            let created = insert_contact(&tx, &observation, LinkPrecedence::Primary, None)?;
            let view = consolidate(std::slice::from_ref(&created), created.id);
            tx.commit().context("failed to commit reconcile transaction")?;
            return Ok(view);
        }

        let mut primary_ids = BTreeSet::new();
        for contact in &matches {
            primary_ids.insert(contact.linked_id.unwrap_or(contact.id));
        }

        let mut cluster: BTreeMap<ContactId, Contact> = BTreeMap::new();
        for primary_id in &primary_ids {
            for member in find_cluster_members(&tx, *primary_id)? {
                cluster.insert(member.id, member);
            }
        }
        // A direct match whose linked primary was soft-deleted still belongs
        // to the combined set.
        for contact in matches {
            cluster.entry(contact.id).or_insert(contact);
        }

        let combined: Vec<Contact> = cluster.values().cloned().collect();
        let elected = elect_primary(&combined)
            .ok_or_else(|| anyhow!("combined contact set is unexpectedly empty"))?;

        if needs_new_record(&observation, &combined) {
            let created =
                insert_contact(&tx, &observation, LinkPrecedence::Secondary, Some(elected))?;
            cluster.insert(created.id, created);
        }

        let combined: Vec<Contact> = cluster.values().cloned().collect();
        let elected = elect_primary(&combined)
            .ok_or_else(|| anyhow!("combined contact set is unexpectedly empty"))?;
        for target in relink_targets(&combined, elected) {
            demote_contact(&tx, target, elected)?;
        }

        let ids: Vec<ContactId> = cluster.keys().copied().collect();
        let finals = fetch_contacts_by_ids(&tx, &ids)?;
        let elected = elect_primary(&finals)
            .ok_or_else(|| anyhow!("combined contact set is unexpectedly empty"))?;
        let view = consolidate(&finals, elected);

        tx.commit().context("failed to commit reconcile transaction")?;
        Ok(view)
    }

    /// Read-only consolidated view of the cluster containing one contact.
    ///
    /// # Errors
    /// Returns an error when queries fail; `Ok(None)` for an unknown or
    /// soft-deleted contact id.
    pub fn cluster_view(&self, id: ContactId) -> Result<Option<ConsolidatedContact>> {
        let query = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1 AND deleted_at IS NULL");
        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query(params![id.0])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let contact = read_contact(row)?;

        let primary_id = contact.linked_id.unwrap_or(contact.id);
        let members_query = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&members_query)?;
        let mut rows = stmt.query(params![primary_id.0])?;
        let mut members = Vec::new();
        while let Some(row) = rows.next()? {
            members.push(read_contact(row)?);
        }

        let elected = elect_primary(&members)
            .ok_or_else(|| anyhow!("cluster for contact {id} is unexpectedly empty"))?;
        Ok(Some(consolidate(&members, elected)))
    }

    /// List all non-deleted contacts in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let query = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE deleted_at IS NULL
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(read_contact(row)?);
        }
        Ok(contacts)
    }

    /// Export every contact row (soft-deleted included) as deterministic
    /// NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let contacts = self.list_all_contacts()?;
        let contacts_path = out_dir.join(CONTACTS_FILE);
        let digest = write_ndjson_file(&contacts_path, &contacts)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest {
                path: CONTACTS_FILE.to_string(),
                sha256: digest.0,
                records: digest.1,
            }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database, preserving
    /// contact ids and linkage.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, duplicate
    /// handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let contacts = read_ndjson_file::<Contact>(&in_dir.join(CONTACTS_FILE))?;

        let mut summary = ImportSummary { imported_contacts: 0, skipped_existing_contacts: 0 };

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        // Rows arrive in id order but a secondary may precede the primary it
        // references, so linkage checks are deferred to commit.
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .context("failed to defer foreign key checks for import")?;

        for contact in contacts {
            let exists = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM contacts WHERE id = ?1)",
                    params![contact.id.0],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to check for existing contact")?;
            if exists == 1 {
                if skip_existing {
                    summary.skipped_existing_contacts += 1;
                    continue;
                }
                return Err(anyhow!("contact already exists for id {}", contact.id));
            }

            tx.execute(
                "INSERT INTO contacts(
                    id, email, phone_number, link_precedence, linked_id,
                    created_at, updated_at, deleted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    contact.id.0,
                    contact.email,
                    contact.phone_number,
                    contact.link_precedence.as_str(),
                    contact.linked_id.map(|linked| linked.0),
                    rfc3339(contact.created_at)?,
                    rfc3339(contact.updated_at)?,
                    contact.deleted_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert imported contact")?;
            summary.imported_contacts += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, linkage invariant probes, and
    /// schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let link_violations = self.link_violations()?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            link_violations,
            schema_status,
        })
    }

    fn link_violations(&self) -> Result<Vec<LinkViolation>> {
        let mut violations = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT id, linked_id FROM contacts
             WHERE deleted_at IS NULL AND link_precedence = 'secondary'
               AND (linked_id IS NULL
                    OR linked_id NOT IN (
                        SELECT id FROM contacts
                        WHERE link_precedence = 'primary' AND deleted_at IS NULL))
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)))?;
        for row in rows {
            let (contact_id, linked_id) = row?;
            let reason = if linked_id.is_none() {
                "secondary contact has no linked primary".to_string()
            } else {
                "secondary contact does not point at a live primary".to_string()
            };
            violations.push(LinkViolation { contact_id, linked_id, reason });
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, linked_id FROM contacts
             WHERE deleted_at IS NULL AND link_precedence = 'primary' AND linked_id IS NOT NULL
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)))?;
        for row in rows {
            let (contact_id, linked_id) = row?;
            violations.push(LinkViolation {
                contact_id,
                linked_id,
                reason: "primary contact carries a linked id".to_string(),
            });
        }

        Ok(violations)
    }

    fn list_all_contacts(&self) -> Result<Vec<Contact>> {
        let query = format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(read_contact(row)?);
        }
        Ok(contacts)
    }
}

fn find_by_email_or_phone(
    tx: &rusqlite::Transaction<'_>,
    observation: &Observation,
) -> Result<Vec<Contact>> {
    let (predicate, bindings): (&str, Vec<&str>) =
        match (observation.email.as_deref(), observation.phone_number.as_deref()) {
            (Some(email), Some(phone)) => {
                ("(email = ?1 OR phone_number = ?2)", vec![email, phone])
            }
            (Some(email), None) => ("email = ?1", vec![email]),
            (None, Some(phone)) => ("phone_number = ?1", vec![phone]),
            (None, None) => return Ok(Vec::new()),
        };

    let query = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE deleted_at IS NULL AND {predicate}
         ORDER BY created_at ASC, id ASC"
    );
    let mut stmt = tx.prepare(&query)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(bindings))?;
    let mut contacts = Vec::new();
    while let Some(row) = rows.next()? {
        contacts.push(read_contact(row)?);
    }
    Ok(contacts)
}

fn find_cluster_members(
    tx: &rusqlite::Transaction<'_>,
    primary_id: ContactId,
) -> Result<Vec<Contact>> {
    let query = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)
         ORDER BY created_at ASC, id ASC"
    );
    let mut stmt = tx.prepare(&query)?;
    let mut rows = stmt.query(params![primary_id.0])?;
    let mut contacts = Vec::new();
    while let Some(row) = rows.next()? {
        contacts.push(read_contact(row)?);
    }
    Ok(contacts)
}

fn fetch_contacts_by_ids(
    tx: &rusqlite::Transaction<'_>,
    ids: &[ContactId],
) -> Result<Vec<Contact>> {
    let query = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE deleted_at IS NULL AND id = ?1"
    );
    let mut stmt = tx.prepare(&query)?;
    let mut contacts = Vec::new();
    for id in ids {
        let mut rows = stmt.query(params![id.0])?;
        while let Some(row) = rows.next()? {
            contacts.push(read_contact(row)?);
        }
    }
    Ok(contacts)
}

fn insert_contact(
    tx: &rusqlite::Transaction<'_>,
    observation: &Observation,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<Contact> {
    let now = OffsetDateTime::now_utc();
    tx.execute(
        "INSERT INTO contacts(email, phone_number, link_precedence, linked_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            observation.email,
            observation.phone_number,
            link_precedence.as_str(),
            linked_id.map(|linked| linked.0),
            rfc3339(now)?,
            rfc3339(now)?,
        ],
    )
    .context("failed to insert contact")?;

    Ok(Contact {
        id: ContactId(tx.last_insert_rowid()),
        email: observation.email.clone(),
        phone_number: observation.phone_number.clone(),
        link_precedence,
        linked_id,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    })
}

fn demote_contact(
    tx: &rusqlite::Transaction<'_>,
    id: ContactId,
    primary: ContactId,
) -> Result<()> {
    tx.execute(
        "UPDATE contacts
         SET link_precedence = 'secondary', linked_id = ?2, updated_at = ?3
         WHERE id = ?1",
        params![id.0, primary.0, now_rfc3339()?],
    )
    .context("failed to demote contact")?;
    Ok(())
}

fn read_contact(row: &rusqlite::Row<'_>) -> Result<Contact> {
    let link_precedence_raw: String = row.get(3)?;
    let link_precedence = LinkPrecedence::parse(&link_precedence_raw)
        .ok_or_else(|| anyhow!("unknown link_precedence: {link_precedence_raw}"))?;

    Ok(Contact {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        link_precedence,
        linked_id: row.get::<_, Option<i64>>(4)?.map(ContactId),
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        deleted_at: row.get::<_, Option<String>>(7)?.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let Some(expected) = manifest.files.iter().find(|file| file.path == CONTACTS_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {CONTACTS_FILE}"));
    };
    let file_path = in_dir.join(CONTACTS_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {CONTACTS_FILE}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {CONTACTS_FILE}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use idres_core::ReconcileError;

    fn open_store() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        store
    }

    fn observation(email: Option<&str>, phone: Option<&str>) -> Observation {
        Observation::new(email.map(ToString::to_string), phone.map(ToString::to_string))
    }

    fn reconcile(store: &mut SqliteStore, email: Option<&str>, phone: Option<&str>) -> ConsolidatedContact {
        match store.reconcile(&observation(email, phone)) {
            Ok(view) => view,
            Err(err) => panic!("reconcile should succeed: {err}"),
        }
    }

    fn contact_count(store: &SqliteStore) -> i64 {
        match store.conn.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0)) {
            Ok(count) => count,
            Err(err) => panic!("count query should succeed: {err}"),
        }
    }

    fn soft_delete(store: &SqliteStore, id: i64) {
        let result = store.conn.execute(
            "UPDATE contacts SET deleted_at = ?2 WHERE id = ?1",
            params![id, "2026-01-01T00:00:00Z"],
        );
        if let Err(err) = result {
            panic!("soft delete should succeed: {err}");
        }
    }

    // Test IDs: TSTO-001
    #[test]
    fn reconcile_creates_primary_when_store_is_empty() {
        let mut store = open_store();
        let view = reconcile(&mut store, Some("a@x.com"), None);

        assert_eq!(view.emails, vec!["a@x.com".to_string()]);
        assert!(view.phone_numbers.is_empty());
        assert!(view.secondary_contact_ids.is_empty());
        assert_eq!(contact_count(&store), 1);
    }

    // Test IDs: TSTO-002
    #[test]
    fn repeat_reconcile_is_idempotent() {
        let mut store = open_store();
        let first = reconcile(&mut store, Some("a@x.com"), Some("555"));
        let second = reconcile(&mut store, Some("a@x.com"), Some("555"));

        assert_eq!(first.primary_contact_id, second.primary_contact_id);
        assert_eq!(first.emails, second.emails);
        assert_eq!(first.phone_numbers, second.phone_numbers);
        assert_eq!(contact_count(&store), 1);
    }

    // Test IDs: TSTO-003
    #[test]
    fn new_fact_creates_linked_secondary() {
        let mut store = open_store();
        let first = reconcile(&mut store, Some("a@x.com"), None);
        let second = reconcile(&mut store, Some("a@x.com"), Some("555"));

        assert_eq!(second.primary_contact_id, first.primary_contact_id);
        assert_eq!(second.phone_numbers, vec!["555".to_string()]);
        assert_eq!(second.secondary_contact_ids.len(), 1);
        assert_eq!(contact_count(&store), 2);

        let contacts = match store.list_contacts() {
            Ok(contacts) => contacts,
            Err(err) => panic!("list should succeed: {err}"),
        };
        let secondary = contacts
            .iter()
            .find(|contact| contact.link_precedence == LinkPrecedence::Secondary)
            .unwrap_or_else(|| panic!("a secondary contact should exist"));
        assert_eq!(secondary.linked_id, Some(first.primary_contact_id));
        assert_eq!(secondary.email.as_deref(), Some("a@x.com"));
        assert_eq!(secondary.phone_number.as_deref(), Some("555"));
    }

    // Test IDs: TSTO-004
    #[test]
    fn merge_elects_older_primary_and_demotes_younger() {
        let mut store = open_store();
        let older = reconcile(&mut store, Some("a@x.com"), None);
        let younger = reconcile(&mut store, None, Some("555"));
        assert_ne!(older.primary_contact_id, younger.primary_contact_id);

        let merged = reconcile(&mut store, Some("a@x.com"), Some("555"));
        assert_eq!(merged.primary_contact_id, older.primary_contact_id);
        assert!(merged.secondary_contact_ids.contains(&younger.primary_contact_id));
        assert_eq!(merged.emails, vec!["a@x.com".to_string()]);
        assert_eq!(merged.phone_numbers, vec!["555".to_string()]);
        // Both facts were already known, so the merge inserts nothing.
        assert_eq!(contact_count(&store), 2);
    }

    // Test IDs: TSTO-005
    #[test]
    fn merge_reparents_losing_cluster_secondaries() {
        let mut store = open_store();
        let older = reconcile(&mut store, Some("a@x.com"), None);
        let _ = reconcile(&mut store, Some("a@x.com"), Some("111"));
        let younger = reconcile(&mut store, Some("b@x.com"), None);
        let _ = reconcile(&mut store, Some("b@x.com"), Some("222"));

        let merged = reconcile(&mut store, Some("a@x.com"), Some("222"));
        assert_eq!(merged.primary_contact_id, older.primary_contact_id);
        assert_eq!(merged.secondary_contact_ids.len(), 3);
        assert!(merged.secondary_contact_ids.contains(&younger.primary_contact_id));

        let contacts = match store.list_contacts() {
            Ok(contacts) => contacts,
            Err(err) => panic!("list should succeed: {err}"),
        };
        for contact in &contacts {
            if contact.id == older.primary_contact_id {
                assert!(contact.is_primary());
                assert_eq!(contact.linked_id, None);
            } else {
                assert_eq!(contact.link_precedence, LinkPrecedence::Secondary);
                assert_eq!(contact.linked_id, Some(older.primary_contact_id));
            }
        }
    }

    // Test IDs: TSTO-006
    #[test]
    fn soft_deleted_contacts_are_invisible() {
        let mut store = open_store();
        let first = reconcile(&mut store, Some("a@x.com"), Some("555"));
        soft_delete(&store, first.primary_contact_id.0);

        let replacement = reconcile(&mut store, Some("a@x.com"), None);
        assert_ne!(replacement.primary_contact_id, first.primary_contact_id);
        assert_eq!(replacement.emails, vec!["a@x.com".to_string()]);
        assert!(replacement.phone_numbers.is_empty());
        assert!(replacement.secondary_contact_ids.is_empty());

        let listed = match store.list_contacts() {
            Ok(contacts) => contacts,
            Err(err) => panic!("list should succeed: {err}"),
        };
        assert!(listed.iter().all(|contact| contact.id != first.primary_contact_id));
    }

    // Test IDs: TSTO-007
    #[test]
    fn empty_observation_is_rejected_without_touching_contacts() {
        let mut store = open_store();
        let err = match store.reconcile(&observation(Some("  "), None)) {
            Ok(_) => panic!("blank observation should be rejected"),
            Err(err) => err,
        };
        assert!(err.downcast_ref::<ReconcileError>().is_some());
        assert_eq!(contact_count(&store), 0);
    }

    // Test IDs: TSTO-008
    #[test]
    fn contacts_table_enforces_check_constraints() {
        let store = open_store();

        let no_facts = store.conn.execute(
            "INSERT INTO contacts(email, phone_number, link_precedence, created_at, updated_at)
             VALUES (NULL, NULL, 'primary', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(no_facts.is_err());

        let bad_precedence = store.conn.execute(
            "INSERT INTO contacts(email, phone_number, link_precedence, created_at, updated_at)
             VALUES ('a@x.com', NULL, 'tertiary', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad_precedence.is_err());
    }

    // Test IDs: TSTO-009
    #[test]
    fn migrate_is_idempotent_and_status_reports_up_to_date() {
        let mut store = open_store();
        if let Err(err) = store.migrate() {
            panic!("second migrate should be a no-op: {err}");
        }

        let status = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should read: {err}"),
        };
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    // Test IDs: TSTO-010
    #[test]
    fn export_import_round_trip_preserves_clusters() {
        let mut store = open_store();
        let _ = reconcile(&mut store, Some("a@x.com"), None);
        let _ = reconcile(&mut store, Some("a@x.com"), Some("555"));
        let before = reconcile(&mut store, Some("a@x.com"), None);

        let out_dir = std::env::temp_dir().join(format!(
            "idres-export-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or_default()
        ));
        let manifest = match store.export_snapshot(&out_dir) {
            Ok(manifest) => manifest,
            Err(err) => panic!("export should succeed: {err}"),
        };
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].records, 2);

        let mut restored = open_store();
        let summary = match restored.import_snapshot(&out_dir, true) {
            Ok(summary) => summary,
            Err(err) => panic!("import should succeed: {err}"),
        };
        assert_eq!(summary.imported_contacts, 2);
        assert_eq!(summary.skipped_existing_contacts, 0);

        let after = reconcile(&mut restored, Some("a@x.com"), None);
        assert_eq!(after, before);

        let again = match restored.import_snapshot(&out_dir, true) {
            Ok(summary) => summary,
            Err(err) => panic!("repeat import should succeed: {err}"),
        };
        assert_eq!(again.imported_contacts, 0);
        assert_eq!(again.skipped_existing_contacts, 2);

        let _ = fs::remove_dir_all(&out_dir);
    }

    // Test IDs: TSTO-011
    #[test]
    fn integrity_check_flags_secondary_chains() {
        let mut store = open_store();
        let primary = reconcile(&mut store, Some("a@x.com"), None);
        let with_secondary = reconcile(&mut store, Some("a@x.com"), Some("555"));
        let secondary_id = with_secondary.secondary_contact_ids[0];

        // Fabricate a secondary -> secondary chain.
        let chained = store.conn.execute(
            "INSERT INTO contacts(email, phone_number, link_precedence, linked_id, created_at, updated_at)
             VALUES ('chain@x.com', NULL, 'secondary', ?1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            params![secondary_id.0],
        );
        if let Err(err) = chained {
            panic!("chain fixture insert should succeed: {err}");
        }

        let report = match store.integrity_check() {
            Ok(report) => report,
            Err(err) => panic!("integrity check should run: {err}"),
        };
        assert!(report.quick_check_ok);
        assert_eq!(report.link_violations.len(), 1);
        assert_ne!(report.link_violations[0].contact_id, primary.primary_contact_id.0);
        assert_eq!(report.link_violations[0].linked_id, Some(secondary_id.0));
        assert!(report.link_violations[0].reason.contains("live primary"));
    }

    // Test IDs: TSTO-012
    #[test]
    fn cluster_view_returns_consolidated_cluster() {
        let mut store = open_store();
        let first = reconcile(&mut store, Some("a@x.com"), None);
        let merged = reconcile(&mut store, Some("a@x.com"), Some("555"));
        let secondary_id = merged.secondary_contact_ids[0];

        let from_secondary = match store.cluster_view(secondary_id) {
            Ok(Some(view)) => view,
            Ok(None) => panic!("cluster view should exist for a known secondary"),
            Err(err) => panic!("cluster view should succeed: {err}"),
        };
        assert_eq!(from_secondary.primary_contact_id, first.primary_contact_id);
        assert_eq!(from_secondary, merged);

        let unknown = match store.cluster_view(ContactId(9_999)) {
            Ok(view) => view,
            Err(err) => panic!("cluster view should succeed: {err}"),
        };
        assert!(unknown.is_none());
    }

    // Test IDs: TSTO-013
    #[test]
    fn backup_and_restore_round_trip() {
        let mut store = open_store();
        let before = reconcile(&mut store, Some("a@x.com"), Some("555"));

        let backup_file = std::env::temp_dir().join(format!(
            "idres-backup-{}.sqlite3",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or_default()
        ));
        if let Err(err) = store.backup_database(&backup_file) {
            panic!("backup should succeed: {err}");
        }

        let mut restored = open_store();
        if let Err(err) = restored.restore_database(&backup_file) {
            panic!("restore should succeed: {err}");
        }
        let after = reconcile(&mut restored, Some("a@x.com"), Some("555"));
        assert_eq!(after, before);

        let _ = fs::remove_file(&backup_file);
    }
}
