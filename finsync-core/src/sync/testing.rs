//! Test doubles: a statement-counting store and an in-memory relay.

use crate::database::{Database, LocalStore, Row, SqlValue};
use crate::sync::identity::{save_linked_installation, Installation};
use crate::sync::models::{EncryptedPackage, InitRecord, PulledPackage, PushResponse};
use crate::sync::relay::Relay;
use crate::sync::SyncConfig;
use crate::{RelayFailure, Result};
use async_trait::async_trait;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Wraps a store and counts the statements run through it.
pub struct CountingStore<'a> {
    inner: &'a dyn LocalStore,
    executes: Cell<usize>,
    queries: Cell<usize>,
    batches: Cell<usize>,
}

impl<'a> CountingStore<'a> {
    pub fn new(inner: &'a dyn LocalStore) -> Self {
        Self {
            inner,
            executes: Cell::new(0),
            queries: Cell::new(0),
            batches: Cell::new(0),
        }
    }

    pub fn executes(&self) -> usize {
        self.executes.get()
    }

    pub fn queries(&self) -> usize {
        self.queries.get()
    }

    pub fn batches(&self) -> usize {
        self.batches.get()
    }
}

impl LocalStore for CountingStore<'_> {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.executes.set(self.executes.get() + 1);
        self.inner.execute(sql, params)
    }

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        self.queries.set(self.queries.get() + 1);
        self.inner.query_one(sql, params)
    }

    fn query_many(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.queries.set(self.queries.get() + 1);
        self.inner.query_many(sql, params)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.batches.set(self.batches.get() + 1);
        self.inner.execute_batch(sql)
    }
}

struct StoredPackage {
    id: String,
    recipient: Uuid,
    created_at: i64,
    package: EncryptedPackage,
}

/// Relay state shared by every [`MemoryRelay`] handle.
#[derive(Default)]
pub struct Mailbox {
    packages: Mutex<Vec<StoredPackage>>,
    inits: Mutex<Vec<(Uuid, InitRecord)>>,
    clock: Mutex<i64>,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn tick(&self) -> i64 {
        let mut clock = self.clock.lock().unwrap();
        *clock = (*clock + 1).max(crate::now_ms());
        *clock
    }

    pub fn pending_packages(&self, recipient: Uuid) -> usize {
        self.packages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.recipient == recipient)
            .count()
    }

    pub fn pending_inits(&self, target: Uuid) -> usize {
        self.inits
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == target)
            .count()
    }

    /// Deliver a raw init record, as a misbehaving peer might.
    pub fn inject_init(&self, target: Uuid, sender: Uuid, payload: Vec<u8>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = InitRecord {
            id: id.clone(),
            sender_uuid: sender,
            encrypted_payload: payload,
            created_at: self.tick(),
        };
        self.inits.lock().unwrap().push((target, record));
        id
    }
}

/// In-memory relay client for one installation.
pub struct MemoryRelay {
    id: Uuid,
    mailbox: Arc<Mailbox>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: Mutex<HashSet<&'static str>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryRelay {
    pub fn new(id: Uuid, mailbox: Arc<Mailbox>) -> Self {
        Self {
            id,
            mailbox,
            calls: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Make every later `operation` call fail with a 503.
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    /// Delay every call, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn enter(&self, operation: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(operation) {
            return Err(RelayFailure::new(operation, Some(503), "Service Unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn installation_id(&self) -> Uuid {
        self.id
    }

    async fn push(&self, package: &EncryptedPackage) -> Result<PushResponse> {
        self.enter("push").await?;
        let package_id = Uuid::new_v4().to_string();
        let created_at = self.mailbox.tick();
        let mut packages = self.mailbox.packages.lock().unwrap();
        for (recipient, key) in &package.recipient_keys {
            let mut copy = package.clone();
            copy.recipient_keys = BTreeMap::from([(*recipient, key.clone())]);
            packages.push(StoredPackage {
                id: format!("{}-{}", package_id, recipient),
                recipient: *recipient,
                created_at,
                package: copy,
            });
        }
        Ok(PushResponse {
            success: true,
            package_id,
        })
    }

    async fn pull(&self, since: i64) -> Result<Vec<PulledPackage>> {
        self.enter("pull").await?;
        Ok(self
            .mailbox
            .packages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.recipient == self.id && p.created_at > since)
            .map(|p| PulledPackage {
                id: p.id.clone(),
                created_at: p.created_at,
                package: p.package.clone(),
            })
            .collect())
    }

    async fn ack(&self, package_ids: &[String]) -> Result<()> {
        self.enter("ack").await?;
        self.mailbox
            .packages
            .lock()
            .unwrap()
            .retain(|p| !(p.recipient == self.id && package_ids.contains(&p.id)));
        Ok(())
    }

    async fn post_init(&self, target: Uuid, encrypted_payload: &[u8]) -> Result<()> {
        self.enter("init post").await?;
        self.mailbox
            .inject_init(target, self.id, encrypted_payload.to_vec());
        Ok(())
    }

    async fn get_inits(&self) -> Result<Vec<InitRecord>> {
        self.enter("init get").await?;
        Ok(self
            .mailbox
            .inits
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| *target == self.id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn delete_inits(&self, ids: &[String]) -> Result<()> {
        self.enter("init delete").await?;
        self.mailbox
            .inits
            .lock()
            .unwrap()
            .retain(|(target, record)| !(*target == self.id && ids.contains(&record.id)));
        Ok(())
    }
}

/// A registered device: schema, identity and sync enabled.
pub struct Device {
    pub db: Arc<Mutex<Database>>,
    pub installation: Installation,
    pub relay: Arc<MemoryRelay>,
}

impl Device {
    pub fn new(mailbox: &Arc<Mailbox>) -> Self {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        let installation = Installation::generate(Uuid::new_v4(), "token");
        installation.save(&db).unwrap();
        SyncConfig {
            sync_enabled: true,
            relay_url: Some("memory://relay".to_string()),
            ..SyncConfig::default()
        }
        .save(&db)
        .unwrap();

        let relay = Arc::new(MemoryRelay::new(
            installation.installation_id,
            Arc::clone(mailbox),
        ));
        Self {
            db: Arc::new(Mutex::new(db)),
            installation,
            relay,
        }
    }

    pub fn id(&self) -> Uuid {
        self.installation.installation_id
    }

    pub fn public_key(&self) -> String {
        self.installation.key_pair.public_key_b64()
    }

    /// Record `other` as linked on this device only.
    pub fn link(&self, other: &Device) {
        let db = self.db.lock().unwrap();
        save_linked_installation(&*db, other.id(), &other.public_key()).unwrap();
    }

    /// Run `sql`, then wait out the current millisecond so the capture
    /// stamps fall strictly before the next package window.
    pub fn exec(&self, sql: &str) {
        self.db.lock().unwrap().execute_batch(sql).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    pub fn count(&self, sql: &str) -> i64 {
        let db = self.db.lock().unwrap();
        let row = db.query_one(sql, &[]).unwrap().unwrap();
        row.values().next().and_then(|v| v.as_i64()).unwrap()
    }
}
