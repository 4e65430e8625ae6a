use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::availability::AvailabilityStore;
use crate::limits::MAX_COMMIT_WRITES;
use crate::model::*;
use crate::wal::Wal;

use super::{DocumentStore, Order, StoreError, UserDirectory};

/// Everything stored under one user: profile, availability, both appointment
/// partitions and the service-hour aggregate.
#[derive(Debug, Default)]
pub struct UserDocs {
    profile: Option<UserProfile>,
    availability: AvailabilityStore,
    active: BTreeMap<Ulid, Appointment>,
    past: BTreeMap<Ulid, Appointment>,
    hours: Option<ServiceHours>,
}

impl UserDocs {
    fn partition(&self, partition: Partition) -> &BTreeMap<Ulid, Appointment> {
        match partition {
            Partition::Active => &self.active,
            Partition::Past => &self.past,
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut BTreeMap<Ulid, Appointment> {
        match partition {
            Partition::Active => &mut self.active,
            Partition::Past => &mut self.past,
        }
    }

    fn holds(&self, id: &Ulid) -> bool {
        self.active.contains_key(id) || self.past.contains_key(id)
    }
}

pub type SharedUserDocs = Arc<RwLock<UserDocs>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let _ = response.send(wal.rewrite(&commits));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            flush_and_respond(wal, &mut vec![(commit, response)]);
        }
    }
}

/// Apply one user-scoped write (no locking; caller holds the user's lock).
fn apply_to_user(
    user: UserId,
    docs: &mut UserDocs,
    write: &Write,
    owners: &DashMap<Ulid, Vec<UserId>>,
) {
    match write {
        Write::PutProfile(profile) => docs.profile = Some(profile.clone()),
        Write::PutAvailability { availability, .. } => docs.availability = availability.clone(),
        Write::PutAppointment {
            partition,
            appointment,
            ..
        } => {
            docs.partition_mut(*partition)
                .insert(appointment.id, appointment.clone());
            let mut entry = owners.entry(appointment.id).or_default();
            if !entry.contains(&user) {
                entry.push(user);
            }
        }
        Write::DeleteAppointment { partition, id, .. } => {
            docs.partition_mut(*partition).remove(id);
            if !docs.holds(id) {
                let now_empty = owners.get_mut(id).is_some_and(|mut users| {
                    users.retain(|u| *u != user);
                    users.is_empty()
                });
                if now_empty {
                    owners.remove(id);
                }
            }
        }
        Write::PutHours { hours, .. } => docs.hours = Some(hours.clone()),
        // Locations are handled at the map level, not here
        Write::PutLocation(_) => {}
    }
}

/// In-memory documents made durable by a group-committed WAL.
///
/// Every [`DocumentStore::commit`] becomes one WAL record, so a multi-document
/// write either replays whole or not at all.
pub struct WalStore {
    users: DashMap<UserId, SharedUserDocs>,
    locations: DashMap<Ulid, Location>,
    /// Reverse lookup: appointment id → users holding a copy.
    appointment_owners: DashMap<Ulid, Vec<UserId>>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold this shared; compaction holds it exclusively so no commit
    /// slips between the snapshot and the file swap.
    commit_gate: RwLock<()>,
}

impl WalStore {
    /// Replay the WAL at `path`, cut any torn tail and start the background
    /// writer. Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let locations = DashMap::new();
        let appointment_owners = DashMap::new();
        let mut users: HashMap<UserId, UserDocs> = HashMap::new();
        for commit in &commits {
            for write in &commit.writes {
                match write.user() {
                    Some(uid) => {
                        let docs = users.entry(uid).or_default();
                        apply_to_user(uid, docs, write, &appointment_owners);
                    }
                    None => {
                        if let Write::PutLocation(loc) = write {
                            locations.insert(loc.id, loc.clone());
                        }
                    }
                }
            }
        }

        tracing::info!(
            path = %path.display(),
            commits = commits.len(),
            users = users.len(),
            "replayed store"
        );

        Ok(Self {
            users: users
                .into_iter()
                .map(|(id, docs)| (id, Arc::new(RwLock::new(docs))))
                .collect(),
            locations,
            appointment_owners,
            wal_tx,
            commit_gate: RwLock::new(()),
        })
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &Commit) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?.map_err(StoreError::Io)
    }

    fn docs(&self, user: &UserId) -> Option<SharedUserDocs> {
        self.users.get(user).map(|e| e.value().clone())
    }

    fn docs_or_default(&self, user: UserId) -> SharedUserDocs {
        self.users.entry(user).or_default().value().clone()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Rewrite the WAL as a snapshot of the current documents.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.commit_gate.write().await;

        let mut commits = Vec::new();
        let locations: Vec<Write> = self
            .locations
            .iter()
            .map(|e| Write::PutLocation(e.value().clone()))
            .collect();
        if !locations.is_empty() {
            commits.push(Commit { writes: locations });
        }

        let all: Vec<(UserId, SharedUserDocs)> = self
            .users
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (user, docs) in all {
            let docs = docs.read().await;
            let mut writes = Vec::new();
            if let Some(profile) = &docs.profile {
                writes.push(Write::PutProfile(profile.clone()));
            }
            if !docs.availability.is_empty() {
                writes.push(Write::PutAvailability {
                    user,
                    availability: docs.availability.clone(),
                });
            }
            for partition in [Partition::Active, Partition::Past] {
                for appointment in docs.partition(partition).values() {
                    writes.push(Write::PutAppointment {
                        user,
                        partition,
                        appointment: appointment.clone(),
                    });
                }
            }
            if let Some(hours) = &docs.hours {
                writes.push(Write::PutHours { user, hours: hours.clone() });
            }
            if !writes.is_empty() {
                commits.push(Commit { writes });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?.map_err(StoreError::Io)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for WalStore {
    async fn location(&self, id: Ulid) -> Result<Option<Location>, StoreError> {
        Ok(self.locations.get(&id).map(|e| e.value().clone()))
    }

    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        let mut ids: Vec<UserId> = self.users.iter().map(|e| *e.key()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn availability(&self, user: UserId) -> Result<AvailabilityStore, StoreError> {
        match self.docs(&user) {
            Some(docs) => Ok(docs.read().await.availability.clone()),
            None => Ok(AvailabilityStore::new()),
        }
    }

    async fn appointment(
        &self,
        user: UserId,
        partition: Partition,
        id: Ulid,
    ) -> Result<Option<Appointment>, StoreError> {
        let Some(docs) = self.docs(&user) else {
            return Ok(None);
        };
        let docs = docs.read().await;
        Ok(docs.partition(partition).get(&id).cloned())
    }

    async fn appointments(
        &self,
        user: UserId,
        partition: Partition,
    ) -> Result<Vec<Appointment>, StoreError> {
        let Some(docs) = self.docs(&user) else {
            return Ok(Vec::new());
        };
        let docs = docs.read().await;
        Ok(docs.partition(partition).values().cloned().collect())
    }

    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        let owners = self
            .appointment_owners
            .get(&id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for partition in [Partition::Active, Partition::Past] {
            for owner in &owners {
                if let Some(appt) = self.appointment(*owner, partition, id).await? {
                    return Ok(Some(appt));
                }
            }
        }
        Ok(None)
    }

    async fn past_by_clock_out(
        &self,
        user: UserId,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let mut past: Vec<Appointment> = self
            .appointments(user, Partition::Past)
            .await?
            .into_iter()
            .filter(|a| a.clock_out.is_some())
            .collect();
        past.sort_by_key(|a| (a.clock_out.as_ref().map(|c| c.sent_timestamp), a.id));
        if order == Order::Descending {
            past.reverse();
        }
        if let Some(limit) = limit {
            past.truncate(limit);
        }
        Ok(past)
    }

    async fn hours(&self, user: UserId) -> Result<ServiceHours, StoreError> {
        let Some(docs) = self.docs(&user) else {
            return Ok(ServiceHours::default());
        };
        let docs = docs.read().await;
        Ok(docs.hours.clone().unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        if writes.len() > MAX_COMMIT_WRITES {
            return Err(StoreError::LimitExceeded("too many writes in one commit"));
        }
        let _gate = self.commit_gate.read().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut user_ids: Vec<UserId> = writes.iter().filter_map(Write::user).collect();
        user_ids.sort();
        user_ids.dedup();

        let mut guards = Vec::with_capacity(user_ids.len());
        let mut guard_of = HashMap::with_capacity(user_ids.len());
        for uid in &user_ids {
            let docs = self.docs_or_default(*uid);
            guard_of.insert(*uid, guards.len());
            guards.push(docs.write_owned().await);
        }

        let commit = Commit { writes };
        self.wal_append(&commit).await?;

        for write in &commit.writes {
            match write.user() {
                Some(uid) => {
                    let guard = &mut guards[guard_of[&uid]];
                    apply_to_user(uid, guard, write, &self.appointment_owners);
                }
                None => {
                    if let Write::PutLocation(loc) = write {
                        self.locations.insert(loc.id, loc.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for WalStore {
    async fn profile(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        let Some(docs) = self.docs(&id) else {
            return Ok(None);
        };
        let docs = docs.read().await;
        Ok(docs.profile.clone())
    }

    async fn profiles(&self) -> Result<Vec<UserProfile>, StoreError> {
        let all: Vec<SharedUserDocs> = self.users.iter().map(|e| e.value().clone()).collect();
        let mut profiles = Vec::new();
        for docs in all {
            if let Some(profile) = &docs.read().await.profile {
                profiles.push(profile.clone());
            }
        }
        Ok(profiles)
    }
}
