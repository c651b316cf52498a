use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::revocation::{MemoryRevocationStore, RevocationStore};
use crate::config::Config;
use crate::models::account::{CustomerAccount, ReferralEntry, Restaurant, Session};
use crate::models::courier::Courier;
use crate::notify::sms::{LogSms, SmsSender};
use crate::notify::{BroadcastNotifier, Envelope, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::memory::MemoryStore;
use crate::store::Store;

pub struct AppState {
    pub config: Config,
    /// Orders, offers and OTP challenges: the invariant-bearing shared
    /// state, mutated only through the engines.
    pub store: Arc<dyn Store>,
    pub couriers: DashMap<Uuid, Courier>,
    pub restaurants: DashMap<Uuid, Restaurant>,
    /// Customer accounts keyed by phone.
    pub accounts: DashMap<String, CustomerAccount>,
    /// Referral ledger keyed by referred user, which is what makes the
    /// entry once-per-referred structural.
    pub referrals: DashMap<Uuid, ReferralEntry>,
    pub sessions: DashMap<Uuid, Session>,
    /// Remaining candidates per order under the sequential dispatch policy.
    pub dispatch_queues: DashMap<Uuid, VecDeque<Uuid>>,
    pub revocations: Arc<dyn RevocationStore>,
    pub notifier: Arc<dyn Notifier>,
    pub sms: Arc<dyn SmsSender>,
    pub events_tx: broadcast::Sender<Envelope>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            couriers: DashMap::new(),
            restaurants: DashMap::new(),
            accounts: DashMap::new(),
            referrals: DashMap::new(),
            sessions: DashMap::new(),
            dispatch_queues: DashMap::new(),
            revocations: Arc::new(MemoryRevocationStore::new()),
            notifier: Arc::new(BroadcastNotifier::new(events_tx.clone())),
            sms: Arc::new(LogSms),
            events_tx,
            metrics: Metrics::new(),
        }
    }
}
