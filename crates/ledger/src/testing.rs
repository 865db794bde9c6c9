//! In-memory doubles for the storage and provider ports.
//!
//! Each double mirrors the Postgres implementation's semantics — in
//! particular the ledger double applies the duplicate-reference check
//! before the balance guard, under one lock, matching the transactional
//! ordering of the real store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::orchestrator::{GeneratedImage, GenerationRequest, ImageGenerator, MediaStore};
use crate::store::{Account, DeltaOutcome, LedgerEvent, LedgerReason, LedgerStore};
use crate::subscriptions::{NewSubscription, Subscription, SubscriptionStatus, SubscriptionStore};
use crate::usage::{GenerationRecord, NewGeneration, UsageStore};
use crate::catalog::{CatalogStore, Package, Plan};

struct AccountState {
    balance: i64,
    customer_ref: Option<String>,
    created_at: OffsetDateTime,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Uuid, AccountState>,
    events: Vec<LedgerEvent>,
    used_refs: HashSet<String>,
}

pub struct MemoryLedgerStore {
    inner: Mutex<LedgerState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerState::default()),
        }
    }

    pub fn add_account(&self, account_id: Uuid, balance: i64) {
        let mut state = self.inner.lock().unwrap();
        state.accounts.insert(
            account_id,
            AccountState {
                balance,
                customer_ref: None,
                created_at: OffsetDateTime::now_utc(),
            },
        );
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn events_with_ref(&self, external_ref: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.external_event_ref.as_deref() == Some(external_ref))
            .count()
    }

    pub fn customer_ref(&self, account_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .get(&account_id)
            .and_then(|a| a.customer_ref.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_balance(&self, account_id: Uuid) -> LedgerResult<i64> {
        let state = self.inner.lock().unwrap();
        state
            .accounts
            .get(&account_id)
            .map(|a| a.balance)
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Account> {
        let state = self.inner.lock().unwrap();
        state
            .accounts
            .get(&account_id)
            .map(|a| Account {
                id: account_id,
                balance: a.balance,
                stripe_customer_ref: a.customer_ref.clone(),
                created_at: a.created_at,
            })
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    async fn apply_delta(
        &self,
        account_id: Uuid,
        delta: i64,
        reason: LedgerReason,
        external_ref: Option<&str>,
    ) -> LedgerResult<DeltaOutcome> {
        let mut state = self.inner.lock().unwrap();

        // Duplicate reference check first, mirroring insert-then-update.
        if let Some(external_ref) = external_ref {
            if state.used_refs.contains(external_ref) {
                return Ok(DeltaOutcome::AlreadyApplied);
            }
        }

        let balance = state
            .accounts
            .get(&account_id)
            .map(|a| a.balance)
            .ok_or(LedgerError::AccountNotFound(account_id))?;

        let new_balance = balance + delta;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientCredits {
                balance,
                required: -delta,
            });
        }

        if let Some(external_ref) = external_ref {
            state.used_refs.insert(external_ref.to_string());
        }
        state.events.push(LedgerEvent {
            id: Uuid::new_v4(),
            account_id,
            delta,
            reason,
            external_event_ref: external_ref.map(str::to_string),
            created_at: OffsetDateTime::now_utc(),
        });
        if let Some(account) = state.accounts.get_mut(&account_id) {
            account.balance = new_balance;
        }

        Ok(DeltaOutcome::Applied { new_balance })
    }

    async fn link_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> LedgerResult<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(account) = state.accounts.get_mut(&account_id) {
            if account.customer_ref.is_none() {
                account.customer_ref = Some(customer_ref.to_string());
            }
        }
        Ok(())
    }

    async fn events_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

pub struct MemorySubscriptionStore {
    inner: Mutex<HashMap<String, Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscription(&self, external_ref: &str) -> Option<Subscription> {
        self.inner.lock().unwrap().get(external_ref).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_by_external_ref(&self, external_ref: &str) -> LedgerResult<Option<Subscription>> {
        Ok(self.inner.lock().unwrap().get(external_ref).cloned())
    }

    async fn find_occupying_for_account(
        &self,
        account_id: Uuid,
    ) -> LedgerResult<Option<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .values()
            .find(|s| s.account_id == account_id && s.status.occupies_account())
            .cloned())
    }

    async fn insert_if_absent(&self, sub: NewSubscription) -> LedgerResult<Subscription> {
        let mut subs = self.inner.lock().unwrap();
        if let Some(existing) = subs.get(&sub.external_subscription_ref) {
            return Ok(existing.clone());
        }
        let created = Subscription {
            id: Uuid::new_v4(),
            account_id: sub.account_id,
            external_subscription_ref: sub.external_subscription_ref.clone(),
            plan_ref: sub.plan_ref,
            credits_per_period: sub.credits_per_period,
            status: sub.status,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            canceled_at: None,
        };
        subs.insert(sub.external_subscription_ref, created.clone());
        Ok(created)
    }

    async fn update_period(
        &self,
        external_ref: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> LedgerResult<()> {
        let mut subs = self.inner.lock().unwrap();
        let sub = subs
            .get_mut(external_ref)
            .ok_or(LedgerError::SubscriptionNotFound(external_ref.to_string()))?;
        sub.current_period_start = period_start;
        sub.current_period_end = period_end;
        Ok(())
    }

    async fn update_status(
        &self,
        external_ref: &str,
        status: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
    ) -> LedgerResult<()> {
        let mut subs = self.inner.lock().unwrap();
        let sub = subs
            .get_mut(external_ref)
            .ok_or(LedgerError::SubscriptionNotFound(external_ref.to_string()))?;
        sub.status = status;
        if let Some(period_end) = period_end {
            sub.current_period_end = period_end;
        }
        Ok(())
    }

    async fn cancel(&self, external_ref: &str, canceled_at: OffsetDateTime) -> LedgerResult<()> {
        let mut subs = self.inner.lock().unwrap();
        let sub = subs
            .get_mut(external_ref)
            .ok_or(LedgerError::SubscriptionNotFound(external_ref.to_string()))?;
        sub.status = SubscriptionStatus::Canceled;
        sub.canceled_at = Some(canceled_at);
        Ok(())
    }
}

pub struct MemoryCatalogStore {
    packages: HashMap<String, Package>,
    plans: HashMap<String, Plan>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self {
            packages: HashMap::new(),
            plans: HashMap::new(),
        }
    }

    pub fn with_package(mut self, id: &str, credits: i64, price_cents: i64) -> Self {
        self.packages.insert(
            id.to_string(),
            Package {
                id: id.to_string(),
                credits,
                price_cents,
                currency: "usd".to_string(),
                is_active: true,
            },
        );
        self
    }

    pub fn with_plan(mut self, id: &str, credits_per_period: i64, price_cents: i64) -> Self {
        self.plans.insert(
            id.to_string(),
            Plan {
                id: id.to_string(),
                credits_per_period,
                price_cents,
                interval: "month".to_string(),
                is_active: true,
            },
        );
        self
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn package(&self, id: &str) -> LedgerResult<Option<Package>> {
        Ok(self.packages.get(id).cloned())
    }

    async fn plan(&self, id: &str) -> LedgerResult<Option<Plan>> {
        Ok(self.plans.get(id).cloned())
    }
}

pub struct MemoryUsageStore {
    inner: Mutex<Vec<GenerationRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<GenerationRecord> {
        self.inner.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn record_generation(&self, generation: NewGeneration) -> LedgerResult<()> {
        let mut records = self.inner.lock().unwrap();
        if records.iter().any(|r| r.attempt_id == generation.attempt_id) {
            return Ok(());
        }
        records.push(GenerationRecord {
            id: Uuid::new_v4(),
            account_id: generation.account_id,
            attempt_id: generation.attempt_id,
            output_url: generation.output_url,
            prompt: generation.prompt,
            mime_type: generation.mime_type,
            cost: generation.cost,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn generations_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<GenerationRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.account_id == account_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// A usage store that always fails, for exercising the refund path.
pub struct FailingUsageStore;

#[async_trait]
impl UsageStore for FailingUsageStore {
    async fn record_generation(&self, _generation: NewGeneration) -> LedgerResult<()> {
        Err(LedgerError::Database("usage table unavailable".to_string()))
    }

    async fn generations_for_account(
        &self,
        _account_id: Uuid,
        _limit: i64,
    ) -> LedgerResult<Vec<GenerationRecord>> {
        Err(LedgerError::Database("usage table unavailable".to_string()))
    }
}

/// What the scripted generator should do when called.
pub enum GeneratorScript {
    Succeed,
    Fail(String),
    Hang(Duration),
}

pub struct ScriptedGenerator {
    script: GeneratorScript,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: GeneratorScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> LedgerResult<GeneratedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            GeneratorScript::Succeed => Ok(GeneratedImage {
                bytes: vec![0xAB; 64],
                mime_type: "image/png".to_string(),
            }),
            GeneratorScript::Fail(message) => Err(LedgerError::ProviderFailed(message.clone())),
            GeneratorScript::Hang(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(GeneratedImage {
                    bytes: vec![0xAB; 64],
                    mime_type: "image/png".to_string(),
                })
            }
        }
    }
}

pub struct MemoryMediaStore {
    fail: bool,
    puts: AtomicUsize,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self {
            fail: false,
            puts: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            puts: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn put(&self, _bytes: &[u8], _content_type: &str) -> LedgerResult<String> {
        if self.fail {
            return Err(LedgerError::StorageFailed("bucket unreachable".to_string()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://media.sketchforge.test/{}", Uuid::new_v4()))
    }
}
