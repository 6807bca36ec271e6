//! Test utilities: in-memory fakes of the identity provider and record store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};

use site_common::{
    error_codes, ChangeEvent, ChangeKind, Direction, IdentityUser, RecordQuery, Session,
    SignUpRequest, SignUpResponse, Table, UserMetadata,
};

use crate::auth::AuthFacade;
use crate::config::Config;
use crate::error::{IdentityError, RecordError};
use crate::identity::IdentityProvider;
use crate::records::{RecordStore, UpsertMode};
use crate::storage::MemoryStorage;

fn provider_error(status: u16, code: &str, message: &str) -> IdentityError {
    IdentityError::Provider {
        status,
        code: Some(code.to_string()),
        message: message.to_string(),
    }
}

struct Account {
    user: IdentityUser,
    password: String,
}

#[derive(Default)]
struct IdentityState {
    accounts: HashMap<String, Account>,
    /// access token -> user id
    access: HashMap<String, (String, i64)>,
    /// refresh token -> user id
    refresh: HashMap<String, String>,
    resets: Vec<String>,
    next_id: u64,
}

/// Identity provider kept in memory.
pub struct FakeIdentity {
    state: Mutex<IdentityState>,
    require_confirmation: AtomicBool,
    failing: AtomicBool,
    rate_limited: AtomicBool,
    session_ttl: Mutex<i64>,
    sign_in_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

impl Default for FakeIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdentityState::default()),
            require_confirmation: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            rate_limited: AtomicBool::new(false),
            session_ttl: Mutex::new(3600),
            sign_in_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap()
    }

    /// New sign-ups stay unconfirmed and get no session.
    pub fn set_require_confirmation(&self, value: bool) {
        self.require_confirmation.store(value, Ordering::SeqCst);
    }

    /// Every call fails as if the provider were unreachable.
    pub fn set_failing(&self, value: bool) {
        self.failing.store(value, Ordering::SeqCst);
    }

    /// Sign-in, sign-up and reset answer 429.
    pub fn set_rate_limited(&self, value: bool) {
        self.rate_limited.store(value, Ordering::SeqCst);
    }

    /// Lifetime in seconds of sessions issued from now on. Negative values
    /// issue already-expired sessions.
    pub fn set_session_ttl(&self, seconds: i64) {
        *self.session_ttl.lock().unwrap() = seconds;
    }

    pub fn add_account(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
        confirmed: bool,
    ) -> IdentityUser {
        let mut state = self.state();
        state.next_id += 1;
        let now = Utc::now();
        let user = IdentityUser {
            id: format!("user-{}", state.next_id),
            email: email.to_lowercase(),
            user_metadata: metadata,
            email_confirmed_at: confirmed.then_some(now),
            created_at: now,
        };
        state.accounts.insert(
            user.email.clone(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        user
    }

    pub fn confirm(&self, email: &str) {
        if let Some(account) = self.state().accounts.get_mut(&email.to_lowercase()) {
            account.user.email_confirmed_at = Some(Utc::now());
        }
    }

    /// Revoke every issued session, as a sign-out elsewhere would.
    pub fn revoke_all(&self) {
        let mut state = self.state();
        state.access.clear();
        state.refresh.clear();
    }

    pub fn active_sessions(&self) -> usize {
        self.state().access.len()
    }

    pub fn reset_requests(&self) -> Vec<String> {
        self.state().resets.clone()
    }

    pub fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), IdentityError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn check_rate(&self) -> Result<(), IdentityError> {
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(provider_error(
                429,
                error_codes::RATE_LIMITED,
                "Request rate limit reached",
            ));
        }
        Ok(())
    }

    fn issue(&self, state: &mut IdentityState, user: &IdentityUser) -> Session {
        state.next_id += 1;
        let ttl = *self.session_ttl.lock().unwrap();
        let expires_at = Utc::now().timestamp() + ttl;
        let access_token = format!("access-{}", state.next_id);
        let refresh_token = format!("refresh-{}", state.next_id);
        state
            .access
            .insert(access_token.clone(), (user.id.clone(), expires_at));
        state.refresh.insert(refresh_token.clone(), user.id.clone());
        Session {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: ttl,
            expires_at,
            refresh_token,
            user: user.clone(),
        }
    }

    fn user_by_id(state: &IdentityState, id: &str) -> Option<IdentityUser> {
        state
            .accounts
            .values()
            .find(|a| a.user.id == id)
            .map(|a| a.user.clone())
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, IdentityError> {
        self.check_available()?;
        self.check_rate()?;
        let email = request.email.trim().to_lowercase();
        if self.state().accounts.contains_key(&email) {
            return Err(provider_error(
                422,
                error_codes::USER_ALREADY_EXISTS,
                "User already registered",
            ));
        }
        if request.password.len() < 6 {
            return Err(provider_error(
                422,
                error_codes::WEAK_PASSWORD,
                "Password should be at least 6 characters",
            ));
        }

        let confirmed = !self.require_confirmation.load(Ordering::SeqCst);
        let user = self.add_account(&email, &request.password, request.data.clone(), confirmed);
        let session = if confirmed {
            let mut state = self.state();
            Some(self.issue(&mut state, &user))
        } else {
            None
        };
        Ok(SignUpResponse { user, session })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, IdentityError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.check_rate()?;

        let mut state = self.state();
        let user = match state.accounts.get(&email.trim().to_lowercase()) {
            Some(account) if account.password == password => account.user.clone(),
            _ => {
                return Err(provider_error(
                    400,
                    error_codes::INVALID_CREDENTIALS,
                    "Invalid login credentials",
                ))
            }
        };
        if !user.is_confirmed() {
            return Err(provider_error(
                400,
                error_codes::EMAIL_NOT_CONFIRMED,
                "Email not confirmed",
            ));
        }
        Ok(self.issue(&mut state, &user))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut state = self.state();
        let (user_id, _) = state
            .access
            .remove(access_token)
            .ok_or_else(|| provider_error(401, error_codes::UNAUTHORIZED, "Invalid token"))?;
        state.refresh.retain(|_, owner| *owner != user_id);
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<IdentityUser, IdentityError> {
        self.check_available()?;
        let state = self.state();
        let unauthorized = || provider_error(401, error_codes::UNAUTHORIZED, "Invalid token");
        let (user_id, expires_at) = state.access.get(access_token).ok_or_else(unauthorized)?;
        if Utc::now().timestamp() >= *expires_at {
            return Err(unauthorized());
        }
        Self::user_by_id(&state, user_id).ok_or_else(unauthorized)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, IdentityError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut state = self.state();
        let user_id = state.refresh.remove(refresh_token).ok_or_else(|| {
            provider_error(401, error_codes::UNAUTHORIZED, "Invalid refresh token")
        })?;
        let user = Self::user_by_id(&state, &user_id).ok_or_else(|| {
            provider_error(401, error_codes::UNAUTHORIZED, "Invalid refresh token")
        })?;
        Ok(self.issue(&mut state, &user))
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), IdentityError> {
        self.check_available()?;
        self.check_rate()?;
        self.state().resets.push(email.trim().to_lowercase());
        Ok(())
    }
}

/// Record store kept in memory. Filters compare the JSON value's text form.
pub struct FakeRecordStore {
    tables: Mutex<HashMap<Table, Vec<Map<String, Value>>>>,
    failing: AtomicBool,
    next_id: AtomicUsize,
    access_token: Mutex<Option<String>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for FakeRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRecordStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            tables: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
            access_token: Mutex::new(None),
            changes,
        }
    }

    pub fn set_failing(&self, value: bool) {
        self.failing.store(value, Ordering::SeqCst);
    }

    /// Bearer most recently handed to the store.
    pub fn access_token(&self) -> Option<String> {
        self.access_token.lock().unwrap().clone()
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), RecordError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RecordError::Transport("record store unavailable".to_string()));
        }
        Ok(())
    }

    fn publish(&self, table: Table, kind: ChangeKind, row: &Map<String, Value>) {
        let _ = self
            .changes
            .send(ChangeEvent::new(table, kind, Value::Object(row.clone())));
    }

    fn object(row: Value) -> Result<Map<String, Value>, RecordError> {
        match row {
            Value::Object(map) => Ok(map),
            other => Err(RecordError::Store {
                status: 400,
                code: Some(error_codes::VALIDATION_FAILED.to_string()),
                message: format!("expected an object, got {}", other),
            }),
        }
    }

    fn fill_defaults(&self, table: Table, row: &mut Map<String, Value>) {
        let now = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));
        if !row.contains_key("id") {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            row.insert("id".to_string(), Value::String(format!("{}-{}", table, n)));
        }
        row.entry("created_at").or_insert_with(|| now.clone());
        if table.has_column("updated_at") {
            row.entry("updated_at").or_insert(now);
        }
    }

    fn insert_row(
        &self,
        rows: &mut Vec<Map<String, Value>>,
        table: Table,
        mut row: Map<String, Value>,
    ) -> Result<Map<String, Value>, RecordError> {
        self.fill_defaults(table, &mut row);
        if rows.iter().any(|r| r.get("id") == row.get("id")) {
            return Err(RecordError::Store {
                status: 409,
                code: Some("conflict".to_string()),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        rows.push(row.clone());
        Ok(row)
    }

    fn merge(table: Table, target: &mut Map<String, Value>, patch: Map<String, Value>) {
        for (key, value) in patch {
            target.insert(key, value);
        }
        if table.has_column("updated_at") {
            target.insert(
                "updated_at".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "null".to_string(),
        Some(other) => other.to_string(),
    }
}

fn matches(row: &Map<String, Value>, query: &RecordQuery) -> bool {
    query
        .filters
        .iter()
        .all(|(column, value)| text(row.get(column)) == *value)
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn select(&self, table: Table, query: &RecordQuery) -> Result<Vec<Value>, RecordError> {
        self.check_available()?;
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Map<String, Value>> = tables
            .get(&table)
            .map(|rows| rows.iter().filter(|r| matches(r, query)).cloned().collect())
            .unwrap_or_default();
        if let Some((column, direction)) = &query.order {
            rows.sort_by_key(|r| text(r.get(column)));
            if *direction == Direction::Desc {
                rows.reverse();
            }
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows.into_iter().map(Value::Object).collect())
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Vec<Value>, RecordError> {
        self.check_available()?;
        let row = Self::object(row)?;
        let mut tables = self.tables.lock().unwrap();
        let stored = self.insert_row(tables.entry(table).or_default(), table, row)?;
        self.publish(table, ChangeKind::Insert, &stored);
        Ok(vec![Value::Object(stored)])
    }

    async fn update(
        &self,
        table: Table,
        filter: &RecordQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RecordError> {
        self.check_available()?;
        let patch = Self::object(patch)?;
        let mut tables = self.tables.lock().unwrap();
        let mut updated = Vec::new();
        for row in tables.entry(table).or_default().iter_mut() {
            if matches(row, filter) {
                Self::merge(table, row, patch.clone());
                self.publish(table, ChangeKind::Update, row);
                updated.push(Value::Object(row.clone()));
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: Table, filter: &RecordQuery) -> Result<Vec<Value>, RecordError> {
        self.check_available()?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table).or_default();
        let (removed, kept): (Vec<_>, Vec<_>) = rows.drain(..).partition(|r| matches(r, filter));
        *rows = kept;
        for row in &removed {
            self.publish(table, ChangeKind::Delete, row);
        }
        Ok(removed.into_iter().map(Value::Object).collect())
    }

    async fn upsert(
        &self,
        table: Table,
        row: Value,
        mode: UpsertMode,
    ) -> Result<Vec<Value>, RecordError> {
        self.check_available()?;
        let row = Self::object(row)?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table).or_default();

        let existing = row
            .get("id")
            .and_then(|id| rows.iter().position(|r| r.get("id") == Some(id)));
        match (existing, mode) {
            (Some(_), UpsertMode::IgnoreDuplicates) => Ok(Vec::new()),
            (Some(index), UpsertMode::Merge) => {
                let target = &mut rows[index];
                Self::merge(table, target, row);
                self.publish(table, ChangeKind::Update, target);
                Ok(vec![Value::Object(target.clone())])
            }
            (None, _) => {
                let stored = self.insert_row(rows, table, row)?;
                self.publish(table, ChangeKind::Insert, &stored);
                Ok(vec![Value::Object(stored)])
            }
        }
    }

    async fn subscribe(&self, table: Table) -> Result<mpsc::Receiver<ChangeEvent>, RecordError> {
        self.check_available()?;
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(event) = changes.recv().await {
                if event.table == table && tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn set_access_token(&self, token: Option<String>) {
        *self.access_token.lock().unwrap() = token;
    }
}

/// A facade wired to fresh fakes.
pub struct TestClient {
    pub facade: Arc<AuthFacade>,
    pub identity: Arc<FakeIdentity>,
    pub records: Arc<FakeRecordStore>,
    pub storage: Arc<MemoryStorage>,
}

pub fn test_client() -> TestClient {
    test_client_with(Config::default())
}

pub fn test_client_with(config: Config) -> TestClient {
    let identity = Arc::new(FakeIdentity::new());
    let records = Arc::new(FakeRecordStore::new());
    let storage = Arc::new(MemoryStorage::new());
    let facade = AuthFacade::new(identity.clone(), records.clone(), storage.clone(), &config)
        .expect("test facade");
    TestClient {
        facade: Arc::new(facade),
        identity,
        records,
        storage,
    }
}
