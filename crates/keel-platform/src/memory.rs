//! In-memory platform for tests and dry runs.
//!
//! [`InMemoryPlatform`] implements every service trait against plain maps and
//! keeps an ordered log of successful mutating calls, so callers can assert
//! exactly which API operations a reconcile issued.
//!
//! It enforces the platform rules reconcilers have to respect: functions need
//! an existing role, policies hold at most [`MAX_POLICY_VERSIONS`] versions,
//! roles and policies cannot be deleted while attached, and rules cannot be
//! deleted while they still have targets.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::Tags;
use keel_core::identity::{policy_arn, role_arn};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PlatformError, PlatformResult};
use crate::service::{
    ComputeService, EventService, GatewayService, IdentityService, RegistryService,
};
use crate::types::*;

/// Version slots per managed policy.
pub const MAX_POLICY_VERSIONS: usize = 5;

/// Bus every account starts with.
pub const DEFAULT_BUS: &str = "default";

/// One successful mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: &'static str,
    pub target: String,
}

#[derive(Debug, Clone)]
struct StoredImage {
    digest: String,
    tags: Vec<String>,
    pushed_at: DateTime<Utc>,
    architecture: String,
    labels: Labels,
}

#[derive(Debug, Default)]
struct State {
    roles: BTreeMap<String, Role>,
    attached: BTreeMap<String, BTreeSet<String>>,
    policies: BTreeMap<String, Policy>,
    versions: BTreeMap<String, Vec<PolicyVersion>>,
    next_version: BTreeMap<String, u32>,
    functions: BTreeMap<String, Deployment>,
    pending: BTreeMap<String, u32>,
    permissions: BTreeMap<String, Vec<Permission>>,
    buses: BTreeSet<String>,
    rules: BTreeMap<(String, String), Rule>,
    targets: BTreeMap<(String, String), Vec<Target>>,
    apis: BTreeMap<String, Api>,
    integrations: BTreeMap<String, Vec<Integration>>,
    routes: BTreeMap<String, Vec<Route>>,
    images: BTreeMap<String, Vec<StoredImage>>,
    update_lag: u32,
    sequence: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{prefix}-{:06}", self.sequence)
    }
}

#[derive(Debug)]
pub struct InMemoryPlatform {
    account_id: String,
    region: String,
    state: RwLock<State>,
    log: RwLock<Vec<Mutation>>,
    faults: RwLock<HashMap<String, VecDeque<PlatformError>>>,
}

fn poison_err<T>(_: PoisonError<T>) -> PlatformError {
    PlatformError::Other("in-memory platform lock poisoned".to_string())
}

impl InMemoryPlatform {
    #[must_use]
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        let state = State {
            buses: BTreeSet::from([DEFAULT_BUS.to_string()]),
            ..Default::default()
        };
        Self {
            account_id: account_id.into(),
            region: region.into(),
            state: RwLock::new(state),
            log: RwLock::new(Vec::new()),
            faults: RwLock::new(HashMap::new()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn function_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{name}",
            self.region, self.account_id
        )
    }

    fn rule_arn(&self, bus: &str, name: &str) -> String {
        let path = if bus == DEFAULT_BUS {
            name.to_string()
        } else {
            format!("{bus}/{name}")
        };
        format!(
            "arn:aws:events:{}:{}:rule/{path}",
            self.region, self.account_id
        )
    }

    fn registry_host(&self) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", self.account_id, self.region)
    }

    // ── Setup ──────────────────────────────────────────────────────

    /// Register a gateway API. Not logged.
    pub fn add_api(&self, id: &str, tags: Tags) -> PlatformResult<()> {
        let mut state = self.write()?;
        state.apis.insert(
            id.to_string(),
            Api {
                id: id.to_string(),
                name: id.to_string(),
                tags,
            },
        );
        Ok(())
    }

    /// Register an event bus. Not logged.
    pub fn add_bus(&self, name: &str) -> PlatformResult<()> {
        self.write()?.buses.insert(name.to_string());
        Ok(())
    }

    /// Store an image and return its digest. Tags move off older images.
    pub fn push_image(
        &self,
        repository: &str,
        tags: &[&str],
        architecture: &str,
        labels: Labels,
        pushed_at: DateTime<Utc>,
    ) -> PlatformResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(repository.as_bytes());
        for (k, v) in &labels {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.update(tags.join(",").as_bytes());
        hasher.update(pushed_at.to_rfc3339().as_bytes());
        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        let mut state = self.write()?;
        let images = state.images.entry(repository.to_string()).or_default();
        for image in images.iter_mut() {
            image.tags.retain(|t| !tags.contains(&t.as_str()));
        }
        images.push(StoredImage {
            digest: digest.clone(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            pushed_at,
            architecture: architecture.to_string(),
            labels,
        });
        Ok(digest)
    }

    /// Leave functions in progress for `polls` reads after each create/update.
    pub fn set_update_lag(&self, polls: u32) -> PlatformResult<()> {
        self.write()?.update_lag = polls;
        Ok(())
    }

    /// Fail the next call to `op` with `error`. Queued errors fire in order.
    pub fn fail_next(&self, op: &str, error: PlatformError) -> PlatformResult<()> {
        self.faults
            .write()
            .map_err(poison_err)?
            .entry(op.to_string())
            .or_default()
            .push_back(error);
        Ok(())
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn mutations(&self) -> Vec<Mutation> {
        self.log.read().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn mutation_count(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or_default()
    }

    /// Logged calls to one operation.
    pub fn calls(&self, op: &str) -> Vec<Mutation> {
        self.mutations().into_iter().filter(|m| m.op == op).collect()
    }

    pub fn clear_mutations(&self) {
        if let Ok(mut log) = self.log.write() {
            log.clear();
        }
    }

    pub fn role_exists(&self, name: &str) -> bool {
        self.read().map(|s| s.roles.contains_key(name)).unwrap_or(false)
    }

    pub fn policy_version_count(&self, arn: &str) -> usize {
        self.read()
            .map(|s| s.versions.get(arn).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn routes(&self, api_id: &str) -> Vec<Route> {
        self.read()
            .map(|s| s.routes.get(api_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn integrations(&self, api_id: &str) -> Vec<Integration> {
        self.read()
            .map(|s| s.integrations.get(api_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn read(&self) -> PlatformResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(poison_err)
    }

    fn write(&self) -> PlatformResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(poison_err)
    }

    /// Pop an injected fault for `op`, if any.
    fn enter(&self, op: &str) -> PlatformResult<()> {
        let mut faults = self.faults.write().map_err(poison_err)?;
        if let Some(error) = faults.get_mut(op).and_then(VecDeque::pop_front) {
            debug!(op, %error, "injected fault");
            return Err(error);
        }
        Ok(())
    }

    fn record(&self, op: &'static str, target: impl Into<String>) -> PlatformResult<()> {
        let target = target.into();
        debug!(op, %target, "mutation");
        self.log
            .write()
            .map_err(poison_err)?
            .push(Mutation { op, target });
        Ok(())
    }

    fn resolve_digest(state: &State, image_uri: &str) -> PlatformResult<String> {
        if let Some((_, digest)) = image_uri.split_once('@') {
            return Ok(digest.to_string());
        }
        let path = image_uri
            .split_once('/')
            .map(|(_, p)| p)
            .ok_or_else(|| PlatformError::InvalidRequest(format!("bad image uri {image_uri}")))?;
        let (repository, tag) = path
            .rsplit_once(':')
            .ok_or_else(|| PlatformError::InvalidRequest(format!("bad image uri {image_uri}")))?;
        state
            .images
            .get(repository)
            .and_then(|images| images.iter().find(|i| i.tags.iter().any(|t| t == tag)))
            .map(|i| i.digest.clone())
            .ok_or_else(|| PlatformError::InvalidRequest(format!("image not found: {image_uri}")))
    }

    fn mark_updating(state: &mut State, name: &str) {
        let lag = state.update_lag;
        if let Some(function) = state.functions.get_mut(name) {
            function.last_modified = Utc::now();
            if lag == 0 {
                function.update_status = UpdateStatus::Successful;
            } else {
                function.update_status = UpdateStatus::InProgress;
                state.pending.insert(name.to_string(), lag);
            }
        }
    }

    fn function_mut<'a>(state: &'a mut State, name: &str) -> PlatformResult<&'a mut Deployment> {
        state
            .functions
            .get_mut(name)
            .ok_or_else(|| PlatformError::not_found("function", name))
    }

    fn ensure_settled(function: &Deployment) -> PlatformResult<()> {
        if function.is_settled() {
            Ok(())
        } else {
            Err(PlatformError::Transient(format!(
                "an update is in progress for function {}",
                function.name
            )))
        }
    }
}

fn merge_tags(existing: &mut Tags, tags: &Tags) {
    for (k, v) in tags {
        existing.insert(k.clone(), v.clone());
    }
}

fn remove_tags(existing: &mut Tags, keys: &[String]) {
    for key in keys {
        existing.remove(key);
    }
}

// ── Identity ───────────────────────────────────────────────────────

#[async_trait]
impl IdentityService for InMemoryPlatform {
    async fn get_role(&self, name: &str) -> PlatformResult<Option<Role>> {
        self.enter("get_role")?;
        Ok(self.read()?.roles.get(name).cloned())
    }

    async fn create_role(
        &self,
        name: &str,
        trust_document: &str,
        tags: &Tags,
    ) -> PlatformResult<Role> {
        self.enter("create_role")?;
        let mut state = self.write()?;
        if state.roles.contains_key(name) {
            return Err(PlatformError::conflict("role", name));
        }
        let role = Role {
            name: name.to_string(),
            arn: role_arn(&self.account_id, name),
            trust_document: trust_document.to_string(),
            tags: tags.clone(),
        };
        state.roles.insert(name.to_string(), role.clone());
        self.record("create_role", name)?;
        Ok(role)
    }

    async fn update_trust_document(&self, name: &str, trust_document: &str) -> PlatformResult<()> {
        self.enter("update_trust_document")?;
        let mut state = self.write()?;
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| PlatformError::not_found("role", name))?;
        role.trust_document = trust_document.to_string();
        self.record("update_trust_document", name)
    }

    async fn tag_role(&self, name: &str, tags: &Tags) -> PlatformResult<()> {
        self.enter("tag_role")?;
        let mut state = self.write()?;
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| PlatformError::not_found("role", name))?;
        merge_tags(&mut role.tags, tags);
        self.record("tag_role", name)
    }

    async fn untag_role(&self, name: &str, keys: &[String]) -> PlatformResult<()> {
        self.enter("untag_role")?;
        let mut state = self.write()?;
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| PlatformError::not_found("role", name))?;
        remove_tags(&mut role.tags, keys);
        self.record("untag_role", name)
    }

    async fn delete_role(&self, name: &str) -> PlatformResult<()> {
        self.enter("delete_role")?;
        let mut state = self.write()?;
        if !state.roles.contains_key(name) {
            return Err(PlatformError::not_found("role", name));
        }
        if state.attached.get(name).is_some_and(|p| !p.is_empty()) {
            return Err(PlatformError::InvalidRequest(format!(
                "role {name} still has attached policies"
            )));
        }
        state.roles.remove(name);
        state.attached.remove(name);
        self.record("delete_role", name)
    }

    async fn list_attached_policies(&self, role: &str) -> PlatformResult<Vec<String>> {
        self.enter("list_attached_policies")?;
        let state = self.read()?;
        if !state.roles.contains_key(role) {
            return Err(PlatformError::not_found("role", role));
        }
        Ok(state
            .attached
            .get(role)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn attach_policy(&self, role: &str, policy_arn: &str) -> PlatformResult<()> {
        self.enter("attach_policy")?;
        let mut state = self.write()?;
        if !state.roles.contains_key(role) {
            return Err(PlatformError::not_found("role", role));
        }
        // Provider-managed policies are not stored locally.
        let managed = policy_arn.starts_with("arn:aws:iam::aws:policy/");
        if !managed && !state.policies.contains_key(policy_arn) {
            return Err(PlatformError::not_found("policy", policy_arn));
        }
        state
            .attached
            .entry(role.to_string())
            .or_default()
            .insert(policy_arn.to_string());
        self.record("attach_policy", format!("{role} {policy_arn}"))
    }

    async fn detach_policy(&self, role: &str, policy_arn: &str) -> PlatformResult<()> {
        self.enter("detach_policy")?;
        let mut state = self.write()?;
        let removed = state
            .attached
            .get_mut(role)
            .is_some_and(|set| set.remove(policy_arn));
        if !removed {
            return Err(PlatformError::not_found("policy attachment", policy_arn));
        }
        self.record("detach_policy", format!("{role} {policy_arn}"))
    }

    async fn get_policy(&self, arn: &str) -> PlatformResult<Option<Policy>> {
        self.enter("get_policy")?;
        Ok(self.read()?.policies.get(arn).cloned())
    }

    async fn create_policy(
        &self,
        name: &str,
        document: &str,
        tags: &Tags,
    ) -> PlatformResult<Policy> {
        self.enter("create_policy")?;
        let arn = policy_arn(&self.account_id, name);
        let mut state = self.write()?;
        if state.policies.contains_key(&arn) {
            return Err(PlatformError::conflict("policy", arn));
        }
        let policy = Policy {
            name: name.to_string(),
            arn: arn.clone(),
            default_version_id: "v1".to_string(),
            tags: tags.clone(),
        };
        state.policies.insert(arn.clone(), policy.clone());
        state.versions.insert(
            arn.clone(),
            vec![PolicyVersion {
                version_id: "v1".to_string(),
                document: document.to_string(),
                is_default: true,
            }],
        );
        state.next_version.insert(arn.clone(), 2);
        self.record("create_policy", arn)?;
        Ok(policy)
    }

    async fn list_policy_versions(&self, arn: &str) -> PlatformResult<Vec<PolicyVersion>> {
        self.enter("list_policy_versions")?;
        self.read()?
            .versions
            .get(arn)
            .cloned()
            .ok_or_else(|| PlatformError::not_found("policy", arn))
    }

    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_default: bool,
    ) -> PlatformResult<PolicyVersion> {
        self.enter("create_policy_version")?;
        let mut state = self.write()?;
        let next = state.next_version.get(arn).copied().unwrap_or(1);
        let versions = state
            .versions
            .get_mut(arn)
            .ok_or_else(|| PlatformError::not_found("policy", arn))?;
        if versions.len() >= MAX_POLICY_VERSIONS {
            return Err(PlatformError::LimitExceeded(format!(
                "policy {arn} already has {MAX_POLICY_VERSIONS} versions"
            )));
        }
        let version = PolicyVersion {
            version_id: format!("v{next}"),
            document: document.to_string(),
            is_default: set_default,
        };
        if set_default {
            for v in versions.iter_mut() {
                v.is_default = false;
            }
        }
        versions.push(version.clone());
        state.next_version.insert(arn.to_string(), next + 1);
        if set_default {
            if let Some(policy) = state.policies.get_mut(arn) {
                policy.default_version_id = version.version_id.clone();
            }
        }
        self.record("create_policy_version", arn)?;
        Ok(version)
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> PlatformResult<()> {
        self.enter("delete_policy_version")?;
        let mut state = self.write()?;
        let versions = state
            .versions
            .get_mut(arn)
            .ok_or_else(|| PlatformError::not_found("policy", arn))?;
        let index = versions
            .iter()
            .position(|v| v.version_id == version_id)
            .ok_or_else(|| PlatformError::not_found("policy version", version_id))?;
        if versions[index].is_default {
            return Err(PlatformError::InvalidRequest(format!(
                "cannot delete default version {version_id} of {arn}"
            )));
        }
        versions.remove(index);
        self.record("delete_policy_version", format!("{arn} {version_id}"))
    }

    async fn tag_policy(&self, arn: &str, tags: &Tags) -> PlatformResult<()> {
        self.enter("tag_policy")?;
        let mut state = self.write()?;
        let policy = state
            .policies
            .get_mut(arn)
            .ok_or_else(|| PlatformError::not_found("policy", arn))?;
        merge_tags(&mut policy.tags, tags);
        self.record("tag_policy", arn)
    }

    async fn untag_policy(&self, arn: &str, keys: &[String]) -> PlatformResult<()> {
        self.enter("untag_policy")?;
        let mut state = self.write()?;
        let policy = state
            .policies
            .get_mut(arn)
            .ok_or_else(|| PlatformError::not_found("policy", arn))?;
        remove_tags(&mut policy.tags, keys);
        self.record("untag_policy", arn)
    }

    async fn delete_policy(&self, arn: &str) -> PlatformResult<()> {
        self.enter("delete_policy")?;
        let mut state = self.write()?;
        if !state.policies.contains_key(arn) {
            return Err(PlatformError::not_found("policy", arn));
        }
        if state.attached.values().any(|set| set.contains(arn)) {
            return Err(PlatformError::InvalidRequest(format!(
                "policy {arn} is still attached"
            )));
        }
        if state.versions.get(arn).is_some_and(|v| v.len() > 1) {
            return Err(PlatformError::InvalidRequest(format!(
                "policy {arn} still has non-default versions"
            )));
        }
        state.policies.remove(arn);
        state.versions.remove(arn);
        state.next_version.remove(arn);
        self.record("delete_policy", arn)
    }
}

// ── Compute ────────────────────────────────────────────────────────

#[async_trait]
impl ComputeService for InMemoryPlatform {
    async fn get_function(&self, name: &str) -> PlatformResult<Option<Deployment>> {
        self.enter("get_function")?;
        let mut state = self.write()?;
        let settled = match state.pending.get_mut(name) {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if settled {
            state.pending.remove(name);
            if let Some(function) = state.functions.get_mut(name) {
                function.update_status = UpdateStatus::Successful;
            }
        }
        Ok(state.functions.get(name).cloned())
    }

    async fn list_functions(&self) -> PlatformResult<Vec<Deployment>> {
        self.enter("list_functions")?;
        Ok(self.read()?.functions.values().cloned().collect())
    }

    async fn create_function(&self, input: &CreateFunction) -> PlatformResult<Deployment> {
        self.enter("create_function")?;
        let mut state = self.write()?;
        if state.functions.contains_key(&input.name) {
            return Err(PlatformError::conflict("function", &input.name));
        }
        let role_name = keel_core::identity::role_name_from_arn(&input.settings.role_arn)
            .unwrap_or_default();
        if !state.roles.contains_key(role_name) {
            return Err(PlatformError::InvalidRequest(format!(
                "role {} cannot be assumed",
                input.settings.role_arn
            )));
        }
        let code_digest = Self::resolve_digest(&state, &input.code.image_uri)?;
        let deployment = Deployment {
            name: input.name.clone(),
            arn: self.function_arn(&input.name),
            settings: input.settings.clone(),
            code: input.code.clone(),
            code_digest,
            reserved_concurrency: None,
            tags: input.tags.clone(),
            last_modified: Utc::now(),
            update_status: UpdateStatus::Successful,
        };
        state.functions.insert(input.name.clone(), deployment);
        Self::mark_updating(&mut state, &input.name);
        self.record("create_function", format!("{} {}", input.name, input.settings.role_arn))?;
        Self::function_mut(&mut state, &input.name).map(|f| f.clone())
    }

    async fn update_function_configuration(
        &self,
        name: &str,
        settings: &FunctionSettings,
    ) -> PlatformResult<Deployment> {
        self.enter("update_function_configuration")?;
        let mut state = self.write()?;
        let role_name =
            keel_core::identity::role_name_from_arn(&settings.role_arn).unwrap_or_default();
        if !state.roles.contains_key(role_name) {
            return Err(PlatformError::InvalidRequest(format!(
                "role {} cannot be assumed",
                settings.role_arn
            )));
        }
        let function = Self::function_mut(&mut state, name)?;
        Self::ensure_settled(function)?;
        function.settings = settings.clone();
        Self::mark_updating(&mut state, name);
        self.record(
            "update_function_configuration",
            format!("{name} {}", settings.role_arn),
        )?;
        Self::function_mut(&mut state, name).map(|f| f.clone())
    }

    async fn update_function_code(
        &self,
        name: &str,
        code: &FunctionCode,
    ) -> PlatformResult<Deployment> {
        self.enter("update_function_code")?;
        let mut state = self.write()?;
        let digest = Self::resolve_digest(&state, &code.image_uri)?;
        let function = Self::function_mut(&mut state, name)?;
        Self::ensure_settled(function)?;
        function.code = code.clone();
        function.code_digest = digest;
        Self::mark_updating(&mut state, name);
        self.record("update_function_code", format!("{name} {}", code.image_uri))?;
        Self::function_mut(&mut state, name).map(|f| f.clone())
    }

    async fn put_function_concurrency(&self, name: &str, reserved: i32) -> PlatformResult<()> {
        self.enter("put_function_concurrency")?;
        let mut state = self.write()?;
        Self::function_mut(&mut state, name)?.reserved_concurrency = Some(reserved);
        self.record("put_function_concurrency", name)
    }

    async fn tag_function(&self, arn: &str, tags: &Tags) -> PlatformResult<()> {
        self.enter("tag_function")?;
        let mut state = self.write()?;
        let function = state
            .functions
            .values_mut()
            .find(|f| f.arn == arn)
            .ok_or_else(|| PlatformError::not_found("function", arn))?;
        merge_tags(&mut function.tags, tags);
        self.record("tag_function", arn)
    }

    async fn untag_function(&self, arn: &str, keys: &[String]) -> PlatformResult<()> {
        self.enter("untag_function")?;
        let mut state = self.write()?;
        let function = state
            .functions
            .values_mut()
            .find(|f| f.arn == arn)
            .ok_or_else(|| PlatformError::not_found("function", arn))?;
        remove_tags(&mut function.tags, keys);
        self.record("untag_function", arn)
    }

    async fn delete_function(&self, name: &str) -> PlatformResult<()> {
        self.enter("delete_function")?;
        let mut state = self.write()?;
        if state.functions.remove(name).is_none() {
            return Err(PlatformError::not_found("function", name));
        }
        state.permissions.remove(name);
        state.pending.remove(name);
        self.record("delete_function", name)
    }

    async fn list_permissions(&self, function: &str) -> PlatformResult<Vec<Permission>> {
        self.enter("list_permissions")?;
        let state = self.read()?;
        if !state.functions.contains_key(function) {
            return Err(PlatformError::not_found("function", function));
        }
        Ok(state.permissions.get(function).cloned().unwrap_or_default())
    }

    async fn add_permission(&self, function: &str, permission: &Permission) -> PlatformResult<()> {
        self.enter("add_permission")?;
        let mut state = self.write()?;
        if !state.functions.contains_key(function) {
            return Err(PlatformError::not_found("function", function));
        }
        let statements = state.permissions.entry(function.to_string()).or_default();
        if statements
            .iter()
            .any(|p| p.statement_id == permission.statement_id)
        {
            return Err(PlatformError::conflict(
                "permission statement",
                &permission.statement_id,
            ));
        }
        statements.push(permission.clone());
        self.record(
            "add_permission",
            format!("{function} {}", permission.statement_id),
        )
    }

    async fn remove_permission(&self, function: &str, statement_id: &str) -> PlatformResult<()> {
        self.enter("remove_permission")?;
        let mut state = self.write()?;
        let statements = state
            .permissions
            .get_mut(function)
            .ok_or_else(|| PlatformError::not_found("permission statement", statement_id))?;
        let before = statements.len();
        statements.retain(|p| p.statement_id != statement_id);
        if statements.len() == before {
            return Err(PlatformError::not_found("permission statement", statement_id));
        }
        self.record("remove_permission", format!("{function} {statement_id}"))
    }
}

// ── Event bus ──────────────────────────────────────────────────────

#[async_trait]
impl EventService for InMemoryPlatform {
    async fn list_buses(&self) -> PlatformResult<Vec<String>> {
        self.enter("list_buses")?;
        Ok(self.read()?.buses.iter().cloned().collect())
    }

    async fn list_rules(&self, bus: &str) -> PlatformResult<Vec<Rule>> {
        self.enter("list_rules")?;
        let state = self.read()?;
        if !state.buses.contains(bus) {
            return Err(PlatformError::not_found("event bus", bus));
        }
        Ok(state
            .rules
            .iter()
            .filter(|((b, _), _)| b == bus)
            .map(|(_, rule)| rule.clone())
            .collect())
    }

    async fn describe_rule(&self, bus: &str, name: &str) -> PlatformResult<Option<Rule>> {
        self.enter("describe_rule")?;
        Ok(self
            .read()?
            .rules
            .get(&(bus.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_targets(&self, bus: &str, rule: &str) -> PlatformResult<Vec<Target>> {
        self.enter("list_targets")?;
        let state = self.read()?;
        let key = (bus.to_string(), rule.to_string());
        if !state.rules.contains_key(&key) {
            return Err(PlatformError::not_found("rule", rule));
        }
        Ok(state.targets.get(&key).cloned().unwrap_or_default())
    }

    async fn put_rule(
        &self,
        bus: &str,
        name: &str,
        expression: &RuleExpression,
        description: &str,
    ) -> PlatformResult<Rule> {
        self.enter("put_rule")?;
        let mut state = self.write()?;
        if !state.buses.contains(bus) {
            return Err(PlatformError::not_found("event bus", bus));
        }
        let rule = Rule {
            bus: bus.to_string(),
            name: name.to_string(),
            arn: self.rule_arn(bus, name),
            expression: expression.clone(),
            state: RuleState::Enabled,
            description: description.to_string(),
        };
        state
            .rules
            .insert((bus.to_string(), name.to_string()), rule.clone());
        self.record("put_rule", format!("{bus}/{name}"))?;
        Ok(rule)
    }

    async fn put_target(&self, bus: &str, rule: &str, target: &Target) -> PlatformResult<()> {
        self.enter("put_target")?;
        let mut state = self.write()?;
        let key = (bus.to_string(), rule.to_string());
        if !state.rules.contains_key(&key) {
            return Err(PlatformError::not_found("rule", rule));
        }
        let targets = state.targets.entry(key).or_default();
        targets.retain(|t| t.id != target.id);
        targets.push(target.clone());
        self.record("put_target", format!("{bus}/{rule} {}", target.id))
    }

    async fn remove_target(&self, bus: &str, rule: &str, target_id: &str) -> PlatformResult<()> {
        self.enter("remove_target")?;
        let mut state = self.write()?;
        let key = (bus.to_string(), rule.to_string());
        if !state.rules.contains_key(&key) {
            return Err(PlatformError::not_found("rule", rule));
        }
        let targets = state.targets.entry(key).or_default();
        let before = targets.len();
        targets.retain(|t| t.id != target_id);
        if targets.len() == before {
            return Err(PlatformError::not_found("target", target_id));
        }
        self.record("remove_target", format!("{bus}/{rule} {target_id}"))
    }

    async fn delete_rule(&self, bus: &str, name: &str) -> PlatformResult<()> {
        self.enter("delete_rule")?;
        let mut state = self.write()?;
        let key = (bus.to_string(), name.to_string());
        if !state.rules.contains_key(&key) {
            return Err(PlatformError::not_found("rule", name));
        }
        if state.targets.get(&key).is_some_and(|t| !t.is_empty()) {
            return Err(PlatformError::InvalidRequest(format!(
                "rule {name} still has targets"
            )));
        }
        state.rules.remove(&key);
        state.targets.remove(&key);
        self.record("delete_rule", format!("{bus}/{name}"))
    }
}

// ── Gateway ────────────────────────────────────────────────────────

#[async_trait]
impl GatewayService for InMemoryPlatform {
    async fn get_api(&self, api_id: &str) -> PlatformResult<Api> {
        self.enter("get_api")?;
        self.read()?
            .apis
            .get(api_id)
            .cloned()
            .ok_or_else(|| PlatformError::not_found("api", api_id))
    }

    async fn list_integrations(&self, api_id: &str) -> PlatformResult<Vec<Integration>> {
        self.enter("list_integrations")?;
        let state = self.read()?;
        if !state.apis.contains_key(api_id) {
            return Err(PlatformError::not_found("api", api_id));
        }
        Ok(state.integrations.get(api_id).cloned().unwrap_or_default())
    }

    async fn create_integration(
        &self,
        api_id: &str,
        spec: &IntegrationSpec,
    ) -> PlatformResult<Integration> {
        self.enter("create_integration")?;
        let mut state = self.write()?;
        if !state.apis.contains_key(api_id) {
            return Err(PlatformError::not_found("api", api_id));
        }
        let integration = Integration {
            id: state.next_id("int"),
            spec: spec.clone(),
        };
        state
            .integrations
            .entry(api_id.to_string())
            .or_default()
            .push(integration.clone());
        self.record("create_integration", format!("{api_id} {}", integration.id))?;
        Ok(integration)
    }

    async fn update_integration(
        &self,
        api_id: &str,
        integration_id: &str,
        spec: &IntegrationSpec,
    ) -> PlatformResult<Integration> {
        self.enter("update_integration")?;
        let mut state = self.write()?;
        let integration = state
            .integrations
            .get_mut(api_id)
            .and_then(|list| list.iter_mut().find(|i| i.id == integration_id))
            .ok_or_else(|| PlatformError::not_found("integration", integration_id))?;
        integration.spec = spec.clone();
        let updated = integration.clone();
        self.record("update_integration", format!("{api_id} {integration_id}"))?;
        Ok(updated)
    }

    async fn delete_integration(&self, api_id: &str, integration_id: &str) -> PlatformResult<()> {
        self.enter("delete_integration")?;
        let mut state = self.write()?;
        let target = format!("integrations/{integration_id}");
        if state
            .routes
            .get(api_id)
            .is_some_and(|routes| routes.iter().any(|r| r.spec.target == target))
        {
            return Err(PlatformError::InvalidRequest(format!(
                "integration {integration_id} is still referenced by a route"
            )));
        }
        let list = state
            .integrations
            .get_mut(api_id)
            .ok_or_else(|| PlatformError::not_found("integration", integration_id))?;
        let before = list.len();
        list.retain(|i| i.id != integration_id);
        if list.len() == before {
            return Err(PlatformError::not_found("integration", integration_id));
        }
        self.record("delete_integration", format!("{api_id} {integration_id}"))
    }

    async fn list_routes(&self, api_id: &str) -> PlatformResult<Vec<Route>> {
        self.enter("list_routes")?;
        let state = self.read()?;
        if !state.apis.contains_key(api_id) {
            return Err(PlatformError::not_found("api", api_id));
        }
        Ok(state.routes.get(api_id).cloned().unwrap_or_default())
    }

    async fn create_route(&self, api_id: &str, spec: &RouteSpec) -> PlatformResult<Route> {
        self.enter("create_route")?;
        let mut state = self.write()?;
        if !state.apis.contains_key(api_id) {
            return Err(PlatformError::not_found("api", api_id));
        }
        if state
            .routes
            .get(api_id)
            .is_some_and(|routes| routes.iter().any(|r| r.spec.key == spec.key))
        {
            return Err(PlatformError::conflict("route", &spec.key));
        }
        let route = Route {
            id: state.next_id("route"),
            spec: spec.clone(),
        };
        state
            .routes
            .entry(api_id.to_string())
            .or_default()
            .push(route.clone());
        self.record("create_route", format!("{api_id} {}", spec.key))?;
        Ok(route)
    }

    async fn update_route(
        &self,
        api_id: &str,
        route_id: &str,
        spec: &RouteSpec,
    ) -> PlatformResult<Route> {
        self.enter("update_route")?;
        let mut state = self.write()?;
        let route = state
            .routes
            .get_mut(api_id)
            .and_then(|routes| routes.iter_mut().find(|r| r.id == route_id))
            .ok_or_else(|| PlatformError::not_found("route", route_id))?;
        route.spec = spec.clone();
        let updated = route.clone();
        self.record("update_route", format!("{api_id} {}", spec.key))?;
        Ok(updated)
    }

    async fn delete_route(&self, api_id: &str, route_id: &str) -> PlatformResult<()> {
        self.enter("delete_route")?;
        let mut state = self.write()?;
        let routes = state
            .routes
            .get_mut(api_id)
            .ok_or_else(|| PlatformError::not_found("route", route_id))?;
        let before = routes.len();
        routes.retain(|r| r.id != route_id);
        if routes.len() == before {
            return Err(PlatformError::not_found("route", route_id));
        }
        self.record("delete_route", format!("{api_id} {route_id}"))
    }
}

// ── Registry ───────────────────────────────────────────────────────

#[async_trait]
impl RegistryService for InMemoryPlatform {
    async fn inspect(&self, repository: &str, reference: &ImageRef) -> PlatformResult<Artifact> {
        self.enter("inspect")?;
        let state = self.read()?;
        let images = state
            .images
            .get(repository)
            .ok_or_else(|| PlatformError::not_found("repository", repository))?;
        let image = images
            .iter()
            .find(|i| match reference {
                ImageRef::Tag(tag) => i.tags.iter().any(|t| t == tag),
                ImageRef::Digest(digest) => &i.digest == digest,
            })
            .ok_or_else(|| PlatformError::not_found("image", format!("{repository}{reference}")))?;
        Ok(Artifact {
            repository: repository.to_string(),
            digest: image.digest.clone(),
            uri: format!("{}/{repository}@{}", self.registry_host(), image.digest),
            architecture: image.architecture.clone(),
            labels: image.labels.clone(),
        })
    }

    async fn list_images(&self, repository: &str) -> PlatformResult<Vec<ImageDetail>> {
        self.enter("list_images")?;
        let state = self.read()?;
        let images = state
            .images
            .get(repository)
            .ok_or_else(|| PlatformError::not_found("repository", repository))?;
        Ok(images
            .iter()
            .map(|i| ImageDetail {
                digest: i.digest.clone(),
                tags: i.tags.clone(),
                pushed_at: i.pushed_at,
            })
            .collect())
    }

    async fn delete_images(&self, repository: &str, digests: &[String]) -> PlatformResult<()> {
        self.enter("delete_images")?;
        let mut state = self.write()?;
        let images = state
            .images
            .get_mut(repository)
            .ok_or_else(|| PlatformError::not_found("repository", repository))?;
        images.retain(|i| !digests.contains(&i.digest));
        self.record("delete_images", format!("{repository} {}", digests.len()))
    }
}
