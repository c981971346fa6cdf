//! Scripted in-memory directory for tests

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use ldapbridge_core::types::{BindOutcome, DirectoryEndpoint, DirectoryEntry, SearchOutcome};
use parking_lot::Mutex;

use crate::directory::{BindCredentials, DirectoryClient, SearchRequest};

#[derive(Debug, Clone)]
struct ScriptedUser {
    dn: String,
    uid: String,
    password: String,
}

#[derive(Debug, Clone)]
struct ScriptedGroup {
    dn: String,
    members: Vec<String>,
    rules: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    users: Vec<ScriptedUser>,
    groups: Vec<ScriptedGroup>,
    service: Option<(String, String)>,
    down: HashSet<String>,
    delays: HashMap<String, Duration>,
    group_search_down: bool,
    user_search_rc: Option<u32>,
    group_search_rc: Option<u32>,
    missing_bases: HashSet<String>,
    omit_dn_attribute: bool,
    binds: usize,
    searches: usize,
    probes: usize,
}

/// A directory whose contents and failures are set up by the test
#[derive(Debug, Default)]
pub(crate) struct ScriptedDirectory {
    state: Mutex<State>,
}

pub(crate) const RULES_ATTRIBUTE: &str = "aclRules";

impl ScriptedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, dn: &str, uid: &str, password: &str) {
        self.state.lock().users.push(ScriptedUser {
            dn: dn.to_string(),
            uid: uid.to_string(),
            password: password.to_string(),
        });
    }

    pub fn remove_user(&self, uid: &str) {
        self.state.lock().users.retain(|u| u.uid != uid);
    }

    pub fn set_password(&self, uid: &str, password: &str) {
        for user in self.state.lock().users.iter_mut().filter(|u| u.uid == uid) {
            user.password = password.to_string();
        }
    }

    pub fn add_group(&self, dn: &str, members: &[&str], rules: &[&str]) {
        self.state.lock().groups.push(ScriptedGroup {
            dn: dn.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            rules: rules.iter().map(|r| r.to_string()).collect(),
        });
    }

    pub fn set_service_account(&self, dn: &str, password: &str) {
        self.state.lock().service = Some((dn.to_string(), password.to_string()));
    }

    pub fn set_down(&self, url: &str) {
        self.state.lock().down.insert(url.to_string());
    }

    pub fn set_up(&self, url: &str) {
        self.state.lock().down.remove(url);
    }

    pub fn set_all_down(&self, urls: &[&str]) {
        for url in urls {
            self.set_down(url);
        }
    }

    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.state.lock().delays.insert(url.to_string(), delay);
    }

    pub fn fail_group_search(&self, fail: bool) {
        self.state.lock().group_search_down = fail;
    }

    /// Answer user searches with result code `rc`, or normally for `None`
    pub fn fail_search_with(&self, rc: Option<u32>) {
        self.state.lock().user_search_rc = rc;
    }

    /// Answer group searches with result code `rc`, or normally for `None`
    pub fn fail_group_search_with(&self, rc: Option<u32>) {
        self.state.lock().group_search_rc = rc;
    }

    /// Searches under `base` answer noSuchObject (32)
    pub fn remove_base(&self, base: &str) {
        self.state.lock().missing_bases.insert(base.to_ascii_lowercase());
    }

    /// Return user entries without the resolved DN attribute
    pub fn omit_dn_attribute(&self, omit: bool) {
        self.state.lock().omit_dn_attribute = omit;
    }

    pub fn bind_count(&self) -> usize {
        self.state.lock().binds
    }

    pub fn search_count(&self) -> usize {
        self.state.lock().searches
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock().probes
    }

    /// Binds plus searches
    pub fn call_count(&self) -> usize {
        let state = self.state.lock();
        state.binds + state.searches
    }

    /// Simulated transport: `Err` when the endpoint is down or slower than
    /// the timeout
    async fn transport(&self, endpoint: &DirectoryEndpoint, timeout: Duration) -> Result<(), String> {
        let (down, delay) = {
            let state = self.state.lock();
            (
                state.down.contains(&endpoint.url),
                state.delays.get(&endpoint.url).copied(),
            )
        };

        if down {
            return Err(format!("connection refused: {}", endpoint.url));
        }
        if let Some(delay) = delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Err(format!("timed out: {}", endpoint.url));
            }
        }
        Ok(())
    }

    fn credentials_valid(&self, dn: &str, password: &str) -> bool {
        let state = self.state.lock();
        let service = state
            .service
            .as_ref()
            .map(|(d, p)| d.eq_ignore_ascii_case(dn) && p == password)
            .unwrap_or(false);
        service
            || state
                .users
                .iter()
                .any(|u| u.dn.eq_ignore_ascii_case(dn) && u.password == password)
    }
}

fn within_base(dn: &str, base: &str) -> bool {
    base.is_empty() || dn.to_ascii_lowercase().ends_with(&base.to_ascii_lowercase())
}

#[async_trait]
impl DirectoryClient for ScriptedDirectory {
    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        dn: &str,
        password: &str,
        timeout: Duration,
    ) -> BindOutcome {
        self.state.lock().binds += 1;
        if let Err(e) = self.transport(endpoint, timeout).await {
            return BindOutcome::Unreachable(e);
        }

        if !password.is_empty() && self.credentials_valid(dn, password) {
            BindOutcome::Ok
        } else {
            BindOutcome::InvalidCredentials
        }
    }

    async fn search(
        &self,
        endpoint: &DirectoryEndpoint,
        bind_as: &BindCredentials,
        request: &SearchRequest,
        timeout: Duration,
    ) -> SearchOutcome {
        self.state.lock().searches += 1;
        if let Err(e) = self.transport(endpoint, timeout).await {
            return SearchOutcome::Unreachable(e);
        }

        if !bind_as.is_anonymous() && !self.credentials_valid(&bind_as.dn, &bind_as.password) {
            return SearchOutcome::InvalidServiceCredentials;
        }

        let state = self.state.lock();

        if state.missing_bases.contains(&request.base.to_ascii_lowercase()) {
            return SearchOutcome::Failed {
                code: 32,
                message: "No such object".to_string(),
            };
        }

        if let Some(member) = request
            .filter
            .strip_prefix("(member=")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            if state.group_search_down {
                return SearchOutcome::Unreachable("group search connection reset".to_string());
            }
            if let Some(code) = state.group_search_rc {
                return SearchOutcome::Failed {
                    code,
                    message: "group search refused".to_string(),
                };
            }

            let entries: Vec<DirectoryEntry> = state
                .groups
                .iter()
                .filter(|g| within_base(&g.dn, &request.base))
                .filter(|g| g.members.iter().any(|m| m.eq_ignore_ascii_case(member)))
                .map(|g| {
                    DirectoryEntry::new(g.dn.clone())
                        .with_attribute(RULES_ATTRIBUTE, g.rules.clone())
                })
                .collect();

            return if entries.is_empty() {
                SearchOutcome::NotFound
            } else {
                SearchOutcome::Found(entries)
            };
        }

        if let Some(code) = state.user_search_rc {
            return SearchOutcome::Failed {
                code,
                message: "user search refused".to_string(),
            };
        }

        let entries: Vec<DirectoryEntry> = state
            .users
            .iter()
            .filter(|u| within_base(&u.dn, &request.base))
            .filter(|u| request.filter.contains(&format!("={})", u.uid)))
            .map(|u| {
                let mut entry = DirectoryEntry::new(u.dn.clone());
                if !state.omit_dn_attribute {
                    for attr in &request.attributes {
                        entry = entry.with_attribute(attr.clone(), vec![u.dn.clone()]);
                    }
                }
                entry
            })
            .collect();

        if entries.is_empty() {
            SearchOutcome::NotFound
        } else {
            SearchOutcome::Found(entries)
        }
    }

    async fn probe(&self, endpoint: &DirectoryEndpoint, timeout: Duration) -> bool {
        self.state.lock().probes += 1;
        self.transport(endpoint, timeout).await.is_ok()
    }
}
