//! Aggregate fan-out over many cluster connections (`spec.md` §4.6).
//!
//! The fan-out shape — one task per connected profile, global result
//! collection, never-fail-the-whole-batch semantics — is grounded on the
//! teacher's `server/src/parallel_fetcher.rs` (`do_for_all_remote_nodes`),
//! adapted from "fetch per remote node" to "run an arbitrary operation per
//! connected profile".

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cache::Cache;
use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::model::{ClusterResourceEntry, Node, Task, Vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileStatus {
    Unknown,
    Connected,
    Disconnected,
    Error,
}

pub struct ProfileClient {
    pub client: Option<Arc<Client>>,
    pub status: ProfileStatus,
    pub last_err: Option<String>,
}

pub struct ProfileResult<T> {
    pub profile_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub data: Option<T>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct GroupManager {
    profiles: RwLock<HashMap<String, ProfileClient>>,
    cache: Arc<dyn Cache>,
    logger: Arc<dyn Logger>,
}

impl GroupManager {
    pub fn new(cache: Arc<dyn Cache>, logger: Arc<dyn Logger>) -> Self {
        GroupManager {
            profiles: RwLock::new(HashMap::new()),
            cache,
            logger,
        }
    }

    /// Connects to every profile concurrently; returns an error only when
    /// zero profiles connected (`spec.md` §4.6/§8 "Empty profiles list...
    /// error").
    pub async fn initialize(&self, profiles: Vec<(String, Arc<dyn Config>)>) -> Result<()> {
        if profiles.is_empty() {
            return Err(Error::config("no profiles provided"));
        }

        let mut set = tokio::task::JoinSet::new();
        for (name, config) in profiles {
            let cache = self.cache.clone();
            let logger = self.logger.clone();
            set.spawn(async move {
                let result = Client::new(config, cache, logger).await;
                (name, result)
            });
        }

        let mut connected = 0usize;
        let mut table = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (name, result) = joined.map_err(|e| Error::config(e.to_string()))?;
            match result {
                Ok(client) => {
                    connected += 1;
                    table.insert(
                        name,
                        ProfileClient {
                            client: Some(Arc::new(client)),
                            status: ProfileStatus::Connected,
                            last_err: None,
                        },
                    );
                }
                Err(err) => {
                    log::error!("profile failed to connect: {err}");
                    self.logger.error(&format!("profile failed to connect: {err}"));
                    table.insert(
                        name,
                        ProfileClient {
                            client: None,
                            status: ProfileStatus::Error,
                            last_err: Some(err.to_string()),
                        },
                    );
                }
            }
        }

        *self.profiles.write().await = table;

        if connected == 0 {
            return Err(Error::config("no profiles connected"));
        }
        Ok(())
    }

    /// Rebuilds the client for one profile, e.g. after a prior connection
    /// error. Does not retry any operation already in flight against the
    /// old client for that profile (`spec.md` §9 open question, decided in
    /// `DESIGN.md`).
    pub async fn refresh_profile_connection(&self, profile: &str, config: Arc<dyn Config>) -> Result<()> {
        let result = Client::new(config, self.cache.clone(), self.logger.clone()).await;
        let mut profiles = self.profiles.write().await;
        let entry = match result {
            Ok(client) => ProfileClient {
                client: Some(Arc::new(client)),
                status: ProfileStatus::Connected,
                last_err: None,
            },
            Err(err) => ProfileClient {
                client: None,
                status: ProfileStatus::Error,
                last_err: Some(err.to_string()),
            },
        };
        let failed = entry.status != ProfileStatus::Connected;
        profiles.insert(profile.to_string(), entry);
        if failed {
            return Err(Error::config(format!("profile {profile} failed to reconnect")));
        }
        Ok(())
    }

    /// Rebuilds clients for every profile currently in `Error`/`Disconnected`
    /// state.
    pub async fn refresh_all_failed_profiles(&self, configs: &HashMap<String, Arc<dyn Config>>) {
        let failed_names: Vec<String> = {
            let profiles = self.profiles.read().await;
            profiles
                .iter()
                .filter(|(_, p)| matches!(p.status, ProfileStatus::Error | ProfileStatus::Disconnected))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in failed_names {
            if let Some(config) = configs.get(&name) {
                if let Err(err) = self.refresh_profile_connection(&name, config.clone()).await {
                    log::debug!("refresh of {name} failed again: {err}");
                    self.logger.debug(&format!("refresh of {name} failed again: {err}"));
                }
            }
        }
    }

    /// Spawns one task per connected profile, runs `operation` against
    /// each, and collects every result. Never fails as a whole — per-profile
    /// failures are reported in the returned `ProfileResult`s.
    pub async fn execute_on_all_profiles<T, F>(&self, operation: F) -> Vec<ProfileResult<T>>
    where
        T: Send + 'static,
        F: Fn(String, Arc<Client>) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        let connected: Vec<(String, Arc<Client>)> = {
            let profiles = self.profiles.read().await;
            profiles
                .iter()
                .filter_map(|(name, p)| {
                    (p.status == ProfileStatus::Connected).then(|| p.client.clone().map(|c| (name.clone(), c)))
                })
                .flatten()
                .collect()
        };

        let operation = Arc::new(operation);
        let mut set = tokio::task::JoinSet::new();
        for (name, client) in connected {
            let operation = operation.clone();
            set.spawn(async move {
                let result = operation(name.clone(), client).await;
                match result {
                    Ok(data) => ProfileResult { profile_name: name, success: true, error: None, data: Some(data) },
                    Err(err) => ProfileResult { profile_name: name, success: false, error: Some(err.to_string()), data: None },
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(ProfileResult {
                    profile_name: String::new(),
                    success: false,
                    error: Some(join_err.to_string()),
                    data: None,
                }),
            }
        }
        results
    }

    /// Filters to successes and folds them with `merge`.
    pub async fn get_aggregated_data<T, M, R>(&self, operation: impl Fn(String, Arc<Client>) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static, merge: M) -> R
    where
        T: Send + 'static,
        M: FnOnce(Vec<ProfileResult<T>>) -> R,
    {
        let results = self.execute_on_all_profiles(operation).await;
        merge(results)
    }

    /// Configured profile names, used to compute placeholders for profiles
    /// that produced no data.
    async fn configured_profile_names(&self) -> Vec<String> {
        self.profiles.read().await.keys().cloned().collect()
    }

    /// Reads nodes from every connected profile, tags each with
    /// `source_profile`, sorts deterministically, deduplicates nodes that
    /// alias to the same real cluster (same Name+IP), and appends
    /// placeholder entries for profiles that produced no data
    /// (`spec.md` §4.6/§8).
    pub async fn get_group_nodes(&self) -> Result<Vec<Node>> {
        let all_profiles = self.configured_profile_names().await;

        let results = self
            .execute_on_all_profiles::<Vec<Node>, _>(|profile, client| {
                Box::pin(async move {
                    let snapshot = client.get_cluster_status().await?;
                    let mut nodes = snapshot.nodes.clone();
                    for node in &mut nodes {
                        node.source_profile = profile.clone();
                    }
                    Ok(nodes)
                })
            })
            .await;

        Ok(merge_group_nodes(&all_profiles, &results))
    }

    pub async fn get_group_vms(&self) -> Result<Vec<Arc<RwLock<Vm>>>> {
        let results = self
            .execute_on_all_profiles::<Vec<Arc<RwLock<Vm>>>, _>(|profile, client| {
                Box::pin(async move {
                    let snapshot = client.get_cluster_status().await?;
                    let vms = snapshot.all_vms();
                    for vm in &vms {
                        vm.write().await.source_profile = profile.clone();
                    }
                    Ok(vms)
                })
            })
            .await;

        let mut vms = Vec::new();
        for result in results.into_iter().filter(|r| r.success) {
            if let Some(data) = result.data {
                vms.extend(data);
            }
        }
        sort_vms(&mut vms).await;
        Ok(vms)
    }

    /// Raw `/cluster/resources` rows from every connected profile, tagged
    /// with the profile they came from. Per-profile failures are dropped
    /// silently here (as with the other `get_group_*` readers, partial
    /// failures are never fatal to the aggregate — `spec.md` §7 item 6); use
    /// `execute_on_all_profiles` directly if the caller needs per-profile
    /// error detail.
    pub async fn get_group_cluster_resources(&self) -> Result<Vec<(String, ClusterResourceEntry)>> {
        let results = self
            .execute_on_all_profiles::<Vec<ClusterResourceEntry>, _>(|_profile, client| {
                Box::pin(async move { client.get_cluster_resources().await })
            })
            .await;

        let mut tagged = Vec::new();
        for result in results.into_iter().filter(|r| r.success) {
            if let Some(entries) = result.data {
                tagged.extend(entries.into_iter().map(|e| (result.profile_name.clone(), e)));
            }
        }
        Ok(tagged)
    }

    /// Reads recent tasks from every connected profile, tags each with
    /// `source_profile`, and sorts by `start_time` descending across all
    /// profiles (`spec.md` §4.6).
    pub async fn get_group_tasks(&self) -> Result<Vec<Task>> {
        let results = self
            .execute_on_all_profiles::<Vec<Task>, _>(|profile, client| {
                Box::pin(async move {
                    let mut tasks = client.list_cluster_tasks().await?;
                    for task in &mut tasks {
                        task.source_profile = profile.clone();
                    }
                    Ok(tasks)
                })
            })
            .await;

        let mut all: Vec<Task> = results
            .into_iter()
            .filter(|r| r.success)
            .filter_map(|r| r.data)
            .flatten()
            .collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(all)
    }
}

/// Merges per-profile node lists: dedups nodes that alias to the same real
/// cluster (same Name+IP), appends a placeholder for every profile that
/// produced no data, and sorts deterministically (`spec.md` §4.6/§8).
fn merge_group_nodes(all_profiles: &[String], results: &[ProfileResult<Vec<Node>>]) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::new();
    let mut represented: std::collections::HashSet<String> = std::collections::HashSet::new();

    for result in results {
        represented.insert(result.profile_name.clone());
        if let Some(data) = &result.data {
            for node in data {
                let already_present = nodes.iter().any(|n| n.name == node.name && n.ip == node.ip);
                if !already_present {
                    nodes.push(node.clone());
                }
            }
        }
    }

    for profile in all_profiles {
        if represented.contains(profile) {
            let produced_any = results
                .iter()
                .any(|r| &r.profile_name == profile && r.data.as_ref().is_some_and(|d| !d.is_empty()));
            if produced_any {
                continue;
            }
            let reason = if results.iter().any(|r| &r.profile_name == profile && !r.success) {
                "Connection Failed"
            } else {
                "No Data"
            };
            nodes.push(Node::placeholder(profile, reason));
        } else {
            nodes.push(Node::placeholder(profile, "Offline"));
        }
    }

    sort_nodes(&mut nodes);
    nodes
}

fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| a.source_profile.cmp(&b.source_profile).then_with(|| a.id.cmp(&b.id)));
}

async fn sort_vms(vms: &mut Vec<Arc<RwLock<Vm>>>) {
    // Read every VM's sort key once, then sort a parallel index array —
    // avoids holding any lock while `sort_by` re-enters comparisons — and
    // reorder `vms` to match the sorted index order.
    let mut keyed: Vec<(String, String, u32, usize)> = Vec::with_capacity(vms.len());
    for (i, vm) in vms.iter().enumerate() {
        let guard = vm.read().await;
        keyed.push((guard.source_profile.clone(), guard.node.clone(), guard.id, i));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)).then_with(|| a.2.cmp(&b.2)));
    let reordered: Vec<Arc<RwLock<Vm>>> = keyed.into_iter().map(|(_, _, _, i)| vms[i].clone()).collect();
    *vms = reordered;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;

    #[test]
    fn sort_nodes_orders_by_profile_then_id() {
        let mut nodes = vec![
            Node::placeholder("b", "Offline"),
            Node::placeholder("a", "Offline"),
        ];
        sort_nodes(&mut nodes);
        assert_eq!(nodes[0].source_profile, "a");
        assert_eq!(nodes[1].source_profile, "b");
    }

    fn vm_with(profile: &str, node: &str, id: crate::model::VmId) -> Arc<RwLock<Vm>> {
        let mut vm = Vm::new(id, "x", node, crate::model::VmType::Qemu);
        vm.source_profile = profile.to_string();
        Arc::new(RwLock::new(vm))
    }

    /// `sort_vms` must reorder `vms` itself, not just a discarded local key
    /// vector, so `get_group_vms` actually returns a deterministic order
    /// (`spec.md` §4.6/§8).
    #[tokio::test]
    async fn sort_vms_reorders_by_profile_then_node_then_id() {
        let mut vms = vec![
            vm_with("b", "pve1", 200),
            vm_with("a", "pve2", 100),
            vm_with("a", "pve1", 300),
        ];
        sort_vms(&mut vms).await;

        let mut order = Vec::new();
        for vm in &vms {
            let guard = vm.read().await;
            order.push((guard.source_profile.clone(), guard.node.clone(), guard.id));
        }
        assert_eq!(
            order,
            vec![
                ("a".to_string(), "pve1".to_string(), 300),
                ("a".to_string(), "pve2".to_string(), 100),
                ("b".to_string(), "pve1".to_string(), 200),
            ]
        );
    }

    #[tokio::test]
    async fn initialize_rejects_empty_profile_list() {
        let manager = GroupManager::new(Arc::new(crate::cache::NoOpCache), crate::logger::default_logger());
        let err = manager.initialize(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg == "no profiles provided"));
    }

    fn online_node(name: &str, ip: &str, profile: &str) -> Node {
        Node {
            id: name.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
            online: true,
            cpu_count: 4,
            cpu_usage: 0.1,
            memory_total_gb: 16.0,
            memory_used_gb: 4.0,
            total_storage_bytes: 0,
            used_storage_bytes: 0,
            uptime_secs: 0,
            version: "8.1".into(),
            kernel_version: String::new(),
            load_avg: [String::new(), String::new(), String::new()],
            cpu_info: crate::model::CpuInfo::default(),
            storage: Vec::new(),
            vms: Vec::new(),
            source_profile: profile.to_string(),
        }
    }

    fn result_ok(profile: &str, nodes: Vec<Node>) -> ProfileResult<Vec<Node>> {
        ProfileResult { profile_name: profile.to_string(), success: true, error: None, data: Some(nodes) }
    }

    fn result_err(profile: &str) -> ProfileResult<Vec<Node>> {
        ProfileResult { profile_name: profile.to_string(), success: false, error: Some("boom".into()), data: None }
    }

    /// One profile never even connected (never ran, so it's absent from
    /// `results` entirely) — `merge_group_nodes` must still emit a
    /// placeholder for it by walking `all_profiles`, reasoned as "Offline"
    /// since no attempt was ever recorded against it.
    #[test]
    fn profile_with_no_attempt_recorded_yields_offline_placeholder() {
        let all_profiles = vec!["profile1".to_string(), "profile2".to_string()];
        let results = vec![result_ok("profile1", vec![online_node("pve1", "10.0.0.1", "profile1")])];

        let nodes = merge_group_nodes(&all_profiles, &results);

        assert_eq!(nodes.len(), 2);
        let pve1 = nodes.iter().find(|n| n.name == "pve1").unwrap();
        assert!(pve1.online);
        assert_eq!(pve1.source_profile, "profile1");
        let placeholder = nodes.iter().find(|n| n.is_placeholder()).unwrap();
        assert_eq!(placeholder.name, "profile2");
        assert_eq!(placeholder.version, "Offline");
        assert_eq!(placeholder.source_profile, "profile2");
    }

    /// Scenario 1 (`spec.md` §8): one online + one offline profile, where
    /// "offline" means the profile connected but its per-call operation
    /// failed (e.g. the mock server returned 500) — this is the case that
    /// actually surfaces "Connection Failed" rather than "Offline".
    #[test]
    fn one_online_one_failed_profile_yields_connection_failed_placeholder() {
        let all_profiles = vec!["profile1".to_string(), "profile2".to_string()];
        let results = vec![
            result_ok("profile1", vec![online_node("pve1", "10.0.0.1", "profile1")]),
            result_err("profile2"),
        ];

        let nodes = merge_group_nodes(&all_profiles, &results);

        assert_eq!(nodes.len(), 2);
        let pve1 = nodes.iter().find(|n| n.name == "pve1").unwrap();
        assert!(pve1.online);
        let placeholder = nodes.iter().find(|n| n.is_placeholder()).unwrap();
        assert_eq!(placeholder.name, "profile2");
        assert_eq!(placeholder.version, "Connection Failed");
    }

    /// Scenario 2 (`spec.md` §8): two profiles alias to the same real
    /// cluster (same Name+IP) — collapse to one entry, no placeholder for
    /// either profile.
    #[test]
    fn aliasing_profiles_dedup_to_one_node_with_no_placeholders() {
        let all_profiles = vec!["default".to_string(), "backup".to_string()];
        let results = vec![
            result_ok("default", vec![online_node("pve-main", "10.0.0.5", "default")]),
            result_ok("backup", vec![online_node("pve-main", "10.0.0.5", "backup")]),
        ];

        let nodes = merge_group_nodes(&all_profiles, &results);

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "pve-main");
        assert!(!nodes.iter().any(|n| n.is_placeholder()));
    }

    /// Boundary behavior (`spec.md` §8): zero connected profiles but ≥1
    /// configured yields a placeholder-only list, not an error.
    #[test]
    fn zero_connected_profiles_yields_placeholder_only_list() {
        let all_profiles = vec!["profile1".to_string()];
        let nodes = merge_group_nodes(&all_profiles, &[]);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_placeholder());
        assert_eq!(nodes[0].version, "Offline");
    }

    fn task_at(upid: &str, secs_ago: u64) -> Task {
        Task {
            upid: upid.to_string(),
            node: "pve1".to_string(),
            vmid: None,
            status: crate::model::TaskStatus::Stopped,
            exit_status: Some("OK".to_string()),
            start_time: std::time::Instant::now() - std::time::Duration::from_secs(secs_ago),
            source_profile: String::new(),
        }
    }

    /// `get_group_tasks` sorts by `start_time` descending, so the most
    /// recently started task across all profiles comes first regardless of
    /// which profile it came from (`spec.md` §4.6).
    #[test]
    fn tasks_sort_by_start_time_descending() {
        let mut tasks = vec![task_at("old", 100), task_at("newest", 1), task_at("mid", 10)];
        tasks.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let order: Vec<&str> = tasks.iter().map(|t| t.upid.as_str()).collect();
        assert_eq!(order, vec!["newest", "mid", "old"]);
    }
}
