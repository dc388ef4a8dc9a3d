//! In-process hypervisor.
//!
//! Keeps domains and snapshots in memory and follows the lifecycle rules of
//! a libvirt QEMU driver closely enough to exercise the command layer
//! without a host hypervisor. Also used by the `memory://` URI.

use super::{
    DomainHandle, HvResult, Hypervisor, HypervisorConnection, HypervisorError, SnapshotHandle,
};
use crate::types::{VmInfo, VmState};
use crate::xml::{escape, parse_domain_definition, parse_snapshot};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Number of calls that reached the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open_attempts: u64,
    /// Connections successfully opened
    pub opens: u64,
    pub closes: u64,
    pub lookups: u64,
    /// State-changing calls on domains and snapshots
    pub mutations: u64,
}

#[derive(Debug)]
struct StoredSnapshot {
    name: String,
    description: Option<String>,
    created_at: i64,
    state: VmState,
}

#[derive(Debug)]
struct StoredDomain {
    uuid: String,
    id: Option<u32>,
    state: VmState,
    persistent: bool,
    autostart: bool,
    memory_kib: u64,
    vcpus: u32,
    xml: String,
    snapshots: Vec<StoredSnapshot>,
    cpu_time_ns: u64,
    cpu_readings: VecDeque<u64>,
    rss_kib: u64,
}

#[derive(Debug, Default)]
struct State {
    unreachable: bool,
    op_delay: Option<Duration>,
    domains: BTreeMap<String, StoredDomain>,
    failing: BTreeSet<&'static str>,
    next_id: u32,
    calls: CallCounts,
}

impl State {
    fn check_fault(&self, op: &'static str) -> HvResult<()> {
        if self.failing.contains(op) {
            return Err(HypervisorError::Failed(format!("internal error: {} failed", op)));
        }
        Ok(())
    }

    fn activate(&mut self, name: &str) -> HvResult<()> {
        self.next_id += 1;
        let id = self.next_id;
        let domain = self.domains.get_mut(name).ok_or_else(|| no_domain(name))?;
        domain.state = VmState::Running;
        domain.id = Some(id);
        if domain.rss_kib == 0 {
            domain.rss_kib = domain.memory_kib / 2;
        }
        Ok(())
    }

    /// Power a domain off. Transient domains vanish once stopped.
    fn deactivate(&mut self, name: &str) -> HvResult<()> {
        let domain = self.domains.get_mut(name).ok_or_else(|| no_domain(name))?;
        if !domain.state.is_active() {
            return Err(HypervisorError::InvalidState("domain is not running".to_string()));
        }
        domain.state = VmState::Shutoff;
        domain.id = None;
        domain.rss_kib = 0;
        if !domain.persistent {
            self.domains.remove(name);
        }
        Ok(())
    }

    fn insert(&mut self, xml: &str, persistent: bool) -> HvResult<String> {
        let def = parse_domain_definition(xml).map_err(HypervisorError::InvalidDefinition)?;
        if self.domains.contains_key(&def.name) {
            return Err(HypervisorError::Failed(format!("domain '{}' already exists", def.name)));
        }
        self.domains.insert(
            def.name.clone(),
            StoredDomain {
                uuid: uuid::Uuid::new_v4().to_string(),
                id: None,
                state: VmState::Shutoff,
                persistent,
                autostart: false,
                memory_kib: def.memory_kib,
                vcpus: def.vcpus,
                xml: xml.to_string(),
                snapshots: Vec::new(),
                cpu_time_ns: 0,
                cpu_readings: VecDeque::new(),
                rss_kib: 0,
            },
        );
        Ok(def.name)
    }
}

fn no_domain(name: &str) -> HypervisorError {
    HypervisorError::NoDomain(format!("no domain with matching name '{}'", name))
}

fn no_snapshot(name: &str) -> HypervisorError {
    HypervisorError::NoSnapshot(format!("no domain snapshot with matching name '{}'", name))
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hypervisor that keeps everything in process memory.
///
/// Clones share state, so a test can keep one handle for inspection and
/// hand another to the code under test.
#[derive(Debug, Clone)]
pub struct MemoryHypervisor {
    uri: String,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHypervisor {
    pub const URI: &'static str = "memory://";

    pub fn new() -> Self {
        Self::with_uri(Self::URI)
    }

    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), state: Arc::new(Mutex::new(State::default())) }
    }

    /// Define a persistent domain from its XML, optionally starting it.
    pub fn seed_domain(&self, xml: &str, running: bool) -> HvResult<()> {
        let mut state = lock(&self.state);
        let name = state.insert(xml, true)?;
        if running {
            state.activate(&name)?;
        }
        Ok(())
    }

    /// Simulate an outage: every `open` fails while unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    /// Delay every `open` by `delay`.
    pub fn set_operation_delay(&self, delay: Option<Duration>) {
        lock(&self.state).op_delay = delay;
    }

    /// Queue cumulative CPU times returned by successive reads.
    pub fn push_cpu_readings(&self, name: &str, readings: impl IntoIterator<Item = u64>) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.cpu_readings.extend(readings);
        }
    }

    pub fn set_memory_rss_kib(&self, name: &str, kib: u64) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.rss_kib = kib;
        }
    }

    /// Make every later `op` ("destroy" or "undefine") fail on any domain.
    pub fn fail_operation(&self, op: &'static str) {
        lock(&self.state).failing.insert(op);
    }

    /// Force a domain into `state` (e.g. to pause it).
    pub fn set_state(&self, name: &str, vm_state: VmState) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.state = vm_state;
        }
    }

    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    pub fn domain_state(&self, name: &str) -> Option<VmState> {
        lock(&self.state).domains.get(name).map(|d| d.state)
    }

    pub fn is_persistent(&self, name: &str) -> Option<bool> {
        lock(&self.state).domains.get(name).map(|d| d.persistent)
    }

    pub fn domain_names(&self) -> Vec<String> {
        lock(&self.state).domains.keys().cloned().collect()
    }

    pub fn snapshot_names(&self, name: &str) -> Vec<String> {
        lock(&self.state)
            .domains
            .get(name)
            .map(|d| d.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl Hypervisor for MemoryHypervisor {
    fn name(&self) -> &str {
        "memory"
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> HvResult<Box<dyn HypervisorConnection>> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.open_attempts += 1;
            if state.unreachable {
                return Err(HypervisorError::Unreachable(format!(
                    "unable to connect to '{}'",
                    self.uri
                )));
            }
            state.calls.opens += 1;
            state.op_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        debug!(uri = %self.uri, "Opened in-memory hypervisor connection");
        Ok(Box::new(MemoryConnection { state: Arc::clone(&self.state) }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

impl MemoryConnection {
    fn handle(&self, name: String) -> Box<dyn DomainHandle> {
        Box::new(MemoryDomain { state: Arc::clone(&self.state), name })
    }
}

impl HypervisorConnection for MemoryConnection {
    fn list_domains(&self) -> HvResult<Vec<Box<dyn DomainHandle>>> {
        let names: Vec<String> = lock(&self.state).domains.keys().cloned().collect();
        Ok(names.into_iter().map(|n| self.handle(n)).collect())
    }

    fn lookup_domain(&self, name: &str) -> HvResult<Box<dyn DomainHandle>> {
        let mut state = lock(&self.state);
        state.calls.lookups += 1;
        if !state.domains.contains_key(name) {
            return Err(no_domain(name));
        }
        drop(state);
        Ok(self.handle(name.to_string()))
    }

    fn create_domain(&self, xml: &str) -> HvResult<Box<dyn DomainHandle>> {
        let mut state = lock(&self.state);
        state.calls.mutations += 1;
        let name = state.insert(xml, false)?;
        state.activate(&name)?;
        drop(state);
        Ok(self.handle(name))
    }

    fn define_domain(&self, xml: &str) -> HvResult<Box<dyn DomainHandle>> {
        let mut state = lock(&self.state);
        state.calls.mutations += 1;
        let name = state.insert(xml, true)?;
        drop(state);
        Ok(self.handle(name))
    }

    fn close(self: Box<Self>) -> HvResult<()> {
        lock(&self.state).calls.closes += 1;
        Ok(())
    }
}

struct MemoryDomain {
    state: Arc<Mutex<State>>,
    name: String,
}

impl MemoryDomain {
    fn read<T>(&self, f: impl FnOnce(&StoredDomain) -> HvResult<T>) -> HvResult<T> {
        let state = lock(&self.state);
        let domain = state.domains.get(&self.name).ok_or_else(|| no_domain(&self.name))?;
        f(domain)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> HvResult<T>) -> HvResult<T> {
        let mut state = lock(&self.state);
        state.calls.mutations += 1;
        if !state.domains.contains_key(&self.name) {
            return Err(no_domain(&self.name));
        }
        f(&mut state)
    }

    fn domain_mut<'a>(&self, state: &'a mut State) -> HvResult<&'a mut StoredDomain> {
        state.domains.get_mut(&self.name).ok_or_else(|| no_domain(&self.name))
    }

    fn snapshot(&self, name: String) -> Box<dyn SnapshotHandle> {
        Box::new(MemorySnapshot { state: Arc::clone(&self.state), domain: self.name.clone(), name })
    }
}

fn require_active(domain: &StoredDomain) -> HvResult<()> {
    if domain.state.is_active() {
        Ok(())
    } else {
        Err(HypervisorError::InvalidState("domain is not running".to_string()))
    }
}

impl DomainHandle for MemoryDomain {
    fn name(&self) -> HvResult<String> {
        self.read(|_| Ok(self.name.clone()))
    }

    fn info(&self) -> HvResult<VmInfo> {
        self.read(|d| {
            Ok(VmInfo {
                name: self.name.clone(),
                id: d.id,
                uuid: d.uuid.clone(),
                state: d.state,
                max_memory: d.memory_kib,
                memory: d.memory_kib,
                vcpus: d.vcpus,
                autostart: d.autostart,
            })
        })
    }

    fn xml_desc(&self) -> HvResult<String> {
        self.read(|d| Ok(d.xml.clone()))
    }

    fn start(&self) -> HvResult<()> {
        self.mutate(|state| {
            if self.domain_mut(state)?.state.is_active() {
                return Err(HypervisorError::InvalidState("domain is already running".to_string()));
            }
            state.activate(&self.name)
        })
    }

    fn resume(&self) -> HvResult<()> {
        self.mutate(|state| {
            let domain = self.domain_mut(state)?;
            if domain.state != VmState::Paused {
                return Err(HypervisorError::InvalidState("domain is not paused".to_string()));
            }
            domain.state = VmState::Running;
            Ok(())
        })
    }

    fn reboot(&self) -> HvResult<()> {
        self.mutate(|state| require_active(self.domain_mut(state)?))
    }

    fn shutdown(&self) -> HvResult<()> {
        self.mutate(|state| state.deactivate(&self.name))
    }

    fn destroy(&self) -> HvResult<()> {
        self.mutate(|state| {
            state.check_fault("destroy")?;
            state.deactivate(&self.name)
        })
    }

    fn undefine(&self) -> HvResult<()> {
        self.mutate(|state| {
            state.check_fault("undefine")?;
            let domain = self.domain_mut(state)?;
            if !domain.persistent {
                return Err(HypervisorError::InvalidState(
                    "cannot undefine transient domain".to_string(),
                ));
            }
            if domain.state.is_active() {
                domain.persistent = false;
            } else {
                state.domains.remove(&self.name);
            }
            Ok(())
        })
    }

    fn cpu_time_ns(&self) -> HvResult<u64> {
        let mut state = lock(&self.state);
        let domain = self.domain_mut(&mut state)?;
        require_active(domain)?;
        if let Some(next) = domain.cpu_readings.pop_front() {
            domain.cpu_time_ns = next;
        }
        Ok(domain.cpu_time_ns)
    }

    fn memory_rss_kib(&self) -> HvResult<u64> {
        self.read(|d| {
            require_active(d)?;
            Ok(d.rss_kib)
        })
    }

    fn list_snapshots(&self) -> HvResult<Vec<Box<dyn SnapshotHandle>>> {
        let names: Vec<String> =
            self.read(|d| Ok(d.snapshots.iter().map(|s| s.name.clone()).collect()))?;
        Ok(names.into_iter().map(|n| self.snapshot(n)).collect())
    }

    fn create_snapshot(&self, xml: &str) -> HvResult<Box<dyn SnapshotHandle>> {
        let request = parse_snapshot(xml, &self.name).map_err(HypervisorError::InvalidDefinition)?;
        self.mutate(|state| {
            let domain = self.domain_mut(state)?;
            if domain.snapshots.iter().any(|s| s.name == request.name) {
                return Err(HypervisorError::Failed(format!(
                    "domain snapshot {} already exists",
                    request.name
                )));
            }
            domain.snapshots.push(StoredSnapshot {
                name: request.name.clone(),
                description: request.description.clone(),
                created_at: Utc::now().timestamp(),
                state: domain.state,
            });
            Ok(())
        })?;
        Ok(self.snapshot(request.name))
    }

    fn lookup_snapshot(&self, name: &str) -> HvResult<Box<dyn SnapshotHandle>> {
        let mut state = lock(&self.state);
        state.calls.lookups += 1;
        let domain = self.domain_mut(&mut state)?;
        if !domain.snapshots.iter().any(|s| s.name == name) {
            return Err(no_snapshot(name));
        }
        drop(state);
        Ok(self.snapshot(name.to_string()))
    }
}

struct MemorySnapshot {
    state: Arc<Mutex<State>>,
    domain: String,
    name: String,
}

impl MemorySnapshot {
    fn with<T>(
        &self,
        mutation: bool,
        f: impl FnOnce(&mut StoredDomain, usize) -> HvResult<T>,
    ) -> HvResult<T> {
        let mut state = lock(&self.state);
        if mutation {
            state.calls.mutations += 1;
        }
        let domain = state.domains.get_mut(&self.domain).ok_or_else(|| no_domain(&self.domain))?;
        let index = domain
            .snapshots
            .iter()
            .position(|s| s.name == self.name)
            .ok_or_else(|| no_snapshot(&self.name))?;
        f(domain, index)
    }
}

impl SnapshotHandle for MemorySnapshot {
    fn name(&self) -> HvResult<String> {
        self.with(false, |_, _| Ok(self.name.clone()))
    }

    fn xml_desc(&self) -> HvResult<String> {
        self.with(false, |domain, index| {
            let snap = &domain.snapshots[index];
            let description = snap
                .description
                .as_deref()
                .map(|d| format!("  <description>{}</description>\n", escape(d)))
                .unwrap_or_default();
            Ok(format!(
                "<domainsnapshot>\n  <name>{}</name>\n{}  <state>{}</state>\n  \
                 <creationTime>{}</creationTime>\n</domainsnapshot>\n",
                escape(&snap.name),
                description,
                snap.state,
                snap.created_at
            ))
        })
    }

    fn revert(&self) -> HvResult<()> {
        self.with(true, |domain, index| {
            let target = domain.snapshots[index].state;
            domain.state = target;
            if !target.is_active() {
                domain.id = None;
            }
            Ok(())
        })
    }

    fn delete(&self) -> HvResult<()> {
        self.with(true, |domain, index| {
            domain.snapshots.remove(index);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_xml(name: &str) -> String {
        format!(
            "<domain type='kvm'><name>{}</name>\
             <memory unit='MiB'>512</memory><vcpu>1</vcpu></domain>",
            name
        )
    }

    #[test]
    fn test_outage_fails_open() {
        let hv = MemoryHypervisor::new();
        hv.set_reachable(false);
        assert!(matches!(hv.open(), Err(HypervisorError::Unreachable(_))));
        assert_eq!(hv.calls().open_attempts, 1);
        assert_eq!(hv.calls().opens, 0);
    }

    #[test]
    fn test_transient_domain_vanishes_on_stop() {
        let hv = MemoryHypervisor::new();
        let conn = hv.open().unwrap();
        let dom = conn.create_domain(&domain_xml("web")).unwrap();
        assert_eq!(hv.domain_state("web"), Some(VmState::Running));
        assert_eq!(hv.is_persistent("web"), Some(false));

        dom.destroy().unwrap();
        assert_eq!(hv.domain_state("web"), None);
        assert!(matches!(dom.undefine(), Err(HypervisorError::NoDomain(_))));
    }

    #[test]
    fn test_persistent_lifecycle() {
        let hv = MemoryHypervisor::new();
        hv.seed_domain(&domain_xml("db"), false).unwrap();
        let conn = hv.open().unwrap();
        let dom = conn.lookup_domain("db").unwrap();

        assert!(matches!(dom.shutdown(), Err(HypervisorError::InvalidState(_))));
        dom.start().unwrap();
        assert!(dom.info().unwrap().id.is_some());
        assert!(matches!(dom.start(), Err(HypervisorError::InvalidState(_))));
        assert!(matches!(dom.resume(), Err(HypervisorError::InvalidState(_))));

        dom.shutdown().unwrap();
        assert_eq!(hv.domain_state("db"), Some(VmState::Shutoff));
        dom.undefine().unwrap();
        assert!(hv.domain_names().is_empty());
        conn.close().unwrap();
        assert_eq!(hv.calls().closes, 1);
    }

    #[test]
    fn test_snapshots() {
        let hv = MemoryHypervisor::new();
        hv.seed_domain(&domain_xml("web"), true).unwrap();
        let conn = hv.open().unwrap();
        let dom = conn.lookup_domain("web").unwrap();

        let xml = crate::xml::snapshot_xml("web", "s1");
        dom.create_snapshot(&xml).unwrap();
        assert!(dom.create_snapshot(&xml).is_err());

        let snap = dom.lookup_snapshot("s1").unwrap();
        let desc = parse_snapshot(&snap.xml_desc().unwrap(), "web").unwrap();
        assert_eq!(desc.description.as_deref(), Some("Snapshot of web"));
        assert!(desc.created_at.is_some());

        dom.destroy().unwrap();
        snap.revert().unwrap();
        assert_eq!(hv.domain_state("web"), Some(VmState::Running));

        snap.delete().unwrap();
        assert!(matches!(dom.lookup_snapshot("s1"), Err(HypervisorError::NoSnapshot(_))));
    }

    #[test]
    fn test_scripted_cpu_readings() {
        let hv = MemoryHypervisor::new();
        hv.seed_domain(&domain_xml("web"), true).unwrap();
        hv.push_cpu_readings("web", [10, 30]);
        let dom = hv.open().unwrap().lookup_domain("web").unwrap();
        assert_eq!(dom.cpu_time_ns().unwrap(), 10);
        assert_eq!(dom.cpu_time_ns().unwrap(), 30);
        assert_eq!(dom.cpu_time_ns().unwrap(), 30);
        assert_eq!(dom.memory_rss_kib().unwrap(), 256 * 1024);
    }
}
