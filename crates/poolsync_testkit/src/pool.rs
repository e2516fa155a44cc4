//! An in-process pool server speaking the poolsync wire contract.
//!
//! The simulated pool keeps object tables and an event log with
//! monotonically increasing ids, much like a server-side oplog. Every
//! mutation appends an event and wakes long polls. Server-side tasks advance
//! one step per `task.get_record`.

use parking_lot::Mutex;
use poolsync_engine::{Certificate, RpcRequest, RpcResponse, TransportFailure, FailureKind};
use poolsync_protocol::{
    Event, EventOperation, Fault, ObjectRecord, ObjectRef, ObjectType, TaskStatus, Value,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// A server-side task.
struct SimTask {
    status: TaskStatus,
    step: u32,
    steps: u32,
    outcome: Result<Value, Fault>,
    effect: Option<Effect>,
    cancel_requested: bool,
}

/// What a task does to the world when it succeeds.
enum Effect {
    CreateBond {
        network: ObjectRef,
        members: Vec<ObjectRef>,
    },
    DestroyBond {
        bond: ObjectRef,
    },
}

struct LoggedEvent {
    id: u64,
    class: ObjectType,
    raw: Value,
}

struct World {
    tables: BTreeMap<ObjectType, BTreeMap<ObjectRef, ObjectRecord>>,
    log: Vec<LoggedEvent>,
    next_event: u64,
    next_ref: u64,
    username: String,
    password: String,
    sessions: HashMap<String, String>,
    next_session: u64,
    coordinator: String,
    redirects: HashMap<String, String>,
    offline: HashSet<String>,
    certificate: Option<Certificate>,
    tasks: HashMap<ObjectRef, SimTask>,
    task_steps: u32,
    next_faults: HashMap<String, VecDeque<Fault>>,
    failing_hosts: HashSet<ObjectRef>,
    async_outcomes: HashMap<String, Result<Value, Fault>>,
    calls: Vec<String>,
}

enum PollOutcome {
    Respond(Result<RpcResponse, TransportFailure>),
    Wait(Duration),
}

fn fault(code: &str, params: &[&str]) -> RpcResponse {
    RpcResponse::Fault(Fault::new(code, params.iter().copied()))
}

fn handle_invalid(class: &str, reference: &str) -> RpcResponse {
    fault(Fault::HANDLE_INVALID, &[class, reference])
}

impl World {
    fn new(username: &str, password: &str) -> Self {
        Self {
            tables: BTreeMap::new(),
            log: Vec::new(),
            next_event: 1,
            next_ref: 1,
            username: username.to_string(),
            password: password.to_string(),
            sessions: HashMap::new(),
            next_session: 1,
            coordinator: String::new(),
            redirects: HashMap::new(),
            offline: HashSet::new(),
            certificate: None,
            tasks: HashMap::new(),
            task_steps: 3,
            next_faults: HashMap::new(),
            failing_hosts: HashSet::new(),
            async_outcomes: HashMap::new(),
            calls: Vec::new(),
        }
    }

    fn last_event_id(&self) -> u64 {
        self.next_event - 1
    }

    fn new_ref(&mut self, kind: &str) -> ObjectRef {
        let n = self.next_ref;
        self.next_ref += 1;
        ObjectRef::new(format!("OpaqueRef:{kind}-sim-{n}"))
    }

    fn emit(&mut self, event: Event) -> u64 {
        let id = self.next_event;
        self.next_event += 1;
        let class = event.class.clone();
        let raw = Event { id, ..event }.to_value();
        self.log.push(LoggedEvent { id, class, raw });
        id
    }

    fn get(&self, class: &ObjectType, reference: &ObjectRef) -> Option<&ObjectRecord> {
        self.tables.get(class).and_then(|t| t.get(reference))
    }

    fn put(&mut self, reference: ObjectRef, record: ObjectRecord) -> u64 {
        let class = record.object_type().clone();
        let existed = self
            .tables
            .entry(class)
            .or_default()
            .insert(reference.clone(), record.clone())
            .is_some();
        if existed {
            self.emit(Event::modified(0, reference, record))
        } else {
            self.emit(Event::added(0, reference, record))
        }
    }

    fn delete(&mut self, class: &ObjectType, reference: &ObjectRef) -> Option<u64> {
        self.tables.get_mut(class)?.remove(reference)?;
        Some(self.emit(Event::deleted(0, class.clone(), reference.clone())))
    }

    fn update<F>(&mut self, class: &ObjectType, reference: &ObjectRef, change: F) -> bool
    where
        F: FnOnce(ObjectRecord) -> ObjectRecord,
    {
        match self.get(class, reference).cloned() {
            Some(record) => {
                self.put(reference.clone(), change(record));
                true
            }
            None => false,
        }
    }

    fn host_addresses(&self) -> Vec<String> {
        self.tables
            .get(&ObjectType::Host)
            .map(|t| {
                t.values()
                    .filter_map(|r| r.text("address").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_known(&self, address: &str) -> bool {
        address == self.coordinator
            || self.redirects.contains_key(address)
            || self.host_addresses().iter().any(|a| a == address)
    }

    fn take_fault(&mut self, method: &str) -> Option<Fault> {
        self.next_faults.get_mut(method).and_then(VecDeque::pop_front)
    }

    fn offline_failure(address: &str) -> TransportFailure {
        TransportFailure::new(FailureKind::ConnectionReset, format!("{address} is not responding"))
    }

    fn dispatch(&mut self, address: &str, request: &RpcRequest) -> Result<RpcResponse, TransportFailure> {
        let method = request.method.as_str();
        self.calls.push(method.to_string());
        trace!(address, method, "simulated call");
        if self.offline.contains(address) {
            return Err(Self::offline_failure(address));
        }
        if let Some(f) = self.take_fault(method) {
            return Ok(RpcResponse::Fault(f));
        }
        let params = &request.params;
        let response = match method {
            "session.login_with_password" => self.login(address, params),
            "session.logout" => {
                if let Some(id) = params.first().and_then(Value::as_text) {
                    self.sessions.remove(id);
                }
                RpcResponse::Success(Value::Null)
            }
            _ => match self.check_session(params) {
                Some(denied) => denied,
                None => self.invoke(method, &params[1..]),
            },
        };
        Ok(response)
    }

    fn check_session(&self, params: &[Value]) -> Option<RpcResponse> {
        let id = params.first().and_then(Value::as_text).unwrap_or_default();
        if self.sessions.contains_key(id) {
            None
        } else {
            Some(fault(Fault::SESSION_INVALID, &[id]))
        }
    }

    fn login(&mut self, address: &str, params: &[Value]) -> RpcResponse {
        if let Some(target) = self.redirects.get(address) {
            return fault(Fault::HOST_IS_SLAVE, &[target.as_str()]);
        }
        if address != self.coordinator {
            return fault(Fault::HOST_IS_SLAVE, &[self.coordinator.as_str()]);
        }
        let user = params.first().and_then(Value::as_text);
        let secret = params.get(1).and_then(Value::as_text);
        if user != Some(self.username.as_str()) || secret != Some(self.password.as_str()) {
            return fault(Fault::SESSION_AUTHENTICATION_FAILED, &[user.unwrap_or_default()]);
        }
        let id = format!("OpaqueRef:session-{}", self.next_session);
        self.next_session += 1;
        self.sessions.insert(id.clone(), address.to_string());
        RpcResponse::Success(Value::from(id))
    }

    fn invoke(&mut self, method: &str, args: &[Value]) -> RpcResponse {
        let arg_ref = |i: usize| args.get(i).and_then(Value::as_object_ref);

        if let Some(class) = method.strip_suffix(".get_all_records") {
            let class = ObjectType::from_wire(class);
            let records = self
                .tables
                .get(&class)
                .map(|t| {
                    t.iter()
                        .map(|(r, record)| (r.to_string(), record.to_value()))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default();
            return RpcResponse::Success(Value::Map(records));
        }

        match method {
            "task.get_record" => match arg_ref(0) {
                Some(task) => self.step_task(&task),
                None => handle_invalid("task", ""),
            },
            "task.cancel" => match arg_ref(0).and_then(|t| self.tasks.get_mut(&t)) {
                Some(task) => {
                    if !task.status.is_finished() {
                        task.cancel_requested = true;
                    }
                    RpcResponse::Success(Value::Null)
                }
                None => handle_invalid("task", ""),
            },
            "task.destroy" => match arg_ref(0) {
                Some(task) if self.tasks.remove(&task).is_some() => {
                    self.delete(&ObjectType::Task, &task);
                    RpcResponse::Success(Value::Null)
                }
                _ => handle_invalid("task", ""),
            },
            "network.create" => {
                let name = args
                    .first()
                    .and_then(|v| v.get("name_label"))
                    .and_then(Value::as_text)
                    .unwrap_or("network")
                    .to_string();
                let reference = self.new_ref("network");
                self.put(
                    reference.clone(),
                    ObjectRecord::new(ObjectType::Network)
                        .field("name_label", name)
                        .field("PIFs", Value::Array(Vec::new())),
                );
                RpcResponse::Success(Value::Ref(reference))
            }
            "network.destroy" => match arg_ref(0) {
                Some(network) if self.delete(&ObjectType::Network, &network).is_some() => {
                    RpcResponse::Success(Value::Null)
                }
                other => handle_invalid("network", other.as_ref().map(ObjectRef::as_str).unwrap_or("")),
            },
            "Async.Bond.create" => self.start_bond_create(arg_ref(0), args.get(1)),
            "Async.Bond.destroy" => match arg_ref(0) {
                Some(bond) if self.get(&ObjectType::Bond, &bond).is_some() => {
                    let task = self.create_task(
                        "Bond.destroy",
                        Ok(Value::Null),
                        Some(Effect::DestroyBond { bond }),
                    );
                    RpcResponse::Success(Value::Ref(task))
                }
                other => handle_invalid("Bond", other.as_ref().map(ObjectRef::as_str).unwrap_or("")),
            },
            "host.management_reconfigure" => match arg_ref(0) {
                Some(pif) => self.management_reconfigure(&pif),
                None => handle_invalid("PIF", ""),
            },
            other => match self.async_outcomes.get(other).cloned() {
                Some(outcome) => {
                    let task = self.create_task(other, outcome, None);
                    RpcResponse::Success(Value::Ref(task))
                }
                None => fault(Fault::MESSAGE_METHOD_UNKNOWN, &[other]),
            },
        }
    }

    fn create_task(&mut self, name: &str, outcome: Result<Value, Fault>, effect: Option<Effect>) -> ObjectRef {
        let reference = self.new_ref("task");
        self.tasks.insert(
            reference.clone(),
            SimTask {
                status: TaskStatus::Pending,
                step: 0,
                steps: self.task_steps.max(1),
                outcome,
                effect,
                cancel_requested: false,
            },
        );
        self.put(
            reference.clone(),
            ObjectRecord::new(ObjectType::Task)
                .field("name_label", name)
                .field("status", TaskStatus::Pending.wire_name())
                .field("progress", 0.0)
                .field("result", "")
                .field("error_info", Value::Array(Vec::new())),
        );
        reference
    }

    fn step_task(&mut self, reference: &ObjectRef) -> RpcResponse {
        let Some(mut task) = self.tasks.remove(reference) else {
            return handle_invalid("task", reference.as_str());
        };

        if !task.status.is_finished() {
            if task.cancel_requested {
                task.status = TaskStatus::Cancelled;
            } else {
                task.step += 1;
                if task.step >= task.steps {
                    if task.outcome.is_ok() {
                        if let Some(effect) = task.effect.take() {
                            task.outcome = self.apply_effect(effect);
                        }
                    }
                    task.status = if task.outcome.is_ok() {
                        TaskStatus::Success
                    } else {
                        TaskStatus::Failure
                    };
                }
            }
        }

        let progress = if task.status == TaskStatus::Success {
            1.0
        } else {
            f64::from(task.step.min(task.steps)) / f64::from(task.steps)
        };
        let (result, error_info) = match (&task.status, &task.outcome) {
            (TaskStatus::Success, Ok(value)) => (value.clone(), Value::Array(Vec::new())),
            (TaskStatus::Failure, Err(f)) => (Value::from(""), f.to_value()),
            _ => (Value::from(""), Value::Array(Vec::new())),
        };
        let status = task.status;
        self.tasks.insert(reference.clone(), task);

        let record = self
            .get(&ObjectType::Task, reference)
            .cloned()
            .unwrap_or_else(|| ObjectRecord::new(ObjectType::Task))
            .field("status", status.wire_name())
            .field("progress", progress)
            .field("result", result)
            .field("error_info", error_info);
        self.put(reference.clone(), record.clone());
        RpcResponse::Success(record.to_value())
    }

    fn start_bond_create(&mut self, network: Option<ObjectRef>, members: Option<&Value>) -> RpcResponse {
        let Some(network) = network.filter(|n| self.get(&ObjectType::Network, n).is_some()) else {
            return handle_invalid("network", "");
        };
        let members = members.map(Value::as_object_refs).unwrap_or_default();
        if members.len() < 2 {
            return fault("PIF_BOND_NEEDS_MORE_MEMBERS", &[]);
        }
        let mut host = None;
        for member in &members {
            match self.get(&ObjectType::Pif, member) {
                Some(pif) if pif.reference("bond_slave_of").is_some() => {
                    return fault("PIF_ALREADY_BONDED", &[member.as_str()]);
                }
                Some(pif) => host = pif.reference("host"),
                None => return handle_invalid("PIF", member.as_str()),
            }
        }
        let host = host.unwrap_or_else(ObjectRef::null);

        let outcome = if self.failing_hosts.contains(&host) {
            Err(Fault::new("INTERNAL_ERROR", [format!("bond creation failed on {host}")]))
        } else {
            Ok(Value::Null)
        };
        let task = self.create_task(
            "Bond.create",
            outcome,
            Some(Effect::CreateBond { network, members }),
        );
        RpcResponse::Success(Value::Ref(task))
    }

    fn apply_effect(&mut self, effect: Effect) -> Result<Value, Fault> {
        match effect {
            Effect::CreateBond { network, members } => {
                let first = members
                    .first()
                    .and_then(|m| self.get(&ObjectType::Pif, m))
                    .cloned()
                    .ok_or_else(|| Fault::code(Fault::HANDLE_INVALID))?;
                let host = first.reference("host").unwrap_or_else(ObjectRef::null);
                let bond = self.new_ref("bond");
                let master = self.new_ref("pif");
                let device = format!("bond{}", self.next_ref);

                self.put(
                    master.clone(),
                    ObjectRecord::new(ObjectType::Pif)
                        .field("device", device)
                        .field("host", host)
                        .field("network", network.clone())
                        .field("MAC", first.text("MAC").unwrap_or_default())
                        .field("management", false)
                        .field("physical", false)
                        .field("bond_slave_of", ObjectRef::null())
                        .field("bond_master_of", Value::from(vec![bond.clone()])),
                );
                self.put(
                    bond.clone(),
                    ObjectRecord::new(ObjectType::Bond)
                        .field("master", master.clone())
                        .field("slaves", Value::from(members.clone())),
                );
                for member in &members {
                    let bond = bond.clone();
                    self.update(&ObjectType::Pif, member, |r| r.field("bond_slave_of", bond));
                }
                self.update(&ObjectType::Network, &network, |r| {
                    let mut pifs = r.references("PIFs");
                    pifs.push(master.clone());
                    r.field("PIFs", Value::from(pifs))
                });
                Ok(Value::Ref(bond))
            }
            Effect::DestroyBond { bond } => {
                let record = self
                    .get(&ObjectType::Bond, &bond)
                    .cloned()
                    .ok_or_else(|| Fault::new(Fault::HANDLE_INVALID, ["Bond", bond.as_str()]))?;
                for slave in record.references("slaves") {
                    self.update(&ObjectType::Pif, &slave, |r| {
                        r.field("bond_slave_of", ObjectRef::null())
                    });
                }
                if let Some(master) = record.reference("master") {
                    let network = self
                        .get(&ObjectType::Pif, &master)
                        .and_then(|p| p.reference("network"));
                    if let Some(network) = network {
                        self.update(&ObjectType::Network, &network, |r| {
                            let pifs: Vec<ObjectRef> =
                                r.references("PIFs").into_iter().filter(|p| p != &master).collect();
                            r.field("PIFs", Value::from(pifs))
                        });
                    }
                    self.delete(&ObjectType::Pif, &master);
                }
                self.delete(&ObjectType::Bond, &bond);
                Ok(Value::Null)
            }
        }
    }

    fn management_reconfigure(&mut self, target: &ObjectRef) -> RpcResponse {
        let Some(host) = self.get(&ObjectType::Pif, target).map(|p| p.reference("host")) else {
            return handle_invalid("PIF", target.as_str());
        };
        let on_host: Vec<ObjectRef> = self
            .tables
            .get(&ObjectType::Pif)
            .map(|t| {
                t.iter()
                    .filter(|(_, p)| p.reference("host") == host)
                    .map(|(r, _)| r.clone())
                    .collect()
            })
            .unwrap_or_default();
        for pif in on_host {
            let management = &pif == target;
            let currently = self.get(&ObjectType::Pif, &pif).map(|p| p.flag("management"));
            if currently != Some(management) {
                self.update(&ObjectType::Pif, &pif, |r| r.field("management", management));
            }
        }
        RpcResponse::Success(Value::Null)
    }

    fn poll_events(&mut self, address: &str, params: &[Value]) -> PollOutcome {
        self.calls.push("event.from".to_string());
        if self.offline.contains(address) {
            return PollOutcome::Respond(Err(Self::offline_failure(address)));
        }
        if let Some(f) = self.take_fault("event.from") {
            return PollOutcome::Respond(Ok(RpcResponse::Fault(f)));
        }
        if let Some(denied) = self.check_session(params) {
            return PollOutcome::Respond(Ok(denied));
        }

        let classes: HashSet<ObjectType> = params
            .get(1)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_text)
                    .map(ObjectType::from_wire)
                    .collect()
            })
            .unwrap_or_default();
        let token = params.get(2).and_then(Value::as_text).unwrap_or_default();
        let timeout = params
            .get(3)
            .and_then(Value::as_float)
            .map(|s| Duration::from_secs_f64(s.max(0.0)))
            .unwrap_or_default();
        let current = self.last_event_id().to_string();

        if token.is_empty() {
            let batch = Value::map([
                ("events", Value::Array(Vec::new())),
                ("token", Value::from(current)),
            ]);
            return PollOutcome::Respond(Ok(RpcResponse::Success(batch)));
        }
        let Ok(since) = token.parse::<u64>() else {
            return PollOutcome::Respond(Ok(fault("EVENT_FROM_TOKEN_INVALID", &[token])));
        };

        let events: Vec<Value> = self
            .log
            .iter()
            .filter(|e| e.id > since && classes.contains(&e.class))
            .map(|e| e.raw.clone())
            .collect();
        if events.is_empty() {
            return PollOutcome::Wait(timeout);
        }
        let batch = Value::map([
            ("events", Value::Array(events)),
            ("token", Value::from(current)),
        ]);
        PollOutcome::Respond(Ok(RpcResponse::Success(batch)))
    }
}

struct PoolState {
    world: Mutex<World>,
    changed: Notify,
}

/// A simulated pool server.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedPool {
    state: Arc<PoolState>,
}

impl SimulatedPool {
    /// Creates an empty pool that accepts the given credentials.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            state: Arc::new(PoolState {
                world: Mutex::new(World::new(username, password)),
                changed: Notify::new(),
            }),
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut World) -> T) -> T {
        let out = f(&mut self.state.world.lock());
        self.state.changed.notify_waiters();
        out
    }

    fn read<T>(&self, f: impl FnOnce(&World) -> T) -> T {
        f(&self.state.world.lock())
    }

    /// Sets the coordinator's address.
    pub fn set_coordinator_address(&self, address: &str) {
        self.mutate(|w| w.coordinator = address.to_string());
    }

    /// Returns the coordinator's address.
    pub fn coordinator_address(&self) -> String {
        self.read(|w| w.coordinator.clone())
    }

    /// Sets how many `task.get_record` polls a task takes to finish.
    pub fn set_task_steps(&self, steps: u32) {
        self.mutate(|w| w.task_steps = steps.max(1));
    }

    /// Makes every channel present this certificate.
    pub fn set_certificate(&self, certificate: Option<Certificate>) {
        self.mutate(|w| w.certificate = certificate);
    }

    pub(crate) fn certificate(&self) -> Option<Certificate> {
        self.read(|w| w.certificate.clone())
    }

    /// Creates or replaces an object, returning the event id.
    pub fn put_object(&self, reference: ObjectRef, record: ObjectRecord) -> u64 {
        self.mutate(|w| w.put(reference, record))
    }

    /// Changes an object; returns false if it does not exist.
    pub fn modify_object<F>(&self, class: &ObjectType, reference: &ObjectRef, change: F) -> bool
    where
        F: FnOnce(ObjectRecord) -> ObjectRecord,
    {
        self.mutate(|w| w.update(class, reference, change))
    }

    /// Deletes an object, returning the event id.
    pub fn delete_object(&self, class: &ObjectType, reference: &ObjectRef) -> Option<u64> {
        self.mutate(|w| w.delete(class, reference))
    }

    /// Returns one object.
    pub fn object(&self, class: &ObjectType, reference: &ObjectRef) -> Option<ObjectRecord> {
        self.read(|w| w.get(class, reference).cloned())
    }

    /// Returns every object of a class.
    pub fn objects(&self, class: &ObjectType) -> Vec<(ObjectRef, ObjectRecord)> {
        self.read(|w| {
            w.tables
                .get(class)
                .map(|t| t.iter().map(|(r, rec)| (r.clone(), rec.clone())).collect())
                .unwrap_or_default()
        })
    }

    /// Appends a raw, possibly malformed, event to the log and returns its id.
    pub fn inject_raw_event(&self, class: ObjectType, raw: Value) -> u64 {
        self.mutate(|w| {
            let id = w.next_event;
            w.next_event += 1;
            w.log.push(LoggedEvent { id, class, raw });
            id
        })
    }

    /// Returns the id of the newest event.
    pub fn last_event_id(&self) -> u64 {
        self.read(World::last_event_id)
    }

    /// Fails the next call of `method` with `fault`.
    pub fn fail_next(&self, method: &str, fault: Fault) {
        self.mutate(|w| {
            w.next_faults
                .entry(method.to_string())
                .or_default()
                .push_back(fault)
        });
    }

    /// Makes bond creation on `host` end in a failed task.
    pub fn fail_bonds_on_host(&self, host: ObjectRef) {
        self.mutate(|w| w.failing_hosts.insert(host));
    }

    /// Makes `method` start a task that ends with `outcome`.
    pub fn register_async(&self, method: &str, outcome: Result<Value, Fault>) {
        self.mutate(|w| w.async_outcomes.insert(method.to_string(), outcome));
    }

    /// Makes logins at `from` answer with a redirect to `to`.
    pub fn redirect(&self, from: &str, to: &str) {
        self.mutate(|w| w.redirects.insert(from.to_string(), to.to_string()));
    }

    /// Takes an address off the network, or puts it back.
    pub fn set_offline(&self, address: &str, offline: bool) {
        self.mutate(|w| {
            if offline {
                w.offline.insert(address.to_string());
            } else {
                w.offline.remove(address);
            }
        });
    }

    /// Returns true if `address` is reachable.
    pub fn is_reachable(&self, address: &str) -> bool {
        self.read(|w| w.is_known(address) && !w.offline.contains(address))
    }

    /// Forgets every session, as a server restart would.
    pub fn kill_sessions(&self) {
        self.mutate(|w| w.sessions.clear());
    }

    /// Moves the coordinator role to the host with `address`.
    ///
    /// The old coordinator goes offline, every session is dropped and the
    /// pool record's `master` is updated.
    pub fn fail_over(&self, address: &str) {
        self.mutate(|w| {
            let old = std::mem::replace(&mut w.coordinator, address.to_string());
            w.offline.insert(old);
            w.sessions.clear();
            let host = w.tables.get(&ObjectType::Host).and_then(|t| {
                t.iter()
                    .find(|(_, r)| r.text("address") == Some(address))
                    .map(|(r, _)| r.clone())
            });
            let pools: Vec<ObjectRef> = w
                .tables
                .get(&ObjectType::Pool)
                .map(|t| t.keys().cloned().collect())
                .unwrap_or_default();
            if let Some(host) = host {
                for pool in pools {
                    let host = host.clone();
                    w.update(&ObjectType::Pool, &pool, |r| r.field("master", host));
                }
            }
        });
    }

    /// Returns the method of every call received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.read(|w| w.calls.clone())
    }

    /// Returns how many times `method` was called.
    pub fn call_count(&self, method: &str) -> usize {
        self.read(|w| w.calls.iter().filter(|c| c.as_str() == method).count())
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.read(|w| w.sessions.len())
    }

    /// Returns the number of tasks not yet destroyed.
    pub fn task_count(&self) -> usize {
        self.read(|w| w.tasks.len())
    }

    pub(crate) fn is_known(&self, address: &str) -> bool {
        self.read(|w| w.is_known(address))
    }

    /// Handles one call arriving at `address`.
    pub async fn handle(
        &self,
        address: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse, TransportFailure> {
        if request.method != "event.from" {
            return self.mutate(|w| w.dispatch(address, &request));
        }

        let mut deadline: Option<Instant> = None;
        loop {
            let notified = self.state.changed.notified();
            let outcome = self.state.world.lock().poll_events(address, &request.params);
            match outcome {
                PollOutcome::Respond(response) => return response,
                PollOutcome::Wait(timeout) => {
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(RpcResponse::TimedOut);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SimulatedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.read(|w| {
            f.debug_struct("SimulatedPool")
                .field("coordinator", &w.coordinator)
                .field("events", &w.log.len())
                .field("sessions", &w.sessions.len())
                .finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SimulatedPool {
        let pool = SimulatedPool::new("root", "pw");
        pool.set_coordinator_address("10.0.0.1");
        pool
    }

    async fn login(pool: &SimulatedPool) -> String {
        let response = pool
            .handle(
                "10.0.0.1",
                RpcRequest::new(
                    "session.login_with_password",
                    vec![Value::from("root"), Value::from("pw")],
                ),
            )
            .await
            .unwrap();
        match response {
            RpcResponse::Success(Value::Text(id)) => id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_redirects_from_member() {
        let pool = pool();
        let response = pool
            .handle(
                "10.0.0.2",
                RpcRequest::new("session.login_with_password", vec![Value::from("root"), Value::from("pw")]),
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            RpcResponse::Fault(Fault::new(Fault::HOST_IS_SLAVE, ["10.0.0.1"]))
        );
    }

    #[tokio::test]
    async fn event_from_returns_new_events() {
        let pool = pool();
        let session = login(&pool).await;
        pool.put_object(
            ObjectRef::new("OpaqueRef:h1"),
            ObjectRecord::new(ObjectType::Host).field("address", "10.0.0.1"),
        );
        let response = pool
            .handle(
                "10.0.0.1",
                RpcRequest::new(
                    "event.from",
                    vec![
                        Value::from(session),
                        Value::from(vec!["host"]),
                        Value::from("0"),
                        Value::Float(0.0),
                    ],
                ),
            )
            .await
            .unwrap();
        let RpcResponse::Success(batch) = response else {
            panic!("expected events");
        };
        assert_eq!(batch.get("token").and_then(Value::as_text), Some("1"));
        assert_eq!(batch.get("events").and_then(Value::as_array).map(|e| e.len()), Some(1));
    }

    #[tokio::test]
    async fn event_from_times_out_when_idle() {
        let pool = pool();
        let session = login(&pool).await;
        let response = pool
            .handle(
                "10.0.0.1",
                RpcRequest::new(
                    "event.from",
                    vec![
                        Value::from(session),
                        Value::from(vec!["host"]),
                        Value::from("0"),
                        Value::Float(0.05),
                    ],
                ),
            )
            .await
            .unwrap();
        assert_eq!(response, RpcResponse::TimedOut);
    }

    #[tokio::test]
    async fn tasks_advance_per_poll() {
        let pool = pool();
        pool.set_task_steps(2);
        pool.register_async("Async.VM.start", Ok(Value::from("done")));
        let session = login(&pool).await;

        let call = |method: &str, arg: Value| {
            RpcRequest::new(method, vec![Value::from(session.clone()), arg])
        };
        let RpcResponse::Success(Value::Ref(task)) = pool
            .handle("10.0.0.1", call("Async.VM.start", Value::Null))
            .await
            .unwrap()
        else {
            panic!("expected task");
        };

        let first = pool
            .handle("10.0.0.1", call("task.get_record", Value::Ref(task.clone())))
            .await
            .unwrap();
        let RpcResponse::Success(first) = first else { panic!() };
        assert_eq!(first.get("status").and_then(Value::as_text), Some("pending"));

        let second = pool
            .handle("10.0.0.1", call("task.get_record", Value::Ref(task)))
            .await
            .unwrap();
        let RpcResponse::Success(second) = second else { panic!() };
        assert_eq!(second.get("status").and_then(Value::as_text), Some("success"));
        assert_eq!(second.get("result"), Some(&Value::from("done")));
    }

    #[tokio::test]
    async fn calls_without_session_are_rejected() {
        let pool = pool();
        let response = pool
            .handle(
                "10.0.0.1",
                RpcRequest::new("host.get_all_records", vec![Value::from("bogus")]),
            )
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Fault(f) if f.code == Fault::SESSION_INVALID));
    }
}
